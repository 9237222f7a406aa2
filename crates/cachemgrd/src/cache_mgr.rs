//! CacheMgr - Core cache orchestration implementation

use cachemgr_common::{
    CacheMgrError, CacheMgrResult, CacheParams, CacheState, CommandChannel, EnableRequest,
    PurgeMode, Site, Topology, TopologyKind, TransitionConflict,
};
use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::commands::{
    build_origin_reload_cmd, build_reload_service_cmd, build_stop_service_cmd,
};
use crate::config::CacheMgrConfig;
use crate::daemon::{render_unit, DaemonParams};
use crate::engine::{StepContext, StepEngine, Workflow, WorkflowReport};
use crate::hosts::HostRegistry;
use crate::locks::{KeyedLocks, TenancyClaims};
use crate::policy::{
    include_line, other_includes, render_master_base, PolicyInput, PolicyRenderer, VclRenderer,
};
use crate::purge::{PurgeOutcome, Purger};
use crate::steps::{
    InstallDaemon, ManagedFile, OriginPatch, PatchOriginConfig, RefreshServices,
    ReleasePublicPorts, ReloadOrigin, RemoveSitePolicy, RestoreOriginConfig,
    ValidateOriginConfig, WriteDaemonConfig, WriteSitePolicy,
};
use crate::store::DesiredStateStore;

/// Workflow names.
pub const ENABLE_WORKFLOW: &str = "enable";
/// Workflow names.
pub const DISABLE_WORKFLOW: &str = "disable";

/// What happened to the shared daemon after a Disable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonAction {
    /// No site on the host uses the daemon any more; it was stopped.
    Stopped,
    /// Other sites remain; the daemon was reloaded without this site.
    Reloaded,
    /// Stopping failed; the daemon keeps running unused.
    StopFailed {
        /// Rendered error.
        error: String,
    },
    /// Reloading failed; the daemon still serves the old policy set.
    ReloadFailed {
        /// Rendered error.
        error: String,
    },
}

/// Result of a successful Enable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnableReport {
    /// Site identifier.
    pub site: String,
    /// Steps that ran.
    pub workflow: WorkflowReport,
    /// Committed state.
    pub state: CacheState,
}

/// Result of a successful Disable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisableReport {
    /// Site identifier.
    pub site: String,
    /// Steps that ran.
    pub workflow: WorkflowReport,
    /// Shared daemon handling.
    pub daemon: DaemonAction,
    /// Committed state.
    pub state: CacheState,
}

/// Catalog entry plus recorded state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteStatus {
    /// Catalog entry.
    pub site: Site,
    /// Recorded desired state.
    pub state: CacheState,
}

/// CacheMgr turns caching intent for sites into remote configuration.
///
/// Workflows on one site are serialized by a per-site lock held for the
/// whole workflow; the daemon's master configuration is edited under a
/// per-host lock. Enables of different sites on one host check and claim
/// their topology under a per-host gate, so two of them can never both pass
/// the exclusivity check. The store is only written after a workflow
/// succeeded.
pub struct CacheMgr {
    /// Layout and policy configuration
    config: Arc<CacheMgrConfig>,

    /// Site catalog by id
    sites: BTreeMap<String, Site>,

    /// Channels by host id
    hosts: HostRegistry,

    /// Desired-state store
    store: Arc<dyn DesiredStateStore>,

    /// Policy renderer
    renderer: Arc<dyn PolicyRenderer>,

    /// Whole-workflow locks
    site_locks: KeyedLocks,

    /// Master configuration edit locks
    host_locks: KeyedLocks,

    /// Topologies of enables in flight
    tenancy: TenancyClaims,
}

impl CacheMgr {
    /// Creates a manager over the configured site catalog.
    ///
    /// Every site must be valid and live on a registered host.
    pub fn new(
        config: CacheMgrConfig,
        hosts: HostRegistry,
        store: Arc<dyn DesiredStateStore>,
    ) -> CacheMgrResult<Self> {
        let mut sites = BTreeMap::new();
        for site in &config.sites {
            site.validate()?;
            if !hosts.contains(&site.host) {
                return Err(CacheMgrError::host_not_found(&site.host));
            }
            if sites.insert(site.id.clone(), site.clone()).is_some() {
                return Err(CacheMgrError::invalid_config(
                    "sites",
                    format!("duplicate site '{}'", site.id),
                ));
            }
        }

        let renderer = Arc::new(VclRenderer::new(&config.policy));
        Ok(Self {
            config: Arc::new(config),
            sites,
            hosts,
            store,
            renderer,
            site_locks: KeyedLocks::new("site"),
            host_locks: KeyedLocks::new("host"),
            tenancy: TenancyClaims::new(),
        })
    }

    /// Replaces the policy renderer.
    pub fn with_renderer(mut self, renderer: Arc<dyn PolicyRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    /// Configuration in use.
    pub fn config(&self) -> &CacheMgrConfig {
        &self.config
    }

    /// Catalog entry of a site.
    pub fn site(&self, site_id: &str) -> CacheMgrResult<&Site> {
        self.sites
            .get(site_id)
            .ok_or_else(|| CacheMgrError::site_not_found(site_id))
    }

    /// All catalog entries.
    pub fn sites(&self) -> impl Iterator<Item = &Site> {
        self.sites.values()
    }

    fn step_context<'a>(&'a self, channel: &'a dyn CommandChannel) -> StepContext<'a> {
        StepContext {
            channel,
            host_locks: &self.host_locks,
            timeout: self.config.command_timeout(),
            install_timeout: self.config.install_timeout(),
        }
    }

    /// Other sites on the same host that are recorded as enabled.
    async fn enabled_neighbours(&self, site: &Site) -> CacheMgrResult<Vec<(&Site, CacheState)>> {
        let mut enabled = Vec::new();
        for other in self
            .sites
            .values()
            .filter(|s| s.host == site.host && s.id != site.id)
        {
            let state = self.store.get(&other.id).await?;
            if state.enabled {
                enabled.push((other, state));
            }
        }
        Ok(enabled)
    }

    /// Rejects topologies that cannot coexist with the host's enabled sites
    /// or with enables still in flight there. Callers hold the host's
    /// tenancy gate.
    async fn check_topology(&self, site: &Site, topology: TopologyKind) -> CacheMgrResult<()> {
        let mut held: BTreeMap<String, TopologyKind> = self
            .enabled_neighbours(site)
            .await?
            .into_iter()
            .filter_map(|(s, state)| state.active_topology().map(|t| (s.id.clone(), t.kind())))
            .collect();
        held.extend(self.tenancy.in_flight(&site.host, &site.id));

        let conflicting: Vec<&str> = held
            .iter()
            .filter(|(_, kind)| {
                topology == TopologyKind::DedicatedPort || **kind == TopologyKind::DedicatedPort
            })
            .map(|(id, _)| id.as_str())
            .collect();

        if conflicting.is_empty() {
            return Ok(());
        }
        let message = match topology {
            TopologyKind::DedicatedPort => format!(
                "dedicated_port needs host '{}' to itself, enabled: {}",
                site.host,
                conflicting.join(", ")
            ),
            TopologyKind::SharedPort => format!(
                "host '{}' is held under dedicated_port by {}",
                site.host,
                conflicting.join(", ")
            ),
        };
        Err(CacheMgrError::invalid_config("topology", message))
    }

    fn enable_workflow(&self, site: &Site, params: &CacheParams) -> CacheMgrResult<Workflow> {
        let daemon = &self.config.daemon;
        let origin = &self.config.origin;
        let kind = params.topology.kind();

        let backend = match params.topology {
            Topology::SharedPort => origin.backend_address.clone(),
            Topology::DedicatedPort { backend_port } => format!("127.0.0.1:{}", backend_port),
        };
        let policy = self.renderer.render(&PolicyInput {
            site,
            ttl_seconds: params.ttl_seconds,
            backend: &backend,
        })?;
        let policy_path = daemon.site_policy_path(site);

        let patch = match params.topology {
            Topology::SharedPort => OriginPatch::ProxyBlock {
                block: self.renderer.render_proxy_block(&daemon.internal_endpoint()),
            },
            Topology::DedicatedPort { backend_port } => OriginPatch::ListenRewrite {
                backend_port,
                public_port: origin.public_port,
                public_tls_port: origin.public_tls_port,
            },
        };
        let origin_reload = build_origin_reload_cmd(&origin.test_command, &origin.service);
        let daemon_changed = Arc::new(AtomicBool::new(false));

        Ok(Workflow::new(ENABLE_WORKFLOW)
            .step(InstallDaemon {
                binary: daemon.binary.clone(),
                service: daemon.service.clone(),
                install_command: daemon.install_command.clone(),
                fallback_install_command: daemon.fallback_install_command.clone(),
            })
            .step(WriteDaemonConfig::new(
                vec![
                    ManagedFile {
                        path: daemon.params_path.clone(),
                        content: DaemonParams::for_topology(
                            &self.config,
                            kind,
                            &params.memory_budget,
                        )
                        .render(),
                    },
                    ManagedFile {
                        path: daemon.unit_path.clone(),
                        content: render_unit(daemon),
                    },
                ],
                Arc::clone(&daemon_changed),
            ))
            .step(WriteSitePolicy::new(
                policy_path.clone(),
                policy,
                daemon.master_config.clone(),
                include_line(&policy_path),
                render_master_base(&origin.backend_address)?,
            ))
            .step(PatchOriginConfig::new(
                site.id.clone(),
                origin.site_config_path(site),
                origin.backup_path(site),
                patch,
                origin_reload.clone(),
            ))
            .step(ValidateOriginConfig {
                test_command: origin.test_command.clone(),
            })
            .step(RefreshServices {
                topology: kind,
                daemon_service: daemon.service.clone(),
                origin_reload_command: origin_reload,
                daemon_changed,
            }))
    }

    fn disable_workflow(&self, site: &Site, topology: Topology) -> Workflow {
        let daemon = &self.config.daemon;
        let origin = &self.config.origin;
        let policy_path = daemon.site_policy_path(site);

        let mut workflow = Workflow::new(DISABLE_WORKFLOW)
            .step(RemoveSitePolicy::new(
                policy_path.clone(),
                daemon.master_config.clone(),
                include_line(&policy_path),
            ))
            .step(RestoreOriginConfig::new(
                site.id.clone(),
                origin.site_config_path(site),
                origin.backup_path(site),
            ));
        if topology.kind() == TopologyKind::DedicatedPort {
            workflow = workflow.step(ReleasePublicPorts::new(daemon.service.clone()));
        }
        workflow.step(ReloadOrigin {
            command: build_origin_reload_cmd(&origin.test_command, &origin.service),
        })
    }

    /// Enables caching for a site.
    pub async fn enable(&self, site_id: &str, request: &EnableRequest) -> CacheMgrResult<EnableReport> {
        self.enable_with_cancel(site_id, request, CancellationToken::new())
            .await
    }

    /// Enables caching; `cancel` stops the workflow before its next step.
    #[instrument(skip(self, request, cancel), fields(topology = %request.topology))]
    pub async fn enable_with_cancel(
        &self,
        site_id: &str,
        request: &EnableRequest,
        cancel: CancellationToken,
    ) -> CacheMgrResult<EnableReport> {
        let site = self.site(site_id)?;
        let params = request.validate()?;

        let _guard = self.site_locks.lock(site_id).await;

        let current = self.store.get(site_id).await?;
        if current.enabled {
            return Err(CacheMgrError::illegal_transition(
                site_id,
                TransitionConflict::AlreadyEnabled,
            ));
        }
        let channel = self.hosts.channel(&site.host)?;
        let kind = params.topology.kind();
        let _claim = {
            let _gate = self.tenancy.gate(&site.host).await;
            self.check_topology(site, kind).await?;
            self.tenancy.claim(&site.host, site_id, kind)
        };

        let workflow = self.enable_workflow(site, &params)?;
        let report = StepEngine::with_cancellation(cancel)
            .run(workflow, &self.step_context(channel.as_ref()))
            .await?;

        let state = CacheState::enabled(params);
        self.store.commit(site_id, &state).await?;
        info!(site = %site_id, host = %site.host, "Caching enabled");

        Ok(EnableReport {
            site: site_id.to_string(),
            workflow: report,
            state,
        })
    }

    /// Disables caching for a site.
    pub async fn disable(&self, site_id: &str) -> CacheMgrResult<DisableReport> {
        self.disable_with_cancel(site_id, CancellationToken::new())
            .await
    }

    /// Disables caching; `cancel` stops the workflow before its next step.
    #[instrument(skip(self, cancel))]
    pub async fn disable_with_cancel(
        &self,
        site_id: &str,
        cancel: CancellationToken,
    ) -> CacheMgrResult<DisableReport> {
        let site = self.site(site_id)?;

        let _guard = self.site_locks.lock(site_id).await;

        let current = self.store.get(site_id).await?;
        let topology = match (current.enabled, current.active_topology()) {
            (true, Some(topology)) => topology,
            _ => {
                return Err(CacheMgrError::illegal_transition(
                    site_id,
                    TransitionConflict::NotEnabled,
                ))
            }
        };
        let channel = self.hosts.channel(&site.host)?;

        let workflow = self.disable_workflow(site, topology);
        let report = StepEngine::with_cancellation(cancel)
            .run(workflow, &self.step_context(channel.as_ref()))
            .await?;

        let daemon = match topology {
            Topology::DedicatedPort { .. } => DaemonAction::Stopped,
            Topology::SharedPort => self.settle_shared_daemon(site, channel.as_ref()).await,
        };

        let state = CacheState::disabled_from(&current);
        self.store.commit(site_id, &state).await?;
        info!(site = %site_id, host = %site.host, daemon = ?daemon, "Caching disabled");

        Ok(DisableReport {
            site: site_id.to_string(),
            workflow: report,
            daemon,
            state,
        })
    }

    /// Stops the shared daemon if no other site on the host uses it,
    /// reloads it otherwise. Failures are logged only.
    ///
    /// Besides the store and the enables in flight, the master configuration
    /// is checked under the host lock: an include of another site means that
    /// site is enabled or mid-enable, and its refresh step relies on the
    /// daemon.
    async fn settle_shared_daemon(&self, site: &Site, channel: &dyn CommandChannel) -> DaemonAction {
        let timeout = self.config.command_timeout();
        let service = &self.config.daemon.service;

        let in_flight = self.tenancy.in_flight(&site.host, &site.id).len();
        let neighbours = match self.enabled_neighbours(site).await {
            Ok(neighbours) => neighbours.len() + in_flight,
            Err(e) => {
                warn!(site = %site.id, error = %e, "Cannot read neighbour state, keeping daemon running");
                1
            }
        };

        let _host_guard = self.host_locks.lock(&site.host).await;
        let own = include_line(&self.config.daemon.site_policy_path(site));
        let other_tenants = match channel
            .read_file(&self.config.daemon.master_config, timeout)
            .await
        {
            Ok(master) => master.map_or(0, |m| other_includes(&m, &own).len()),
            Err(e) => {
                warn!(host = %site.host, error = %e, "Cannot read master configuration, keeping daemon running");
                1
            }
        };

        if neighbours == 0 && other_tenants == 0 {
            match channel
                .execute(&build_stop_service_cmd(service), timeout)
                .await
            {
                Ok(_) => {
                    info!(host = %site.host, "No site uses the cache daemon any more, stopped it");
                    DaemonAction::Stopped
                }
                Err(e) => {
                    warn!(host = %site.host, error = %e, "Failed to stop unused cache daemon");
                    DaemonAction::StopFailed {
                        error: e.to_string(),
                    }
                }
            }
        } else {
            match channel
                .execute(&build_reload_service_cmd(service), timeout)
                .await
            {
                Ok(_) => DaemonAction::Reloaded,
                Err(e) => {
                    warn!(host = %site.host, error = %e, "Failed to reload cache daemon");
                    DaemonAction::ReloadFailed {
                        error: e.to_string(),
                    }
                }
            }
        }
    }

    /// Invalidates cached content of a site.
    #[instrument(skip(self, mode), fields(mode = mode.as_str()))]
    pub async fn purge(&self, site_id: &str, mode: &PurgeMode) -> CacheMgrResult<PurgeOutcome> {
        let site = self.site(site_id)?;

        let _guard = self.site_locks.lock(site_id).await;

        let current = self.store.get(site_id).await?;
        let topology = current.active_topology().ok_or_else(|| {
            CacheMgrError::illegal_transition(site_id, TransitionConflict::NotEnabled)
        })?;
        let channel = self.hosts.channel(&site.host)?;

        Purger::new(channel.as_ref(), &self.config)
            .purge(site, mode, topology)
            .await
    }

    /// Recorded state of a site; no remote action.
    pub async fn status(&self, site_id: &str) -> CacheMgrResult<SiteStatus> {
        let site = self.site(site_id)?.clone();
        let state = self.store.get(site_id).await?;
        Ok(SiteStatus { site, state })
    }
}
