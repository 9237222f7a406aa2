//! Provisioning steps of the Enable and Disable workflows.
//!
//! Steps capture whatever they overwrite so their compensation can put it
//! back. A step that fails halfway undoes its own partial effect before
//! returning, since the engine only compensates completed steps.

use async_trait::async_trait;
use cachemgr_common::{CacheMgrError, CacheMgrResult, CompensationFailure, TopologyKind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::commands::{
    build_enable_service_cmd, build_is_active_cmd, build_probe_enabled_cmd,
    build_probe_installed_cmd, build_reload_service_cmd, build_restart_service_cmd,
    build_start_service_cmd, build_stop_service_cmd,
};
use crate::engine::{ProvisioningStep, StepContext};
use crate::origin;
use crate::policy::{count_include, ensure_include, remove_include};

/// Step names.
pub mod names {
    /// Daemon installation.
    pub const INSTALL_DAEMON: &str = "install-cache-daemon";
    /// Daemon parameter and unit files.
    pub const WRITE_DAEMON_CONFIG: &str = "write-daemon-config";
    /// Per-site policy and master include.
    pub const WRITE_SITE_POLICY: &str = "write-site-policy";
    /// Origin proxy block or listen rewrite.
    pub const PATCH_ORIGIN: &str = "patch-origin-config";
    /// Origin syntax check.
    pub const VALIDATE_ORIGIN: &str = "validate-origin-config";
    /// Daemon refresh and origin reload.
    pub const REFRESH_SERVICES: &str = "reload-services";
    /// Per-site policy and include removal.
    pub const REMOVE_SITE_POLICY: &str = "remove-site-policy";
    /// Origin configuration restore.
    pub const RESTORE_ORIGIN: &str = "restore-origin-config";
    /// Daemon stop under DedicatedPort.
    pub const RELEASE_PUBLIC_PORTS: &str = "release-public-ports";
    /// Origin reload.
    pub const RELOAD_ORIGIN: &str = "reload-origin";
}

/// Runs a failed step's undo of its own partial effect. When the undo fails
/// too, `cause` is returned as a partial rollback naming the step, so the
/// leftover surfaces next to the engine's compensation failures.
async fn undo_partial(
    step: &str,
    ctx: &StepContext<'_>,
    cause: CacheMgrError,
    undo: impl Future<Output = CacheMgrResult<()>>,
) -> CacheMgrError {
    match undo.await {
        Ok(()) => cause,
        Err(e) => {
            warn!(host = %ctx.host(), step = %step, error = %e, "Failed to undo partial step effect");
            CacheMgrError::RollbackPartial {
                step: step.to_string(),
                cause: Box::new(cause),
                failures: vec![CompensationFailure {
                    step: step.to_string(),
                    error: e.to_string(),
                }],
            }
        }
    }
}

/// Set when the daemon's parameter or unit file was rewritten.
pub type DaemonFilesChanged = Arc<AtomicBool>;

/// Ensures the daemon is installed and enabled on boot.
///
/// Installation tries the primary package source, then the alternate one.
/// Compensation never uninstalls: other sites may depend on the daemon.
#[derive(Debug, Clone)]
pub struct InstallDaemon {
    /// Binary probed on PATH.
    pub binary: String,
    /// systemd unit.
    pub service: String,
    /// Primary installation command.
    pub install_command: String,
    /// Alternate-source installation command.
    pub fallback_install_command: String,
}

impl InstallDaemon {
    async fn is_installed(&self, ctx: &StepContext<'_>) -> CacheMgrResult<bool> {
        Ok(ctx
            .channel
            .run(&build_probe_installed_cmd(&self.binary), ctx.timeout)
            .await?
            .success())
    }

    async fn install(&self, ctx: &StepContext<'_>) -> CacheMgrResult<()> {
        match ctx
            .channel
            .execute(&self.install_command, ctx.install_timeout)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if !e.is_channel_error() => {
                warn!(host = %ctx.host(), error = %e, "Primary installation failed, trying alternate package source");
                ctx.channel
                    .execute(&self.fallback_install_command, ctx.install_timeout)
                    .await
                    .map(|_| ())
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl ProvisioningStep for InstallDaemon {
    fn name(&self) -> &str {
        names::INSTALL_DAEMON
    }

    async fn probe(&mut self, ctx: &StepContext<'_>) -> CacheMgrResult<bool> {
        if !self.is_installed(ctx).await? {
            return Ok(false);
        }
        Ok(ctx
            .channel
            .run(&build_probe_enabled_cmd(&self.service), ctx.timeout)
            .await?
            .success())
    }

    async fn apply(&mut self, ctx: &StepContext<'_>) -> CacheMgrResult<()> {
        if !self.is_installed(ctx).await? {
            info!(host = %ctx.host(), binary = %self.binary, "Installing cache daemon");
            self.install(ctx).await?;
            if !self.is_installed(ctx).await? {
                return Err(CacheMgrError::internal(format!(
                    "{} not found after installation",
                    self.binary
                )));
            }
        }
        ctx.channel
            .execute(&build_enable_service_cmd(&self.service), ctx.timeout)
            .await?;
        Ok(())
    }

    async fn compensate(&mut self, ctx: &StepContext<'_>) -> CacheMgrResult<()> {
        debug!(host = %ctx.host(), "Leaving shared cache daemon installed");
        Ok(())
    }
}

/// A file whose whole content is managed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedFile {
    /// Remote path.
    pub path: String,
    /// Desired content.
    pub content: String,
}

/// Writes the daemon's parameter and unit files.
///
/// Compensation restores captured prior content, or deletes files this
/// step created.
#[derive(Debug)]
pub struct WriteDaemonConfig {
    files: Vec<ManagedFile>,
    changed: DaemonFilesChanged,
    captured: Vec<(String, Option<String>)>,
}

impl WriteDaemonConfig {
    /// Creates the step; `changed` is raised when a file is rewritten.
    pub fn new(files: Vec<ManagedFile>, changed: DaemonFilesChanged) -> Self {
        Self {
            files,
            changed,
            captured: Vec::new(),
        }
    }

    async fn restore(&mut self, ctx: &StepContext<'_>) -> CacheMgrResult<()> {
        let mut first_error = None;
        while let Some((path, prior)) = self.captured.pop() {
            let result = match &prior {
                Some(content) => ctx.channel.write_file(&path, content, ctx.timeout).await,
                None => ctx.channel.remove_file(&path, ctx.timeout).await,
            };
            if let Err(e) = result {
                warn!(host = %ctx.host(), path = %path, error = %e, "Failed to restore daemon file");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[async_trait]
impl ProvisioningStep for WriteDaemonConfig {
    fn name(&self) -> &str {
        names::WRITE_DAEMON_CONFIG
    }

    async fn probe(&mut self, ctx: &StepContext<'_>) -> CacheMgrResult<bool> {
        for file in &self.files {
            let current = ctx.channel.read_file(&file.path, ctx.timeout).await?;
            if current.as_deref() != Some(file.content.as_str()) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn apply(&mut self, ctx: &StepContext<'_>) -> CacheMgrResult<()> {
        for idx in 0..self.files.len() {
            let (path, content) = (self.files[idx].path.clone(), self.files[idx].content.clone());
            let result = async {
                let prior = ctx.channel.read_file(&path, ctx.timeout).await?;
                if prior.as_deref() == Some(content.as_str()) {
                    return Ok(None);
                }
                ctx.channel.write_file(&path, &content, ctx.timeout).await?;
                Ok::<_, CacheMgrError>(Some(prior))
            }
            .await;

            match result {
                Ok(Some(prior)) => {
                    debug!(host = %ctx.host(), path = %path, created = prior.is_none(), "Wrote daemon file");
                    self.captured.push((path, prior));
                    self.changed.store(true, Ordering::SeqCst);
                }
                Ok(None) => {}
                Err(e) => {
                    let undo = self.restore(ctx);
                    return Err(undo_partial(names::WRITE_DAEMON_CONFIG, ctx, e, undo).await);
                }
            }
        }
        Ok(())
    }

    async fn compensate(&mut self, ctx: &StepContext<'_>) -> CacheMgrResult<()> {
        self.restore(ctx).await
    }
}

/// Writes the per-site policy and adds its include to the master
/// configuration exactly once.
///
/// The master edit runs under the host lock. Compensation removes the
/// include and the policy file, and the master itself if this step
/// created it and nothing else was added since.
#[derive(Debug, Clone)]
pub struct WriteSitePolicy {
    policy_path: String,
    content: String,
    master_path: String,
    include: String,
    master_base: String,
    created_master: bool,
}

impl WriteSitePolicy {
    /// Creates the step; `master_base` seeds a host without master.
    pub fn new(
        policy_path: impl Into<String>,
        content: impl Into<String>,
        master_path: impl Into<String>,
        include: impl Into<String>,
        master_base: impl Into<String>,
    ) -> Self {
        Self {
            policy_path: policy_path.into(),
            content: content.into(),
            master_path: master_path.into(),
            include: include.into(),
            master_base: master_base.into(),
            created_master: false,
        }
    }

    async fn add_include(&mut self, ctx: &StepContext<'_>) -> CacheMgrResult<()> {
        let _guard = ctx.host_locks.lock(ctx.host()).await;
        let (master, existed) = match ctx.channel.read_file(&self.master_path, ctx.timeout).await? {
            Some(master) => (master, true),
            None => (self.master_base.clone(), false),
        };
        let updated = ensure_include(&master, &self.include);
        if updated != master || !existed {
            ctx.channel
                .write_file(&self.master_path, &updated, ctx.timeout)
                .await?;
            self.created_master = !existed;
        }
        Ok(())
    }

    async fn drop_created_master(&self, ctx: &StepContext<'_>) -> CacheMgrResult<()> {
        let _guard = ctx.host_locks.lock(ctx.host()).await;
        let master = ctx.channel.read_file(&self.master_path, ctx.timeout).await?;
        if master.as_deref() == Some(self.master_base.as_str()) {
            ctx.channel.remove_file(&self.master_path, ctx.timeout).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl ProvisioningStep for WriteSitePolicy {
    fn name(&self) -> &str {
        names::WRITE_SITE_POLICY
    }

    async fn probe(&mut self, ctx: &StepContext<'_>) -> CacheMgrResult<bool> {
        let policy = ctx.channel.read_file(&self.policy_path, ctx.timeout).await?;
        if policy.as_deref() != Some(self.content.as_str()) {
            return Ok(false);
        }
        let master = ctx.channel.read_file(&self.master_path, ctx.timeout).await?;
        Ok(master.is_some_and(|m| count_include(&m, &self.include) == 1))
    }

    async fn apply(&mut self, ctx: &StepContext<'_>) -> CacheMgrResult<()> {
        ctx.channel
            .write_file(&self.policy_path, &self.content, ctx.timeout)
            .await?;
        if let Err(e) = self.add_include(ctx).await {
            let undo = ctx.channel.remove_file(&self.policy_path, ctx.timeout);
            return Err(undo_partial(names::WRITE_SITE_POLICY, ctx, e, undo).await);
        }
        Ok(())
    }

    async fn compensate(&mut self, ctx: &StepContext<'_>) -> CacheMgrResult<()> {
        remove_include_line(ctx, &self.master_path, &self.include).await?;
        if self.created_master {
            self.drop_created_master(ctx).await?;
        }
        ctx.channel.remove_file(&self.policy_path, ctx.timeout).await
    }
}

/// Removes `include` from the master configuration under the host lock.
/// Returns true if the line was present.
async fn remove_include_line(
    ctx: &StepContext<'_>,
    master_path: &str,
    include: &str,
) -> CacheMgrResult<bool> {
    let _guard = ctx.host_locks.lock(ctx.host()).await;
    let master = match ctx.channel.read_file(master_path, ctx.timeout).await? {
        Some(master) => master,
        None => return Ok(false),
    };
    if count_include(&master, include) == 0 {
        return Ok(false);
    }
    ctx.channel
        .write_file(master_path, &remove_include(&master, include), ctx.timeout)
        .await?;
    Ok(true)
}

/// Edit applied to the origin site configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OriginPatch {
    /// SharedPort: route public traffic through the daemon.
    ProxyBlock {
        /// Fragment inserted into every `server` block.
        block: String,
    },
    /// DedicatedPort: move the origin's public listeners to loopback.
    ListenRewrite {
        /// Internal HTTP port.
        backend_port: u16,
        /// Public HTTP port being released.
        public_port: u16,
        /// Public HTTPS port being released.
        public_tls_port: u16,
    },
}

/// Patches the origin site configuration, keeping a full backup.
///
/// Compensation restores the backup this step captured, or strips the
/// site's marked edits when it captured none, then reloads the origin
/// (best effort).
#[derive(Debug, Clone)]
pub struct PatchOriginConfig {
    site_id: String,
    config_path: String,
    backup_path: String,
    patch: OriginPatch,
    reload_command: String,
    created_backup: bool,
}

impl PatchOriginConfig {
    /// Creates the step.
    pub fn new(
        site_id: impl Into<String>,
        config_path: impl Into<String>,
        backup_path: impl Into<String>,
        patch: OriginPatch,
        reload_command: impl Into<String>,
    ) -> Self {
        Self {
            site_id: site_id.into(),
            config_path: config_path.into(),
            backup_path: backup_path.into(),
            patch,
            reload_command: reload_command.into(),
            created_backup: false,
        }
    }

    async fn read_config(&self, ctx: &StepContext<'_>) -> CacheMgrResult<String> {
        ctx.channel
            .read_file(&self.config_path, ctx.timeout)
            .await?
            .ok_or_else(|| {
                CacheMgrError::invalid_config(
                    "origin site config",
                    format!("{} does not exist on {}", self.config_path, ctx.host()),
                )
            })
    }

    fn patched(&self, config: &str) -> CacheMgrResult<String> {
        match &self.patch {
            OriginPatch::ProxyBlock { block } => {
                origin::insert_marked_block(config, &self.site_id, block)
            }
            OriginPatch::ListenRewrite {
                backend_port,
                public_port,
                public_tls_port,
            } => origin::rewrite_listen_directives(
                config,
                &self.site_id,
                *backend_port,
                *public_port,
                *public_tls_port,
            ),
        }
    }
}

#[async_trait]
impl ProvisioningStep for PatchOriginConfig {
    fn name(&self) -> &str {
        names::PATCH_ORIGIN
    }

    async fn probe(&mut self, ctx: &StepContext<'_>) -> CacheMgrResult<bool> {
        let config = self.read_config(ctx).await?;
        Ok(match self.patch {
            OriginPatch::ProxyBlock { .. } => origin::has_marked_block(&config, &self.site_id),
            OriginPatch::ListenRewrite { .. } => {
                origin::has_listen_rewrite(&config, &self.site_id)
            }
        })
    }

    async fn apply(&mut self, ctx: &StepContext<'_>) -> CacheMgrResult<()> {
        let config = self.read_config(ctx).await?;
        let patched = self.patched(&config)?;

        if ctx
            .channel
            .read_file(&self.backup_path, ctx.timeout)
            .await?
            .is_none()
        {
            ctx.channel
                .write_file(&self.backup_path, &config, ctx.timeout)
                .await?;
            self.created_backup = true;
        }

        if let Err(e) = ctx
            .channel
            .write_file(&self.config_path, &patched, ctx.timeout)
            .await
        {
            if !self.created_backup {
                return Err(e);
            }
            self.created_backup = false;
            let undo = ctx.channel.remove_file(&self.backup_path, ctx.timeout);
            return Err(undo_partial(names::PATCH_ORIGIN, ctx, e, undo).await);
        }
        Ok(())
    }

    async fn compensate(&mut self, ctx: &StepContext<'_>) -> CacheMgrResult<()> {
        let backup = if self.created_backup {
            ctx.channel.read_file(&self.backup_path, ctx.timeout).await?
        } else {
            None
        };

        match backup {
            Some(original) => {
                ctx.channel
                    .write_file(&self.config_path, &original, ctx.timeout)
                    .await?;
                ctx.channel.remove_file(&self.backup_path, ctx.timeout).await?;
                self.created_backup = false;
            }
            None => {
                if let Some(config) = ctx.channel.read_file(&self.config_path, ctx.timeout).await? {
                    let stripped = origin::strip_site_edits(&config, &self.site_id);
                    if stripped != config {
                        ctx.channel
                            .write_file(&self.config_path, &stripped, ctx.timeout)
                            .await?;
                    }
                }
            }
        }

        if let Err(e) = ctx.channel.execute(&self.reload_command, ctx.timeout).await {
            warn!(host = %ctx.host(), error = %e, "Origin reload after restore failed");
        }
        Ok(())
    }
}

/// Runs the origin's configuration syntax check.
#[derive(Debug, Clone)]
pub struct ValidateOriginConfig {
    /// Syntax check command.
    pub test_command: String,
}

#[async_trait]
impl ProvisioningStep for ValidateOriginConfig {
    fn name(&self) -> &str {
        names::VALIDATE_ORIGIN
    }

    async fn probe(&mut self, _ctx: &StepContext<'_>) -> CacheMgrResult<bool> {
        Ok(false)
    }

    async fn apply(&mut self, ctx: &StepContext<'_>) -> CacheMgrResult<()> {
        ctx.channel
            .execute(&self.test_command, ctx.timeout)
            .await
            .map(|_| ())
    }

    async fn compensate(&mut self, _ctx: &StepContext<'_>) -> CacheMgrResult<()> {
        Ok(())
    }
}

/// Refreshes the daemon and reloads the origin.
///
/// The daemon restarts when its files changed or it is not running, and
/// reloads otherwise so other tenants keep their cache. Under SharedPort
/// the daemon goes first; under DedicatedPort the origin reloads first to
/// release the public ports.
#[derive(Debug, Clone)]
pub struct RefreshServices {
    /// Topology being enabled.
    pub topology: TopologyKind,
    /// Daemon unit.
    pub daemon_service: String,
    /// Origin check-and-reload command.
    pub origin_reload_command: String,
    /// Raised by [`WriteDaemonConfig`].
    pub daemon_changed: DaemonFilesChanged,
}

impl RefreshServices {
    async fn refresh_daemon(&self, ctx: &StepContext<'_>) -> CacheMgrResult<()> {
        let running = ctx
            .channel
            .run(&build_is_active_cmd(&self.daemon_service), ctx.timeout)
            .await?
            .success();
        let command = if self.daemon_changed.load(Ordering::SeqCst) || !running {
            build_restart_service_cmd(&self.daemon_service)
        } else {
            build_reload_service_cmd(&self.daemon_service)
        };
        debug!(host = %ctx.host(), command = %command, "Refreshing cache daemon");
        ctx.channel.execute(&command, ctx.timeout).await.map(|_| ())
    }
}

#[async_trait]
impl ProvisioningStep for RefreshServices {
    fn name(&self) -> &str {
        names::REFRESH_SERVICES
    }

    async fn probe(&mut self, _ctx: &StepContext<'_>) -> CacheMgrResult<bool> {
        Ok(false)
    }

    async fn apply(&mut self, ctx: &StepContext<'_>) -> CacheMgrResult<()> {
        match self.topology {
            TopologyKind::SharedPort => {
                self.refresh_daemon(ctx).await?;
                ctx.channel
                    .execute(&self.origin_reload_command, ctx.timeout)
                    .await?;
            }
            TopologyKind::DedicatedPort => {
                ctx.channel
                    .execute(&self.origin_reload_command, ctx.timeout)
                    .await?;
                self.refresh_daemon(ctx).await?;
            }
        }
        Ok(())
    }

    async fn compensate(&mut self, _ctx: &StepContext<'_>) -> CacheMgrResult<()> {
        Ok(())
    }
}

/// Removes the per-site policy and its include line.
///
/// Compensation writes back what was removed.
#[derive(Debug, Clone)]
pub struct RemoveSitePolicy {
    policy_path: String,
    master_path: String,
    include: String,
    captured_policy: Option<String>,
    removed_include: bool,
}

impl RemoveSitePolicy {
    /// Creates the step.
    pub fn new(
        policy_path: impl Into<String>,
        master_path: impl Into<String>,
        include: impl Into<String>,
    ) -> Self {
        Self {
            policy_path: policy_path.into(),
            master_path: master_path.into(),
            include: include.into(),
            captured_policy: None,
            removed_include: false,
        }
    }
}

#[async_trait]
impl ProvisioningStep for RemoveSitePolicy {
    fn name(&self) -> &str {
        names::REMOVE_SITE_POLICY
    }

    async fn probe(&mut self, ctx: &StepContext<'_>) -> CacheMgrResult<bool> {
        if ctx
            .channel
            .read_file(&self.policy_path, ctx.timeout)
            .await?
            .is_some()
        {
            return Ok(false);
        }
        let master = ctx.channel.read_file(&self.master_path, ctx.timeout).await?;
        Ok(master.map_or(true, |m| count_include(&m, &self.include) == 0))
    }

    async fn apply(&mut self, ctx: &StepContext<'_>) -> CacheMgrResult<()> {
        self.captured_policy = ctx.channel.read_file(&self.policy_path, ctx.timeout).await?;
        self.removed_include = remove_include_line(ctx, &self.master_path, &self.include).await?;
        if let Err(e) = ctx.channel.remove_file(&self.policy_path, ctx.timeout).await {
            let undo = self.compensate(ctx);
            return Err(undo_partial(names::REMOVE_SITE_POLICY, ctx, e, undo).await);
        }
        Ok(())
    }

    async fn compensate(&mut self, ctx: &StepContext<'_>) -> CacheMgrResult<()> {
        if let Some(policy) = self.captured_policy.take() {
            ctx.channel
                .write_file(&self.policy_path, &policy, ctx.timeout)
                .await?;
        }
        if self.removed_include {
            let _guard = ctx.host_locks.lock(ctx.host()).await;
            if let Some(master) = ctx.channel.read_file(&self.master_path, ctx.timeout).await? {
                ctx.channel
                    .write_file(
                        &self.master_path,
                        &ensure_include(&master, &self.include),
                        ctx.timeout,
                    )
                    .await?;
            }
            self.removed_include = false;
        }
        Ok(())
    }
}

/// Restores the origin site configuration.
///
/// Uses the pre-patch backup when present, otherwise strips the site's
/// marked edits. Compensation writes back both captured files.
#[derive(Debug, Clone)]
pub struct RestoreOriginConfig {
    site_id: String,
    config_path: String,
    backup_path: String,
    captured_config: Option<String>,
    captured_backup: Option<String>,
}

impl RestoreOriginConfig {
    /// Creates the step.
    pub fn new(
        site_id: impl Into<String>,
        config_path: impl Into<String>,
        backup_path: impl Into<String>,
    ) -> Self {
        Self {
            site_id: site_id.into(),
            config_path: config_path.into(),
            backup_path: backup_path.into(),
            captured_config: None,
            captured_backup: None,
        }
    }
}

#[async_trait]
impl ProvisioningStep for RestoreOriginConfig {
    fn name(&self) -> &str {
        names::RESTORE_ORIGIN
    }

    async fn probe(&mut self, ctx: &StepContext<'_>) -> CacheMgrResult<bool> {
        if ctx
            .channel
            .read_file(&self.backup_path, ctx.timeout)
            .await?
            .is_some()
        {
            return Ok(false);
        }
        let config = ctx.channel.read_file(&self.config_path, ctx.timeout).await?;
        Ok(config.map_or(true, |c| !origin::has_site_edits(&c, &self.site_id)))
    }

    async fn apply(&mut self, ctx: &StepContext<'_>) -> CacheMgrResult<()> {
        let config = ctx.channel.read_file(&self.config_path, ctx.timeout).await?;
        let backup = ctx.channel.read_file(&self.backup_path, ctx.timeout).await?;

        let restored = match (&backup, &config) {
            (Some(original), _) => Some(original.clone()),
            (None, Some(current)) => Some(origin::strip_site_edits(current, &self.site_id)),
            (None, None) => None,
        };

        if let Some(restored) = restored {
            if config.as_ref() != Some(&restored) {
                ctx.channel
                    .write_file(&self.config_path, &restored, ctx.timeout)
                    .await?;
                self.captured_config = config;
            }
        }
        if backup.is_some() {
            self.captured_backup = backup;
            if let Err(e) = ctx.channel.remove_file(&self.backup_path, ctx.timeout).await {
                let undo = self.compensate(ctx);
                return Err(undo_partial(names::RESTORE_ORIGIN, ctx, e, undo).await);
            }
        }
        Ok(())
    }

    async fn compensate(&mut self, ctx: &StepContext<'_>) -> CacheMgrResult<()> {
        if let Some(config) = self.captured_config.take() {
            ctx.channel
                .write_file(&self.config_path, &config, ctx.timeout)
                .await?;
        }
        if let Some(backup) = self.captured_backup.take() {
            ctx.channel
                .write_file(&self.backup_path, &backup, ctx.timeout)
                .await?;
        }
        Ok(())
    }
}

/// Stops the daemon so the origin can take the public ports back.
///
/// Compensation starts it again if this step stopped it.
#[derive(Debug, Clone)]
pub struct ReleasePublicPorts {
    service: String,
    stopped: bool,
}

impl ReleasePublicPorts {
    /// Creates the step.
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            stopped: false,
        }
    }
}

#[async_trait]
impl ProvisioningStep for ReleasePublicPorts {
    fn name(&self) -> &str {
        names::RELEASE_PUBLIC_PORTS
    }

    async fn probe(&mut self, ctx: &StepContext<'_>) -> CacheMgrResult<bool> {
        Ok(!ctx
            .channel
            .run(&build_is_active_cmd(&self.service), ctx.timeout)
            .await?
            .success())
    }

    async fn apply(&mut self, ctx: &StepContext<'_>) -> CacheMgrResult<()> {
        ctx.channel
            .execute(&build_stop_service_cmd(&self.service), ctx.timeout)
            .await?;
        self.stopped = true;
        Ok(())
    }

    async fn compensate(&mut self, ctx: &StepContext<'_>) -> CacheMgrResult<()> {
        if self.stopped {
            ctx.channel
                .execute(&build_start_service_cmd(&self.service), ctx.timeout)
                .await?;
            self.stopped = false;
        }
        Ok(())
    }
}

/// Checks and reloads the origin.
#[derive(Debug, Clone)]
pub struct ReloadOrigin {
    /// Check-and-reload command.
    pub command: String,
}

#[async_trait]
impl ProvisioningStep for ReloadOrigin {
    fn name(&self) -> &str {
        names::RELOAD_ORIGIN
    }

    async fn probe(&mut self, _ctx: &StepContext<'_>) -> CacheMgrResult<bool> {
        Ok(false)
    }

    async fn apply(&mut self, ctx: &StepContext<'_>) -> CacheMgrResult<()> {
        ctx.channel
            .execute(&self.command, ctx.timeout)
            .await
            .map(|_| ())
    }

    async fn compensate(&mut self, _ctx: &StepContext<'_>) -> CacheMgrResult<()> {
        Ok(())
    }
}
