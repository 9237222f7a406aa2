//! Cache invalidation.
//!
//! Each mode has a primary and a fallback mechanism:
//!
//! | mode    | primary                          | fallback                          |
//! |---------|----------------------------------|-----------------------------------|
//! | All     | `varnishadm ban` by host         | HTTP `BAN` with `X-Ban-Scope: *`  |
//! | Pattern | `varnishadm ban` by host and url | HTTP `BAN` with `X-Ban-Url`       |
//! | Single  | HTTP `PURGE` of the path         | `varnishadm ban` by exact url     |
//!
//! Purging touches neither the desired-state store nor any file; purging
//! something that is not cached succeeds.

use cachemgr_common::{
    normalize_path, CacheMgrError, CacheMgrResult, CommandChannel, PurgeMode, Site, Topology,
};
use std::fmt;
use std::time::Duration;
use tracing::{info, warn};

use crate::commands::{
    build_admin_ban_cmd, build_exact_ban_expression, build_host_ban_expression,
    build_http_ban_cmd, build_http_purge_cmd, build_pattern_ban_expression,
};
use crate::config::CacheMgrConfig;

/// Mechanism that carried out a purge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PurgeMechanism {
    /// Daemon administrative interface.
    Admin,
    /// HTTP request to the daemon.
    Http,
}

impl fmt::Display for PurgeMechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PurgeMechanism::Admin => write!(f, "admin"),
            PurgeMechanism::Http => write!(f, "http"),
        }
    }
}

/// Result of a purge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurgeOutcome {
    /// Mode name.
    pub mode: &'static str,
    /// Mechanism that succeeded.
    pub mechanism: PurgeMechanism,
    /// True if the primary mechanism failed.
    pub fallback_used: bool,
}

/// Issues invalidations for one site.
pub struct Purger<'a> {
    channel: &'a dyn CommandChannel,
    config: &'a CacheMgrConfig,
    timeout: Duration,
}

impl<'a> Purger<'a> {
    /// Creates a purger over `channel`.
    pub fn new(channel: &'a dyn CommandChannel, config: &'a CacheMgrConfig) -> Self {
        Self {
            channel,
            config,
            timeout: config.command_timeout(),
        }
    }

    /// Local address the daemon serves HTTP on for a topology.
    pub fn http_endpoint(&self, topology: Topology) -> String {
        match topology {
            Topology::SharedPort => self.config.daemon.internal_endpoint(),
            Topology::DedicatedPort { .. } => {
                format!("127.0.0.1:{}", self.config.origin.public_port)
            }
        }
    }

    fn admin_ban(&self, expression: &str) -> String {
        build_admin_ban_cmd(
            &self.config.daemon.admin_address,
            &self.config.daemon.secret_path,
            expression,
        )
    }

    /// Runs every command, stopping at the first failure.
    async fn run_all(&self, commands: &[String]) -> CacheMgrResult<()> {
        for command in commands {
            self.channel.execute(command, self.timeout).await?;
        }
        Ok(())
    }

    /// Invalidates cached content of `site` under `topology`.
    pub async fn purge(
        &self,
        site: &Site,
        mode: &PurgeMode,
        topology: Topology,
    ) -> CacheMgrResult<PurgeOutcome> {
        let hostnames = site.hostnames();
        // HTTP requests need a concrete Host header.
        let concrete: Vec<&str> = hostnames
            .iter()
            .copied()
            .filter(|h| !h.starts_with("*."))
            .collect();
        let endpoint = self.http_endpoint(topology);

        let (primary_mechanism, primary, fallback) = match mode {
            PurgeMode::All => (
                PurgeMechanism::Admin,
                vec![self.admin_ban(&build_host_ban_expression(&hostnames))],
                concrete
                    .iter()
                    .map(|h| build_http_ban_cmd(&endpoint, h, None))
                    .collect::<Vec<_>>(),
            ),
            PurgeMode::Pattern(pattern) => (
                PurgeMechanism::Admin,
                vec![self.admin_ban(&build_pattern_ban_expression(&hostnames, pattern))],
                concrete
                    .iter()
                    .map(|h| build_http_ban_cmd(&endpoint, h, Some(pattern.as_str())))
                    .collect(),
            ),
            PurgeMode::Single(path) => {
                let path = normalize_path(path);
                (
                    PurgeMechanism::Http,
                    concrete
                        .iter()
                        .map(|h| build_http_purge_cmd(&endpoint, h, &path))
                        .collect(),
                    vec![self.admin_ban(&build_exact_ban_expression(&hostnames, &path))],
                )
            }
        };
        let fallback_mechanism = match primary_mechanism {
            PurgeMechanism::Admin => PurgeMechanism::Http,
            PurgeMechanism::Http => PurgeMechanism::Admin,
        };
        let step = format!("purge-{}", mode.as_str());

        let primary_error = if primary.is_empty() {
            CacheMgrError::internal("site has no concrete hostname for an HTTP purge")
        } else {
            match self.run_all(&primary).await {
                Ok(()) => {
                    info!(site = %site.id, mode = mode.as_str(), mechanism = %primary_mechanism, "Purged");
                    return Ok(PurgeOutcome {
                        mode: mode.as_str(),
                        mechanism: primary_mechanism,
                        fallback_used: false,
                    });
                }
                Err(e) => e,
            }
        };

        warn!(
            site = %site.id,
            mode = mode.as_str(),
            error = %primary_error,
            "Primary purge failed, using fallback"
        );
        if fallback.is_empty() {
            return Err(CacheMgrError::step_failed(step, primary_error));
        }
        match self.run_all(&fallback).await {
            Ok(()) => {
                info!(site = %site.id, mode = mode.as_str(), mechanism = %fallback_mechanism, "Purged");
                Ok(PurgeOutcome {
                    mode: mode.as_str(),
                    mechanism: fallback_mechanism,
                    fallback_used: true,
                })
            }
            Err(e) => Err(CacheMgrError::step_failed(step, e)),
        }
    }
}
