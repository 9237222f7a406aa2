//! cachemgrd - Varnish cache orchestrator for nginx-hosted sites
//!
//! Enables, disables and purges caching for sites on remote hosts by
//! running idempotent, compensable provisioning workflows over a command
//! channel, and records the desired state per site.

mod cache_mgr;
pub mod commands;
pub mod config;
pub mod daemon;
pub mod engine;
pub mod hosts;
pub mod locks;
pub mod origin;
pub mod policy;
pub mod purge;
pub mod steps;
pub mod store;

pub use cache_mgr::{
    CacheMgr, DaemonAction, DisableReport, EnableReport, SiteStatus, DISABLE_WORKFLOW,
    ENABLE_WORKFLOW,
};
pub use config::{CacheMgrConfig, HostConfig, DEFAULT_CONFIG_PATH};
pub use engine::{ProvisioningStep, StepContext, StepEngine, Workflow, WorkflowReport};
pub use hosts::HostRegistry;
pub use locks::{KeyedLocks, TenancyClaim, TenancyClaims};
pub use policy::{PolicyInput, PolicyRenderer, VclRenderer};
pub use purge::{PurgeMechanism, PurgeOutcome};
pub use store::{DesiredStateStore, JsonStateStore, MemoryStateStore};
