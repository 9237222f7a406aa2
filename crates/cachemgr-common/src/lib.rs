//! Common infrastructure for cachemgrd.
//!
//! This crate provides shared functionality for the cache orchestrator
//! and its test tooling:
//!
//! - [`shell`]: Safe shell command execution with proper quoting and timeouts
//! - [`channel`]: The one-shot [`CommandChannel`] to a host (local or ssh)
//! - [`error`]: Error types for cachemgr operations
//! - [`types`]: Sites, cache state and purge modes
//!
//! # Example
//!
//! ```ignore
//! use cachemgr_common::{CommandChannel, ShellChannel, shell::shellquote};
//!
//! async fn reload(channel: &dyn CommandChannel) -> CacheMgrResult<()> {
//!     let cmd = format!("systemctl reload {}", shellquote("nginx"));
//!     channel.execute(&cmd, Duration::from_secs(30)).await?;
//!     Ok(())
//! }
//! ```

pub mod channel;
pub mod error;
pub mod shell;
pub mod types;

// Re-export commonly used items at crate root
pub use channel::{CommandChannel, ShellChannel, Transport};
pub use error::{CacheMgrError, CacheMgrResult, CompensationFailure, TransitionConflict};
pub use shell::ExecResult;
pub use types::{
    normalize_path, CacheParams, CacheState, EnableRequest, PurgeMode, Site, Topology,
    TopologyKind, MAX_BACKEND_PORT, MIN_BACKEND_PORT, TLS_PORT_OFFSET,
};
