//! Errors shared by the command channel, the step engine and the
//! orchestrator.
//!
//! Workflow failures wrap the failing step's error in
//! [`CacheMgrError::StepFailed`] or [`CacheMgrError::RollbackPartial`];
//! the classifiers look through that wrapping.

use std::fmt;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// `Result` over [`CacheMgrError`].
pub type CacheMgrResult<T> = Result<T, CacheMgrError>;

/// Why a requested transition was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionConflict {
    /// Enable was requested for a site that already has caching enabled.
    AlreadyEnabled,
    /// Disable or Purge was requested for a site without caching.
    NotEnabled,
}

impl fmt::Display for TransitionConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransitionConflict::AlreadyEnabled => write!(f, "caching already enabled"),
            TransitionConflict::NotEnabled => write!(f, "caching not enabled"),
        }
    }
}

/// A compensating action that failed while unwinding a workflow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompensationFailure {
    /// Name of the step whose compensation failed.
    pub step: String,
    /// Rendered error of the failed compensation.
    pub error: String,
}

impl fmt::Display for CompensationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.step, self.error)
    }
}

/// Every failure an Enable, Disable or Purge can report.
#[derive(Debug, Error)]
pub enum CacheMgrError {
    /// The local process (`sh` or `ssh`) could not be spawned or awaited.
    #[error("Failed to spawn '{command}': {source}")]
    ShellExec {
        /// Program and arguments.
        command: String,
        /// Spawn or wait error.
        #[source]
        source: io::Error,
    },

    /// A command ran on the host and exited non-zero.
    #[error("Command '{command}' exited with code {exit_code}: {output}")]
    ShellCommandFailed {
        /// Command line as sent to the host.
        command: String,
        /// Exit status.
        exit_code: i32,
        /// Trimmed stdout, then stderr.
        output: String,
    },

    /// A command printed bytes that are not UTF-8 on stdout.
    #[error("Output of '{command}' is not valid UTF-8 (first bad byte at offset {offset})")]
    NonUtf8Output {
        /// Command line as sent to the host.
        command: String,
        /// Length of the valid prefix.
        offset: usize,
    },

    /// Command did not finish within its timeout.
    #[error("Shell command timed out after {timeout:?}: '{command}'")]
    Timeout {
        /// The command that timed out.
        command: String,
        /// The timeout that elapsed.
        timeout: Duration,
    },

    /// The remote channel itself failed (connection, authentication).
    #[error("Command channel to '{host}' failed: {message}")]
    Channel {
        /// Host the channel points at.
        host: String,
        /// Error message.
        message: String,
    },

    /// A request, catalog entry or configuration value was rejected.
    #[error("Invalid {field}: {message}")]
    InvalidConfig {
        /// Offending field.
        field: String,
        /// What is wrong with it.
        message: String,
    },

    /// Requested transition is illegal for the recorded state.
    #[error("Illegal transition for site '{site}': {conflict}")]
    IllegalTransition {
        /// Site identifier.
        site: String,
        /// What the recorded state conflicts with.
        conflict: TransitionConflict,
    },

    /// Site is not present in the catalog.
    #[error("Site '{site}' not found")]
    SiteNotFound {
        /// Site identifier.
        site: String,
    },

    /// No command channel registered for a host.
    #[error("Host '{host}' not found")]
    HostNotFound {
        /// Host identifier.
        host: String,
    },

    /// A provisioning step failed; completed steps were compensated.
    #[error("Step '{step}' failed: {cause}")]
    StepFailed {
        /// Name of the failing step.
        step: String,
        /// Underlying failure.
        #[source]
        cause: Box<CacheMgrError>,
    },

    /// A provisioning step failed and one or more compensations failed too.
    #[error(
        "Step '{step}' failed: {cause}; rollback incomplete ({} compensation(s) failed), host needs manual attention",
        .failures.len()
    )]
    RollbackPartial {
        /// Name of the failing step.
        step: String,
        /// Underlying failure.
        #[source]
        cause: Box<CacheMgrError>,
        /// Compensations that failed during unwind.
        failures: Vec<CompensationFailure>,
    },

    /// Workflow was cancelled before a step started.
    #[error("Workflow cancelled before step '{before_step}'")]
    Cancelled {
        /// Step that was not started.
        before_step: String,
    },

    /// Desired-state store operation failed.
    #[error("State store operation failed: {operation}: {message}")]
    Store {
        /// The operation that failed (e.g., "get", "commit").
        operation: String,
        /// Error message.
        message: String,
    },

    /// Local IO error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Internal error (unexpected state).
    #[error("Internal error: {message}")]
    Internal {
        /// Error message.
        message: String,
    },
}

impl CacheMgrError {
    /// Creates a channel error.
    pub fn channel(host: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Channel {
            host: host.into(),
            message: message.into(),
        }
    }

    /// Creates an invalid configuration error.
    pub fn invalid_config(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Creates an illegal transition error.
    pub fn illegal_transition(site: impl Into<String>, conflict: TransitionConflict) -> Self {
        Self::IllegalTransition {
            site: site.into(),
            conflict,
        }
    }

    /// Creates a site not found error.
    pub fn site_not_found(site: impl Into<String>) -> Self {
        Self::SiteNotFound { site: site.into() }
    }

    /// Creates a host not found error.
    pub fn host_not_found(host: impl Into<String>) -> Self {
        Self::HostNotFound { host: host.into() }
    }

    /// Wraps a failure as the failure of a named step.
    pub fn step_failed(step: impl Into<String>, cause: CacheMgrError) -> Self {
        Self::StepFailed {
            step: step.into(),
            cause: Box::new(cause),
        }
    }

    /// Creates a state store error.
    pub fn store(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Store {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this error came from the transport rather than the
    /// remote command (spawn failure, timeout, connection failure).
    pub fn is_channel_error(&self) -> bool {
        match self {
            CacheMgrError::ShellExec { .. }
            | CacheMgrError::Timeout { .. }
            | CacheMgrError::Channel { .. } => true,
            CacheMgrError::StepFailed { cause, .. }
            | CacheMgrError::RollbackPartial { cause, .. } => cause.is_channel_error(),
            _ => false,
        }
    }

    /// Returns true if the error was raised locally without touching the host.
    pub fn is_rejected_locally(&self) -> bool {
        matches!(
            self,
            CacheMgrError::IllegalTransition { .. }
                | CacheMgrError::InvalidConfig { .. }
                | CacheMgrError::SiteNotFound { .. }
                | CacheMgrError::HostNotFound { .. }
        )
    }

    /// Returns the conflict if this is an illegal transition.
    pub fn transition_conflict(&self) -> Option<TransitionConflict> {
        match self {
            CacheMgrError::IllegalTransition { conflict, .. } => Some(*conflict),
            _ => None,
        }
    }

    /// Returns the name of the failed step for workflow failures.
    pub fn failed_step(&self) -> Option<&str> {
        match self {
            CacheMgrError::StepFailed { step, .. } | CacheMgrError::RollbackPartial { step, .. } => {
                Some(step)
            }
            _ => None,
        }
    }

    /// Returns the compensations that failed, if any.
    pub fn rollback_failures(&self) -> &[CompensationFailure] {
        match self {
            CacheMgrError::RollbackPartial { failures, .. } => failures,
            _ => &[],
        }
    }
}
