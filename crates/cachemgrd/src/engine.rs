//! Provisioning step engine.
//!
//! A workflow is an ordered list of [`ProvisioningStep`]s. Each step is
//! probed first; a satisfied step is skipped but still counts as
//! completed, so its compensation runs if a later step fails. On the
//! first failing forward action the completed steps are compensated in
//! reverse order. Compensation is fail-soft: every completed step gets
//! its chance even when an earlier one fails, and all failures are
//! reported in [`CacheMgrError::RollbackPartial`].
//!
//! There are no retries here; re-running the workflow from the top is
//! safe because of the probes.

use async_trait::async_trait;
use cachemgr_common::{CacheMgrError, CacheMgrResult, CommandChannel, CompensationFailure};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::locks::KeyedLocks;

/// What a step gets to work with.
pub struct StepContext<'a> {
    /// Channel to the host.
    pub channel: &'a dyn CommandChannel,
    /// Host-scoped locks for shared files.
    pub host_locks: &'a KeyedLocks,
    /// Per-command timeout.
    pub timeout: Duration,
    /// Timeout for package installation.
    pub install_timeout: Duration,
}

impl StepContext<'_> {
    /// Host the workflow runs against.
    pub fn host(&self) -> &str {
        self.channel.host()
    }
}

/// One idempotent unit of remote work with its undo.
#[async_trait]
pub trait ProvisioningStep: Send {
    /// Stable step name used in reports and errors.
    fn name(&self) -> &str;

    /// True if the step's effect is already in place.
    async fn probe(&mut self, ctx: &StepContext<'_>) -> CacheMgrResult<bool>;

    /// Forward action.
    async fn apply(&mut self, ctx: &StepContext<'_>) -> CacheMgrResult<()>;

    /// Undo of the forward action. Called for applied and for satisfied
    /// steps; must tolerate running when `apply` never did.
    async fn compensate(&mut self, ctx: &StepContext<'_>) -> CacheMgrResult<()>;
}

/// Ordered steps of one Enable or Disable run.
pub struct Workflow {
    name: String,
    steps: Vec<Box<dyn ProvisioningStep>>,
}

impl Workflow {
    /// Creates an empty workflow.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
        }
    }

    /// Appends a step.
    pub fn step(mut self, step: impl ProvisioningStep + 'static) -> Self {
        self.steps.push(Box::new(step));
        self
    }

    /// Workflow name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Step names in execution order.
    pub fn step_names(&self) -> Vec<String> {
        self.steps.iter().map(|s| s.name().to_string()).collect()
    }
}

/// Audit trail of a successful run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkflowReport {
    /// Workflow name.
    pub workflow: String,
    /// Steps whose forward action ran.
    pub applied: Vec<String>,
    /// Steps skipped because their probe was satisfied.
    pub satisfied: Vec<String>,
}

/// Runs workflows against a host.
#[derive(Debug, Clone, Default)]
pub struct StepEngine {
    cancel: CancellationToken,
}

impl StepEngine {
    /// Creates an engine that is never cancelled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an engine that stops starting steps once `cancel` fires.
    pub fn with_cancellation(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    /// Executes the workflow, rolling back on failure or cancellation.
    pub async fn run(
        &self,
        mut workflow: Workflow,
        ctx: &StepContext<'_>,
    ) -> CacheMgrResult<WorkflowReport> {
        let mut report = WorkflowReport {
            workflow: workflow.name.clone(),
            ..Default::default()
        };
        let host = ctx.host().to_string();

        for idx in 0..workflow.steps.len() {
            let name = workflow.steps[idx].name().to_string();

            if self.cancel.is_cancelled() {
                warn!(workflow = %workflow.name, host = %host, step = %name, "Cancelled, rolling back");
                let cause = CacheMgrError::Cancelled {
                    before_step: name.clone(),
                };
                return Err(
                    Self::rollback(&workflow.name, &mut workflow.steps[..idx], ctx, name, cause)
                        .await,
                );
            }

            let step = &mut workflow.steps[idx];
            let outcome = match step.probe(ctx).await {
                Ok(true) => {
                    debug!(workflow = %workflow.name, host = %host, step = %name, "Already satisfied");
                    report.satisfied.push(name.clone());
                    Ok(())
                }
                Ok(false) => {
                    debug!(workflow = %workflow.name, host = %host, step = %name, "Applying");
                    step.apply(ctx).await.map(|_| report.applied.push(name.clone()))
                }
                Err(e) => Err(e),
            };

            if let Err(cause) = outcome {
                warn!(
                    workflow = %workflow.name,
                    host = %host,
                    step = %name,
                    error = %cause,
                    "Step failed, rolling back"
                );
                return Err(
                    Self::rollback(&workflow.name, &mut workflow.steps[..idx], ctx, name, cause)
                        .await,
                );
            }
        }

        info!(
            workflow = %workflow.name,
            host = %host,
            applied = ?report.applied,
            satisfied = ?report.satisfied,
            "Workflow completed"
        );
        Ok(report)
    }

    /// Compensates `completed` in reverse order and builds the error.
    async fn rollback(
        workflow: &str,
        completed: &mut [Box<dyn ProvisioningStep>],
        ctx: &StepContext<'_>,
        failed_step: String,
        cause: CacheMgrError,
    ) -> CacheMgrError {
        // A step that could not undo its own partial effect already reports
        // a partial rollback; its leftovers head the list.
        let (cause, mut failures) = match cause {
            CacheMgrError::RollbackPartial {
                cause, failures, ..
            } => (*cause, failures),
            other => (other, Vec::new()),
        };

        for step in completed.iter_mut().rev() {
            let name = step.name().to_string();
            match step.compensate(ctx).await {
                Ok(()) => debug!(workflow = %workflow, step = %name, "Compensated"),
                Err(e) => {
                    warn!(workflow = %workflow, step = %name, error = %e, "Compensation failed");
                    failures.push(CompensationFailure {
                        step: name,
                        error: e.to_string(),
                    });
                }
            }
        }

        let cancelled = matches!(cause, CacheMgrError::Cancelled { .. });
        match (failures.is_empty(), cancelled) {
            (true, true) => cause,
            (true, false) => CacheMgrError::step_failed(failed_step, cause),
            (false, _) => CacheMgrError::RollbackPartial {
                step: failed_step,
                cause: Box::new(cause),
                failures,
            },
        }
    }
}
