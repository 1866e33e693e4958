//! Step executor: runs a registry of steps against a host.
//!
//! Steps run strictly one after another in ordinal order. Each step is
//! snapshotted, then mutated, and its outcome is recorded in the
//! [`RunContext`] before the next step starts:
//!
//! 1. A **mandatory** failure rolls the failing step back, restores its
//!    snapshots and aborts the run; later steps never run.
//! 2. An **optional** failure is logged as a warning and the run continues.
//! 3. A step depending on a step that did not succeed is **skipped**.

use std::fmt;

use tracing::debug;

use crate::backup::{BackupHandle, BackupManager};
use crate::context::{RunContext, StepOutcome};
use crate::error::ProvisionError;
use crate::host::Host;
use crate::registry::StepRegistry;
use crate::report::Reporter;
use crate::step::{ProvisioningStep, StepEffect, StepScope};

/// What happened to the non-fatal steps of a completed run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionSummary {
    /// One entry per optional failure or skipped step.
    pub warnings: Vec<String>,
}

/// Runs every step of a registry once.
pub struct StepExecutor<'a> {
    registry: &'a StepRegistry,
    host: &'a Host,
    backups: BackupManager,
    dry_run: bool,
}

impl<'a> StepExecutor<'a> {
    pub fn new(registry: &'a StepRegistry, host: &'a Host, backups: BackupManager) -> Self {
        Self {
            registry,
            host,
            backups,
            dry_run: false,
        }
    }

    /// Logs every step instead of running it.
    #[must_use]
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Executes all steps in ordinal order.
    ///
    /// Returns `Err` only when a mandatory step could not be completed; the
    /// context then records which steps had succeeded before it.
    pub fn run(
        &mut self,
        ctx: &mut RunContext,
        reporter: &mut Reporter,
    ) -> Result<ExecutionSummary, ProvisionError> {
        let registry = self.registry;
        registry.validate()?;
        for step in registry.steps() {
            ctx.register_pending(step.name(), step.ordinal(), step.is_mandatory())?;
        }
        ctx.persist_or_warn();

        let total = registry.len();
        let mut summary = ExecutionSummary::default();
        for (index, step) in registry.steps().enumerate() {
            let position = format!("{}/{}", index + 1, total);

            // Nothing ran, so dependencies are not evaluated.
            if self.dry_run {
                reporter.info(format!(
                    "dry run: would run step {} {} ({}, {})",
                    position,
                    step.name(),
                    step.operation(),
                    if step.is_mandatory() { "mandatory" } else { "optional" }
                ));
                ctx.finish(step.name(), StepOutcome::Skipped, Some("dry run".to_string()))?;
                continue;
            }

            if let Some(dependency) = unmet_dependency(step, ctx) {
                let detail = format!("dependency '{}' did not succeed", dependency);
                reporter.warning(format!("skipping step {} {}: {}", position, step.name(), detail));
                summary.warnings.push(format!("{}: {}", step.name(), detail));
                ctx.finish(step.name(), StepOutcome::Skipped, Some(detail))?;
                ctx.persist_or_warn();
                continue;
            }

            ctx.begin(step.name())?;
            reporter.info(format!("running step {} {}: {}", position, step.name(), step.operation()));
            let result = self.execute_step(step, ctx, reporter, &mut summary);
            ctx.persist_or_warn();
            result?;
        }
        if self.dry_run {
            ctx.persist_or_warn();
        }
        Ok(summary)
    }

    fn execute_step(
        &mut self,
        step: &ProvisioningStep,
        ctx: &mut RunContext,
        reporter: &mut Reporter,
        summary: &mut ExecutionSummary,
    ) -> Result<(), ProvisionError> {
        let mut handles: Vec<BackupHandle> = Vec::new();
        for target in step.targets() {
            match self.backups.snapshot(target) {
                Ok(Some(handle)) => {
                    reporter.info(format!("backed up {} to {}", handle.path(), handle.location()));
                    ctx.add_backup(handle.clone());
                    handles.push(handle);
                }
                Ok(None) => debug!("{} has nothing to back up at {}", step.name(), target.path),
                Err(err) => return self.snapshot_failed(step, err, ctx, reporter, summary),
            }
        }

        let host = self.host;
        let mut scope = StepScope::new(host, &mut self.backups);
        let result = step.apply(&mut scope);
        for handle in scope.into_handles() {
            reporter.info(format!("recorded {} to {}", handle.path(), handle.location()));
            ctx.add_backup(handle.clone());
            handles.push(handle);
        }

        match result {
            Ok(effect) => {
                let detail = match effect {
                    StepEffect::Changed => None,
                    StepEffect::Unchanged => Some("already in desired state".to_string()),
                };
                match &detail {
                    Some(detail) => reporter.success(format!("step {} succeeded ({})", step.name(), detail)),
                    None => reporter.success(format!("step {} succeeded", step.name())),
                }
                ctx.finish(step.name(), StepOutcome::Succeeded, detail)
            }
            Err(err) => {
                let message = format!("{:#}", err);
                ctx.finish(step.name(), StepOutcome::Failed, Some(message.clone()))?;
                if step.is_mandatory() {
                    let completed = ctx.completed_steps();
                    let failure = ProvisionError::Mutation {
                        step: step.name().to_string(),
                        operation: step.operation().to_string(),
                        message,
                        completed,
                    };
                    reporter.error(failure.to_string());
                    self.recover(step, &handles, reporter);
                    Err(failure)
                } else {
                    reporter.warning(format!(
                        "optional step {} failed during {}: {}; continuing",
                        step.name(),
                        step.operation(),
                        message
                    ));
                    summary.warnings.push(format!("{}: {}", step.name(), message));
                    Ok(())
                }
            }
        }
    }

    /// A step whose pre-mutation snapshot failed is never mutated.
    fn snapshot_failed(
        &self,
        step: &ProvisioningStep,
        err: ProvisionError,
        ctx: &mut RunContext,
        reporter: &mut Reporter,
        summary: &mut ExecutionSummary,
    ) -> Result<(), ProvisionError> {
        if step.is_mandatory() {
            ctx.finish(step.name(), StepOutcome::Failed, Some(err.to_string()))?;
            let failure = ProvisionError::Unbacked {
                step: step.name().to_string(),
                source: Box::new(err),
                completed: ctx.completed_steps(),
            };
            reporter.error(failure.to_string());
            Err(failure)
        } else {
            let detail = format!("not attempted: {}", err);
            reporter.warning(format!("skipping optional step {}: {}", step.name(), err));
            summary.warnings.push(format!("{}: {}", step.name(), detail));
            ctx.finish(step.name(), StepOutcome::Skipped, Some(detail))
        }
    }

    /// Runs the step's rollback, then restores its snapshots newest first.
    fn recover(&self, step: &ProvisioningStep, handles: &[BackupHandle], reporter: &mut Reporter) {
        match step.roll_back(self.host) {
            Some(Ok(())) => reporter.info(format!("rolled back step {}", step.name())),
            Some(Err(e)) => reporter.error(format!(
                "rollback of step {} failed, manual intervention required: {:#}",
                step.name(),
                e
            )),
            None => {}
        }
        for handle in handles.iter().rev() {
            if let Err(e) = self.backups.restore(handle) {
                reporter.error(e.to_string());
            } else {
                reporter.info(format!("restored {} from backup", handle.path()));
            }
        }
    }
}

impl fmt::Debug for StepExecutor<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepExecutor")
            .field("steps", &self.registry.len())
            .field("backups", &self.backups)
            .field("dry_run", &self.dry_run)
            .finish()
    }
}

/// The first dependency of `step` that did not succeed.
fn unmet_dependency<'s>(step: &'s ProvisioningStep, ctx: &RunContext) -> Option<&'s str> {
    step.dependencies()
        .iter()
        .find(|dep| ctx.outcome(dep) != Some(StepOutcome::Succeeded))
        .map(String::as_str)
}
