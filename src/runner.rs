//! Drives one plan from preflight to the final summary.

use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::backup::BackupManager;
use crate::confirm::Confirm;
use crate::context::{RunContext, TargetIdentity};
use crate::error::ProvisionError;
use crate::host::Host;
use crate::lock::RunLock;
use crate::pipeline::StepExecutor;
use crate::preflight::{PreflightChecker, Requirement};
use crate::registry::StepRegistry;
use crate::report::Reporter;
use crate::verify::{Check, VerificationEngine, VerificationResult};

/// Exit code of a run that completed but left warnings behind.
///
/// 2 is taken by clap for usage errors.
pub const EXIT_WARNINGS: i32 = 3;

/// Everything needed to run one provisioning sequence.
#[derive(Debug)]
pub struct Plan {
    pub name: String,
    pub requirements: Vec<Requirement>,
    pub registry: StepRegistry,
    pub checks: Vec<Check>,
    /// Prompt the operator must approve before the first mutation.
    pub confirmation: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    pub state_dir: Utf8PathBuf,
    pub dry_run: bool,
}

/// Final status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum RunStatus {
    #[strum(serialize = "success")]
    Success,
    /// Optional steps failed or verification checks did not pass.
    #[strum(serialize = "completed with warnings")]
    CompletedWithWarnings,
    #[strum(serialize = "failed")]
    Failed,
}

impl RunStatus {
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::CompletedWithWarnings => EXIT_WARNINGS,
            Self::Failed => 1,
        }
    }
}

/// What a run did.
#[derive(Debug)]
pub struct RunReport {
    pub status: RunStatus,
    pub context: RunContext,
    /// `None` when the run aborted or was a dry run.
    pub verification: Option<VerificationResult>,
    /// The error that aborted the run.
    pub failure: Option<ProvisionError>,
    pub log_path: Option<Utf8PathBuf>,
}

/// `<YYYYmmdd-HHMMSS>-<8 hex chars>`, unique per run.
pub fn new_run_id(started_at: DateTime<Utc>) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", started_at.format("%Y%m%d-%H%M%S"), &suffix[..8])
}

/// Runs `plan` against `host`.
///
/// Preflight failures, a declined confirmation and lock contention return
/// `Err` before anything is mutated. Once steps have started, the run
/// always yields a [`RunReport`], with a mandatory failure reported as
/// [`RunStatus::Failed`].
pub fn run_plan(
    plan: &Plan,
    host: &Host,
    target: TargetIdentity,
    options: &RunOptions,
    confirm: &dyn Confirm,
) -> Result<RunReport, ProvisionError> {
    let _lock = RunLock::acquire(&options.state_dir)?;

    let started_at = Utc::now();
    let run_id = new_run_id(started_at);
    let mut reporter = Reporter::to_file(options.state_dir.join("logs").join(format!("{}.log", run_id)))?;
    let mut ctx = RunContext::new(run_id.clone(), started_at, target)
        .with_audit_path(options.state_dir.join("runs").join(format!("{}.yaml", run_id)));

    reporter.info(format!(
        "starting {} run {} (version {}, service {})",
        plan.name, run_id, ctx.target.version, ctx.target.service
    ));
    if options.dry_run {
        reporter.info("dry run: no changes will be made");
    }

    if let Err(err) = PreflightChecker::new(host).check(&plan.requirements) {
        reporter.error(err.to_string());
        reporter.error("no changes were made");
        ctx.persist_or_warn();
        return Err(err);
    }
    reporter.success(format!("preflight checks passed ({} requirements)", plan.requirements.len()));

    if let Some(prompt) = &plan.confirmation {
        if options.dry_run {
            reporter.info("dry run: confirmation not requested");
        } else {
            match confirm.confirm(prompt) {
                Ok(true) => reporter.info("operator confirmed the run"),
                Ok(false) => {
                    reporter.error("operator declined; no changes were made");
                    ctx.persist_or_warn();
                    return Err(ProvisionError::Declined(plan.name.clone()));
                }
                Err(e) => {
                    let err = ProvisionError::Declined(format!("{}: {:#}", plan.name, e));
                    reporter.error(err.to_string());
                    ctx.persist_or_warn();
                    return Err(err);
                }
            }
        }
    }

    let backups = BackupManager::new(
        host.fs.clone(),
        options.state_dir.join("backups").join(&run_id),
    );
    let execution = StepExecutor::new(&plan.registry, host, backups)
        .dry_run(options.dry_run)
        .run(&mut ctx, &mut reporter);

    let (status, verification, failure) = match execution {
        Err(err) => (RunStatus::Failed, None, Some(err)),
        Ok(_) if options.dry_run => (RunStatus::Success, None, None),
        Ok(summary) => {
            let result = VerificationEngine::new(host).verify(&plan.checks, &ctx);
            reporter.verification(&result);
            let status = if summary.warnings.is_empty() && result.all_passed() {
                RunStatus::Success
            } else {
                RunStatus::CompletedWithWarnings
            };
            (status, Some(result), None)
        }
    };

    reporter.summary(&ctx, verification.as_ref(), status);
    ctx.persist_or_warn();

    Ok(RunReport {
        status,
        log_path: reporter.path().map(|p| p.to_owned()),
        context: ctx,
        verification,
        failure,
    })
}
