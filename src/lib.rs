pub mod backup;
pub mod cli;
pub mod config;
pub mod confirm;
pub mod context;
pub mod error;
pub mod executor;
pub mod host;
pub mod lock;
pub mod pipeline;
pub mod plans;
pub mod preflight;
pub mod registry;
pub mod report;
pub mod runner;
pub mod step;
pub mod verify;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info, warn};
use tracing_subscriber::{FmtSubscriber, filter::LevelFilter};

pub use error::ProvisionError;

use crate::config::ProvisionConfig;
use crate::confirm::{Confirm, StdinConfirm};
use crate::context::TargetIdentity;
use crate::executor::CommandExecutor;
use crate::host::Host;
use crate::runner::{RunOptions, RunReport, RunStatus};

pub fn init_logging(log_level: cli::LogLevel) -> Result<()> {
    let filter = match log_level {
        cli::LogLevel::Trace => LevelFilter::TRACE,
        cli::LogLevel::Debug => LevelFilter::DEBUG,
        cli::LogLevel::Info => LevelFilter::INFO,
        cli::LogLevel::Warn => LevelFilter::WARN,
        cli::LogLevel::Error => LevelFilter::ERROR,
    };

    tracing::subscriber::set_global_default(
        FmtSubscriber::builder().with_max_level(filter).finish(),
    )
    .context("failed to set global default tracing subscriber")
}

/// Runs the install plan for `config` against `host`.
pub fn provision(
    config: &ProvisionConfig,
    host: &Host,
    options: &RunOptions,
) -> Result<RunReport, ProvisionError> {
    let plan = plans::install::build(config)?;
    runner::run_plan(&plan, host, TargetIdentity::from_config(config), options, &StdinConfirm)
}

/// Runs the id migration plan for `config` against `host`.
///
/// `uid` and `gid` override the profile's `account.uid` / `account.gid`.
pub fn migrate(
    config: &ProvisionConfig,
    host: &Host,
    uid: Option<u32>,
    gid: Option<u32>,
    options: &RunOptions,
    confirm: &dyn Confirm,
) -> Result<RunReport, ProvisionError> {
    let ids = plans::migrate::plan_ids(config, host, uid, gid)?;
    let plan = plans::migrate::build(config, &ids)?;
    let mut target = TargetIdentity::from_config(config);
    target.uid = Some(ids.new_uid);
    target.gid = Some(ids.new_gid);
    runner::run_plan(&plan, host, target, options, confirm)
}

fn load_config(file: &camino::Utf8Path, version: Option<&str>) -> Result<ProvisionConfig> {
    let profile = config::load_profile(file)
        .with_context(|| format!("failed to load profile from {}", file))?;
    profile
        .resolve(version)
        .context("profile validation failed")
}

/// Logs how a run ended and returns its status.
fn finish(report: RunReport) -> RunStatus {
    if let Some(failure) = &report.failure {
        error!("{}", failure);
    }
    if let Some(result) = &report.verification {
        for check in result.failures() {
            warn!("verification failed: {}: {}", check.name, check.reason);
        }
    }
    if let Some(path) = &report.log_path {
        info!("run log written to {}", path);
    }
    report.status
}

pub fn run_apply(opts: &cli::ApplyArgs, executor: Arc<dyn CommandExecutor>) -> Result<RunStatus> {
    let config = load_config(&opts.common.file, opts.pg_version.as_deref())?;
    let host = Host::system(executor, config.package_tool);
    let options = RunOptions {
        state_dir: config.state_dir.clone(),
        dry_run: opts.dry_run,
    };
    let report = provision(&config, &host, &options)?;
    Ok(finish(report))
}

pub fn run_migrate(opts: &cli::MigrateArgs, executor: Arc<dyn CommandExecutor>) -> Result<RunStatus> {
    let config = load_config(&opts.common.file, None)?;
    let host = Host::system(executor, config.package_tool);
    let options = RunOptions {
        state_dir: config.state_dir.clone(),
        dry_run: opts.dry_run,
    };
    let report = migrate(&config, &host, opts.uid, opts.gid, &options, &StdinConfirm)?;
    Ok(finish(report))
}

pub fn run_validate(opts: &cli::ValidateArgs) -> Result<()> {
    let config = load_config(&opts.common.file, None)?;
    let plan = plans::install::build(&config)?;
    info!("validation successful: PostgreSQL {} ({} service)", config.version, config.service);
    for step in plan.registry.steps() {
        info!(
            "  {:>3} {} ({})",
            step.ordinal(),
            step.name(),
            if step.is_mandatory() { "mandatory" } else { "optional" }
        );
    }
    Ok(())
}
