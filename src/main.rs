use std::io;
use std::process;
use std::sync::Arc;

use clap::CommandFactory;
use pgprovision::cli::{self, Cli, Commands, LogLevel};
use pgprovision::executor::RealCommandExecutor;
use pgprovision::runner::RunStatus;
use tracing::error;

fn main() {
    let args = match cli::parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{:#}", e);
            process::exit(1);
        }
    };

    if let Commands::Completions(opts) = &args.command {
        clap_complete::generate(opts.shell, &mut Cli::command(), env!("CARGO_PKG_NAME"), &mut io::stdout());
        return;
    }

    pgprovision::init_logging(args.command.log_level().unwrap_or(LogLevel::Info))
        .expect("failed to set global default tracing subscriber");

    let executor = Arc::new(RealCommandExecutor);
    let result = match &args.command {
        Commands::Apply(opts) => pgprovision::run_apply(opts, executor),
        Commands::MigrateIds(opts) => pgprovision::run_migrate(opts, executor),
        Commands::Validate(opts) => pgprovision::run_validate(opts).map(|()| RunStatus::Success),
        Commands::Completions(_) => Ok(RunStatus::Success),
    };

    match result {
        Ok(status) => process::exit(status.exit_code()),
        Err(e) => {
            error!("{:#}", e);
            process::exit(RunStatus::Failed.exit_code());
        }
    }
}
