use anyhow::Result;
use camino::Utf8PathBuf;
use clap::{Args, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;

#[derive(Parser, Debug)]
#[command(
    name = env!("CARGO_PKG_NAME"),
    version = env!("CARGO_PKG_VERSION"),
    about = env!("CARGO_PKG_DESCRIPTION"),
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Install and configure PostgreSQL as described by the profile
    Apply(ApplyArgs),

    /// Move the service account to new numeric uid/gid
    MigrateIds(MigrateArgs),

    /// Validate the given YAML profile
    Validate(ValidateArgs),

    /// Generate shell completions
    Completions(CompletionsArgs),
}

impl Commands {
    /// Log level requested on the command line, if the command takes one.
    pub fn log_level(&self) -> Option<LogLevel> {
        match self {
            Self::Apply(opts) => Some(opts.common.log_level),
            Self::MigrateIds(opts) => Some(opts.common.log_level),
            Self::Validate(opts) => Some(opts.common.log_level),
            Self::Completions(_) => None,
        }
    }
}

/// Options shared by every command that reads a profile.
#[derive(Args, Debug)]
pub struct CommonArgs {
    /// Path to the YAML file defining the profile
    #[arg(short, long, default_value = "profile.yaml")]
    pub file: Utf8PathBuf,

    /// Set the log level
    #[arg(short, long, default_value = "info")]
    pub log_level: LogLevel,
}

#[derive(Args, Debug)]
pub struct ApplyArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// PostgreSQL major version, overriding the profile
    #[arg(long, value_name = "VERSION")]
    pub pg_version: Option<String>,

    /// Do not run, just show what would be done
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Args, Debug)]
pub struct MigrateArgs {
    #[command(flatten)]
    pub common: CommonArgs,

    /// New uid of the service account, overriding the profile
    #[arg(long)]
    pub uid: Option<u32>,

    /// New gid of the service group, overriding the profile
    #[arg(long)]
    pub gid: Option<u32>,

    /// Do not run, just show what would be done
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Args, Debug)]
pub struct ValidateArgs {
    #[command(flatten)]
    pub common: CommonArgs,
}

#[derive(Args, Debug)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    pub shell: Shell,
}

/// Represents log levels for controlling the verbosity of logging output.
///
/// Maps directly to the levels of the `tracing` crate. The persisted run
/// log is written regardless of this setting.
#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

pub fn parse_args() -> Result<Cli> {
    Ok(Cli::parse())
}
