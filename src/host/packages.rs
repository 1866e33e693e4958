//! Package manager collaborator.

use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::PackageManager;
use crate::executor::{CommandExecutor, CommandSpec, run_checked};

/// Distribution package tool.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PackageTool {
    /// Debian/Ubuntu `apt-get`.
    #[default]
    Apt,
    /// Fedora/RHEL 8+ `dnf`.
    Dnf,
    /// CentOS 7 `yum`.
    Yum,
}

impl PackageTool {
    /// Returns the command name for this tool.
    pub fn command_name(&self) -> &'static str {
        match self {
            Self::Apt => "apt-get",
            Self::Dnf => "dnf",
            Self::Yum => "yum",
        }
    }

    /// Builds the command sequence that installs `packages`.
    pub fn install_commands(&self, packages: &[String]) -> Vec<CommandSpec> {
        let mut install = vec!["install".to_string(), "-y".to_string()];
        install.extend(packages.iter().cloned());

        match self {
            Self::Apt => vec![
                CommandSpec::new(self.command_name(), vec!["update".to_string()])
                    .with_env("DEBIAN_FRONTEND", "noninteractive"),
                CommandSpec::new(self.command_name(), install)
                    .with_env("DEBIAN_FRONTEND", "noninteractive"),
            ],
            Self::Dnf | Self::Yum => vec![CommandSpec::new(self.command_name(), install)],
        }
    }
}

/// Installs packages with the configured [`PackageTool`].
pub struct SystemPackages {
    tool: PackageTool,
    executor: Arc<dyn CommandExecutor>,
}

impl SystemPackages {
    pub fn new(tool: PackageTool, executor: Arc<dyn CommandExecutor>) -> Self {
        Self { tool, executor }
    }
}

impl PackageManager for SystemPackages {
    fn install(&self, packages: &[String]) -> Result<()> {
        if packages.is_empty() {
            return Ok(());
        }
        for spec in self.tool.install_commands(packages) {
            tracing::debug!("running {}", spec.display());
            run_checked(self.executor.as_ref(), &spec)?;
        }
        Ok(())
    }
}
