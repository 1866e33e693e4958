//! Service manager collaborator backed by `systemctl`.

use std::sync::Arc;

use anyhow::{Context, Result};

use super::ServiceManager;
use crate::executor::{CommandExecutor, CommandSpec, run_checked};

fn systemctl(args: &[&str]) -> CommandSpec {
    CommandSpec::new("systemctl", args.iter().map(|a| a.to_string()).collect())
}

/// Drives systemd units through `systemctl`.
pub struct Systemctl {
    executor: Arc<dyn CommandExecutor>,
}

impl Systemctl {
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self { executor }
    }

    /// Runs a `--quiet` query verb; exit status 0 means "yes".
    fn query(&self, verb: &str, name: &str) -> Result<bool> {
        let spec = systemctl(&[verb, "--quiet", name]);
        let result = self
            .executor
            .execute(&spec)
            .with_context(|| format!("failed to query {} state of {}", verb, name))?;
        Ok(result.status.is_some_and(|s| s.success()))
    }
}

impl ServiceManager for Systemctl {
    fn enable(&self, name: &str) -> Result<()> {
        run_checked(self.executor.as_ref(), &systemctl(&["enable", name]))
    }

    fn start(&self, name: &str) -> Result<()> {
        run_checked(self.executor.as_ref(), &systemctl(&["start", name]))
    }

    fn stop(&self, name: &str) -> Result<()> {
        run_checked(self.executor.as_ref(), &systemctl(&["stop", name]))
    }

    fn is_active(&self, name: &str) -> Result<bool> {
        self.query("is-active", name)
    }

    fn is_enabled(&self, name: &str) -> Result<bool> {
        self.query("is-enabled", name)
    }
}
