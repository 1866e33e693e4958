//! Per-run state: step outcomes, backup handles and the audit file.

use std::fs;
use std::io::Write;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::backup::BackupHandle;
use crate::config::ProvisionConfig;
use crate::error::ProvisionError;

/// State of one step within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum StepOutcome {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl StepOutcome {
    /// Whether the outcome is final for the rest of the run.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }
}

/// Outcome of one step, as recorded in the run context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepRecord {
    pub name: String,
    pub ordinal: u32,
    pub mandatory: bool,
    pub outcome: StepOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Parameters describing the host state a run aims for.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TargetIdentity {
    pub version: String,
    pub service: String,
    pub user: String,
    pub group: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gid: Option<u32>,
    pub directories: Vec<Utf8PathBuf>,
}

impl TargetIdentity {
    pub fn from_config(config: &ProvisionConfig) -> Self {
        Self {
            version: config.version.clone(),
            service: config.service.clone(),
            user: config.account.user.clone(),
            group: config.account.group.clone(),
            uid: config.account.uid,
            gid: config.account.gid,
            directories: config.directories.iter().map(|d| d.path.clone()).collect(),
        }
    }
}

/// Everything known about one run.
///
/// Outcomes move `Pending -> Running -> {Succeeded, Failed, Skipped}` and
/// a terminal outcome is never changed afterwards.
#[derive(Debug, Clone, Serialize)]
pub struct RunContext {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub target: TargetIdentity,
    steps: Vec<StepRecord>,
    backups: Vec<BackupHandle>,
    #[serde(skip)]
    audit_path: Option<Utf8PathBuf>,
}

impl RunContext {
    pub fn new(run_id: impl Into<String>, started_at: DateTime<Utc>, target: TargetIdentity) -> Self {
        Self {
            run_id: run_id.into(),
            started_at,
            target,
            steps: Vec::new(),
            backups: Vec::new(),
            audit_path: None,
        }
    }

    /// Persists the context to `path` on every [`persist`](Self::persist).
    #[must_use]
    pub fn with_audit_path(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.audit_path = Some(path.into());
        self
    }

    pub fn audit_path(&self) -> Option<&Utf8Path> {
        self.audit_path.as_deref()
    }

    /// Adds a step in the `Pending` state.
    pub fn register_pending(
        &mut self,
        name: &str,
        ordinal: u32,
        mandatory: bool,
    ) -> Result<(), ProvisionError> {
        if self.record(name).is_some() {
            return Err(ProvisionError::Validation(format!(
                "step '{}' is already part of run {}",
                name, self.run_id
            )));
        }
        self.steps.push(StepRecord {
            name: name.to_string(),
            ordinal,
            mandatory,
            outcome: StepOutcome::Pending,
            detail: None,
        });
        Ok(())
    }

    /// Moves a pending step to `Running`.
    pub fn begin(&mut self, name: &str) -> Result<(), ProvisionError> {
        let run_id = self.run_id.clone();
        let record = self.record_mut(name)?;
        if record.outcome != StepOutcome::Pending {
            return Err(ProvisionError::Validation(format!(
                "step '{}' cannot start from state {} in run {}",
                name, record.outcome, run_id
            )));
        }
        record.outcome = StepOutcome::Running;
        Ok(())
    }

    /// Records a terminal outcome.
    pub fn finish(
        &mut self,
        name: &str,
        outcome: StepOutcome,
        detail: Option<String>,
    ) -> Result<(), ProvisionError> {
        if !outcome.is_terminal() {
            return Err(ProvisionError::Validation(format!(
                "{} is not a terminal outcome for step '{}'",
                outcome, name
            )));
        }
        let record = self.record_mut(name)?;
        if record.outcome.is_terminal() {
            return Err(ProvisionError::Validation(format!(
                "step '{}' already finished as {}",
                name, record.outcome
            )));
        }
        record.outcome = outcome;
        record.detail = detail;
        Ok(())
    }

    pub fn outcome(&self, name: &str) -> Option<StepOutcome> {
        self.record(name).map(|r| r.outcome)
    }

    pub fn steps(&self) -> &[StepRecord] {
        &self.steps
    }

    /// Names of the steps that succeeded, in execution order.
    pub fn completed_steps(&self) -> Vec<String> {
        self.steps
            .iter()
            .filter(|r| r.outcome == StepOutcome::Succeeded)
            .map(|r| r.name.clone())
            .collect()
    }

    pub fn add_backup(&mut self, handle: BackupHandle) {
        self.backups.push(handle);
    }

    pub fn backups(&self) -> &[BackupHandle] {
        &self.backups
    }

    /// Writes the context as YAML to the audit path, if one is set.
    ///
    /// The file is replaced atomically so an interrupted write never leaves
    /// a truncated record behind.
    pub fn persist(&self) -> Result<(), ProvisionError> {
        let Some(path) = &self.audit_path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| ProvisionError::io(format!("failed to create {}", parent), e))?;
        }
        let yaml = serde_yaml::to_string(self)
            .map_err(|e| ProvisionError::Config(format!("failed to serialize run context: {}", e)))?;

        let tmp = path.with_extension("yaml.tmp");
        let mut file = fs::File::create(&tmp)
            .map_err(|e| ProvisionError::io(format!("failed to create {}", tmp), e))?;
        file.write_all(yaml.as_bytes())
            .and_then(|()| file.sync_all())
            .map_err(|e| ProvisionError::io(format!("failed to write {}", tmp), e))?;
        fs::rename(&tmp, path)
            .map_err(|e| ProvisionError::io(format!("failed to move {} into place", tmp), e))?;
        debug!("run context written to {}", path);
        Ok(())
    }

    /// Like [`persist`](Self::persist), but only logs failures.
    pub(crate) fn persist_or_warn(&self) {
        if let Err(e) = self.persist() {
            warn!("could not persist run context: {}", e);
        }
    }

    fn record(&self, name: &str) -> Option<&StepRecord> {
        self.steps.iter().find(|r| r.name == name)
    }

    fn record_mut(&mut self, name: &str) -> Result<&mut StepRecord, ProvisionError> {
        let run_id = &self.run_id;
        self.steps
            .iter_mut()
            .find(|r| r.name == name)
            .ok_or_else(|| {
                ProvisionError::Validation(format!("unknown step '{}' in run {}", name, run_id))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> RunContext {
        let mut ctx = RunContext::new("20240101-000000-deadbeef", Utc::now(), TargetIdentity::default());
        ctx.register_pending("install-packages", 10, true).unwrap();
        ctx.register_pending("copy-aux-scripts", 60, false).unwrap();
        ctx
    }

    #[test]
    fn outcomes_follow_the_state_machine() {
        let mut ctx = context();
        assert_eq!(ctx.outcome("install-packages"), Some(StepOutcome::Pending));
        ctx.begin("install-packages").unwrap();
        assert_eq!(ctx.outcome("install-packages"), Some(StepOutcome::Running));
        ctx.finish("install-packages", StepOutcome::Succeeded, None).unwrap();
        assert_eq!(ctx.completed_steps(), vec!["install-packages".to_string()]);
    }

    #[test]
    fn terminal_outcomes_are_immutable() {
        let mut ctx = context();
        ctx.begin("copy-aux-scripts").unwrap();
        ctx.finish("copy-aux-scripts", StepOutcome::Failed, Some("boom".into()))
            .unwrap();

        assert!(ctx.finish("copy-aux-scripts", StepOutcome::Succeeded, None).is_err());
        assert!(ctx.begin("copy-aux-scripts").is_err());
        assert_eq!(ctx.outcome("copy-aux-scripts"), Some(StepOutcome::Failed));
    }

    #[test]
    fn skipping_does_not_require_running() {
        let mut ctx = context();
        ctx.finish("copy-aux-scripts", StepOutcome::Skipped, Some("dry run".into()))
            .unwrap();
        assert_eq!(ctx.outcome("copy-aux-scripts"), Some(StepOutcome::Skipped));
    }

    #[test]
    fn running_is_not_a_terminal_outcome() {
        let mut ctx = context();
        assert!(ctx.finish("install-packages", StepOutcome::Running, None).is_err());
        assert!(ctx.finish("unknown", StepOutcome::Failed, None).is_err());
        assert!(ctx.register_pending("install-packages", 11, true).is_err());
    }

    #[test]
    fn persist_writes_yaml_to_the_audit_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(dir.path().join("runs/run.yaml")).unwrap();
        let mut ctx = context().with_audit_path(path.clone());
        ctx.begin("install-packages").unwrap();
        ctx.finish("install-packages", StepOutcome::Succeeded, None).unwrap();
        ctx.persist().unwrap();

        let written = fs::read_to_string(&path).unwrap();
        assert!(written.contains("run_id: 20240101-000000-deadbeef"));
        assert!(written.contains("outcome: succeeded"));
        assert!(written.contains("outcome: pending"));
        assert!(!path.with_extension("yaml.tmp").exists());
    }

    #[test]
    fn persist_without_audit_path_is_a_noop() {
        assert!(context().persist().is_ok());
    }
}
