//! Provisioning steps.
//!
//! A [`ProvisioningStep`] is one named, ordered unit of host mutation. It is
//! built once when a plan is assembled and invoked at most once per run by
//! the [`StepExecutor`](crate::pipeline::StepExecutor).

use std::fmt;

use anyhow::Result;
use camino::Utf8PathBuf;
use serde::Serialize;

use crate::backup::{BackupHandle, BackupManager, OwnershipEntry};
use crate::error::ProvisionError;
use crate::host::Host;

/// What a successful mutation did to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepEffect {
    Changed,
    /// The host was already in the desired state; nothing was touched.
    Unchanged,
}

/// How a target path is captured before the step runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotKind {
    /// Copy a file verbatim (or record a symlink's target).
    File,
    /// Record owner, group and mode of every entry in a tree.
    Ownership,
}

/// A path a step may overwrite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub path: Utf8PathBuf,
    pub kind: SnapshotKind,
}

/// What a mutation sees while it runs.
pub struct StepScope<'a> {
    pub host: &'a Host,
    backups: &'a mut BackupManager,
    handles: Vec<BackupHandle>,
}

impl<'a> StepScope<'a> {
    pub(crate) fn new(host: &'a Host, backups: &'a mut BackupManager) -> Self {
        Self {
            host,
            backups,
            handles: Vec::new(),
        }
    }

    /// Snapshots a path discovered while the step runs.
    ///
    /// Returns `false` when the path does not exist yet.
    pub fn snapshot(
        &mut self,
        path: impl Into<Utf8PathBuf>,
        kind: SnapshotKind,
    ) -> Result<bool, ProvisionError> {
        let target = Target {
            path: path.into(),
            kind,
        };
        match self.backups.snapshot(&target)? {
            Some(handle) => {
                self.handles.push(handle);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Records the current ownership of entries the step is about to change.
    ///
    /// For steps whose targets are only discovered at run time. The caller
    /// must not change any of `entries` if this fails.
    pub fn record_ownership(
        &mut self,
        label: &str,
        entries: Vec<OwnershipEntry>,
    ) -> Result<(), ProvisionError> {
        let handle = self.backups.record_ownership(label, entries)?;
        self.handles.push(handle);
        Ok(())
    }

    pub(crate) fn into_handles(self) -> Vec<BackupHandle> {
        self.handles
    }
}

type Mutation = Box<dyn Fn(&mut StepScope<'_>) -> Result<StepEffect>>;
type Rollback = Box<dyn Fn(&Host) -> Result<()>>;

/// One named unit of host mutation.
pub struct ProvisioningStep {
    name: String,
    ordinal: u32,
    mandatory: bool,
    operation: String,
    targets: Vec<Target>,
    depends_on: Vec<String>,
    mutation: Mutation,
    rollback: Option<Rollback>,
}

impl ProvisioningStep {
    /// A step whose failure aborts the run.
    pub fn mandatory<F>(
        name: impl Into<String>,
        ordinal: u32,
        operation: impl Into<String>,
        mutation: F,
    ) -> Self
    where
        F: Fn(&mut StepScope<'_>) -> Result<StepEffect> + 'static,
    {
        Self::new(name.into(), ordinal, true, operation.into(), Box::new(mutation))
    }

    /// A step whose failure is logged and the run continues.
    pub fn optional<F>(
        name: impl Into<String>,
        ordinal: u32,
        operation: impl Into<String>,
        mutation: F,
    ) -> Self
    where
        F: Fn(&mut StepScope<'_>) -> Result<StepEffect> + 'static,
    {
        Self::new(name.into(), ordinal, false, operation.into(), Box::new(mutation))
    }

    fn new(name: String, ordinal: u32, mandatory: bool, operation: String, mutation: Mutation) -> Self {
        Self {
            name,
            ordinal,
            mandatory,
            operation,
            targets: Vec::new(),
            depends_on: Vec::new(),
            mutation,
            rollback: None,
        }
    }

    /// Declares a path this step may overwrite.
    #[must_use]
    pub fn with_target(mut self, path: impl Into<Utf8PathBuf>, kind: SnapshotKind) -> Self {
        self.targets.push(Target {
            path: path.into(),
            kind,
        });
        self
    }

    /// Declares several paths of the same snapshot kind.
    #[must_use]
    pub fn with_targets<I, P>(mut self, paths: I, kind: SnapshotKind) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Utf8PathBuf>,
    {
        self.targets
            .extend(paths.into_iter().map(|p| Target { path: p.into(), kind }));
        self
    }

    /// Makes this step `Skipped` when `step` does not succeed.
    #[must_use]
    pub fn depends_on(mut self, step: impl Into<String>) -> Self {
        self.depends_on.push(step.into());
        self
    }

    /// Undo action run when this step fails as a mandatory step.
    #[must_use]
    pub fn with_rollback<F>(mut self, rollback: F) -> Self
    where
        F: Fn(&Host) -> Result<()> + 'static,
    {
        self.rollback = Some(Box::new(rollback));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ordinal(&self) -> u32 {
        self.ordinal
    }

    pub fn is_mandatory(&self) -> bool {
        self.mandatory
    }

    /// The OS-level operation this step performs, for diagnostics.
    pub fn operation(&self) -> &str {
        &self.operation
    }

    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    pub fn dependencies(&self) -> &[String] {
        &self.depends_on
    }

    pub(crate) fn apply(&self, scope: &mut StepScope<'_>) -> Result<StepEffect> {
        (self.mutation)(scope)
    }

    /// Runs the rollback action, if the step has one.
    pub(crate) fn roll_back(&self, host: &Host) -> Option<Result<()>> {
        self.rollback.as_ref().map(|rollback| rollback(host))
    }
}

impl fmt::Debug for ProvisioningStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProvisioningStep")
            .field("name", &self.name)
            .field("ordinal", &self.ordinal)
            .field("mandatory", &self.mandatory)
            .field("operation", &self.operation)
            .field("targets", &self.targets)
            .field("depends_on", &self.depends_on)
            .field("rollback", &self.rollback.is_some())
            .finish()
    }
}
