//! Domain-specific error types for pgprovision.
//!
//! This module defines `ProvisionError`, a `thiserror`-based enum that
//! carries the failure taxonomy of a provisioning run: preflight gates,
//! step mutations, backups and restores, plus the ambient configuration,
//! execution and I/O failures. Engine and public API functions return
//! `Result<T, ProvisionError>`, while the collaborator traits in
//! [`crate::host`] continue to use `anyhow::Result`.
//!
//! `ProvisionError` implements `Into<anyhow::Error>`, so the `?` operator
//! converts it automatically at trait boundaries that return `anyhow::Result`.

use std::io;

use serde::Serialize;

/// Formats an IO error kind into a human-readable message.
///
/// Provides consistent, user-friendly messages for common IO error kinds
/// (e.g., "I/O error: not found") instead of the OS-level messages
/// (e.g., "No such file or directory (os error 2)"). For unrecognized
/// error kinds, falls back to including the OS-level error message
/// directly (e.g., "I/O error: connection refused").
pub(crate) fn io_error_kind_message(err: &io::Error) -> String {
    match err.kind() {
        io::ErrorKind::NotFound => "I/O error: not found".to_string(),
        io::ErrorKind::PermissionDenied => "I/O error: permission denied".to_string(),
        io::ErrorKind::IsADirectory => "I/O error: is a directory".to_string(),
        _ => format!("I/O error: {}", err),
    }
}

/// Renders the list of steps that completed before a mandatory failure.
fn completed_list(steps: &[String]) -> String {
    if steps.is_empty() {
        "none".to_string()
    } else {
        steps.join(", ")
    }
}

/// Reason a preflight requirement was not met.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum PreflightKind {
    /// The process does not run with an effective uid of 0.
    NotPrivileged,
    /// A uid or gid intended for reassignment already belongs to someone else.
    IdInUse,
    /// A required source file or directory does not exist.
    MissingPath,
    /// The managed service is running.
    ServiceActive,
    /// The service account is not known to the user/group directory.
    UnknownAccount,
    /// A read-only query needed to evaluate a requirement failed.
    QueryFailed,
}

/// Domain-specific error type for pgprovision.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ProvisionError {
    /// A precondition was not met; nothing has been mutated.
    #[error("preflight check failed ({kind}): {detail}")]
    Preflight {
        /// Which class of requirement failed.
        kind: PreflightKind,
        /// Human-readable description of the unmet requirement.
        detail: String,
    },

    /// A step's OS-level operation failed.
    #[error(
        "step '{step}' failed during {operation}: {message} (completed steps: {})",
        completed_list(.completed)
    )]
    Mutation {
        /// Name of the failing step.
        step: String,
        /// The operation the step was attempting (e.g., "chown").
        operation: String,
        /// The underlying failure, including its context chain.
        message: String,
        /// Steps that had already succeeded, in execution order.
        completed: Vec<String>,
    },

    /// A pre-mutation snapshot could not be captured.
    #[error("backup of {path} failed: {message}")]
    Backup {
        /// The path whose state could not be captured.
        path: String,
        /// Why the snapshot failed.
        message: String,
    },

    /// A mandatory step was not attempted because its snapshot failed.
    #[error(
        "step '{step}' not attempted: {source} (completed steps: {})",
        completed_list(.completed)
    )]
    Unbacked {
        /// Name of the step that was abandoned.
        step: String,
        /// The snapshot failure, normally a [`ProvisionError::Backup`].
        source: Box<ProvisionError>,
        /// Steps that had already succeeded, in execution order.
        completed: Vec<String>,
    },

    /// A rollback attempt failed; the operator has to recover manually.
    #[error("restore of {path} failed, manual intervention required: {message}")]
    Restore {
        /// The path that could not be restored.
        path: String,
        /// Why the restore failed.
        message: String,
    },

    /// A validation constraint was violated.
    #[error("validation error: {0}")]
    Validation(String),

    /// A profile could not be loaded or parsed.
    #[error("configuration error: {0}")]
    Config(String),

    /// A command execution failed (non-zero exit, spawn failure, wait failure, etc.).
    #[error("command execution failed: {command}: {status}")]
    Execution {
        /// The command that was executed.
        command: String,
        /// Human-readable reason for the failure.
        status: String,
    },

    /// The advisory run lock is held by another invocation.
    #[error("lock error: {0}")]
    Lock(String),

    /// The operator declined the confirmation prompt.
    #[error("operation declined: {0}")]
    Declined(String),

    /// An I/O operation failed with contextual information.
    #[error("{context}: {message}")]
    Io {
        /// What was being done when the error occurred.
        context: String,
        /// Human-readable description of the I/O failure, derived from
        /// [`io_error_kind_message`].
        message: String,
        /// The underlying I/O error, preserved for programmatic inspection.
        #[source]
        source: std::io::Error,
    },
}

impl ProvisionError {
    /// Creates an `Io` variant with the `message` field automatically derived
    /// from the `source` via [`io_error_kind_message`].
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            message: io_error_kind_message(&source),
            source,
        }
    }

    pub(crate) fn preflight(kind: PreflightKind, detail: impl Into<String>) -> Self {
        Self::Preflight {
            kind,
            detail: detail.into(),
        }
    }

    /// Returns the preflight kind if this is a preflight failure.
    pub fn preflight_kind(&self) -> Option<PreflightKind> {
        match self {
            Self::Preflight { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}
