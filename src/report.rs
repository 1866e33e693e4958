//! Run log and final summary.
//!
//! Every event of a run is written as one line
//! `<RFC3339 timestamp> [LEVEL] message` to the run log and mirrored to
//! `tracing`.

use std::fs::{self, File, OpenOptions};
use std::io::Write;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{SecondsFormat, Utc};
use tracing::{error, info, warn};

use crate::context::RunContext;
use crate::error::ProvisionError;
use crate::runner::RunStatus;
use crate::verify::{CheckStatus, VerificationResult};

/// Severity tag of a run-log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "UPPERCASE")]
pub enum ReportLevel {
    Info,
    Warning,
    Error,
    Success,
}

/// Writes the persisted run log.
#[derive(Debug)]
pub struct Reporter {
    path: Option<Utf8PathBuf>,
    file: Option<File>,
    lines: Vec<String>,
}

impl Reporter {
    /// Creates a new log at `path`. An existing file is never overwritten.
    pub fn to_file(path: impl Into<Utf8PathBuf>) -> Result<Self, ProvisionError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| ProvisionError::io(format!("failed to create {}", parent), e))?;
        }
        let file = OpenOptions::new()
            .append(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| ProvisionError::io(format!("failed to create run log {}", path), e))?;
        Ok(Self {
            path: Some(path),
            file: Some(file),
            lines: Vec::new(),
        })
    }

    /// A reporter that keeps lines in memory only.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            file: None,
            lines: Vec::new(),
        }
    }

    pub fn path(&self) -> Option<&Utf8Path> {
        self.path.as_deref()
    }

    /// Every line written so far.
    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn info(&mut self, message: impl AsRef<str>) {
        self.emit(ReportLevel::Info, message.as_ref());
    }

    pub fn warning(&mut self, message: impl AsRef<str>) {
        self.emit(ReportLevel::Warning, message.as_ref());
    }

    pub fn error(&mut self, message: impl AsRef<str>) {
        self.emit(ReportLevel::Error, message.as_ref());
    }

    pub fn success(&mut self, message: impl AsRef<str>) {
        self.emit(ReportLevel::Success, message.as_ref());
    }

    /// One line per check.
    pub fn verification(&mut self, result: &VerificationResult) {
        for check in &result.checks {
            match check.status {
                CheckStatus::Pass => {
                    self.success(format!("check passed: {}: {}", check.name, check.reason))
                }
                CheckStatus::Fail => {
                    self.warning(format!("check failed: {}: {}", check.name, check.reason))
                }
            }
        }
    }

    /// Per-step outcomes, verification tally and final status.
    pub fn summary(
        &mut self,
        context: &RunContext,
        verification: Option<&VerificationResult>,
        status: RunStatus,
    ) {
        self.info(format!("summary of run {}", context.run_id));
        for record in context.steps() {
            let kind = if record.mandatory { "mandatory" } else { "optional" };
            let line = match &record.detail {
                Some(detail) => format!("  {} ({}): {} - {}", record.name, kind, record.outcome, detail),
                None => format!("  {} ({}): {}", record.name, kind, record.outcome),
            };
            self.info(line);
        }
        match verification {
            Some(result) => self.info(format!(
                "  verification: {} of {} checks passed",
                result.passed(),
                result.checks.len()
            )),
            None => self.info("  verification: not run"),
        }
        let closing = format!("run {} finished: {} (exit code {})", context.run_id, status, status.exit_code());
        match status {
            RunStatus::Success => self.success(closing),
            RunStatus::CompletedWithWarnings => self.warning(closing),
            RunStatus::Failed => self.error(closing),
        }
    }

    fn emit(&mut self, level: ReportLevel, message: &str) {
        match level {
            ReportLevel::Info | ReportLevel::Success => info!("{}", message),
            ReportLevel::Warning => warn!("{}", message),
            ReportLevel::Error => error!("{}", message),
        }
        let line = format_line(level, message);
        if let Some(file) = self.file.as_mut()
            && let Err(e) = writeln!(file, "{}", line)
        {
            warn!("failed to write run log: {}", e);
        }
        self.lines.push(line);
    }
}

fn format_line(level: ReportLevel, message: &str) -> String {
    format!(
        "{} [{}] {}",
        Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        level,
        message
    )
}
