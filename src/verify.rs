//! Post-run verification.
//!
//! Checks are diagnostic: every check is evaluated and every failure is
//! collected, whatever happened to the checks before it.

use std::fmt;

use camino::Utf8PathBuf;
use serde::Serialize;
use url::Url;

use crate::context::{RunContext, StepOutcome};
use crate::host::{Host, WalkEntry};

/// Expected owner of a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Principal {
    /// Resolved through the user/group directory when the check runs.
    Named { user: String, group: String },
    Ids { uid: u32, gid: u32 },
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Named { user, group } => write!(f, "{}:{}", user, group),
            Self::Ids { uid, gid } => write!(f, "{}:{}", uid, gid),
        }
    }
}

/// What a check asserts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckKind {
    DirectoryExists(Utf8PathBuf),
    Ownership {
        path: Utf8PathBuf,
        owner: Principal,
        mode: Option<u32>,
    },
    /// The service unit is enabled and active.
    ServiceActive(String),
    Connectivity(Url),
    /// The account resolves to the given ids.
    AccountIds {
        user: String,
        group: String,
        uid: u32,
        gid: u32,
    },
    /// No entry under `roots` is owned by the old uid or gid.
    NoLeftovers {
        roots: Vec<Utf8PathBuf>,
        exclude: Vec<Utf8PathBuf>,
        uid: Option<u32>,
        gid: Option<u32>,
    },
}

impl CheckKind {
    /// Evaluation order: existence, ownership, service, connectivity.
    fn rank(&self) -> u8 {
        match self {
            Self::DirectoryExists(_) => 0,
            Self::AccountIds { .. } => 1,
            Self::Ownership { .. } => 2,
            Self::NoLeftovers { .. } => 3,
            Self::ServiceActive(_) => 4,
            Self::Connectivity(_) => 5,
        }
    }

    fn name(&self) -> String {
        match self {
            Self::DirectoryExists(path) => format!("directory exists: {}", path),
            Self::Ownership { path, .. } => format!("ownership: {}", path),
            Self::ServiceActive(name) => format!("service active: {}", name),
            Self::Connectivity(url) => format!("connectivity: {}", url),
            Self::AccountIds { user, .. } => format!("account ids: {}", user),
            Self::NoLeftovers { uid, gid, .. } => format!(
                "no leftovers owned by uid {} / gid {}",
                uid.map_or_else(|| "-".to_string(), |u| u.to_string()),
                gid.map_or_else(|| "-".to_string(), |g| g.to_string())
            ),
        }
    }
}

/// A check plus the step that is supposed to establish it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Check {
    pub kind: CheckKind,
    pub step: Option<String>,
}

impl Check {
    pub fn new(kind: CheckKind) -> Self {
        Self { kind, step: None }
    }

    /// Mentions `step`'s outcome in the reason when the check fails.
    #[must_use]
    pub fn established_by(mut self, step: impl Into<String>) -> Self {
        self.step = Some(step.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[strum(serialize_all = "UPPERCASE")]
pub enum CheckStatus {
    Pass,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckResult {
    pub name: String,
    pub status: CheckStatus,
    pub reason: String,
}

/// Outcome of every check of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VerificationResult {
    pub checks: Vec<CheckResult>,
}

impl VerificationResult {
    pub fn all_passed(&self) -> bool {
        self.checks.iter().all(|c| c.status == CheckStatus::Pass)
    }

    pub fn passed(&self) -> usize {
        self.checks
            .iter()
            .filter(|c| c.status == CheckStatus::Pass)
            .count()
    }

    pub fn failures(&self) -> impl Iterator<Item = &CheckResult> {
        self.checks.iter().filter(|c| c.status == CheckStatus::Fail)
    }
}

/// How many leftover paths a failed sweep check names.
const LEFTOVER_SAMPLE: usize = 5;

pub struct VerificationEngine<'a> {
    host: &'a Host,
}

impl<'a> VerificationEngine<'a> {
    pub fn new(host: &'a Host) -> Self {
        Self { host }
    }

    pub fn verify(&self, checks: &[Check], context: &RunContext) -> VerificationResult {
        let mut ordered: Vec<&Check> = checks.iter().collect();
        ordered.sort_by_key(|c| c.kind.rank());

        let checks = ordered
            .into_iter()
            .map(|check| {
                let (status, mut reason) = match self.evaluate(&check.kind) {
                    Ok(reason) => (CheckStatus::Pass, reason),
                    Err(reason) => (CheckStatus::Fail, reason),
                };
                if status == CheckStatus::Fail
                    && let Some(step) = &check.step
                {
                    match context.outcome(step) {
                        Some(StepOutcome::Succeeded) | None => {}
                        Some(outcome) => {
                            reason = format!("{} (step '{}' {})", reason, step, outcome)
                        }
                    }
                }
                CheckResult {
                    name: check.kind.name(),
                    status,
                    reason,
                }
            })
            .collect();
        VerificationResult { checks }
    }

    /// `Ok(reason)` when the check passes, `Err(reason)` otherwise.
    fn evaluate(&self, kind: &CheckKind) -> Result<String, String> {
        let host = self.host;
        match kind {
            CheckKind::DirectoryExists(path) => match host.fs.stat(path) {
                Ok(stat) if stat.is_dir() => Ok(format!("{} is a directory", path)),
                Ok(_) => Err(format!("{} exists but is not a directory", path)),
                Err(e) => Err(format!("{:#}", e)),
            },
            CheckKind::Ownership { path, owner, mode } => {
                let (uid, gid) = self.resolve(owner)?;
                let stat = host.fs.stat(path).map_err(|e| format!("{:#}", e))?;
                if stat.uid != uid || stat.gid != gid {
                    return Err(format!(
                        "owned by {}:{}, expected {} ({}:{})",
                        stat.uid, stat.gid, owner, uid, gid
                    ));
                }
                if let Some(mode) = mode
                    && stat.mode != *mode
                {
                    return Err(format!("mode is {:04o}, expected {:04o}", stat.mode, mode));
                }
                Ok(match mode {
                    Some(mode) => format!("owned by {} with mode {:04o}", owner, mode),
                    None => format!("owned by {}", owner),
                })
            }
            CheckKind::ServiceActive(name) => {
                let enabled = host
                    .services
                    .is_enabled(name)
                    .map_err(|e| format!("cannot query service {}: {:#}", name, e))?;
                let active = host
                    .services
                    .is_active(name)
                    .map_err(|e| format!("cannot query service {}: {:#}", name, e))?;
                match (enabled, active) {
                    (true, true) => Ok(format!("{} is enabled and active", name)),
                    (false, true) => Err(format!("{} is active but not enabled", name)),
                    (true, false) => Err(format!("{} is enabled but not active", name)),
                    (false, false) => Err(format!("{} is neither enabled nor active", name)),
                }
            }
            CheckKind::Connectivity(url) => host
                .probe
                .try_connect(url)
                .map(|()| format!("{} accepts connections", url))
                .map_err(|e| format!("{:#}", e)),
            CheckKind::AccountIds {
                user,
                group,
                uid,
                gid,
            } => {
                let identity = host
                    .accounts
                    .user_by_name(user)
                    .ok_or_else(|| format!("user '{}' does not exist", user))?;
                let group_gid = host
                    .accounts
                    .group_gid(group)
                    .ok_or_else(|| format!("group '{}' does not exist", group))?;
                if identity.uid != *uid || group_gid != *gid {
                    return Err(format!(
                        "resolves to {}:{}, expected {}:{}",
                        identity.uid, group_gid, uid, gid
                    ));
                }
                Ok(format!("{} resolves to {}:{}", user, uid, gid))
            }
            CheckKind::NoLeftovers {
                roots,
                exclude,
                uid,
                gid,
            } => {
                let mut leftovers = Vec::new();
                let mut unreadable = 0usize;
                for root in roots {
                    for entry in host.fs.walk(root, exclude) {
                        match entry {
                            WalkEntry::Found { path, stat } => {
                                if Some(stat.uid) == *uid || Some(stat.gid) == *gid {
                                    leftovers.push(path);
                                }
                            }
                            WalkEntry::Unreadable { .. } => unreadable += 1,
                        }
                    }
                }
                let skipped = if unreadable > 0 {
                    format!(", {} unreadable entries skipped", unreadable)
                } else {
                    String::new()
                };
                if leftovers.is_empty() {
                    return Ok(format!("no leftover paths found{}", skipped));
                }
                let sample: Vec<String> = leftovers
                    .iter()
                    .take(LEFTOVER_SAMPLE)
                    .map(|p| p.to_string())
                    .collect();
                Err(format!(
                    "{} leftover paths, e.g. {}{}",
                    leftovers.len(),
                    sample.join(", "),
                    skipped
                ))
            }
        }
    }

    fn resolve(&self, owner: &Principal) -> Result<(u32, u32), String> {
        match owner {
            Principal::Ids { uid, gid } => Ok((*uid, *gid)),
            Principal::Named { user, group } => {
                let identity = self
                    .host
                    .accounts
                    .user_by_name(user)
                    .ok_or_else(|| format!("user '{}' does not exist", user))?;
                let gid = self
                    .host
                    .accounts
                    .group_gid(group)
                    .ok_or_else(|| format!("group '{}' does not exist", group))?;
                Ok((identity.uid, gid))
            }
        }
    }
}

impl fmt::Debug for VerificationEngine<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VerificationEngine").finish_non_exhaustive()
    }
}
