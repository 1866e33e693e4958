//! Read-only checks that gate every run.

use std::fmt;

use camino::Utf8PathBuf;
use tracing::debug;

use crate::error::{PreflightKind, ProvisionError};
use crate::host::Host;

/// One precondition of a plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requirement {
    /// The process runs with an effective uid of 0.
    Privileged,
    /// The service account and its group are known.
    AccountExists { user: String, group: String },
    /// `uid` is unallocated or already belongs to `user`.
    UidAvailable { uid: u32, user: String },
    /// `gid` is unallocated or already belongs to `group`.
    GidAvailable { gid: u32, group: String },
    PathExists(Utf8PathBuf),
    ServiceInactive(String),
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Privileged => write!(f, "running as root"),
            Self::AccountExists { user, group } => write!(f, "account {}:{} exists", user, group),
            Self::UidAvailable { uid, user } => write!(f, "uid {} is free for {}", uid, user),
            Self::GidAvailable { gid, group } => write!(f, "gid {} is free for {}", gid, group),
            Self::PathExists(path) => write!(f, "{} exists", path),
            Self::ServiceInactive(name) => write!(f, "service {} is not active", name),
        }
    }
}

/// Evaluates requirements against a host, stopping at the first unmet one.
pub struct PreflightChecker<'a> {
    host: &'a Host,
}

impl<'a> PreflightChecker<'a> {
    pub fn new(host: &'a Host) -> Self {
        Self { host }
    }

    pub fn check(&self, requirements: &[Requirement]) -> Result<(), ProvisionError> {
        for requirement in requirements {
            self.check_one(requirement)?;
            debug!("preflight: {}", requirement);
        }
        Ok(())
    }

    fn check_one(&self, requirement: &Requirement) -> Result<(), ProvisionError> {
        use PreflightKind::*;

        match requirement {
            Requirement::Privileged => {
                let euid = self.host.privileges.effective_uid();
                if euid != 0 {
                    return Err(ProvisionError::preflight(
                        NotPrivileged,
                        format!("root privileges are required (effective uid is {})", euid),
                    ));
                }
            }
            Requirement::AccountExists { user, group } => {
                if self.host.accounts.user_by_name(user).is_none() {
                    return Err(ProvisionError::preflight(
                        UnknownAccount,
                        format!("user '{}' does not exist", user),
                    ));
                }
                if self.host.accounts.group_gid(group).is_none() {
                    return Err(ProvisionError::preflight(
                        UnknownAccount,
                        format!("group '{}' does not exist", group),
                    ));
                }
            }
            Requirement::UidAvailable { uid, user } => {
                if let Some(owner) = self.host.accounts.user_by_uid(*uid)
                    && owner.name != *user
                {
                    return Err(ProvisionError::preflight(
                        IdInUse,
                        format!("uid {} is already allocated to user '{}'", uid, owner.name),
                    ));
                }
            }
            Requirement::GidAvailable { gid, group } => {
                if let Some(owner) = self.host.accounts.group_by_gid(*gid)
                    && owner != *group
                {
                    return Err(ProvisionError::preflight(
                        IdInUse,
                        format!("gid {} is already allocated to group '{}'", gid, owner),
                    ));
                }
            }
            Requirement::PathExists(path) => {
                if !self.host.fs.exists(path) {
                    return Err(ProvisionError::preflight(
                        MissingPath,
                        format!("required path {} does not exist", path),
                    ));
                }
            }
            Requirement::ServiceInactive(name) => {
                let active = self.host.services.is_active(name).map_err(|e| {
                    ProvisionError::preflight(
                        QueryFailed,
                        format!("cannot query state of service {}: {:#}", name, e),
                    )
                })?;
                if active {
                    return Err(ProvisionError::preflight(
                        ServiceActive,
                        format!("service {} is running; stop it before provisioning", name),
                    ));
                }
            }
        }
        Ok(())
    }
}

impl fmt::Debug for PreflightChecker<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PreflightChecker").finish_non_exhaustive()
    }
}
