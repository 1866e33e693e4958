//! Moves the service account to new numeric ids.
//!
//! The group id is changed before the user id, and nothing is re-owned
//! until both ids have been read back from the directory service. The
//! filesystem sweep and shared-memory release are best-effort.

use anyhow::bail;
use camino::Utf8PathBuf;
use tracing::{debug, info, warn};

use super::account_ids;
use crate::backup::OwnershipEntry;
use crate::config::ProvisionConfig;
use crate::error::{PreflightKind, ProvisionError};
use crate::host::{Host, WalkEntry, restamp_tree};
use crate::preflight::Requirement;
use crate::registry::StepRegistry;
use crate::runner::Plan;
use crate::step::{ProvisioningStep, SnapshotKind, StepEffect, StepScope};
use crate::verify::{Check, CheckKind, Principal};

pub const CHANGE_GID: &str = "change-gid";
pub const CHANGE_UID: &str = "change-uid";
pub const CONFIRM_IDS: &str = "confirm-ids";
pub const RESTAMP_OWNERSHIP: &str = "restamp-ownership";
pub const SWEEP_LEFTOVERS: &str = "sweep-leftovers";
pub const RELEASE_SHM: &str = "release-shm";

/// Current and desired ids of the service account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdChange {
    pub user: String,
    pub group: String,
    pub old_uid: u32,
    pub old_gid: u32,
    pub new_uid: u32,
    pub new_gid: u32,
}

impl IdChange {
    /// Old uid, if the uid changes.
    pub fn stale_uid(&self) -> Option<u32> {
        (self.old_uid != self.new_uid).then_some(self.old_uid)
    }

    /// Old gid, if the gid changes.
    pub fn stale_gid(&self) -> Option<u32> {
        (self.old_gid != self.new_gid).then_some(self.old_gid)
    }

    /// Whether `uid:gid` still refers to an old id.
    fn is_stale(&self, uid: u32, gid: u32) -> bool {
        self.stale_uid() == Some(uid) || self.stale_gid() == Some(gid)
    }

    /// The ids an entry owned by `uid:gid` should end up with.
    fn migrated(&self, uid: u32, gid: u32) -> (u32, u32) {
        let uid = if self.stale_uid() == Some(uid) { self.new_uid } else { uid };
        let gid = if self.stale_gid() == Some(gid) { self.new_gid } else { gid };
        (uid, gid)
    }
}

/// Looks up the account's current ids and pairs them with the targets.
///
/// A target left unset keeps the current id; at least one must be given.
pub fn plan_ids(
    config: &ProvisionConfig,
    host: &Host,
    uid: Option<u32>,
    gid: Option<u32>,
) -> Result<IdChange, ProvisionError> {
    let user = config.account.user.clone();
    let group = config.account.group.clone();
    let uid = uid.or(config.account.uid);
    let gid = gid.or(config.account.gid);
    if uid.is_none() && gid.is_none() {
        return Err(ProvisionError::Validation(
            "no target uid or gid given (use --uid/--gid or account.uid/account.gid)".to_string(),
        ));
    }
    let (old_uid, old_gid) = account_ids(host, &user, &group)
        .map_err(|e| ProvisionError::preflight(PreflightKind::UnknownAccount, format!("{:#}", e)))?;
    Ok(IdChange {
        new_uid: uid.unwrap_or(old_uid),
        new_gid: gid.unwrap_or(old_gid),
        user,
        group,
        old_uid,
        old_gid,
    })
}

/// Builds the id migration plan.
pub fn build(config: &ProvisionConfig, ids: &IdChange) -> Result<Plan, ProvisionError> {
    let mut registry = StepRegistry::new();
    registry.register(change_gid(ids))?;
    registry.register(change_uid(ids))?;
    registry.register(confirm_ids(ids))?;
    registry.register(restamp_ownership(config, ids))?;
    registry.register(sweep_leftovers(config, ids))?;
    registry.register(release_shm(ids))?;
    registry.validate()?;

    Ok(Plan {
        name: "migrate-ids".to_string(),
        requirements: vec![
            Requirement::Privileged,
            Requirement::AccountExists {
                user: ids.user.clone(),
                group: ids.group.clone(),
            },
            Requirement::GidAvailable {
                gid: ids.new_gid,
                group: ids.group.clone(),
            },
            Requirement::UidAvailable {
                uid: ids.new_uid,
                user: ids.user.clone(),
            },
            Requirement::ServiceInactive(config.service.clone()),
        ],
        registry,
        checks: checks(config, ids),
        confirmation: Some(prompt(config, ids)),
    })
}

fn prompt(config: &ProvisionConfig, ids: &IdChange) -> String {
    let roots = if config.migration.roots.is_empty() {
        "no configured roots".to_string()
    } else {
        config
            .migration
            .roots
            .iter()
            .map(|r| r.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    };
    format!(
        "About to move {}:{} from uid {} / gid {} to uid {} / gid {}, re-own {} \
        and sweep {} for leftover files. Service {} must stay stopped.",
        ids.user,
        ids.group,
        ids.old_uid,
        ids.old_gid,
        ids.new_uid,
        ids.new_gid,
        roots,
        config
            .migration
            .sweep_roots
            .iter()
            .map(|r| r.as_str())
            .collect::<Vec<_>>()
            .join(", "),
        config.service
    )
}

fn checks(config: &ProvisionConfig, ids: &IdChange) -> Vec<Check> {
    let mut checks = vec![
        Check::new(CheckKind::AccountIds {
            user: ids.user.clone(),
            group: ids.group.clone(),
            uid: ids.new_uid,
            gid: ids.new_gid,
        })
        .established_by(CONFIRM_IDS),
    ];
    for root in &config.migration.roots {
        checks.push(
            Check::new(CheckKind::Ownership {
                path: root.clone(),
                owner: Principal::Ids {
                    uid: ids.new_uid,
                    gid: ids.new_gid,
                },
                mode: None,
            })
            .established_by(RESTAMP_OWNERSHIP),
        );
    }
    if ids.stale_uid().is_some() || ids.stale_gid().is_some() {
        checks.push(
            Check::new(CheckKind::NoLeftovers {
                roots: config.migration.sweep_roots.clone(),
                exclude: config.migration.sweep_exclude.clone(),
                uid: ids.stale_uid(),
                gid: ids.stale_gid(),
            })
            .established_by(SWEEP_LEFTOVERS),
        );
    }
    checks
}

fn change_gid(ids: &IdChange) -> ProvisioningStep {
    let apply = ids.clone();
    let undo = ids.clone();
    ProvisioningStep::mandatory(CHANGE_GID, 10, "groupmod -g", move |scope| {
        let current = scope
            .host
            .accounts
            .group_gid(&apply.group)
            .ok_or_else(|| anyhow::anyhow!("group '{}' does not exist", apply.group))?;
        if current == apply.new_gid {
            return Ok(StepEffect::Unchanged);
        }
        scope.host.accounts.set_gid(&apply.group, apply.new_gid)?;
        info!("group {} moved from gid {} to {}", apply.group, current, apply.new_gid);
        Ok(StepEffect::Changed)
    })
    .with_rollback(move |host| {
        if host.accounts.group_gid(&undo.group) != Some(undo.old_gid) {
            host.accounts.set_gid(&undo.group, undo.old_gid)?;
        }
        Ok(())
    })
}

fn change_uid(ids: &IdChange) -> ProvisioningStep {
    let apply = ids.clone();
    let undo = ids.clone();
    ProvisioningStep::mandatory(CHANGE_UID, 20, "usermod -u", move |scope| {
        let current = scope
            .host
            .accounts
            .user_by_name(&apply.user)
            .ok_or_else(|| anyhow::anyhow!("user '{}' does not exist", apply.user))?
            .uid;
        if current == apply.new_uid {
            return Ok(StepEffect::Unchanged);
        }
        scope.host.accounts.set_uid(&apply.user, apply.new_uid)?;
        info!("user {} moved from uid {} to {}", apply.user, current, apply.new_uid);
        Ok(StepEffect::Changed)
    })
    .with_rollback(move |host| {
        if host.accounts.user_by_name(&undo.user).map(|u| u.uid) != Some(undo.old_uid) {
            host.accounts.set_uid(&undo.user, undo.old_uid)?;
        }
        Ok(())
    })
}

fn confirm_ids(ids: &IdChange) -> ProvisioningStep {
    let ids = ids.clone();
    ProvisioningStep::mandatory(CONFIRM_IDS, 30, "id lookup", move |scope| {
        let (uid, gid) = account_ids(scope.host, &ids.user, &ids.group)?;
        if (uid, gid) != (ids.new_uid, ids.new_gid) {
            bail!(
                "{}:{} resolves to {}:{} after the change, expected {}:{}",
                ids.user,
                ids.group,
                uid,
                gid,
                ids.new_uid,
                ids.new_gid
            );
        }
        Ok(StepEffect::Unchanged)
    })
}

fn restamp_ownership(config: &ProvisionConfig, ids: &IdChange) -> ProvisioningStep {
    let roots = config.migration.roots.clone();
    let (uid, gid) = (ids.new_uid, ids.new_gid);
    ProvisioningStep::mandatory(RESTAMP_OWNERSHIP, 40, "chown -R", move |scope| {
        let mut changed = 0;
        for root in &roots {
            if !scope.host.fs.exists(root) {
                warn!("migration root {} does not exist, skipping", root);
                continue;
            }
            let count = restamp_tree(scope.host.fs.as_ref(), root, uid, gid)?;
            info!("re-owned {} entries under {}", count, root);
            changed += count;
        }
        Ok(if changed == 0 {
            StepEffect::Unchanged
        } else {
            StepEffect::Changed
        })
    })
    .with_targets(config.migration.roots.iter().cloned(), SnapshotKind::Ownership)
}

fn sweep_leftovers(config: &ProvisionConfig, ids: &IdChange) -> ProvisioningStep {
    let roots = config.migration.sweep_roots.clone();
    let exclude = config.migration.sweep_exclude.clone();
    let ids = ids.clone();
    ProvisioningStep::optional(SWEEP_LEFTOVERS, 50, "chown leftovers", move |scope| {
        sweep(scope, &roots, &exclude, &ids)
    })
}

/// Re-owns every entry still carrying an old id. Entries that cannot be
/// read or re-owned are logged and left alone.
fn sweep(
    scope: &mut StepScope<'_>,
    roots: &[Utf8PathBuf],
    exclude: &[Utf8PathBuf],
    ids: &IdChange,
) -> anyhow::Result<StepEffect> {
    if ids.stale_uid().is_none() && ids.stale_gid().is_none() {
        return Ok(StepEffect::Unchanged);
    }
    let fs = scope.host.fs.clone();
    let mut effect = StepEffect::Unchanged;
    for root in roots {
        let mut leftovers = Vec::new();
        for entry in fs.walk(root, exclude) {
            match entry {
                WalkEntry::Found { path, stat } if ids.is_stale(stat.uid, stat.gid) => {
                    leftovers.push(OwnershipEntry {
                        mode: (!stat.is_symlink()).then_some(stat.mode),
                        path,
                        uid: stat.uid,
                        gid: stat.gid,
                    });
                }
                WalkEntry::Found { .. } => {}
                WalkEntry::Unreadable { path, reason } => {
                    warn!("sweep cannot read {}: {}", path, reason);
                }
            }
        }
        if leftovers.is_empty() {
            debug!("no leftovers under {}", root);
            continue;
        }
        scope.record_ownership(&format!("leftovers under {}", root), leftovers.clone())?;

        let mut fixed = 0;
        for entry in &leftovers {
            let (uid, gid) = ids.migrated(entry.uid, entry.gid);
            match fs.chown(&entry.path, uid, gid) {
                Ok(()) => fixed += 1,
                Err(e) => warn!("cannot re-own {}: {:#}", entry.path, e),
            }
        }
        info!("re-owned {} of {} leftover entries under {}", fixed, leftovers.len(), root);
        if fixed > 0 {
            effect = StepEffect::Changed;
        }
    }
    Ok(effect)
}

fn release_shm(ids: &IdChange) -> ProvisioningStep {
    let old_uid = ids.stale_uid();
    ProvisioningStep::optional(RELEASE_SHM, 60, "ipcrm -m", move |scope| {
        let Some(old_uid) = old_uid else {
            return Ok(StepEffect::Unchanged);
        };
        let segments = scope.host.shm.segments_owned_by(old_uid)?;
        if segments.is_empty() {
            return Ok(StepEffect::Unchanged);
        }
        for id in segments {
            match scope.host.shm.release(id) {
                Ok(()) => info!("released shared memory segment {}", id),
                Err(e) => warn!("cannot release shared memory segment {}: {:#}", id, e),
            }
        }
        Ok(StepEffect::Changed)
    })
}
