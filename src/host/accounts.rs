//! User/group directory collaborator.
//!
//! Lookups go through NSS (`getpwnam_r` and friends, via `uzers`), so LDAP or
//! sssd-backed accounts are seen the same way `id(1)` sees them. Changes go
//! through `usermod`/`groupmod`, which also rewrite the shadow files.

use std::sync::Arc;

use anyhow::Result;

use super::{Accounts, Identity};
use crate::executor::{CommandExecutor, CommandSpec, run_checked};

fn identity_from(user: &uzers::User) -> Identity {
    Identity {
        name: user.name().to_string_lossy().into_owned(),
        uid: user.uid(),
        gid: user.primary_group_id(),
    }
}

/// Builds the `groupmod` invocation that sets `group`'s gid.
pub(crate) fn groupmod_spec(group: &str, gid: u32) -> CommandSpec {
    CommandSpec::new("groupmod", vec!["-g".to_string(), gid.to_string(), group.to_string()])
}

/// Builds the `usermod` invocation that sets `name`'s uid.
pub(crate) fn usermod_spec(name: &str, uid: u32) -> CommandSpec {
    CommandSpec::new("usermod", vec!["-u".to_string(), uid.to_string(), name.to_string()])
}

/// The system account database.
pub struct SystemAccounts {
    executor: Arc<dyn CommandExecutor>,
}

impl SystemAccounts {
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self { executor }
    }
}

impl Accounts for SystemAccounts {
    fn user_by_name(&self, name: &str) -> Option<Identity> {
        uzers::get_user_by_name(name).map(|u| identity_from(&u))
    }

    fn user_by_uid(&self, uid: u32) -> Option<Identity> {
        uzers::get_user_by_uid(uid).map(|u| identity_from(&u))
    }

    fn group_gid(&self, name: &str) -> Option<u32> {
        uzers::get_group_by_name(name).map(|g| g.gid())
    }

    fn group_by_gid(&self, gid: u32) -> Option<String> {
        uzers::get_group_by_gid(gid).map(|g| g.name().to_string_lossy().into_owned())
    }

    fn set_uid(&self, name: &str, uid: u32) -> Result<()> {
        run_checked(self.executor.as_ref(), &usermod_spec(name, uid))
    }

    fn set_gid(&self, group: &str, gid: u32) -> Result<()> {
        run_checked(self.executor.as_ref(), &groupmod_spec(group, gid))
    }
}
