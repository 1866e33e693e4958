//! The provisioning sequences pgprovision knows how to run.
//!
//! Each plan turns a validated [`ProvisionConfig`](crate::config::ProvisionConfig)
//! into a [`Plan`](crate::runner::Plan): preflight requirements, an ordered
//! step registry and the checks that verify the result.

pub mod install;
pub mod migrate;

use anyhow::{Result, anyhow};

use crate::host::Host;

/// Current uid of `user` and gid of `group`.
pub(crate) fn account_ids(host: &Host, user: &str, group: &str) -> Result<(u32, u32)> {
    let identity = host
        .accounts
        .user_by_name(user)
        .ok_or_else(|| anyhow!("user '{}' does not exist", user))?;
    let gid = host
        .accounts
        .group_gid(group)
        .ok_or_else(|| anyhow!("group '{}' does not exist", group))?;
    Ok((identity.uid, gid))
}
