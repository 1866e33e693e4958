//! Collaborators the provisioning engine drives.
//!
//! The engine never touches the operating system directly. Every side effect
//! and every read-only query goes through one of the traits below, bundled
//! into a [`Host`]. Production implementations live in the submodules; tests
//! substitute in-memory fakes.

pub mod accounts;
pub mod fs;
pub mod packages;
pub mod probe;
pub mod service;
pub mod shm;

use std::sync::Arc;

use anyhow::Result;
use camino::{Utf8Path, Utf8PathBuf};
use url::Url;

pub use accounts::SystemAccounts;
pub use fs::HostFilesystem;
pub use packages::{PackageTool, SystemPackages};
pub use probe::TcpProbe;
pub use service::Systemctl;
pub use shm::SysvShm;

use crate::executor::CommandExecutor;

/// Type of a filesystem entry, as seen without following symlinks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileKind {
    Dir,
    File,
    /// A symbolic link and the path it points at.
    Symlink(Utf8PathBuf),
    Other,
}

/// Ownership and permission bits of a filesystem entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStat {
    pub uid: u32,
    pub gid: u32,
    /// Permission bits only (`mode & 0o7777`).
    pub mode: u32,
    pub kind: FileKind,
}

impl FileStat {
    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Dir
    }

    pub fn is_symlink(&self) -> bool {
        matches!(self.kind, FileKind::Symlink(_))
    }
}

/// One entry produced by a recursive walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalkEntry {
    Found { path: Utf8PathBuf, stat: FileStat },
    /// The entry could not be read (e.g., permission denied); the walk continues.
    Unreadable { path: Utf8PathBuf, reason: String },
}

/// Filesystem operations. Paths are never followed through symlinks.
pub trait Filesystem {
    fn exists(&self, path: &Utf8Path) -> bool;
    fn stat(&self, path: &Utf8Path) -> Result<FileStat>;
    fn mkdir_all(&self, path: &Utf8Path) -> Result<()>;
    fn chown(&self, path: &Utf8Path, uid: u32, gid: u32) -> Result<()>;
    fn chmod(&self, path: &Utf8Path, mode: u32) -> Result<()>;
    fn symlink(&self, target: &Utf8Path, link: &Utf8Path) -> Result<()>;
    /// Removes a file or symlink. Directories are refused.
    fn remove(&self, path: &Utf8Path) -> Result<()>;
    fn copy(&self, from: &Utf8Path, to: &Utf8Path) -> Result<()>;
    fn write(&self, path: &Utf8Path, contents: &[u8]) -> Result<()>;
    /// Lists the immediate children of a directory, sorted.
    fn read_dir(&self, path: &Utf8Path) -> Result<Vec<Utf8PathBuf>>;
    /// Walks `root` recursively (root included), pruning any path in `exclude`.
    fn walk(&self, root: &Utf8Path, exclude: &[Utf8PathBuf]) -> Vec<WalkEntry>;
}

/// Package installation.
pub trait PackageManager {
    fn install(&self, packages: &[String]) -> Result<()>;
}

/// A user account as reported by the user/group directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub name: String,
    pub uid: u32,
    /// Primary group id.
    pub gid: u32,
}

/// User/group directory service.
pub trait Accounts {
    fn user_by_name(&self, name: &str) -> Option<Identity>;
    fn user_by_uid(&self, uid: u32) -> Option<Identity>;
    fn group_gid(&self, name: &str) -> Option<u32>;
    /// Name of the group owning `gid`, if any.
    fn group_by_gid(&self, gid: u32) -> Option<String>;
    fn set_uid(&self, name: &str, uid: u32) -> Result<()>;
    fn set_gid(&self, group: &str, gid: u32) -> Result<()>;
}

/// Service manager (systemd units).
pub trait ServiceManager {
    fn enable(&self, name: &str) -> Result<()>;
    fn start(&self, name: &str) -> Result<()>;
    fn stop(&self, name: &str) -> Result<()>;
    fn is_active(&self, name: &str) -> Result<bool>;
    fn is_enabled(&self, name: &str) -> Result<bool>;
}

/// Liveness probe against the managed database service.
pub trait ConnectivityProbe {
    fn try_connect(&self, endpoint: &Url) -> Result<()>;
}

/// System V shared-memory segments.
pub trait SharedMemory {
    /// Ids of the segments whose owner uid is `uid`.
    fn segments_owned_by(&self, uid: u32) -> Result<Vec<u64>>;
    fn release(&self, id: u64) -> Result<()>;
}

/// Privilege level of the running process.
pub trait Privileges {
    fn effective_uid(&self) -> u32;
}

/// Reads the effective uid with `geteuid(2)`.
#[derive(Debug, Default, Clone)]
pub struct ProcessPrivileges;

impl Privileges for ProcessPrivileges {
    fn effective_uid(&self) -> u32 {
        rustix::process::geteuid().as_raw()
    }
}

/// Every collaborator of a run.
#[derive(Clone)]
pub struct Host {
    pub fs: Arc<dyn Filesystem>,
    pub packages: Arc<dyn PackageManager>,
    pub accounts: Arc<dyn Accounts>,
    pub services: Arc<dyn ServiceManager>,
    pub probe: Arc<dyn ConnectivityProbe>,
    pub shm: Arc<dyn SharedMemory>,
    pub privileges: Arc<dyn Privileges>,
}

impl Host {
    /// Builds the production collaborators, running external tools through `executor`.
    pub fn system(executor: Arc<dyn CommandExecutor>, tool: PackageTool) -> Self {
        Self {
            fs: Arc::new(HostFilesystem),
            packages: Arc::new(SystemPackages::new(tool, executor.clone())),
            accounts: Arc::new(SystemAccounts::new(executor.clone())),
            services: Arc::new(Systemctl::new(executor.clone())),
            probe: Arc::new(TcpProbe::default()),
            shm: Arc::new(SysvShm::new(executor)),
            privileges: Arc::new(ProcessPrivileges),
        }
    }
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host").finish_non_exhaustive()
    }
}

/// Re-owns every entry under `root` (root included) to `uid:gid`.
///
/// Returns the number of entries whose ownership changed. Entries that
/// cannot be read abort the walk with an error, since a partial re-stamp
/// of a data directory is worse than none.
pub(crate) fn restamp_tree(fs: &dyn Filesystem, root: &Utf8Path, uid: u32, gid: u32) -> Result<usize> {
    let mut changed = 0;
    for entry in fs.walk(root, &[]) {
        match entry {
            WalkEntry::Found { path, stat } => {
                if stat.uid != uid || stat.gid != gid {
                    fs.chown(&path, uid, gid)?;
                    changed += 1;
                }
            }
            WalkEntry::Unreadable { path, reason } => {
                anyhow::bail!("cannot read {} while re-owning {}: {}", path, root, reason);
            }
        }
    }
    Ok(changed)
}
