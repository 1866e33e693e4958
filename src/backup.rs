//! Pre-mutation snapshots and their restoration.
//!
//! Every run gets its own backup root (`<state_dir>/backups/<run-id>`), so
//! a later run never overwrites an earlier snapshot. Within a run, file
//! copies mirror the original absolute path under `files/`, and ownership
//! snapshots are written as numbered plain-text manifests.

use std::fmt::Write as _;
use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tracing::{debug, info};

use crate::error::ProvisionError;
use crate::host::{FileKind, Filesystem, WalkEntry};
use crate::step::{SnapshotKind, Target};

/// Owner, group and mode of one entry at snapshot time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OwnershipEntry {
    pub path: Utf8PathBuf,
    pub uid: u32,
    pub gid: u32,
    /// `None` for symlinks, whose mode is not meaningful.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<u32>,
}

/// One captured pre-mutation snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackupHandle {
    /// A regular file copied verbatim.
    File { original: Utf8PathBuf, copy: Utf8PathBuf },
    /// A symlink and the path it pointed at.
    Link { path: Utf8PathBuf, target: Utf8PathBuf },
    /// Ownership of a set of entries, also written to `manifest`.
    Ownership {
        root: Utf8PathBuf,
        manifest: Utf8PathBuf,
        entries: Vec<OwnershipEntry>,
    },
}

impl BackupHandle {
    /// The path this snapshot restores.
    pub fn path(&self) -> &Utf8Path {
        match self {
            Self::File { original, .. } => original,
            Self::Link { path, .. } => path,
            Self::Ownership { root, .. } => root,
        }
    }

    /// Where the snapshot was stored, for log lines.
    pub fn location(&self) -> String {
        match self {
            Self::File { copy, .. } => copy.to_string(),
            Self::Link { target, .. } => format!("link to {}", target),
            Self::Ownership {
                manifest, entries, ..
            } => format!("{} ({} entries)", manifest, entries.len()),
        }
    }
}

/// Renders an ownership manifest: one `path<TAB>uid<TAB>gid<TAB>mode` line
/// per entry, with `-` as the mode of symlinks.
pub fn render_manifest(label: &str, entries: &[OwnershipEntry]) -> String {
    let mut out = format!("# ownership snapshot of {}\n", label);
    for entry in entries {
        let mode = entry
            .mode
            .map(|m| format!("{:04o}", m))
            .unwrap_or_else(|| "-".to_string());
        // Writing to a String cannot fail.
        let _ = writeln!(out, "{}\t{}\t{}\t{}", entry.path, entry.uid, entry.gid, mode);
    }
    out
}

/// Captures and restores snapshots for one run.
pub struct BackupManager {
    fs: Arc<dyn Filesystem>,
    root: Utf8PathBuf,
    sequence: u32,
}

impl BackupManager {
    pub fn new(fs: Arc<dyn Filesystem>, root: impl Into<Utf8PathBuf>) -> Self {
        Self {
            fs,
            root: root.into(),
            sequence: 0,
        }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// Captures `target` before it is overwritten.
    ///
    /// Returns `Ok(None)` when the path does not exist yet, since there is
    /// nothing to preserve.
    pub fn snapshot(&mut self, target: &Target) -> Result<Option<BackupHandle>, ProvisionError> {
        if !self.fs.exists(&target.path) {
            debug!("{} does not exist, nothing to back up", target.path);
            return Ok(None);
        }
        let handle = match target.kind {
            SnapshotKind::File => self.snapshot_file(&target.path)?,
            SnapshotKind::Ownership => self.snapshot_ownership(&target.path)?,
        };
        Ok(Some(handle))
    }

    /// Writes a manifest for entries discovered while a step runs.
    pub fn record_ownership(
        &mut self,
        label: &str,
        entries: Vec<OwnershipEntry>,
    ) -> Result<BackupHandle, ProvisionError> {
        let manifest = self.write_manifest(label, &entries)?;
        Ok(BackupHandle::Ownership {
            root: Utf8PathBuf::from(label),
            manifest,
            entries,
        })
    }

    /// Puts a snapshot back in place.
    pub fn restore(&self, handle: &BackupHandle) -> Result<(), ProvisionError> {
        let restore_err = |path: &Utf8Path, err: anyhow::Error| ProvisionError::Restore {
            path: path.to_string(),
            message: format!("{:#}", err),
        };
        match handle {
            BackupHandle::File { original, copy } => {
                self.fs
                    .copy(copy, original)
                    .map_err(|e| restore_err(original, e))?;
            }
            BackupHandle::Link { path, target } => {
                if self.fs.exists(path) {
                    self.fs.remove(path).map_err(|e| restore_err(path, e))?;
                }
                self.fs
                    .symlink(target, path)
                    .map_err(|e| restore_err(path, e))?;
            }
            BackupHandle::Ownership { root, entries, .. } => {
                let mut failures = Vec::new();
                for entry in entries {
                    let result = self
                        .fs
                        .chown(&entry.path, entry.uid, entry.gid)
                        .and_then(|()| match entry.mode {
                            Some(mode) => self.fs.chmod(&entry.path, mode),
                            None => Ok(()),
                        });
                    if let Err(e) = result {
                        failures.push(format!("{}: {:#}", entry.path, e));
                    }
                }
                if !failures.is_empty() {
                    return Err(ProvisionError::Restore {
                        path: root.to_string(),
                        message: failures.join("; "),
                    });
                }
            }
        }
        info!("restored {}", handle.path());
        Ok(())
    }

    fn snapshot_file(&mut self, path: &Utf8Path) -> Result<BackupHandle, ProvisionError> {
        let stat = self.fs.stat(path).map_err(|e| backup_err(path, e))?;
        match stat.kind {
            FileKind::Symlink(target) => Ok(BackupHandle::Link {
                path: path.to_owned(),
                target,
            }),
            FileKind::File => {
                let copy = self.copy_destination(path);
                if let Some(parent) = copy.parent() {
                    self.fs.mkdir_all(parent).map_err(|e| backup_err(path, e))?;
                }
                self.fs.copy(path, &copy).map_err(|e| backup_err(path, e))?;
                Ok(BackupHandle::File {
                    original: path.to_owned(),
                    copy,
                })
            }
            FileKind::Dir => Err(ProvisionError::Backup {
                path: path.to_string(),
                message: "is a directory, refusing to replace it".to_string(),
            }),
            FileKind::Other => Err(ProvisionError::Backup {
                path: path.to_string(),
                message: "is not a regular file or symlink".to_string(),
            }),
        }
    }

    fn snapshot_ownership(&mut self, root: &Utf8Path) -> Result<BackupHandle, ProvisionError> {
        let mut entries = Vec::new();
        for entry in self.fs.walk(root, &[]) {
            match entry {
                WalkEntry::Found { path, stat } => entries.push(OwnershipEntry {
                    mode: (!stat.is_symlink()).then_some(stat.mode),
                    path,
                    uid: stat.uid,
                    gid: stat.gid,
                }),
                WalkEntry::Unreadable { path, reason } => {
                    return Err(ProvisionError::Backup {
                        path: root.to_string(),
                        message: format!("cannot read {}: {}", path, reason),
                    });
                }
            }
        }
        let manifest = self.write_manifest(root.as_str(), &entries)?;
        Ok(BackupHandle::Ownership {
            root: root.to_owned(),
            manifest,
            entries,
        })
    }

    fn write_manifest(
        &mut self,
        label: &str,
        entries: &[OwnershipEntry],
    ) -> Result<Utf8PathBuf, ProvisionError> {
        self.sequence += 1;
        let manifest = self
            .root
            .join(format!("ownership-{:03}.manifest", self.sequence));
        let write = || -> anyhow::Result<()> {
            self.fs.mkdir_all(&self.root)?;
            self.fs
                .write(&manifest, render_manifest(label, entries).as_bytes())
        };
        write().map_err(|e| backup_err(Utf8Path::new(label), e))?;
        Ok(manifest)
    }

    /// `files/<original path>`, suffixed with `.N` if that copy exists.
    fn copy_destination(&mut self, original: &Utf8Path) -> Utf8PathBuf {
        let relative = original.strip_prefix("/").unwrap_or(original);
        let base = self.root.join("files").join(relative);
        if !self.fs.exists(&base) {
            return base;
        }
        loop {
            self.sequence += 1;
            let candidate = Utf8PathBuf::from(format!("{}.{}", base, self.sequence));
            if !self.fs.exists(&candidate) {
                return candidate;
            }
        }
    }
}

impl std::fmt::Debug for BackupManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupManager")
            .field("root", &self.root)
            .field("sequence", &self.sequence)
            .finish_non_exhaustive()
    }
}

fn backup_err(path: &Utf8Path, err: anyhow::Error) -> ProvisionError {
    ProvisionError::Backup {
        path: path.to_string(),
        message: format!("{:#}", err),
    }
}
