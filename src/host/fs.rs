//! Filesystem collaborator backed by the local host.

use std::fs;
use std::os::unix::fs::{MetadataExt, PermissionsExt};

use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use walkdir::WalkDir;

use super::{FileKind, FileStat, Filesystem, WalkEntry};
use crate::error::ProvisionError;

/// Converts `lstat` metadata into a [`FileStat`].
fn stat_from_metadata(path: &Utf8Path, metadata: &fs::Metadata) -> Result<FileStat> {
    let file_type = metadata.file_type();
    let kind = if file_type.is_symlink() {
        let target = fs::read_link(path)
            .map_err(|e| ProvisionError::io(format!("failed to read link {}", path), e))?;
        let target = Utf8PathBuf::from_path_buf(target).map_err(|p| {
            ProvisionError::Validation(format!(
                "symlink target of {} is not valid UTF-8: {}",
                path,
                p.display()
            ))
        })?;
        FileKind::Symlink(target)
    } else if file_type.is_dir() {
        FileKind::Dir
    } else if file_type.is_file() {
        FileKind::File
    } else {
        FileKind::Other
    };
    Ok(FileStat {
        uid: metadata.uid(),
        gid: metadata.gid(),
        mode: metadata.mode() & 0o7777,
        kind,
    })
}

/// The host's own filesystem.
#[derive(Debug, Default, Clone)]
pub struct HostFilesystem;

impl Filesystem for HostFilesystem {
    fn exists(&self, path: &Utf8Path) -> bool {
        fs::symlink_metadata(path).is_ok()
    }

    fn stat(&self, path: &Utf8Path) -> Result<FileStat> {
        let metadata = fs::symlink_metadata(path)
            .map_err(|e| ProvisionError::io(format!("failed to stat {}", path), e))?;
        stat_from_metadata(path, &metadata)
    }

    fn mkdir_all(&self, path: &Utf8Path) -> Result<()> {
        fs::create_dir_all(path)
            .map_err(|e| ProvisionError::io(format!("failed to create directory {}", path), e))?;
        Ok(())
    }

    fn chown(&self, path: &Utf8Path, uid: u32, gid: u32) -> Result<()> {
        std::os::unix::fs::lchown(path, Some(uid), Some(gid)).map_err(|e| {
            ProvisionError::io(format!("failed to chown {} to {}:{}", path, uid, gid), e)
        })?;
        Ok(())
    }

    fn chmod(&self, path: &Utf8Path, mode: u32) -> Result<()> {
        fs::set_permissions(path, fs::Permissions::from_mode(mode)).map_err(|e| {
            ProvisionError::io(format!("failed to chmod {} to {:04o}", path, mode), e)
        })?;
        Ok(())
    }

    fn symlink(&self, target: &Utf8Path, link: &Utf8Path) -> Result<()> {
        std::os::unix::fs::symlink(target, link).map_err(|e| {
            ProvisionError::io(format!("failed to link {} -> {}", link, target), e)
        })?;
        Ok(())
    }

    fn remove(&self, path: &Utf8Path) -> Result<()> {
        fs::remove_file(path)
            .map_err(|e| ProvisionError::io(format!("failed to remove {}", path), e))?;
        Ok(())
    }

    fn copy(&self, from: &Utf8Path, to: &Utf8Path) -> Result<()> {
        fs::copy(from, to)
            .map_err(|e| ProvisionError::io(format!("failed to copy {} to {}", from, to), e))?;
        Ok(())
    }

    fn write(&self, path: &Utf8Path, contents: &[u8]) -> Result<()> {
        fs::write(path, contents)
            .map_err(|e| ProvisionError::io(format!("failed to write {}", path), e))?;
        Ok(())
    }

    fn read_dir(&self, path: &Utf8Path) -> Result<Vec<Utf8PathBuf>> {
        let entries = fs::read_dir(path)
            .map_err(|e| ProvisionError::io(format!("failed to read directory {}", path), e))?;
        let mut children = Vec::new();
        for entry in entries {
            let entry = entry.with_context(|| format!("failed to read entry in {}", path))?;
            let child = Utf8PathBuf::from_path_buf(entry.path()).map_err(|p| {
                ProvisionError::Validation(format!("path is not valid UTF-8: {}", p.display()))
            })?;
            children.push(child);
        }
        children.sort();
        Ok(children)
    }

    fn walk(&self, root: &Utf8Path, exclude: &[Utf8PathBuf]) -> Vec<WalkEntry> {
        let walker = WalkDir::new(root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| !exclude.iter().any(|x| e.path() == x.as_std_path()));

        let mut entries = Vec::new();
        for item in walker {
            match item {
                Ok(entry) => {
                    let Some(path) = Utf8Path::from_path(entry.path()) else {
                        entries.push(WalkEntry::Unreadable {
                            path: Utf8PathBuf::from(entry.path().to_string_lossy().into_owned()),
                            reason: "path is not valid UTF-8".to_string(),
                        });
                        continue;
                    };
                    let stat = entry
                        .metadata()
                        .map_err(anyhow::Error::from)
                        .and_then(|metadata| stat_from_metadata(path, &metadata));
                    match stat {
                        Ok(stat) => entries.push(WalkEntry::Found {
                            path: path.to_owned(),
                            stat,
                        }),
                        Err(e) => entries.push(WalkEntry::Unreadable {
                            path: path.to_owned(),
                            reason: format!("{:#}", e),
                        }),
                    }
                }
                Err(err) => {
                    let path = err
                        .path()
                        .map(|p| p.to_string_lossy().into_owned())
                        .unwrap_or_else(|| root.to_string());
                    let reason = match err.io_error() {
                        Some(io) => crate::error::io_error_kind_message(io),
                        None => err.to_string(),
                    };
                    entries.push(WalkEntry::Unreadable {
                        path: Utf8PathBuf::from(path),
                        reason,
                    });
                }
            }
        }
        entries
    }
}
