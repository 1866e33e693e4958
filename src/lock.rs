//! Advisory lock preventing two runs against the same host at once.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};

use camino::{Utf8Path, Utf8PathBuf};
use rustix::fs::{FlockOperation, flock};
use tracing::debug;

use crate::error::ProvisionError;

/// Name of the lock file inside the state directory.
pub const LOCK_FILE: &str = "pgprovision.lock";

/// An exclusive `flock` on `<state_dir>/pgprovision.lock`, released on drop.
#[derive(Debug)]
pub struct RunLock {
    path: Utf8PathBuf,
    _file: File,
}

impl RunLock {
    pub fn acquire(state_dir: &Utf8Path) -> Result<Self, ProvisionError> {
        fs::create_dir_all(state_dir)
            .map_err(|e| ProvisionError::io(format!("failed to create {}", state_dir), e))?;
        let path = state_dir.join(LOCK_FILE);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| ProvisionError::io(format!("failed to open lock file {}", path), e))?;

        if let Err(errno) = flock(&file, FlockOperation::NonBlockingLockExclusive) {
            if errno == rustix::io::Errno::WOULDBLOCK {
                let mut holder = String::new();
                let _ = file.read_to_string(&mut holder);
                let holder = holder.trim();
                let holder = if holder.is_empty() { "unknown" } else { holder };
                return Err(ProvisionError::Lock(format!(
                    "another pgprovision run (pid {}) holds {}",
                    holder, path
                )));
            }
            return Err(ProvisionError::io(
                format!("failed to lock {}", path),
                std::io::Error::from(errno),
            ));
        }

        file.set_len(0)
            .and_then(|()| file.seek(SeekFrom::Start(0)).map(|_| ()))
            .and_then(|()| writeln!(file, "{}", std::process::id()))
            .map_err(|e| ProvisionError::io(format!("failed to write pid to {}", path), e))?;
        debug!("acquired {}", path);
        Ok(Self { path, _file: file })
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }
}
