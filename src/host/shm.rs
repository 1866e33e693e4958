//! System V shared-memory collaborator.
//!
//! A PostgreSQL postmaster that was killed rather than stopped can leave its
//! shared-memory segment behind, still owned by the old service uid.

use std::fs;
use std::sync::Arc;

use anyhow::Result;
use camino::Utf8PathBuf;

use super::SharedMemory;
use crate::error::ProvisionError;
use crate::executor::{CommandExecutor, CommandSpec, run_checked};

/// Kernel listing of System V shared-memory segments.
pub const SYSVIPC_SHM: &str = "/proc/sysvipc/shm";

/// One row of the segment listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShmSegment {
    pub id: u64,
    pub uid: u32,
    pub attached: u64,
}

/// Parses the `/proc/sysvipc/shm` table.
///
/// Columns are `key shmid perms size cpid lpid nattch uid gid ...`; the
/// header line and malformed rows are ignored.
pub fn parse_sysvipc_shm(table: &str) -> Vec<ShmSegment> {
    table
        .lines()
        .skip(1)
        .filter_map(|line| {
            let cols: Vec<&str> = line.split_whitespace().collect();
            if cols.len() < 9 {
                return None;
            }
            Some(ShmSegment {
                id: cols[1].parse().ok()?,
                attached: cols[6].parse().ok()?,
                uid: cols[7].parse().ok()?,
            })
        })
        .collect()
}

/// Lists segments from procfs and removes them with `ipcrm`.
pub struct SysvShm {
    table: Utf8PathBuf,
    executor: Arc<dyn CommandExecutor>,
}

impl SysvShm {
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            table: Utf8PathBuf::from(SYSVIPC_SHM),
            executor,
        }
    }
}

impl SharedMemory for SysvShm {
    fn segments_owned_by(&self, uid: u32) -> Result<Vec<u64>> {
        let table = fs::read_to_string(&self.table)
            .map_err(|e| ProvisionError::io(format!("failed to read {}", self.table), e))?;
        Ok(parse_sysvipc_shm(&table)
            .into_iter()
            .filter(|s| s.uid == uid)
            .map(|s| {
                if s.attached > 0 {
                    tracing::warn!(
                        shmid = s.id,
                        attached = s.attached,
                        "shared-memory segment still has attached processes"
                    );
                }
                s.id
            })
            .collect())
    }

    fn release(&self, id: u64) -> Result<()> {
        let spec = CommandSpec::new("ipcrm", vec!["-m".to_string(), id.to_string()]);
        run_checked(self.executor.as_ref(), &spec)
    }
}
