//! Single-flight transaction lock
//!
//! `R/update.lock` is created with `create_new`, so exactly one process
//! wins. The file records who holds it:
//! - a lock whose owner process is gone is recovered, and its record is
//!   handed back so the caller can repair what the owner left behind
//! - a corrupt lock is recovered
//! - a live owner means `UpdateInProgress`, without waiting

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::process;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{HatchError, IoContext, Result};
use crate::fsutil::atomic_write;
use crate::ops_log::OpsLog;
use crate::paths::InstallLayout;

/// Attempts before giving up on a lock that keeps changing under us
const MAX_ACQUIRE_ATTEMPTS: usize = 3;

/// Lock file contents
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    /// Transaction holding the lock
    pub txn: String,
    pub pid: u32,
    pub hostname: String,
    pub acquired_at: DateTime<Utc>,
    /// Current step, for operators
    pub step: String,
}

impl LockInfo {
    fn new(txn: &str, step: &str) -> Self {
        let hostname = fs::read_to_string("/etc/hostname")
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        Self {
            txn: txn.to_string(),
            pid: process::id(),
            hostname,
            acquired_at: Utc::now(),
            step: step.to_string(),
        }
    }

    /// Whether the recorded owner is still running
    pub fn owner_alive(&self) -> bool {
        process_alive(self.pid)
    }
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // Signal 0 checks existence; EPERM still means the process exists
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    true
}

enum Holder {
    Live(LockInfo),
    /// Being written by its creator right now
    Empty,
    Stale {
        reason: String,
        /// Record of a dead owner; absent when the file was corrupt
        abandoned: Option<LockInfo>,
    },
}

/// Update lock handle - releases lock on drop
#[derive(Debug)]
pub struct UpdateLock {
    path: PathBuf,
    info: LockInfo,
    /// Lock of a dead owner that this one replaced
    recovered: Option<LockInfo>,
    ops_log: OpsLog,
    released: bool,
}

impl UpdateLock {
    /// Attempt to acquire the lock for transaction `txn`
    pub fn acquire(layout: &InstallLayout, txn: &str, step: &str) -> Result<Self> {
        let path = layout.lock_file();
        let ops_log = OpsLog::open(layout.ops_log());
        fs::create_dir_all(layout.root()).at(layout.root())?;

        let info = LockInfo::new(txn, step);
        let content = serde_json::to_string_pretty(&info)?;
        let mut recovered = None;

        for _ in 0..MAX_ACQUIRE_ATTEMPTS {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    file.write_all(content.as_bytes()).at(&path)?;
                    file.sync_all().at(&path)?;
                    ops_log.log(
                        "updater",
                        "lock_acquired",
                        Some(&format!("pid={} txn={} step={}", info.pid, txn, step)),
                    );
                    return Ok(Self {
                        path,
                        info,
                        recovered,
                        ops_log,
                        released: false,
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                Err(e) => return Err(HatchError::io(&path, e)),
            }

            match Self::inspect(&path)? {
                Some(Holder::Live(holder)) => {
                    return Err(HatchError::UpdateInProgress {
                        pid: holder.pid,
                        txn: holder.txn,
                    });
                }
                Some(Holder::Empty) => {
                    return Err(HatchError::UpdateInProgress {
                        pid: 0,
                        txn: "unknown".to_string(),
                    });
                }
                Some(Holder::Stale { reason, abandoned }) => {
                    warn!("Recovering update lock: {}", reason);
                    ops_log.log("updater", "stale_lock_recovered", Some(&reason));
                    match fs::remove_file(&path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == ErrorKind::NotFound => {}
                        Err(e) => return Err(HatchError::io(&path, e)),
                    }
                    recovered = abandoned;
                }
                // Released between our attempt and the read
                None => {}
            }
        }

        let holder = Self::holder(layout);
        Err(HatchError::UpdateInProgress {
            pid: holder.as_ref().map(|h| h.pid).unwrap_or(0),
            txn: holder.map(|h| h.txn).unwrap_or_else(|| "unknown".to_string()),
        })
    }

    fn inspect(path: &Path) -> Result<Option<Holder>> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(HatchError::io(path, e)),
        };
        if content.trim().is_empty() {
            return Ok(Some(Holder::Empty));
        }

        Ok(Some(match serde_json::from_str::<LockInfo>(&content) {
            Ok(holder) if holder.owner_alive() => Holder::Live(holder),
            Ok(holder) => Holder::Stale {
                reason: format!(
                    "owner pid={} txn={} no longer running (step {})",
                    holder.pid, holder.txn, holder.step
                ),
                abandoned: Some(holder),
            },
            Err(e) => Holder::Stale {
                reason: format!("corrupt lock file: {e}"),
                abandoned: None,
            },
        }))
    }

    /// Current lock holder, if any
    pub fn holder(layout: &InstallLayout) -> Option<LockInfo> {
        let content = fs::read_to_string(layout.lock_file()).ok()?;
        serde_json::from_str(&content).ok()
    }

    pub fn info(&self) -> &LockInfo {
        &self.info
    }

    /// The dead owner's record, if acquiring had to recover its lock
    pub fn recovered(&self) -> Option<&LockInfo> {
        self.recovered.as_ref()
    }

    /// Record progress in the lock file
    pub fn update_step(&mut self, step: &str) -> Result<()> {
        self.info.step = step.to_string();
        let content = serde_json::to_string_pretty(&self.info)?;
        atomic_write(&self.path, content.as_bytes())
    }

    /// Check if we still hold the lock
    pub fn is_valid(&self) -> bool {
        fs::read_to_string(&self.path)
            .ok()
            .and_then(|content| serde_json::from_str::<LockInfo>(&content).ok())
            .map(|holder| holder.pid == self.info.pid && holder.txn == self.info.txn)
            .unwrap_or(false)
    }

    /// Release explicitly (also done on drop)
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        if !self.is_valid() {
            warn!("Update lock no longer ours, leaving it in place");
            return;
        }
        match fs::remove_file(&self.path) {
            Ok(()) => {
                debug!("Released update lock for {}", self.info.txn);
                self.ops_log
                    .log("updater", "lock_released", Some(&format!("txn={}", self.info.txn)));
            }
            Err(e) => warn!("Failed to remove {}: {}", self.path.display(), e),
        }
    }
}

impl Drop for UpdateLock {
    fn drop(&mut self) {
        self.release_inner();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_single_flight() {
        let temp = TempDir::new().unwrap();
        let layout = InstallLayout::new(temp.path());

        let lock = UpdateLock::acquire(&layout, "txn-a", "begin").unwrap();
        let err = UpdateLock::acquire(&layout, "txn-b", "begin").unwrap_err();
        match err {
            HatchError::UpdateInProgress { pid, txn } => {
                assert_eq!(pid, process::id());
                assert_eq!(txn, "txn-a");
            }
            other => panic!("unexpected error: {other}"),
        }

        drop(lock);
        assert!(!layout.lock_file().exists());
        UpdateLock::acquire(&layout, "txn-b", "begin").unwrap();
    }

    #[test]
    fn test_update_step() {
        let temp = TempDir::new().unwrap();
        let layout = InstallLayout::new(temp.path());
        let mut lock = UpdateLock::acquire(&layout, "txn", "begin").unwrap();
        lock.update_step("stage").unwrap();
        assert_eq!(UpdateLock::holder(&layout).unwrap().step, "stage");
        assert!(lock.is_valid());
    }

    #[test]
    fn test_recovers_corrupt_lock() {
        let temp = TempDir::new().unwrap();
        let layout = InstallLayout::new(temp.path());
        fs::write(layout.lock_file(), "{ not json").unwrap();
        let lock = UpdateLock::acquire(&layout, "txn", "begin").unwrap();
        assert_eq!(lock.info().txn, "txn");
        assert!(lock.recovered().is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_recovers_dead_owner() {
        let temp = TempDir::new().unwrap();
        let layout = InstallLayout::new(temp.path());

        // A child that has already exited and been reaped
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let dead_pid = child.id();
        child.wait().unwrap();

        let stale = LockInfo {
            txn: "old".into(),
            pid: dead_pid,
            hostname: "h".into(),
            acquired_at: Utc::now(),
            step: "apply".into(),
        };
        fs::write(layout.lock_file(), serde_json::to_string(&stale).unwrap()).unwrap();

        let lock = UpdateLock::acquire(&layout, "new", "begin").unwrap();
        assert_eq!(UpdateLock::holder(&layout).unwrap().txn, "new");
        let recovered = lock.recovered().unwrap();
        assert_eq!(recovered.txn, "old");
        assert_eq!(recovered.step, "apply");
        drop(lock);
    }

    #[test]
    fn test_drop_leaves_foreign_lock() {
        let temp = TempDir::new().unwrap();
        let layout = InstallLayout::new(temp.path());
        let lock = UpdateLock::acquire(&layout, "mine", "begin").unwrap();

        // Someone else took over the file
        let foreign = LockInfo::new("theirs", "apply");
        fs::write(layout.lock_file(), serde_json::to_string(&foreign).unwrap()).unwrap();
        drop(lock);
        assert!(layout.lock_file().exists());
    }
}
