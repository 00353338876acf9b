//! Update transactions

use std::fmt;
use std::path::PathBuf;

use semver::Version;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::updater::lock::UpdateLock;

/// What a transaction updates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateScope {
    /// The managed application tree
    Application,
    /// The framework's own installation; entry points are probed for
    /// executability before and after the swap
    SelfUpdate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxnStatus {
    Pending,
    Staged,
    Verified,
    Applied,
    RolledBack,
    Failed,
}

impl TxnStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TxnStatus::Applied | TxnStatus::RolledBack | TxnStatus::Failed)
    }
}

impl fmt::Display for TxnStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TxnStatus::Pending => "pending",
            TxnStatus::Staged => "staged",
            TxnStatus::Verified => "verified",
            TxnStatus::Applied => "applied",
            TxnStatus::RolledBack => "rolled back",
            TxnStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One in-flight update. Holds the lock until it reaches a terminal state.
#[derive(Debug)]
pub struct UpdateTransaction {
    pub id: Uuid,
    pub scope: UpdateScope,
    /// Absent on first install
    pub current_version: Option<Version>,
    pub candidate_version: Version,
    pub staging_path: PathBuf,
    pub backup_path: Option<PathBuf>,
    pub status: TxnStatus,
    pub(crate) lock: Option<UpdateLock>,
}

impl UpdateTransaction {
    /// Move to a terminal state and release the lock
    pub(crate) fn finish(&mut self, status: TxnStatus) {
        self.status = status;
        if let Some(lock) = self.lock.take() {
            lock.release();
        }
    }

    pub(crate) fn step(&mut self, step: &str) {
        if let Some(lock) = self.lock.as_mut() {
            if let Err(e) = lock.update_step(step) {
                tracing::warn!("Failed to record step {}: {}", step, e);
            }
        }
    }

    pub fn holds_lock(&self) -> bool {
        self.lock.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(TxnStatus::Applied.is_terminal());
        assert!(TxnStatus::RolledBack.is_terminal());
        assert!(TxnStatus::Failed.is_terminal());
        assert!(!TxnStatus::Verified.is_terminal());
        assert_eq!(TxnStatus::RolledBack.to_string(), "rolled back");
    }
}
