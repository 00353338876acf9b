//! Backups of prior live trees
//!
//! ```text
//! R/backups/20261019T170523.120Z_1.2.0/
//!     tree/            the displaced live tree
//!     registry.state   registry snapshot at the time, if any
//!     backup.json      BackupMeta
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{HatchError, IoContext, Result};
use crate::host::{FileOp, Privilege};
use crate::paths::{InstallLayout, REGISTRY_FILE};

pub const BACKUP_META: &str = "backup.json";
pub const BACKUP_TREE: &str = "tree";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupMeta {
    /// Version marker of the backed-up tree, if it had one
    pub version: Option<Version>,
    pub created_at: DateTime<Utc>,
    /// Transaction that displaced the tree
    pub txn: Uuid,
    /// `fsutil::tree_digest` of `tree/`
    pub tree_digest: String,
}

#[derive(Debug, Clone)]
pub struct Backup {
    pub dir: PathBuf,
    pub meta: BackupMeta,
}

impl Backup {
    /// Create an empty backup directory and write its metadata
    pub(crate) fn create(
        layout: &InstallLayout,
        meta: BackupMeta,
        privilege: &dyn Privilege,
    ) -> Result<Self> {
        let base = format!(
            "{}_{}",
            meta.created_at.format("%Y%m%dT%H%M%S%.3fZ"),
            meta.version
                .as_ref()
                .map(Version::to_string)
                .unwrap_or_else(|| "unknown".to_string())
        );

        let backups = layout.backups_dir();
        let mut dir = backups.join(&base);
        let mut n = 1;
        while dir.exists() {
            dir = backups.join(format!("{base}-{n}"));
            n += 1;
        }
        perform(privilege, FileOp::CreateDir { path: dir.clone() })?;

        let backup = Self { dir, meta };
        let json = serde_json::to_string_pretty(&backup.meta)?;
        perform(
            privilege,
            FileOp::Write {
                path: backup.dir.join(BACKUP_META),
                data: json.into_bytes(),
            },
        )?;
        Ok(backup)
    }

    pub fn tree(&self) -> PathBuf {
        self.dir.join(BACKUP_TREE)
    }

    pub fn registry_file(&self) -> PathBuf {
        self.dir.join(REGISTRY_FILE)
    }

    fn open(dir: &Path) -> Result<Self> {
        let path = dir.join(BACKUP_META);
        let content = fs::read_to_string(&path).at(&path)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            meta: serde_json::from_str(&content)?,
        })
    }

    /// Every readable backup dir, complete or not
    fn scan(layout: &InstallLayout) -> Result<Vec<Self>> {
        let backups_dir = layout.backups_dir();
        let entries = match fs::read_dir(&backups_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(HatchError::io(&backups_dir, e)),
        };

        let mut backups = Vec::new();
        for entry in entries.filter_map(|e| e.ok()) {
            let dir = entry.path();
            if !dir.is_dir() {
                continue;
            }
            match Self::open(&dir) {
                Ok(backup) => backups.push(backup),
                Err(e) => warn!("Ignoring unreadable backup {}: {}", dir.display(), e),
            }
        }
        Ok(backups)
    }

    /// Complete backups, newest first
    pub fn list(layout: &InstallLayout) -> Result<Vec<Self>> {
        let mut backups: Vec<Self> = Self::scan(layout)?
            .into_iter()
            .filter(|backup| {
                let complete = backup.tree().is_dir();
                if !complete {
                    debug!("Ignoring incomplete backup {}", backup.dir.display());
                }
                complete
            })
            .collect();

        backups.sort_by(|a, b| {
            b.meta
                .created_at
                .cmp(&a.meta.created_at)
                .then_with(|| b.dir.cmp(&a.dir))
        });
        Ok(backups)
    }

    /// Backup written by transaction `txn`, even if its tree never arrived
    pub(crate) fn for_txn(layout: &InstallLayout, txn: Uuid) -> Result<Option<Self>> {
        Ok(Self::scan(layout)?
            .into_iter()
            .find(|backup| backup.meta.txn == txn))
    }

    /// Newest backup, or newest with `version`
    pub fn find(layout: &InstallLayout, version: Option<&Version>) -> Result<Self> {
        Self::list(layout)?
            .into_iter()
            .find(|b| version.map_or(true, |v| b.meta.version.as_ref() == Some(v)))
            .ok_or_else(|| HatchError::NoBackupAvailable {
                version: version.cloned(),
            })
    }

    /// Remove all but the newest `keep` backups. A backup that cannot be
    /// removed is reported and kept. Returns removed dirs.
    pub fn prune(
        layout: &InstallLayout,
        keep: usize,
        privilege: &dyn Privilege,
    ) -> Result<Vec<PathBuf>> {
        let mut removed = Vec::new();
        for backup in Self::list(layout)?.into_iter().skip(keep) {
            let op = FileOp::Remove {
                path: backup.dir.clone(),
            };
            match privilege.perform(&op) {
                Ok(()) => {
                    info!("Pruned backup {}", backup.dir.display());
                    removed.push(backup.dir);
                }
                Err(e) => warn!("Failed to prune {}: {:#}", backup.dir.display(), e),
            }
        }
        Ok(removed)
    }
}

fn perform(privilege: &dyn Privilege, op: FileOp) -> Result<()> {
    privilege.perform(&op).map_err(|e| {
        HatchError::io(
            op_path(&op),
            std::io::Error::new(std::io::ErrorKind::Other, format!("{e:#}")),
        )
    })
}

fn op_path(op: &FileOp) -> PathBuf {
    match op {
        FileOp::CreateDir { path } | FileOp::Write { path, .. } | FileOp::Remove { path } => {
            path.clone()
        }
        FileOp::Copy { to, .. } | FileOp::Move { to, .. } => to.clone(),
    }
}
