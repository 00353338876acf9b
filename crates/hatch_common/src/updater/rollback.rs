//! Manual rollback to a retained backup
//!
//! The backup is copied next to the live tree first and swapped in with a
//! rename, so the live slot is never half-written. The backup itself is
//! kept.

use std::fs;
use std::path::{Path, PathBuf};

use semver::Version;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::ModulesConfig;
use crate::error::{HatchError, IoContext, Result};
use crate::fsutil::{self, atomic_write};
use crate::host::{FileOp, Privilege, ServiceControl};
use crate::ops_log::OpsLog;
use crate::paths::InstallLayout;
use crate::release::ReleaseManifest;
use crate::updater::backup::Backup;
use crate::updater::engine::{restart_if_running, version_label};
use crate::updater::lock::UpdateLock;
use crate::updater::recovery::Recovery;
use crate::updater::{mark_inconsistent, rebuild_registry};

#[derive(Debug, Clone)]
pub struct RollbackOutcome {
    /// Version of the restored tree
    pub restored: Option<Version>,
    /// Version that was live before the rollback
    pub previous: Option<Version>,
    pub backup: PathBuf,
}

pub struct RollbackController<'a> {
    layout: InstallLayout,
    modules: ModulesConfig,
    service: &'a dyn ServiceControl,
    privilege: &'a dyn Privilege,
    ops_log: OpsLog,
}

impl<'a> RollbackController<'a> {
    pub fn new(
        layout: InstallLayout,
        modules: ModulesConfig,
        service: &'a dyn ServiceControl,
        privilege: &'a dyn Privilege,
    ) -> Self {
        let ops_log = OpsLog::open(layout.ops_log());
        Self {
            layout,
            modules,
            service,
            privilege,
            ops_log,
        }
    }

    /// Restore the newest backup, or the newest one of `to_version`
    pub fn rollback(&self, to_version: Option<&Version>) -> Result<RollbackOutcome> {
        let txn = Uuid::new_v4();
        let mut lock = UpdateLock::acquire(&self.layout, &txn.to_string(), "rollback")?;
        if let Some(stale) = lock.recovered().cloned() {
            let recovery = Recovery::new(&self.layout, &self.modules, self.privilege);
            // A failed recovery leaves the marker; restoring a backup clears it
            if let Err(e) = recovery.recover(&stale) {
                warn!("{}", e);
            }
        }

        let backup = Backup::find(&self.layout, to_version)?;
        let digest = fsutil::tree_digest(&backup.tree())?;
        if digest != backup.meta.tree_digest {
            return Err(HatchError::CorruptBackup {
                path: backup.dir.clone(),
                reason: "tree digest does not match backup record".to_string(),
            });
        }

        let live = self.layout.live_dir();
        let previous = ReleaseManifest::read_version(&live);
        info!(
            "Rolling back {} -> {}",
            version_label(previous.as_ref()),
            version_label(backup.meta.version.as_ref())
        );
        lock.update_step("restore")?;

        self.swap_in(&backup, &live, txn)?;
        lock.update_step("commit")?;
        self.restore_registry(&backup)?;

        let restored_digest = fsutil::tree_digest(&live)?;
        if restored_digest != backup.meta.tree_digest {
            let detail = format!(
                "restored tree from {} does not match its digest",
                backup.dir.display()
            );
            mark_inconsistent(&self.layout, &detail);
            return Err(HatchError::InconsistentInstallation(detail));
        }

        match fs::remove_file(self.layout.inconsistent_marker()) {
            Ok(()) => info!("Cleared inconsistency marker"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(HatchError::io(self.layout.inconsistent_marker(), e)),
        }

        restart_if_running(self.service, &self.ops_log);

        self.ops_log.log(
            "updater",
            "rolled_back",
            Some(&format!(
                "{}->{} from={}",
                version_label(previous.as_ref()),
                version_label(backup.meta.version.as_ref()),
                backup.dir.display()
            )),
        );
        lock.release();

        Ok(RollbackOutcome {
            restored: backup.meta.version.clone(),
            previous,
            backup: backup.dir,
        })
    }

    /// Copy the backup beside the live tree, then rename it into place
    fn swap_in(&self, backup: &Backup, live: &Path, txn: Uuid) -> Result<()> {
        let restore = restore_dir(&self.layout, &txn.to_string());
        let displaced = displaced_dir(&self.layout, &txn.to_string());
        fsutil::remove_tree(&restore)?;

        self.perform(FileOp::Copy {
            from: backup.tree(),
            to: restore.clone(),
        })?;

        let had_live = live.exists();
        if had_live {
            if let Err(e) = self.perform(FileOp::Move {
                from: live.to_path_buf(),
                to: displaced.clone(),
            }) {
                self.discard(&restore);
                return Err(e);
            }
        }

        if let Err(e) = self.perform(FileOp::Move {
            from: restore.clone(),
            to: live.to_path_buf(),
        }) {
            if had_live {
                if let Err(back) = self.perform(FileOp::Move {
                    from: displaced.clone(),
                    to: live.to_path_buf(),
                }) {
                    let detail = format!(
                        "rollback swap failed ({e}) and live tree could not be put back ({back})"
                    );
                    mark_inconsistent(&self.layout, &detail);
                    return Err(HatchError::InconsistentInstallation(detail));
                }
            }
            self.discard(&restore);
            return Err(e);
        }

        if had_live {
            self.discard(&displaced);
        }
        Ok(())
    }

    fn restore_registry(&self, backup: &Backup) -> Result<()> {
        let saved = backup.registry_file();
        if saved.exists() {
            let bytes = fs::read(&saved).at(&saved)?;
            atomic_write(&self.layout.registry_file(), &bytes)
        } else {
            rebuild_registry(&self.layout, &self.modules)
        }
    }

    fn perform(&self, op: FileOp) -> Result<()> {
        self.privilege
            .perform(&op)
            .map_err(|e| HatchError::RollbackFailed(format!("{e:#}")))
    }

    fn discard(&self, path: &Path) {
        if let Err(e) = self.perform(FileOp::Remove {
            path: path.to_path_buf(),
        }) {
            warn!("Failed to remove {}: {}", path.display(), e);
        }
    }
}

/// Copy of the backup tree waiting to be renamed into place
pub(crate) fn restore_dir(layout: &InstallLayout, txn: &str) -> PathBuf {
    layout.backups_dir().join(format!(".restore-{txn}"))
}

/// Where the live tree sits while a rollback swaps
pub(crate) fn displaced_dir(layout: &InstallLayout, txn: &str) -> PathBuf {
    layout.root().join(format!(".displaced-{txn}"))
}
