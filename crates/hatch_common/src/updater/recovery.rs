//! Recovery after a lock owner died mid-transaction
//!
//! The recovered lock names the transaction and the step it was in:
//! - `apply`: the swap never committed, the displaced live tree goes back
//! - `commit`: the new tree is fully in place, only bookkeeping is redone
//! - `restore`: a rollback swap is finished or undone
//! - anything earlier: the live tree was never touched, staging is dropped
//!
//! If the prior tree cannot be put back the installation is marked
//! inconsistent.

use std::fs;
use std::path::Path;

use tracing::info;
use uuid::Uuid;

use crate::config::ModulesConfig;
use crate::error::{HatchError, IoContext, Result};
use crate::fsutil::atomic_write;
use crate::host::{FileOp, Privilege};
use crate::module::RegistrySnapshot;
use crate::ops_log::OpsLog;
use crate::paths::InstallLayout;
use crate::updater::backup::Backup;
use crate::updater::lock::LockInfo;
use crate::updater::rollback::{displaced_dir, restore_dir};
use crate::updater::{mark_inconsistent, rebuild_registry};

pub(crate) struct Recovery<'a> {
    layout: &'a InstallLayout,
    modules: &'a ModulesConfig,
    privilege: &'a dyn Privilege,
    ops_log: OpsLog,
}

impl<'a> Recovery<'a> {
    pub(crate) fn new(
        layout: &'a InstallLayout,
        modules: &'a ModulesConfig,
        privilege: &'a dyn Privilege,
    ) -> Self {
        Self {
            layout,
            modules,
            privilege,
            ops_log: OpsLog::open(layout.ops_log()),
        }
    }

    /// Bring the installation back to a whole tree after `stale` was
    /// abandoned by its owner
    pub(crate) fn recover(&self, stale: &LockInfo) -> Result<()> {
        info!("Recovering transaction {} interrupted in {}", stale.txn, stale.step);
        self.ops_log.log(
            "updater",
            "recover",
            Some(&format!("txn={} step={}", stale.txn, stale.step)),
        );

        let result = match stale.step.as_str() {
            "apply" => self.recover_apply(&stale.txn),
            "commit" => self.recover_commit(&stale.txn),
            "restore" => self.recover_restore(&stale.txn),
            _ => self.drop_staging(&stale.txn),
        };

        if let Err(reason) = result {
            let detail = format!(
                "transaction {} interrupted in {} and could not be recovered ({})",
                stale.txn, stale.step, reason
            );
            mark_inconsistent(self.layout, &detail);
            self.ops_log.log("updater", "inconsistent", Some(&detail));
            return Err(HatchError::InconsistentInstallation(detail));
        }
        Ok(())
    }

    fn recover_apply(&self, txn: &str) -> std::result::Result<(), String> {
        let live = self.layout.live_dir();
        let staging = self.layout.staging_dir(txn);
        let backup = match Uuid::parse_str(txn) {
            Ok(id) => Backup::for_txn(self.layout, id).map_err(|e| e.to_string())?,
            Err(_) => None,
        };

        match backup {
            Some(backup) if backup.tree().is_dir() => {
                if live.exists() {
                    // The candidate made it into place; set it aside again
                    self.remove(&staging)?;
                    self.rename(&live, &staging)?;
                }
                self.rename(&backup.tree(), &live)?;
                self.restore_registry(&backup)?;
                self.remove(&backup.dir)?;
                info!("Put back {}", version_text(&backup));
            }
            Some(backup) => {
                if !live.exists() {
                    return Err(format!(
                        "live tree missing and backup {} holds no tree",
                        backup.dir.display()
                    ));
                }
                self.remove(&backup.dir)?;
            }
            None if live.exists() => {
                // Staging gone means a first install finished its move
                if !staging.exists() {
                    rebuild_registry(self.layout, self.modules).map_err(|e| e.to_string())?;
                }
            }
            None if self.had_install() => {
                return Err("live tree missing and no backup from this transaction".to_string());
            }
            // First install that never reached the live slot
            None => {}
        }

        self.remove(&staging)?;
        self.ops_log
            .log("updater", "apply_recovered", Some(&format!("txn={txn}")));
        Ok(())
    }

    fn recover_commit(&self, txn: &str) -> std::result::Result<(), String> {
        rebuild_registry(self.layout, self.modules).map_err(|e| e.to_string())?;
        self.drop_staging(txn)
    }

    fn recover_restore(&self, txn: &str) -> std::result::Result<(), String> {
        let live = self.layout.live_dir();
        let displaced = displaced_dir(self.layout, txn);

        if displaced.exists() {
            if live.exists() {
                // Swap finished; the registry may still describe the old tree
                self.remove(&displaced)?;
                rebuild_registry(self.layout, self.modules).map_err(|e| e.to_string())?;
            } else {
                self.rename(&displaced, &live)?;
            }
        }
        self.remove(&restore_dir(self.layout, txn))?;
        self.ops_log
            .log("updater", "restore_recovered", Some(&format!("txn={txn}")));
        Ok(())
    }

    /// Whether the registry records an installed tree
    fn had_install(&self) -> bool {
        RegistrySnapshot::load(&self.layout.registry_file())
            .ok()
            .flatten()
            .and_then(|snapshot| snapshot.install_version)
            .is_some()
    }

    fn drop_staging(&self, txn: &str) -> std::result::Result<(), String> {
        self.remove(&self.layout.staging_dir(txn))
    }

    fn restore_registry(&self, backup: &Backup) -> std::result::Result<(), String> {
        let saved = backup.registry_file();
        if saved.exists() {
            let bytes = fs::read(&saved).at(&saved).map_err(|e| e.to_string())?;
            atomic_write(&self.layout.registry_file(), &bytes).map_err(|e| e.to_string())
        } else {
            rebuild_registry(self.layout, self.modules).map_err(|e| e.to_string())
        }
    }

    fn rename(&self, from: &Path, to: &Path) -> std::result::Result<(), String> {
        self.privilege
            .perform(&FileOp::Move {
                from: from.to_path_buf(),
                to: to.to_path_buf(),
            })
            .map_err(|e| format!("{e:#}"))
    }

    fn remove(&self, path: &Path) -> std::result::Result<(), String> {
        if !path.exists() {
            return Ok(());
        }
        self.privilege
            .perform(&FileOp::Remove {
                path: path.to_path_buf(),
            })
            .map_err(|e| format!("{e:#}"))
    }
}

fn version_text(backup: &Backup) -> String {
    backup
        .meta
        .version
        .as_ref()
        .map(|v| v.to_string())
        .unwrap_or_else(|| "unversioned tree".to_string())
}
