//! Update engine
//!
//! Drives one transaction through `Pending -> Staged -> Verified ->
//! Applied`. Every failure before apply discards staging and leaves the
//! live tree untouched. A failed apply is reversed automatically; if the
//! reversal fails too the installation is marked inconsistent.

use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use semver::Version;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::HatchConfig;
use crate::error::{HatchError, Result};
use crate::fsutil;
use crate::host::{FileOp, Privilege, ServiceControl, ServiceStatus, TimedOut, VersionSource};
use crate::module::{ModuleLoader, ModuleRegistry, SearchPath};
use crate::ops_log::OpsLog;
use crate::paths::{InstallLayout, MODULES_DIR};
use crate::release::ReleaseManifest;
use crate::updater::backup::{Backup, BackupMeta};
use crate::updater::lock::UpdateLock;
use crate::updater::recovery::Recovery;
use crate::updater::rollback::{RollbackController, RollbackOutcome};
use crate::updater::transaction::{TxnStatus, UpdateScope, UpdateTransaction};
use crate::updater::{mark_inconsistent, rebuild_registry};

/// Result of comparing the live version with the source
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateCheck {
    UpToDate { current: Version },
    UpdateAvailable {
        current: Option<Version>,
        latest: Version,
    },
    CheckFailed(String),
}

pub struct UpdateEngine<'a> {
    layout: InstallLayout,
    config: HatchConfig,
    scope: UpdateScope,
    source: &'a dyn VersionSource,
    service: &'a dyn ServiceControl,
    privilege: &'a dyn Privilege,
    fetch_timeout: Duration,
    ops_log: OpsLog,
}

impl<'a> UpdateEngine<'a> {
    pub fn new(
        layout: InstallLayout,
        config: HatchConfig,
        source: &'a dyn VersionSource,
        service: &'a dyn ServiceControl,
        privilege: &'a dyn Privilege,
    ) -> Self {
        let fetch_timeout = config.update.fetch_timeout();
        let ops_log = OpsLog::open(layout.ops_log());
        Self {
            layout,
            config,
            scope: UpdateScope::Application,
            source,
            service,
            privilege,
            fetch_timeout,
            ops_log,
        }
    }

    pub fn with_scope(mut self, scope: UpdateScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn layout(&self) -> &InstallLayout {
        &self.layout
    }

    pub fn scope(&self) -> UpdateScope {
        self.scope
    }

    /// Version marker of the live tree
    pub fn current_version(&self) -> Option<Version> {
        ReleaseManifest::read_version(&self.layout.live_dir())
    }

    pub fn check_update(&self) -> UpdateCheck {
        let current = self.current_version();
        match self.source.latest() {
            Ok(latest) => match current {
                Some(current) if current >= latest => UpdateCheck::UpToDate { current },
                current => UpdateCheck::UpdateAvailable { current, latest },
            },
            Err(e) => {
                debug!("Update check failed: {:#}", e);
                UpdateCheck::CheckFailed(format!("{e:#}"))
            }
        }
    }

    /// Take the lock and open a transaction for `target`, or for the
    /// newest version the source offers.
    pub fn begin_update(&self, target: Option<Version>) -> Result<UpdateTransaction> {
        let marker = self.layout.inconsistent_marker();
        if marker.exists() {
            return Err(HatchError::InconsistentInstallation(format!(
                "{} present",
                marker.display()
            )));
        }

        let id = Uuid::new_v4();
        let lock = UpdateLock::acquire(&self.layout, &id.to_string(), "pending")?;
        if let Some(stale) = lock.recovered().cloned() {
            let recovery = Recovery::new(&self.layout, &self.config.modules, self.privilege);
            if let Err(e) = recovery.recover(&stale) {
                lock.release();
                return Err(e);
            }
        }

        let candidate = match target {
            Some(version) => version,
            None => match self.source.latest() {
                Ok(version) => version,
                Err(e) => {
                    lock.release();
                    return Err(HatchError::CheckFailed(format!("{e:#}")));
                }
            },
        };

        let current = self.current_version();
        info!("Transaction {}: {} -> {}", id, version_label(current.as_ref()), candidate);
        self.ops_log.log(
            "updater",
            "begin",
            Some(&format!(
                "txn={} {}->{}",
                id,
                version_label(current.as_ref()),
                candidate
            )),
        );

        Ok(UpdateTransaction {
            id,
            scope: self.scope,
            current_version: current,
            candidate_version: candidate,
            staging_path: self.layout.staging_dir(&id.to_string()),
            backup_path: None,
            status: TxnStatus::Pending,
            lock: Some(lock),
        })
    }

    /// Fetch the candidate into `R/staging/<txn>/`
    pub fn stage(&self, txn: &mut UpdateTransaction) -> Result<()> {
        expect(txn, &[TxnStatus::Pending], "stage")?;
        txn.step("stage");

        if let Err(e) = self.fetch_into(txn) {
            self.discard(txn, "stage_failed", &e.to_string());
            return Err(e);
        }

        txn.status = TxnStatus::Staged;
        info!("Staged {} in {}", txn.candidate_version, txn.staging_path.display());
        self.ops_log
            .log("updater", "staged", Some(&format!("txn={}", txn.id)));
        Ok(())
    }

    fn fetch_into(&self, txn: &UpdateTransaction) -> Result<()> {
        let staging_root = self.layout.staging_root();
        if !staging_root.is_dir() {
            self.privilege
                .perform(&FileOp::CreateDir {
                    path: staging_root.clone(),
                })
                .map_err(|e| HatchError::StageFailed {
                    txn: txn.id,
                    version: txn.candidate_version.clone(),
                    reason: format!("{e:#}"),
                })?;
        }
        fsutil::remove_tree(&txn.staging_path)?;

        self.source
            .fetch(&txn.candidate_version, &txn.staging_path, self.fetch_timeout)
            .map_err(|e| {
                if e.downcast_ref::<TimedOut>().is_some() {
                    HatchError::Timeout {
                        operation: format!("fetching {}", txn.candidate_version),
                        secs: self.fetch_timeout.as_secs(),
                    }
                } else {
                    HatchError::StageFailed {
                        txn: txn.id,
                        version: txn.candidate_version.clone(),
                        reason: format!("{e:#}"),
                    }
                }
            })?;

        if !txn.staging_path.is_dir() {
            return Err(HatchError::StageFailed {
                txn: txn.id,
                version: txn.candidate_version.clone(),
                reason: "source produced no tree".to_string(),
            });
        }
        Ok(())
    }

    /// Check the staged tree's integrity and module graph
    pub fn verify(&self, txn: &mut UpdateTransaction) -> Result<()> {
        expect(txn, &[TxnStatus::Staged], "verify")?;
        txn.step("verify");

        if let Err(reason) = self.check_staged(txn) {
            self.discard(txn, "verify_failed", &reason);
            return Err(HatchError::VerifyFailed {
                txn: txn.id,
                version: txn.candidate_version.clone(),
                reason,
            });
        }

        txn.status = TxnStatus::Verified;
        info!("Verified {}", txn.candidate_version);
        self.ops_log
            .log("updater", "verified", Some(&format!("txn={}", txn.id)));
        Ok(())
    }

    fn check_staged(&self, txn: &UpdateTransaction) -> std::result::Result<(), String> {
        let tree = &txn.staging_path;
        let manifest = ReleaseManifest::load(tree).map_err(|e| e.to_string())?;
        if manifest.version != txn.candidate_version {
            return Err(format!(
                "release manifest declares {}, expected {}",
                manifest.version, txn.candidate_version
            ));
        }
        manifest.check_tree(tree, self.probes_executables())?;

        // The staged tree takes the place of the project scope
        let project = tree.join(MODULES_DIR);
        let discovery =
            ModuleLoader::discover(&SearchPath::standard(&project, &self.config.modules))
                .map_err(|e| e.to_string())?;
        if let Some((dir, reason)) = discovery
            .rejected
            .iter()
            .find(|(dir, _)| dir.starts_with(&project))
        {
            return Err(format!("module in {}: {}", dir.display(), reason));
        }

        let names: Vec<String> = discovery.modules.iter().map(|d| d.name.clone()).collect();
        let mut registry = ModuleRegistry::new();
        for descriptor in discovery.modules {
            registry.register(descriptor).map_err(|e| e.to_string())?;
        }
        let order = registry
            .resolve_load_order(&names)
            .map_err(|e| e.to_string())?;
        debug!("Staged module order: {:?}", order);
        Ok(())
    }

    fn probes_executables(&self) -> bool {
        self.scope == UpdateScope::SelfUpdate
    }

    /// Swap the staged tree in. The displaced live tree becomes a backup.
    pub fn apply(&self, txn: &mut UpdateTransaction) -> Result<()> {
        expect(txn, &[TxnStatus::Verified], "apply")?;
        txn.step("apply");
        let live = self.layout.live_dir();

        let backup = if live.exists() {
            let backup = match self.prepare_backup(txn, &live) {
                Ok(backup) => backup,
                Err(e) => return Err(self.revert(txn, None, false, e.to_string())),
            };
            if let Err(reason) = self.move_tree(&live, &backup.tree()) {
                return Err(self.revert(txn, Some(&backup), false, reason));
            }
            txn.backup_path = Some(backup.dir.clone());
            Some(backup)
        } else {
            info!("No live tree, first install");
            None
        };

        if let Err(reason) = self.move_tree(&txn.staging_path, &live) {
            return Err(self.revert(txn, backup.as_ref(), false, reason));
        }

        if self.probes_executables() {
            let probe = ReleaseManifest::load(&live)
                .map_err(|e| e.to_string())
                .and_then(|manifest| manifest.check_tree(&live, true));
            if let Err(reason) = probe {
                return Err(self.revert(txn, backup.as_ref(), true, reason));
            }
        }

        self.finish_apply(txn);
        Ok(())
    }

    fn prepare_backup(&self, txn: &UpdateTransaction, live: &Path) -> Result<Backup> {
        let backup = Backup::create(
            &self.layout,
            BackupMeta {
                version: txn.current_version.clone(),
                created_at: Utc::now(),
                txn: txn.id,
                tree_digest: fsutil::tree_digest(live)?,
            },
            self.privilege,
        )?;

        let registry = self.layout.registry_file();
        if registry.exists() {
            self.privilege
                .perform(&FileOp::Copy {
                    from: registry,
                    to: backup.registry_file(),
                })
                .map_err(|e| {
                    HatchError::io(
                        backup.registry_file(),
                        std::io::Error::new(std::io::ErrorKind::Other, format!("{e:#}")),
                    )
                })?;
        }
        Ok(backup)
    }

    fn move_tree(&self, from: &Path, to: &Path) -> std::result::Result<(), String> {
        self.privilege
            .perform(&FileOp::Move {
                from: from.to_path_buf(),
                to: to.to_path_buf(),
            })
            .map_err(|e| format!("{e:#}"))
    }

    /// Undo a partial apply. `installed` means the staged tree already sits
    /// in the live slot.
    fn revert(
        &self,
        txn: &mut UpdateTransaction,
        backup: Option<&Backup>,
        installed: bool,
        reason: String,
    ) -> HatchError {
        warn!("Apply of {} failed: {}; reverting", txn.candidate_version, reason);
        let live = self.layout.live_dir();

        let mut reverted = Ok(());
        if installed {
            reverted = self.move_tree(&live, &txn.staging_path);
        }
        if reverted.is_ok() {
            if let Some(backup) = backup.filter(|b| b.tree().exists()) {
                reverted = self.move_tree(&backup.tree(), &live);
            }
        }

        match reverted {
            Ok(()) => {
                if let Some(backup) = backup {
                    if let Err(e) = fsutil::remove_tree(&backup.dir) {
                        warn!("Failed to remove {}: {}", backup.dir.display(), e);
                    }
                }
                txn.backup_path = None;
                if let Err(e) = fsutil::remove_tree(&txn.staging_path) {
                    warn!("Failed to discard staging: {}", e);
                }
                self.ops_log.log(
                    "updater",
                    "apply_reverted",
                    Some(&format!("txn={} {}", txn.id, reason)),
                );
                txn.finish(TxnStatus::RolledBack);
                HatchError::ApplyFailed {
                    txn: txn.id,
                    version: txn.candidate_version.clone(),
                    reason,
                }
            }
            Err(revert_reason) => {
                let detail = format!(
                    "transaction {}: apply of {} failed ({}) and reversal failed ({})",
                    txn.id, txn.candidate_version, reason, revert_reason
                );
                mark_inconsistent(&self.layout, &detail);
                self.ops_log.log("updater", "inconsistent", Some(&detail));
                // Staging and backup stay where they are for manual recovery
                txn.finish(TxnStatus::Failed);
                HatchError::InconsistentInstallation(detail)
            }
        }
    }

    fn finish_apply(&self, txn: &mut UpdateTransaction) {
        // From here on the new tree stays, even if this process dies
        txn.step("commit");
        if let Err(e) = rebuild_registry(&self.layout, &self.config.modules) {
            warn!("Failed to rebuild registry: {}", e);
            self.ops_log
                .log("updater", "registry_rebuild_failed", Some(&e.to_string()));
        }
        if let Err(e) = fsutil::remove_tree(&txn.staging_path) {
            warn!("Failed to remove staging: {}", e);
        }

        restart_if_running(self.service, &self.ops_log);

        // The backup this apply just took is never pruned
        let keep = self.config.update.backup_retention.max(1);
        match Backup::prune(&self.layout, keep, self.privilege) {
            Ok(removed) if !removed.is_empty() => {
                debug!("Pruned {} backups", removed.len());
            }
            Ok(_) => {}
            Err(e) => warn!("Failed to prune backups: {}", e),
        }

        info!(
            "Applied {} -> {}",
            version_label(txn.current_version.as_ref()),
            txn.candidate_version
        );
        self.ops_log.log(
            "updater",
            "applied",
            Some(&format!(
                "{}->{} txn={}",
                version_label(txn.current_version.as_ref()),
                txn.candidate_version,
                txn.id
            )),
        );
        txn.finish(TxnStatus::Applied);
    }

    /// Cancel a transaction that has not reached apply
    pub fn abort(&self, txn: &mut UpdateTransaction) -> Result<()> {
        expect(
            txn,
            &[TxnStatus::Pending, TxnStatus::Staged, TxnStatus::Verified],
            "abort",
        )?;
        info!("Aborting transaction {}", txn.id);
        self.discard(txn, "aborted", "cancelled");
        Ok(())
    }

    /// Drop staging and fail the transaction, releasing the lock
    fn discard(&self, txn: &mut UpdateTransaction, event: &str, reason: &str) {
        if let Err(e) = fsutil::remove_tree(&txn.staging_path) {
            warn!("Failed to discard staging: {}", e);
        }
        self.ops_log
            .log("updater", event, Some(&format!("txn={} {}", txn.id, reason)));
        txn.finish(TxnStatus::Failed);
    }

    /// Restore a retained backup of this installation
    pub fn rollback(&self, to_version: Option<&Version>) -> Result<RollbackOutcome> {
        RollbackController::new(
            self.layout.clone(),
            self.config.modules.clone(),
            self.service,
            self.privilege,
        )
        .rollback(to_version)
    }

    /// begin, stage, verify and apply in one go
    pub fn run(&self, target: Option<Version>) -> Result<UpdateTransaction> {
        let mut txn = self.begin_update(target)?;
        self.stage(&mut txn)?;
        self.verify(&mut txn)?;
        self.apply(&mut txn)?;
        Ok(txn)
    }
}

fn expect(txn: &UpdateTransaction, allowed: &[TxnStatus], action: &'static str) -> Result<()> {
    if allowed.contains(&txn.status) {
        Ok(())
    } else {
        Err(HatchError::InvalidTransition {
            txn: txn.id,
            action,
            status: txn.status.to_string(),
        })
    }
}

pub(crate) fn restart_if_running(service: &dyn ServiceControl, ops_log: &OpsLog) {
    match service.status() {
        ServiceStatus::Running => match service.restart() {
            Ok(()) => {
                info!("Service restarted");
                ops_log.log("updater", "service_restarted", None);
            }
            Err(e) => {
                warn!("Service restart failed: {:#}", e);
                ops_log.log("updater", "service_restart_failed", Some(&format!("{e:#}")));
            }
        },
        status => debug!("Service {}, not restarting", status),
    }
}

pub(crate) fn version_label(version: Option<&Version>) -> String {
    version
        .map(Version::to_string)
        .unwrap_or_else(|| "none".to_string())
}
