//! Installation status report

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::host::{ServiceControl, ServiceStatus};
use crate::module::RegistrySnapshot;
use crate::paths::InstallLayout;
use crate::release::ReleaseManifest;
use crate::updater::{Backup, LockInfo, UpdateLock};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleStatus {
    pub name: String,
    pub version: Version,
    pub loaded: bool,
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupStatus {
    pub version: Option<Version>,
    pub created_at: DateTime<Utc>,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub root: PathBuf,
    /// Version marker of the live tree
    pub version: Option<Version>,
    pub inconsistent: bool,
    /// Holder of the update lock, if a transaction is running
    pub lock: Option<LockInfo>,
    /// The lock holder died mid-transaction; the next update or rollback
    /// repairs the tree
    #[serde(default)]
    pub interrupted: bool,
    pub modules: Vec<ModuleStatus>,
    /// Load order recorded by the last process
    pub loaded: Vec<String>,
    pub backups: Vec<BackupStatus>,
    pub service: ServiceStatus,
}

impl StatusReport {
    /// Collect status from persisted state only; nothing is loaded
    pub fn collect(layout: &InstallLayout, service: &dyn ServiceControl) -> Result<Self> {
        let snapshot = RegistrySnapshot::load(&layout.registry_file())?;
        let (modules, loaded) = match snapshot {
            Some(snapshot) => {
                let modules = snapshot
                    .modules
                    .iter()
                    .map(|record| ModuleStatus {
                        name: record.name.clone(),
                        version: record.version.clone(),
                        loaded: snapshot.loaded.contains(&record.name),
                        capabilities: record.capabilities.clone(),
                    })
                    .collect();
                (modules, snapshot.loaded)
            }
            None => (Vec::new(), Vec::new()),
        };

        let backups = Backup::list(layout)?
            .into_iter()
            .map(|b| BackupStatus {
                version: b.meta.version,
                created_at: b.meta.created_at,
                path: b.dir,
            })
            .collect();

        let lock = UpdateLock::holder(layout);
        Ok(Self {
            root: layout.root().to_path_buf(),
            version: ReleaseManifest::read_version(&layout.live_dir()),
            inconsistent: layout.inconsistent_marker().exists(),
            interrupted: lock.as_ref().is_some_and(|l| !l.owner_alive()),
            lock,
            modules,
            loaded,
            backups,
            service: service.status(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::NoService;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_empty_installation() {
        let temp = TempDir::new().unwrap();
        let layout = InstallLayout::new(temp.path());
        let report = StatusReport::collect(&layout, &NoService).unwrap();
        assert!(report.version.is_none());
        assert!(!report.inconsistent);
        assert!(report.lock.is_none());
        assert!(report.modules.is_empty());
        assert_eq!(report.service, ServiceStatus::Stopped);
    }

    #[test]
    fn test_reports_version_and_marker() {
        let temp = TempDir::new().unwrap();
        let layout = InstallLayout::new(temp.path());
        fs::create_dir_all(layout.live_dir()).unwrap();
        fs::write(layout.release_manifest(), "version = \"1.2.0\"\n").unwrap();
        fs::write(layout.inconsistent_marker(), "x").unwrap();

        let report = StatusReport::collect(&layout, &NoService).unwrap();
        assert_eq!(report.version, Some(Version::new(1, 2, 0)));
        assert!(report.inconsistent);
    }
}
