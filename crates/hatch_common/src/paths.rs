//! Path helpers for a Hatch installation
//!
//! Every persisted file lives under one installation root `R`:
//!
//! ```text
//! R/hatch.toml        configuration
//! R/app/              live tree (release.toml at its root)
//! R/registry.state    module registry snapshot
//! R/update.lock       single-flight transaction lock
//! R/staging/<txn>/    candidate trees being staged
//! R/backups/<stamp>/  prior trees, newest N retained
//! R/INCONSISTENT      present only after a failed automatic reversal
//! R/ops.log           lifecycle audit trail
//! ```

use std::path::{Path, PathBuf};

/// Live tree directory name
pub const LIVE_DIR: &str = "app";

/// Registry snapshot file name
pub const REGISTRY_FILE: &str = "registry.state";

/// Lock file name
pub const LOCK_FILE: &str = "update.lock";

/// Configuration file name
pub const CONFIG_FILE: &str = "hatch.toml";

/// Release manifest file name at the root of every tree
pub const RELEASE_MANIFEST: &str = "release.toml";

/// Module directory inside a tree
pub const MODULES_DIR: &str = "modules";

/// Inconsistency marker file name
pub const INCONSISTENT_MARKER: &str = "INCONSISTENT";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallLayout {
    root: PathBuf,
}

impl InstallLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn live_dir(&self) -> PathBuf {
        self.root.join(LIVE_DIR)
    }

    pub fn live_modules_dir(&self) -> PathBuf {
        self.live_dir().join(MODULES_DIR)
    }

    pub fn release_manifest(&self) -> PathBuf {
        self.live_dir().join(RELEASE_MANIFEST)
    }

    pub fn registry_file(&self) -> PathBuf {
        self.root.join(REGISTRY_FILE)
    }

    pub fn lock_file(&self) -> PathBuf {
        self.root.join(LOCK_FILE)
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    pub fn staging_root(&self) -> PathBuf {
        self.root.join("staging")
    }

    pub fn staging_dir(&self, txn: &str) -> PathBuf {
        self.staging_root().join(txn)
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.root.join("backups")
    }

    pub fn inconsistent_marker(&self) -> PathBuf {
        self.root.join(INCONSISTENT_MARKER)
    }

    pub fn ops_log(&self) -> PathBuf {
        self.root.join("ops.log")
    }
}

/// Check if we're running as root
pub fn is_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

/// Default user-scope module directory ($XDG_DATA_HOME/hatch/modules)
pub fn default_user_modules_dir() -> Option<PathBuf> {
    dirs::data_dir().map(|d| d.join("hatch").join(MODULES_DIR))
}

/// Default system-scope module directory
pub fn default_system_modules_dir() -> PathBuf {
    PathBuf::from("/usr/share/hatch/modules")
}
