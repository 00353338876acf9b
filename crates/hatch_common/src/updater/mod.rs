//! Atomic update and rollback of an installation tree
//!
//! Flow: begin (lock) -> stage -> verify -> apply -> commit, with automatic
//! reversal when apply fails, recovery of transactions whose process died,
//! and manual rollback from retained backups.

pub mod backup;
pub mod engine;
pub mod lock;
mod recovery;
pub mod rollback;
pub mod transaction;

pub use backup::{Backup, BackupMeta};
pub use engine::{UpdateCheck, UpdateEngine};
pub use lock::{LockInfo, UpdateLock};
pub use rollback::{RollbackController, RollbackOutcome};
pub use transaction::{TxnStatus, UpdateScope, UpdateTransaction};

use chrono::Utc;
use tracing::error;

use crate::config::ModulesConfig;
use crate::error::Result;
use crate::fsutil::atomic_write;
use crate::module::{ModuleLoader, ModuleRegistry, SearchPath};
use crate::paths::InstallLayout;
use crate::release::ReleaseManifest;

/// Rewrite `R/registry.state` from the modules of the live tree, nothing
/// loaded
pub(crate) fn rebuild_registry(layout: &InstallLayout, modules: &ModulesConfig) -> Result<()> {
    let discovery =
        ModuleLoader::discover(&SearchPath::standard(layout.live_modules_dir(), modules))?;
    let mut registry = ModuleRegistry::new();
    for descriptor in discovery.modules {
        registry.register(descriptor)?;
    }
    registry
        .snapshot(ReleaseManifest::read_version(&layout.live_dir()))
        .save(&layout.registry_file())
}

/// Flag the installation as needing manual rollback
pub(crate) fn mark_inconsistent(layout: &InstallLayout, reason: &str) {
    error!("Installation inconsistent: {}", reason);
    let content = format!("{} {}\n", Utc::now().to_rfc3339(), reason);
    if let Err(e) = atomic_write(&layout.inconsistent_marker(), content.as_bytes()) {
        error!("Failed to write inconsistency marker: {}", e);
    }
}
