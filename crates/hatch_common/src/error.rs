//! Error types for Hatch.
//!
//! One enum covers every failure the lifecycle core can report. Variants
//! carry the module name, version or transaction id they concern so the
//! CLI boundary can log them once and map them to an exit code.

use std::path::PathBuf;

use semver::Version;
use thiserror::Error;
use uuid::Uuid;

pub type Result<T, E = HatchError> = std::result::Result<T, E>;

/// Exit code for success
pub const EXIT_SUCCESS: i32 = 0;

/// Exit code for general errors
pub const EXIT_GENERAL_ERROR: i32 = 1;

/// Exit code when another update or rollback holds the lock
pub const EXIT_UPDATE_IN_PROGRESS: i32 = 10;

/// Exit code when a dependency cycle is detected
pub const EXIT_CYCLIC_DEPENDENCY: i32 = 11;

/// Exit code when a module dependency is missing
pub const EXIT_MISSING_DEPENDENCY: i32 = 12;

/// Exit code when no backup exists to roll back to
pub const EXIT_NO_BACKUP: i32 = 13;

/// Exit code when the installation is flagged inconsistent
pub const EXIT_INCONSISTENT: i32 = 14;

#[derive(Error, Debug)]
pub enum HatchError {
    // Resolution
    #[error("dependency cycle: {}", .cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    #[error("module '{requester}' depends on '{missing}', which is not available")]
    MissingDependency { missing: String, requester: String },

    #[error("capability '{capability}' is claimed by several modules: {}", .modules.join(", "))]
    AmbiguousCapability {
        capability: String,
        modules: Vec<String>,
    },

    #[error("no module provides capability '{0}'")]
    UnknownCapability(String),

    #[error("unknown module '{0}'")]
    UnknownModule(String),

    #[error("module '{name}' already registered at version {existing} (attempted {attempted})")]
    DuplicateModule {
        name: String,
        existing: Version,
        attempted: Version,
    },

    // Lifecycle
    #[error("module '{module}' {version} failed verification: {reason}")]
    ModuleVerificationFailed {
        module: String,
        version: Version,
        reason: String,
    },

    #[error("module '{module}' {version} failed to initialize: {reason}")]
    ModuleInitFailed {
        module: String,
        version: Version,
        reason: String,
    },

    #[error("module '{module}' cleanup failed: {reason}")]
    ModuleCleanupFailed { module: String, reason: String },

    #[error("cannot unload '{module}': still required by {}", .dependents.join(", "))]
    DependentModulesActive {
        module: String,
        dependents: Vec<String>,
    },

    #[error("capability '{capability}' of module '{module}' failed: {reason}")]
    CapabilityFailed {
        capability: String,
        module: String,
        reason: String,
    },

    #[error("invalid manifest {}: {reason}", .path.display())]
    InvalidManifest { path: PathBuf, reason: String },

    // Transactions
    #[error("update already in progress (pid {pid}, transaction {txn})")]
    UpdateInProgress { pid: u32, txn: String },

    #[error("update check failed: {0}")]
    CheckFailed(String),

    #[error("transaction {txn}: staging {version} failed: {reason}")]
    StageFailed {
        txn: Uuid,
        version: Version,
        reason: String,
    },

    #[error("transaction {txn}: verification of {version} failed: {reason}")]
    VerifyFailed {
        txn: Uuid,
        version: Version,
        reason: String,
    },

    #[error("transaction {txn}: apply of {version} failed and was rolled back: {reason}")]
    ApplyFailed {
        txn: Uuid,
        version: Version,
        reason: String,
    },

    #[error("rollback failed: {0}")]
    RollbackFailed(String),

    #[error("installation is inconsistent, run a manual rollback: {0}")]
    InconsistentInstallation(String),

    #[error("transaction {txn}: cannot {action} while {status}")]
    InvalidTransition {
        txn: Uuid,
        action: &'static str,
        status: String,
    },

    #[error("{operation} timed out after {secs}s")]
    Timeout { operation: String, secs: u64 },

    // Resources
    #[error("no backup available{}", for_version(.version))]
    NoBackupAvailable { version: Option<Version> },

    #[error("backup {} is corrupt: {reason}", .path.display())]
    CorruptBackup { path: PathBuf, reason: String },

    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config error in {}: {reason}", .path.display())]
    Config { path: PathBuf, reason: String },
}

impl HatchError {
    /// Wrap an IO error with the path it concerns.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            HatchError::UpdateInProgress { .. } => EXIT_UPDATE_IN_PROGRESS,
            HatchError::CyclicDependency { .. } => EXIT_CYCLIC_DEPENDENCY,
            HatchError::MissingDependency { .. } => EXIT_MISSING_DEPENDENCY,
            HatchError::NoBackupAvailable { .. } => EXIT_NO_BACKUP,
            HatchError::InconsistentInstallation(_) => EXIT_INCONSISTENT,
            _ => EXIT_GENERAL_ERROR,
        }
    }
}

/// Attach a path to IO results.
fn for_version(version: &Option<Version>) -> String {
    version
        .as_ref()
        .map(|v| format!(" for version {v}"))
        .unwrap_or_default()
}

pub(crate) trait IoContext<T> {
    fn at(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoContext<T> for std::io::Result<T> {
    fn at(self, path: impl Into<PathBuf>) -> Result<T> {
        self.map_err(|e| HatchError::io(path, e))
    }
}
