//! Hatch - lifecycle framework core
//!
//! Dependency-aware module loading with capability auto-dispatch, and
//! atomic update/rollback of a live installation tree.

pub mod config;
pub mod error;
pub mod fsutil;
pub mod host;
pub mod module;
pub mod ops_log;
pub mod paths;
pub mod release;
pub mod runtime;
pub mod status;
pub mod updater;

pub use config::{BatchFailurePolicy, HatchConfig, SourceConfig};
pub use error::{HatchError, Result};
pub use module::{
    CallOutput, Dispatcher, ModuleDescriptor, ModuleHooks, ModuleLoader, ModuleRegistry,
    SearchPath, SearchScope,
};
pub use paths::InstallLayout;
pub use release::ReleaseManifest;
pub use runtime::Runtime;
pub use status::StatusReport;
pub use updater::{
    RollbackController, TxnStatus, UpdateCheck, UpdateEngine, UpdateScope, UpdateTransaction,
};
