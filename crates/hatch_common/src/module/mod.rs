//! Module system: descriptors, registry, dependency resolution, loading
//! and capability dispatch.

pub mod descriptor;
pub mod dispatch;
pub mod loader;
pub mod manifest;
pub mod registry;
pub mod resolver;

pub use descriptor::{CallOutput, ModuleDescriptor, ModuleHooks, ModuleOrigin, SearchScope};
pub use dispatch::Dispatcher;
pub use loader::{Discovery, ModuleLoader, SearchPath};
pub use manifest::{CommandHooks, ModuleManifest, MODULE_MANIFEST};
pub use registry::{ModuleRecord, ModuleRegistry, RegistrySnapshot};
pub use resolver::resolve_load_order;
