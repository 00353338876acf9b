//! Per-process coordinator context
//!
//! A `Runtime` owns the module registry, the capability cache and the
//! stack of modules currently inside `init`. Loader, dispatcher and hooks
//! all work against the same `&mut Runtime`.

use std::collections::HashMap;

use tracing::debug;

use crate::config::HatchConfig;
use crate::error::{HatchError, Result};
use crate::module::{
    CallOutput, Dispatcher, ModuleDescriptor, ModuleLoader, ModuleRegistry, RegistrySnapshot,
    SearchPath,
};
use crate::ops_log::OpsLog;
use crate::paths::InstallLayout;
use crate::release::ReleaseManifest;

#[derive(Debug)]
pub struct Runtime {
    pub(crate) layout: InstallLayout,
    pub(crate) config: HatchConfig,
    pub(crate) registry: ModuleRegistry,
    /// capability -> module
    pub(crate) capabilities: HashMap<String, String>,
    /// Modules whose `init` is running, outermost first
    pub(crate) initializing: Vec<String>,
    pub(crate) ops_log: OpsLog,
}

impl Runtime {
    /// Runtime with an empty registry
    pub fn new(layout: InstallLayout, config: HatchConfig) -> Self {
        let ops_log = OpsLog::open(layout.ops_log());
        Self {
            layout,
            config,
            registry: ModuleRegistry::new(),
            capabilities: HashMap::new(),
            initializing: Vec::new(),
            ops_log,
        }
    }

    /// Discover modules on the standard search path and restore which of
    /// them a previous process left loaded.
    pub fn open(layout: InstallLayout, config: HatchConfig) -> Result<Self> {
        let marker = layout.inconsistent_marker();
        if marker.exists() {
            return Err(HatchError::InconsistentInstallation(format!(
                "{} present",
                marker.display()
            )));
        }

        let mut rt = Self::new(layout, config);
        let discovery = ModuleLoader::discover(&rt.search_paths())?;
        for descriptor in discovery.modules {
            rt.register(descriptor)?;
        }
        rt.restore_loaded()?;
        Ok(rt)
    }

    /// Re-mark modules recorded as loaded whose descriptor still matches.
    /// Anything else is left for the next load to initialize.
    fn restore_loaded(&mut self) -> Result<()> {
        let Some(snapshot) = RegistrySnapshot::load(&self.layout.registry_file())? else {
            return Ok(());
        };

        for name in &snapshot.loaded {
            let same_version = match (snapshot.record(name), self.registry.get(name)) {
                (Some(record), Some(current)) => record.version == current.version,
                _ => false,
            };
            if !same_version {
                debug!("Not restoring {}: descriptor changed or gone", name);
                continue;
            }
            if let Err(e) = self.registry.mark_loaded(name) {
                debug!("Not restoring {}: {}", name, e);
            }
        }
        Ok(())
    }

    pub fn search_paths(&self) -> Vec<SearchPath> {
        SearchPath::standard(self.layout.live_modules_dir(), &self.config.modules)
    }

    /// Register a native module
    pub fn register(&mut self, descriptor: ModuleDescriptor) -> Result<()> {
        self.registry.register(descriptor)
    }

    /// Replace a descriptor that is not loaded
    pub fn register_override(&mut self, descriptor: ModuleDescriptor) -> Result<()> {
        let name = descriptor.name.clone();
        self.registry.register_override(descriptor)?;
        self.capabilities.retain(|_, module| *module != name);
        Ok(())
    }

    pub fn layout(&self) -> &InstallLayout {
        &self.layout
    }

    pub fn config(&self) -> &HatchConfig {
        &self.config
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    pub fn ops_log(&self) -> &OpsLog {
        &self.ops_log
    }

    pub fn load<S: AsRef<str>>(&mut self, names: &[S]) -> Result<Vec<String>> {
        ModuleLoader::load(self, names)
    }

    pub fn unload(&mut self, name: &str, force: bool) -> Result<Vec<String>> {
        ModuleLoader::unload(self, name, force)
    }

    pub fn resolve_capability(&mut self, capability: &str) -> Result<String> {
        Dispatcher::resolve(self, capability)
    }

    pub fn invoke(&mut self, capability: &str, args: &[String]) -> Result<CallOutput> {
        Dispatcher::invoke(self, capability, args)
    }

    /// Write the registry snapshot to `R/registry.state`
    pub fn persist(&self) -> Result<()> {
        let version = ReleaseManifest::read_version(&self.layout.live_dir());
        if version.is_none() {
            debug!("No release manifest in {}", self.layout.live_dir().display());
        }
        self.registry
            .snapshot(version)
            .save(&self.layout.registry_file())
    }
}
