//! Module registry
//!
//! `available` maps names to descriptors; `loaded` records load order.
//! Every loaded name is available, appears once, and comes after all of
//! its dependencies. The registry is persisted as a JSON snapshot.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{HatchError, Result};
use crate::fsutil::atomic_write;
use crate::module::descriptor::{ModuleDescriptor, ModuleOrigin, SearchScope};
use crate::module::resolver;

/// Current snapshot schema
pub const SNAPSHOT_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Default, Clone)]
pub struct ModuleRegistry {
    available: BTreeMap<String, ModuleDescriptor>,
    loaded: Vec<String>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a descriptor. The same name and version again is a no-op.
    pub fn register(&mut self, descriptor: ModuleDescriptor) -> Result<()> {
        if let Some(existing) = self.available.get(&descriptor.name) {
            if existing.version == descriptor.version {
                debug!("{} {} already registered", descriptor.name, descriptor.version);
                return Ok(());
            }
            return Err(HatchError::DuplicateModule {
                name: descriptor.name.clone(),
                existing: existing.version.clone(),
                attempted: descriptor.version,
            });
        }
        self.available.insert(descriptor.name.clone(), descriptor);
        Ok(())
    }

    /// Replace a descriptor regardless of version, unless it is loaded
    pub fn register_override(&mut self, descriptor: ModuleDescriptor) -> Result<()> {
        if self.is_loaded(&descriptor.name) {
            let existing = self
                .available
                .get(&descriptor.name)
                .map(|d| d.version.clone())
                .unwrap_or_else(|| descriptor.version.clone());
            return Err(HatchError::DuplicateModule {
                name: descriptor.name.clone(),
                existing,
                attempted: descriptor.version,
            });
        }
        self.available.insert(descriptor.name.clone(), descriptor);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ModuleDescriptor> {
        self.available.get(name)
    }

    /// Available descriptors in name order
    pub fn available(&self) -> impl Iterator<Item = &ModuleDescriptor> {
        self.available.values()
    }

    pub fn available_map(&self) -> &BTreeMap<String, ModuleDescriptor> {
        &self.available
    }

    /// Loaded module names in load order
    pub fn loaded(&self) -> &[String] {
        &self.loaded
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.loaded.iter().any(|n| n == name)
    }

    /// Record `name` as loaded. Idempotent.
    pub fn mark_loaded(&mut self, name: &str) -> Result<()> {
        if self.is_loaded(name) {
            return Ok(());
        }
        let descriptor = self
            .available
            .get(name)
            .ok_or_else(|| HatchError::UnknownModule(name.to_string()))?;

        if let Some(dep) = descriptor.dependencies.iter().find(|d| !self.is_loaded(d)) {
            return Err(HatchError::MissingDependency {
                missing: dep.clone(),
                requester: name.to_string(),
            });
        }

        self.loaded.push(name.to_string());
        Ok(())
    }

    /// Drop `name` from the loaded list; returns whether it was loaded
    pub fn unmark_loaded(&mut self, name: &str) -> bool {
        let before = self.loaded.len();
        self.loaded.retain(|n| n != name);
        before != self.loaded.len()
    }

    /// Loaded modules depending on `name`, directly or transitively, in
    /// load order
    pub fn dependents_of(&self, name: &str) -> Vec<String> {
        let mut affected = vec![name.to_string()];
        let mut dependents = Vec::new();

        // Load order guarantees dependencies come first, so a single pass
        // catches transitive dependents.
        for loaded in &self.loaded {
            if loaded == name {
                continue;
            }
            let Some(descriptor) = self.available.get(loaded) else {
                continue;
            };
            if descriptor.dependencies.iter().any(|d| affected.contains(d)) {
                affected.push(loaded.clone());
                dependents.push(loaded.clone());
            }
        }
        dependents
    }

    /// Names of available modules declaring `capability`, in name order
    pub fn providers_of(&self, capability: &str) -> Vec<String> {
        self.available
            .values()
            .filter(|d| d.capabilities.contains(capability))
            .map(|d| d.name.clone())
            .collect()
    }

    /// Requested modules plus transitive dependencies, dependencies first
    pub fn resolve_load_order<S: AsRef<str>>(&self, requested: &[S]) -> Result<Vec<String>> {
        resolver::resolve_load_order(&self.available, requested)
    }

    pub fn snapshot(&self, install_version: Option<Version>) -> RegistrySnapshot {
        RegistrySnapshot {
            schema_version: SNAPSHOT_SCHEMA_VERSION,
            updated_at: Utc::now(),
            install_version,
            modules: self.available.values().map(ModuleRecord::from).collect(),
            loaded: self.loaded.clone(),
        }
    }
}

/// Persisted descriptor metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleRecord {
    pub name: String,
    pub version: Version,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub scope: Option<SearchScope>,
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

impl From<&ModuleDescriptor> for ModuleRecord {
    fn from(d: &ModuleDescriptor) -> Self {
        let dir = match &d.origin {
            ModuleOrigin::Native => None,
            ModuleOrigin::Discovered { dir, .. } => Some(dir.clone()),
        };
        Self {
            name: d.name.clone(),
            version: d.version.clone(),
            description: d.description.clone(),
            dependencies: d.dependencies.clone(),
            capabilities: d.capabilities.iter().cloned().collect(),
            scope: d.scope(),
            dir,
        }
    }
}

/// On-disk form of the registry (`R/registry.state`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    pub schema_version: u32,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub install_version: Option<Version>,
    #[serde(default)]
    pub modules: Vec<ModuleRecord>,
    #[serde(default)]
    pub loaded: Vec<String>,
}

impl RegistrySnapshot {
    /// Read a snapshot; `None` if none was ever written
    pub fn load(path: &Path) -> Result<Option<Self>> {
        match fs::read_to_string(path) {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(HatchError::io(path, e)),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        atomic_write(path, json.as_bytes())
    }

    pub fn record(&self, name: &str) -> Option<&ModuleRecord> {
        self.modules.iter().find(|m| m.name == name)
    }
}
