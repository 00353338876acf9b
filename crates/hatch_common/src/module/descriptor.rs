//! Module descriptors and the lifecycle contract
//!
//! A module is a value implementing [`ModuleHooks`] plus static metadata.
//! Nothing a module provides runs except through an explicit call on
//! this contract.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use semver::Version;
use serde::{Deserialize, Serialize};

use crate::runtime::Runtime;

/// Output of a capability call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallOutput {
    pub exit_code: i32,
    pub stdout: String,
}

impl CallOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Lifecycle contract every module implements.
///
/// Hooks receive the runtime so they can invoke other capabilities; the
/// dispatcher auto-loads whatever those need.
pub trait ModuleHooks: fmt::Debug {
    /// Mandatory. Must complete before the module is marked loaded.
    fn init(&self, rt: &mut Runtime) -> anyhow::Result<()>;

    /// Optional pre-init check. `None` means the module has no verify hook.
    fn verify(&self, _rt: &Runtime) -> Option<anyhow::Result<()>> {
        None
    }

    /// Optional teardown run on unload. `None` means no cleanup hook.
    fn cleanup(&self, _rt: &mut Runtime) -> Option<anyhow::Result<()>> {
        None
    }

    /// Run one of the capabilities this module declares.
    fn call(
        &self,
        capability: &str,
        args: &[String],
        rt: &mut Runtime,
    ) -> anyhow::Result<CallOutput>;
}

/// Search scope a descriptor was discovered in, highest priority first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchScope {
    Project,
    User,
    System,
}

impl fmt::Display for SearchScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SearchScope::Project => write!(f, "project"),
            SearchScope::User => write!(f, "user"),
            SearchScope::System => write!(f, "system"),
        }
    }
}

/// Where a descriptor came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModuleOrigin {
    /// Registered in-process
    Native,
    /// Parsed from a `module.toml`
    Discovered { scope: SearchScope, dir: PathBuf },
}

/// Static metadata plus lifecycle hooks for one loadable unit
#[derive(Clone)]
pub struct ModuleDescriptor {
    pub name: String,
    pub version: Version,
    pub description: String,
    /// Ordered set: declaration order kept, duplicates dropped
    pub dependencies: Vec<String>,
    pub capabilities: BTreeSet<String>,
    pub origin: ModuleOrigin,
    hooks: Arc<dyn ModuleHooks>,
}

impl ModuleDescriptor {
    pub fn new(
        name: impl Into<String>,
        version: Version,
        hooks: impl ModuleHooks + 'static,
    ) -> Self {
        Self::with_shared_hooks(name, version, Arc::new(hooks))
    }

    pub fn with_shared_hooks(
        name: impl Into<String>,
        version: Version,
        hooks: Arc<dyn ModuleHooks>,
    ) -> Self {
        Self {
            name: name.into(),
            version,
            description: String::new(),
            dependencies: Vec::new(),
            capabilities: BTreeSet::new(),
            origin: ModuleOrigin::Native,
            hooks,
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for dep in deps {
            let dep = dep.into();
            if !self.dependencies.contains(&dep) {
                self.dependencies.push(dep);
            }
        }
        self
    }

    pub fn provides<I, S>(mut self, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.capabilities
            .extend(capabilities.into_iter().map(Into::into));
        self
    }

    pub fn with_origin(mut self, origin: ModuleOrigin) -> Self {
        self.origin = origin;
        self
    }

    pub fn hooks(&self) -> Arc<dyn ModuleHooks> {
        Arc::clone(&self.hooks)
    }

    pub fn scope(&self) -> Option<SearchScope> {
        match &self.origin {
            ModuleOrigin::Native => None,
            ModuleOrigin::Discovered { scope, .. } => Some(*scope),
        }
    }
}

impl fmt::Debug for ModuleDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleDescriptor")
            .field("name", &self.name)
            .field("version", &self.version.to_string())
            .field("dependencies", &self.dependencies)
            .field("capabilities", &self.capabilities)
            .field("origin", &self.origin)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Noop;

    impl ModuleHooks for Noop {
        fn init(&self, _rt: &mut Runtime) -> anyhow::Result<()> {
            Ok(())
        }

        fn call(&self, _c: &str, _a: &[String], _rt: &mut Runtime) -> anyhow::Result<CallOutput> {
            Ok(CallOutput::default())
        }
    }

    #[test]
    fn test_dependencies_are_an_ordered_set() {
        let d = ModuleDescriptor::new("monitor", Version::new(1, 0, 0), Noop)
            .depends_on(["service", "config", "service"]);
        assert_eq!(d.dependencies, vec!["service", "config"]);
    }

    #[test]
    fn test_builder_fields() {
        let d = ModuleDescriptor::new("config", Version::new(0, 2, 1), Noop)
            .describe("configuration store")
            .provides(["config_get", "config_set"]);
        assert_eq!(d.description, "configuration store");
        assert!(d.capabilities.contains("config_get"));
        assert_eq!(d.origin, ModuleOrigin::Native);
        assert!(d.scope().is_none());
    }

    #[test]
    fn test_scope_priority_order() {
        assert!(SearchScope::Project < SearchScope::User);
        assert!(SearchScope::User < SearchScope::System);
        assert_eq!(SearchScope::User.to_string(), "user");
    }
}
