//! Module loader
//!
//! Discovers descriptors on the search path and drives `verify`, `init`
//! and `cleanup` hooks. A module is marked loaded only after its `init`
//! returned successfully.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use tracing::{debug, info, warn};

use crate::config::{BatchFailurePolicy, ModulesConfig};
use crate::error::{HatchError, Result};
use crate::module::descriptor::{ModuleDescriptor, SearchScope};
use crate::module::manifest::{ModuleManifest, MODULE_MANIFEST};
use crate::runtime::Runtime;

/// One directory on the module search path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchPath {
    pub scope: SearchScope,
    pub dir: PathBuf,
}

impl SearchPath {
    pub fn new(scope: SearchScope, dir: impl Into<PathBuf>) -> Self {
        Self {
            scope,
            dir: dir.into(),
        }
    }

    /// Search path in priority order: project modules, then the configured
    /// user and system directories.
    pub fn standard(project_modules: impl Into<PathBuf>, config: &ModulesConfig) -> Vec<Self> {
        let mut paths = vec![Self::new(SearchScope::Project, project_modules)];
        if let Some(dir) = &config.user_dir {
            paths.push(Self::new(SearchScope::User, dir));
        }
        if let Some(dir) = &config.system_dir {
            paths.push(Self::new(SearchScope::System, dir));
        }
        paths
    }
}

/// Result of scanning the search path
#[derive(Debug, Default)]
pub struct Discovery {
    /// Winning descriptors in name order
    pub modules: Vec<ModuleDescriptor>,
    /// Module directories whose manifest was rejected, with the reason
    pub rejected: Vec<(PathBuf, String)>,
}

/// Module loader
pub struct ModuleLoader;

impl ModuleLoader {
    /// Scan `paths` in priority order. On a name collision the earlier path
    /// wins. Missing directories are skipped.
    pub fn discover(paths: &[SearchPath]) -> Result<Discovery> {
        let mut found: BTreeMap<String, ModuleDescriptor> = BTreeMap::new();
        let mut rejected = Vec::new();

        for search in paths {
            if !search.dir.is_dir() {
                debug!("{} module dir {} absent, skipping", search.scope, search.dir.display());
                continue;
            }

            let entries =
                fs::read_dir(&search.dir).map_err(|e| HatchError::io(&search.dir, e))?;
            let mut dirs: Vec<PathBuf> = entries
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.path())
                .filter(|path| path.is_dir())
                .collect();
            dirs.sort();

            for dir in dirs {
                let manifest_path = dir.join(MODULE_MANIFEST);
                if !manifest_path.exists() {
                    debug!("No {} in {}, skipping", MODULE_MANIFEST, dir.display());
                    continue;
                }

                let descriptor = ModuleManifest::from_file(&manifest_path)
                    .and_then(|manifest| manifest.into_descriptor(&dir, search.scope));

                match descriptor {
                    Ok(descriptor) => {
                        if let Some(winner) = found.get(&descriptor.name) {
                            debug!(
                                "{} in {} shadowed by {} scope",
                                descriptor.name,
                                dir.display(),
                                winner.scope().map(|s| s.to_string()).unwrap_or_default()
                            );
                            continue;
                        }
                        found.insert(descriptor.name.clone(), descriptor);
                    }
                    Err(e) => {
                        warn!("Skipping module in {}: {}", dir.display(), e);
                        rejected.push((dir, e.to_string()));
                    }
                }
            }
        }

        debug!("Discovered {} modules", found.len());
        Ok(Discovery {
            modules: found.into_values().collect(),
            rejected,
        })
    }

    /// Load `names` and their dependencies. Returns the modules this call
    /// initialized, in order.
    pub fn load<S: AsRef<str>>(rt: &mut Runtime, names: &[S]) -> Result<Vec<String>> {
        let order = rt.registry.resolve_load_order(names)?;

        // A module still inside its own init cannot be required again
        for name in &order {
            if let Some(pos) = rt.initializing.iter().position(|n| n == name) {
                let mut cycle = rt.initializing[pos..].to_vec();
                if let Some(requested) = order.last().filter(|last| *last != name) {
                    cycle.push(requested.clone());
                }
                cycle.push(name.clone());
                return Err(HatchError::CyclicDependency { cycle });
            }
        }

        let mut initialized = Vec::new();
        let mut failure = None;
        for name in &order {
            // Nested auto-loads may have brought it in meanwhile
            if rt.registry.is_loaded(name) {
                continue;
            }
            match Self::load_one(rt, name) {
                Ok(()) => initialized.push(name.clone()),
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        if let Some(err) = failure {
            if rt.config.modules.on_batch_failure == BatchFailurePolicy::Unwind {
                Self::unwind(rt, &initialized);
            }
            if let Err(e) = rt.persist() {
                warn!("Failed to persist registry after failed load: {}", e);
            }
            return Err(err);
        }

        rt.persist()?;
        Ok(initialized)
    }

    fn load_one(rt: &mut Runtime, name: &str) -> Result<()> {
        let descriptor = rt
            .registry
            .get(name)
            .ok_or_else(|| HatchError::UnknownModule(name.to_string()))?;
        let version = descriptor.version.clone();
        let hooks = descriptor.hooks();

        if let Some(Err(e)) = hooks.verify(rt) {
            return Err(HatchError::ModuleVerificationFailed {
                module: name.to_string(),
                version,
                reason: format!("{e:#}"),
            });
        }

        rt.initializing.push(name.to_string());
        let result = hooks.init(rt);
        rt.initializing.pop();

        if let Err(e) = result {
            return Err(HatchError::ModuleInitFailed {
                module: name.to_string(),
                version,
                reason: format!("{e:#}"),
            });
        }

        rt.registry.mark_loaded(name)?;
        info!("Loaded {} {}", name, version);
        rt.ops_log.log("loader", "loaded", Some(&format!("{name} {version}")));
        Ok(())
    }

    /// Best-effort cleanup of a failed batch, newest first
    fn unwind(rt: &mut Runtime, initialized: &[String]) {
        for name in initialized.iter().rev() {
            // Modules auto-loaded by a nested call may depend on it
            let dependents = rt.registry.dependents_of(name);
            if !dependents.is_empty() {
                warn!("Keeping {}: still required by {}", name, dependents.join(", "));
                continue;
            }
            match Self::unload_one(rt, name) {
                Ok(()) => debug!("Unwound {}", name),
                Err(e) => warn!("Failed to unwind {}: {}", name, e),
            }
        }
    }

    /// Unload `name`. With `force`, loaded dependents are unloaded first,
    /// newest first. Returns the modules unloaded, in order.
    pub fn unload(rt: &mut Runtime, name: &str, force: bool) -> Result<Vec<String>> {
        if rt.registry.get(name).is_none() {
            return Err(HatchError::UnknownModule(name.to_string()));
        }
        if !rt.registry.is_loaded(name) {
            debug!("{} is not loaded", name);
            return Ok(Vec::new());
        }

        let dependents = rt.registry.dependents_of(name);
        if !dependents.is_empty() && !force {
            return Err(HatchError::DependentModulesActive {
                module: name.to_string(),
                dependents,
            });
        }

        let mut unloaded = Vec::new();
        let targets = dependents
            .iter()
            .rev()
            .cloned()
            .chain(std::iter::once(name.to_string()));
        for target in targets {
            if let Err(e) = Self::unload_one(rt, &target) {
                if let Err(persist_err) = rt.persist() {
                    warn!("Failed to persist registry after failed unload: {}", persist_err);
                }
                return Err(e);
            }
            unloaded.push(target);
        }

        rt.persist()?;
        Ok(unloaded)
    }

    fn unload_one(rt: &mut Runtime, name: &str) -> Result<()> {
        let hooks = rt
            .registry
            .get(name)
            .ok_or_else(|| HatchError::UnknownModule(name.to_string()))?
            .hooks();

        if let Some(Err(e)) = hooks.cleanup(rt) {
            return Err(HatchError::ModuleCleanupFailed {
                module: name.to_string(),
                reason: format!("{e:#}"),
            });
        }

        rt.registry.unmark_loaded(name);
        info!("Unloaded {}", name);
        rt.ops_log.log("loader", "unloaded", Some(name));
        Ok(())
    }
}
