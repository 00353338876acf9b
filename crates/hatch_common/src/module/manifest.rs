//! Module manifest parsing and validation
//!
//! Handles parsing `module.toml` manifests and turning them into
//! descriptors whose hooks run executables from the module directory.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Context};
use semver::Version;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{HatchError, Result};
use crate::fsutil;
use crate::module::descriptor::{
    CallOutput, ModuleDescriptor, ModuleHooks, ModuleOrigin, SearchScope,
};
use crate::runtime::Runtime;

/// Manifest file name inside a module directory
pub const MODULE_MANIFEST: &str = "module.toml";

/// Hook executables, relative to the module directory
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HookPaths {
    #[serde(default)]
    pub init: Option<PathBuf>,
    #[serde(default)]
    pub verify: Option<PathBuf>,
    #[serde(default)]
    pub cleanup: Option<PathBuf>,
}

/// Module manifest (module.toml structure)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleManifest {
    pub name: String,
    /// Semantic version, validated on conversion
    pub version: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub hooks: HookPaths,
    /// Capability -> executable; unlisted capabilities use `commands/<name>`
    #[serde(default)]
    pub commands: BTreeMap<String, PathBuf>,
}

impl ModuleManifest {
    /// Load manifest from file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|e| HatchError::io(path, e))?;
        toml::from_str(&contents).map_err(|e| invalid(path, e.to_string()))
    }

    /// Validate and build a descriptor for the module living in `dir`
    pub fn into_descriptor(self, dir: &Path, scope: SearchScope) -> Result<ModuleDescriptor> {
        let manifest_path = dir.join(MODULE_MANIFEST);

        if self.name.trim().is_empty() {
            return Err(invalid(&manifest_path, "module name cannot be empty"));
        }
        let version = Version::parse(&self.version).map_err(|e| {
            invalid(&manifest_path, format!("bad version '{}': {}", self.version, e))
        })?;
        let Some(init) = self.hooks.init.clone() else {
            return Err(invalid(&manifest_path, "missing [hooks] init"));
        };

        let commands: BTreeMap<String, PathBuf> = self
            .capabilities
            .iter()
            .map(|cap| {
                let exe = self
                    .commands
                    .get(cap)
                    .cloned()
                    .unwrap_or_else(|| Path::new("commands").join(cap));
                (cap.clone(), exe)
            })
            .collect();

        let hook_paths = [Some(&init), self.hooks.verify.as_ref(), self.hooks.cleanup.as_ref()];
        for rel in hook_paths.into_iter().flatten().chain(commands.values()) {
            if !fsutil::is_contained(rel) {
                return Err(invalid(
                    &manifest_path,
                    format!("{} escapes the module directory", rel.display()),
                ));
            }
        }

        let hooks = CommandHooks {
            module: self.name.clone(),
            version: version.clone(),
            dir: dir.to_path_buf(),
            init,
            verify: self.hooks.verify,
            cleanup: self.hooks.cleanup,
            commands,
        };

        Ok(ModuleDescriptor::new(self.name, version, hooks)
            .describe(self.description.unwrap_or_default())
            .depends_on(self.dependencies)
            .provides(self.capabilities)
            .with_origin(ModuleOrigin::Discovered {
                scope,
                dir: dir.to_path_buf(),
            }))
    }
}

fn invalid(path: &Path, reason: impl Into<String>) -> HatchError {
    HatchError::InvalidManifest {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

/// Hooks backed by executables inside a module directory
#[derive(Debug, Clone)]
pub struct CommandHooks {
    module: String,
    version: Version,
    dir: PathBuf,
    init: PathBuf,
    verify: Option<PathBuf>,
    cleanup: Option<PathBuf>,
    commands: BTreeMap<String, PathBuf>,
}

impl CommandHooks {
    fn command(&self, rt: &Runtime, rel: &Path, args: &[String]) -> Command {
        let mut cmd = Command::new(self.dir.join(rel));
        cmd.args(args)
            .current_dir(&self.dir)
            .env("HATCH_ROOT", rt.layout().root())
            .env("HATCH_MODULE", &self.module)
            .env("HATCH_MODULE_DIR", &self.dir)
            .env("HATCH_MODULE_VERSION", self.version.to_string());
        cmd
    }

    /// Run a lifecycle hook; non-zero exit is failure
    fn run_hook(&self, rt: &Runtime, rel: &Path) -> anyhow::Result<()> {
        debug!("{}: running hook {}", self.module, rel.display());
        let output = self
            .command(rt, rel, &[])
            .output()
            .with_context(|| format!("failed to run {}", rel.display()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "{} exited with {}: {}",
                rel.display(),
                output.status,
                stderr.trim()
            );
        }
        Ok(())
    }
}

impl ModuleHooks for CommandHooks {
    fn init(&self, rt: &mut Runtime) -> anyhow::Result<()> {
        self.run_hook(rt, &self.init)
    }

    fn verify(&self, rt: &Runtime) -> Option<anyhow::Result<()>> {
        self.verify.as_ref().map(|rel| self.run_hook(rt, rel))
    }

    fn cleanup(&self, rt: &mut Runtime) -> Option<anyhow::Result<()>> {
        self.cleanup.as_ref().map(|rel| self.run_hook(rt, rel))
    }

    fn call(
        &self,
        capability: &str,
        args: &[String],
        rt: &mut Runtime,
    ) -> anyhow::Result<CallOutput> {
        let Some(rel) = self.commands.get(capability) else {
            bail!("{} does not provide {}", self.module, capability);
        };

        // stderr is inherited so command diagnostics reach the operator
        let output = self
            .command(rt, rel, args)
            .stderr(std::process::Stdio::inherit())
            .output()
            .with_context(|| format!("failed to run {}", rel.display()))?;

        Ok(CallOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        })
    }
}
