//! Shared fixtures: temporary installations and release trees

#![allow(dead_code)]

use std::cell::RefCell;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use hatch_common::host::{Direct, DirectorySource, NoService};
use hatch_common::{
    CallOutput, HatchConfig, InstallLayout, ModuleDescriptor, ModuleHooks, Runtime, SourceConfig,
    UpdateEngine,
};
use semver::Version;
use tempfile::TempDir;

pub struct Fixture {
    pub temp: TempDir,
    pub layout: InstallLayout,
    pub releases: PathBuf,
}

impl Fixture {
    pub fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let layout = InstallLayout::new(temp.path().join("root"));
        let releases = temp.path().join("releases");
        fs::create_dir_all(&releases).unwrap();
        Self {
            temp,
            layout,
            releases,
        }
    }

    /// Config that only sees this installation's modules
    pub fn config(&self) -> HatchConfig {
        let mut config = HatchConfig::default();
        config.modules.user_dir = None;
        config.modules.system_dir = None;
        config.update.source = Some(SourceConfig::Directory {
            path: self.releases.clone(),
        });
        config
    }

    pub fn source(&self) -> DirectorySource {
        DirectorySource::new(&self.releases)
    }

    pub fn release(&self, version: &str) -> ReleaseBuilder {
        ReleaseBuilder {
            dir: self.releases.join(version),
            version: version.to_string(),
            declared_version: version.to_string(),
            modules: Vec::new(),
            executable: true,
        }
    }

    /// Install `version` through the normal update path
    pub fn install(&self, version: &str) {
        let source = self.source();
        UpdateEngine::new(self.layout.clone(), self.config(), &source, &NoService, &Direct)
            .run(Some(Version::parse(version).unwrap()))
            .unwrap();
    }

    pub fn runtime(&self) -> Runtime {
        Runtime::new(self.layout.clone(), self.config())
    }

    pub fn hooks_log(&self) -> Vec<String> {
        fs::read_to_string(self.layout.root().join("hooks.log"))
            .map(|s| s.lines().map(str::to_string).collect())
            .unwrap_or_default()
    }
}

pub struct ReleaseBuilder {
    dir: PathBuf,
    version: String,
    declared_version: String,
    modules: Vec<(String, Vec<String>, Vec<String>)>,
    executable: bool,
}

impl ReleaseBuilder {
    pub fn module(mut self, name: &str, deps: &[&str], capabilities: &[&str]) -> Self {
        self.modules.push((
            name.to_string(),
            deps.iter().map(|s| s.to_string()).collect(),
            capabilities.iter().map(|s| s.to_string()).collect(),
        ));
        self
    }

    /// Write a release.toml that claims another version
    pub fn declaring(mut self, version: &str) -> Self {
        self.declared_version = version.to_string();
        self
    }

    pub fn non_executable(mut self) -> Self {
        self.executable = false;
        self
    }

    pub fn write(self) -> PathBuf {
        fs::create_dir_all(self.dir.join("bin")).unwrap();
        write_file(
            &self.dir.join("bin/app"),
            &format!("#!/bin/sh\necho app {}\n", self.version),
            self.executable,
        );
        fs::write(
            self.dir.join("release.toml"),
            format!(
                "version = \"{}\"\nentry_points = [\"bin/app\"]\n",
                self.declared_version
            ),
        )
        .unwrap();

        for (name, deps, caps) in &self.modules {
            let dir = self.dir.join("modules").join(name);
            fs::create_dir_all(dir.join("hooks")).unwrap();
            fs::create_dir_all(dir.join("commands")).unwrap();
            fs::write(
                dir.join("module.toml"),
                format!(
                    "name = \"{name}\"\nversion = \"{}\"\ndependencies = {deps:?}\n\
                     capabilities = {caps:?}\n\n[hooks]\ninit = \"hooks/init\"\n\
                     cleanup = \"hooks/cleanup\"\n",
                    self.version
                ),
            )
            .unwrap();
            write_file(
                &dir.join("hooks/init"),
                "#!/bin/sh\necho \"init $HATCH_MODULE\" >> \"$HATCH_ROOT/hooks.log\"\n",
                true,
            );
            write_file(
                &dir.join("hooks/cleanup"),
                "#!/bin/sh\necho \"cleanup $HATCH_MODULE\" >> \"$HATCH_ROOT/hooks.log\"\n",
                true,
            );
            for cap in caps {
                write_file(
                    &dir.join("commands").join(cap),
                    &format!("#!/bin/sh\necho \"{cap} $*\"\n"),
                    true,
                );
            }
        }
        self.dir
    }
}

pub fn write_file(path: &Path, content: &str, executable: bool) {
    fs::write(path, content).unwrap();
    let mode = if executable { 0o755 } else { 0o644 };
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).unwrap();
}

/// Shared event log for native test modules
pub type Events = Rc<RefCell<Vec<String>>>;

pub fn events() -> Events {
    Rc::new(RefCell::new(Vec::new()))
}

/// Native module recording its lifecycle
#[derive(Debug)]
pub struct Probe {
    pub name: String,
    pub events: Events,
    pub fail_verify: bool,
    pub fail_init: bool,
    pub fail_cleanup: bool,
    /// Capability invoked from inside `init`
    pub init_calls: Option<String>,
}

impl Probe {
    pub fn new(name: &str, events: &Events) -> Self {
        Self {
            name: name.to_string(),
            events: Rc::clone(events),
            fail_verify: false,
            fail_init: false,
            fail_cleanup: false,
            init_calls: None,
        }
    }
}

impl ModuleHooks for Probe {
    fn init(&self, rt: &mut Runtime) -> anyhow::Result<()> {
        if let Some(capability) = &self.init_calls {
            rt.invoke(capability, &[])?;
        }
        if self.fail_init {
            anyhow::bail!("{} refuses to start", self.name);
        }
        self.events.borrow_mut().push(format!("init {}", self.name));
        Ok(())
    }

    fn verify(&self, _rt: &Runtime) -> Option<anyhow::Result<()>> {
        if self.fail_verify {
            return Some(Err(anyhow::anyhow!("{} is damaged", self.name)));
        }
        Some(Ok(()))
    }

    fn cleanup(&self, _rt: &mut Runtime) -> Option<anyhow::Result<()>> {
        if self.fail_cleanup {
            return Some(Err(anyhow::anyhow!("{} cannot stop", self.name)));
        }
        self.events.borrow_mut().push(format!("cleanup {}", self.name));
        Some(Ok(()))
    }

    fn call(
        &self,
        capability: &str,
        args: &[String],
        _rt: &mut Runtime,
    ) -> anyhow::Result<CallOutput> {
        if capability.ends_with("_fail") {
            anyhow::bail!("{} broke", capability);
        }
        self.events
            .borrow_mut()
            .push(format!("call {capability}"));
        Ok(CallOutput::ok(format!("{} {}", capability, args.join(" "))))
    }
}

pub fn native(probe: Probe, deps: &[&str], capabilities: &[&str]) -> ModuleDescriptor {
    ModuleDescriptor::new(probe.name.clone(), Version::new(1, 0, 0), probe)
        .depends_on(deps.iter().copied())
        .provides(capabilities.iter().copied())
}
