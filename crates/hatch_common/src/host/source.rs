//! Version-source collaborator
//!
//! Where candidate release trees come from. Git remotes are driven through
//! the `git` client as a black box; a local directory of release trees is
//! supported for offline installs and tests.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use semver::Version;
use tracing::debug;

use crate::config::SourceConfig;
use crate::fsutil;
use crate::host::process::run_with_timeout;

/// Bound for `git ls-remote`
const LS_REMOTE_TIMEOUT: Duration = Duration::from_secs(60);

pub trait VersionSource {
    /// Newest released version
    fn latest(&self) -> Result<Version>;

    /// Materialize `version` as a new directory `dest`, giving up after
    /// `timeout`
    fn fetch(&self, version: &Version, dest: &Path, timeout: Duration) -> Result<()>;
}

/// Releases published as `v<version>` tags of a git remote
#[derive(Debug, Clone)]
pub struct GitSource {
    url: String,
}

impl GitSource {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

impl VersionSource for GitSource {
    fn latest(&self) -> Result<Version> {
        let output = run_with_timeout(
            Command::new("git").args(["ls-remote", "--tags", &self.url]),
            LS_REMOTE_TIMEOUT,
        )?;
        if !output.status.success() {
            bail!(
                "git ls-remote {} failed: {}",
                self.url,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        newest_tag(&String::from_utf8_lossy(&output.stdout))
            .ok_or_else(|| anyhow!("no release tags found at {}", self.url))
    }

    fn fetch(&self, version: &Version, dest: &Path, timeout: Duration) -> Result<()> {
        let tag = format!("v{version}");
        debug!("Cloning {} at {} into {}", self.url, tag, dest.display());

        let output = run_with_timeout(
            Command::new("git")
                .args(["clone", "--quiet", "--depth", "1", "--branch", &tag, &self.url])
                .arg(dest),
            timeout,
        )?;
        if !output.status.success() {
            bail!(
                "git clone {} at {} failed: {}",
                self.url,
                tag,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        // The release tree is the checkout, not the repository
        fsutil::remove_tree(&dest.join(".git"))?;
        Ok(())
    }
}

/// Newest stable version among `git ls-remote --tags` lines
fn newest_tag(ls_remote: &str) -> Option<Version> {
    ls_remote
        .lines()
        .filter_map(|line| line.split('\t').nth(1))
        .filter_map(|reference| reference.strip_prefix("refs/tags/"))
        .filter(|tag| !tag.ends_with("^{}"))
        .filter_map(|tag| Version::parse(tag.trim_start_matches('v')).ok())
        .filter(|version| version.pre.is_empty())
        .max()
}

/// Release trees laid out as `<dir>/<version>/`
#[derive(Debug, Clone)]
pub struct DirectorySource {
    dir: PathBuf,
}

impl DirectorySource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn versions(&self) -> Result<Vec<Version>> {
        let entries = fs::read_dir(&self.dir)
            .with_context(|| format!("cannot read {}", self.dir.display()))?;
        let mut versions: Vec<Version> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().is_dir())
            .filter_map(|entry| Version::parse(&entry.file_name().to_string_lossy()).ok())
            .collect();
        versions.sort();
        Ok(versions)
    }
}

impl VersionSource for DirectorySource {
    fn latest(&self) -> Result<Version> {
        self.versions()?
            .into_iter()
            .filter(|v| v.pre.is_empty())
            .max()
            .ok_or_else(|| anyhow!("no releases in {}", self.dir.display()))
    }

    fn fetch(&self, version: &Version, dest: &Path, _timeout: Duration) -> Result<()> {
        let src = self.dir.join(version.to_string());
        if !src.is_dir() {
            bail!("release {} not found in {}", version, self.dir.display());
        }
        fsutil::copy_tree(&src, dest)?;
        Ok(())
    }
}

pub fn source_for(config: &SourceConfig) -> Box<dyn VersionSource> {
    match config {
        SourceConfig::Git { url } => Box::new(GitSource::new(url.clone())),
        SourceConfig::Directory { path } => Box::new(DirectorySource::new(path.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_newest_tag() {
        let listing = "\
aaa\trefs/tags/v1.2.0
bbb\trefs/tags/v1.10.0
ccc\trefs/tags/v1.10.0^{}
ddd\trefs/tags/v2.0.0-rc.1
eee\trefs/tags/nightly
";
        assert_eq!(newest_tag(listing), Some(Version::new(1, 10, 0)));
        assert_eq!(newest_tag(""), None);
    }

    #[test]
    fn test_directory_source() {
        let temp = TempDir::new().unwrap();
        for v in ["1.2.0", "1.3.0", "not-a-version"] {
            fs::create_dir_all(temp.path().join(v)).unwrap();
        }
        fs::write(temp.path().join("1.3.0/release.toml"), "version = \"1.3.0\"\n").unwrap();

        let source = DirectorySource::new(temp.path());
        assert_eq!(source.latest().unwrap(), Version::new(1, 3, 0));

        let dest = temp.path().join("staged");
        source
            .fetch(&Version::new(1, 3, 0), &dest, Duration::from_secs(1))
            .unwrap();
        assert!(dest.join("release.toml").exists());

        assert!(source
            .fetch(&Version::new(9, 9, 9), &temp.path().join("x"), Duration::from_secs(1))
            .is_err());
    }
}
