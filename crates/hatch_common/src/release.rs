//! Release manifest (`release.toml`) at the root of every installation tree
//!
//! ```toml
//! version = "1.3.0"
//! entry_points = ["bin/app"]
//!
//! [checksums]
//! "bin/app" = "<sha256 hex>"
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use semver::Version;
use serde::{Deserialize, Serialize};

use crate::error::{HatchError, Result};
use crate::fsutil;
use crate::paths::RELEASE_MANIFEST;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseManifest {
    pub version: Version,

    /// Executables that must be present, relative to the tree root
    #[serde(default)]
    pub entry_points: Vec<PathBuf>,

    /// Optional SHA256 checksums, relative path -> hex digest
    #[serde(default)]
    pub checksums: BTreeMap<PathBuf, String>,
}

impl ReleaseManifest {
    pub fn load(tree: &Path) -> Result<Self> {
        let path = tree.join(RELEASE_MANIFEST);
        let content = fs::read_to_string(&path).map_err(|e| HatchError::io(&path, e))?;
        toml::from_str(&content).map_err(|e| HatchError::InvalidManifest {
            path,
            reason: e.to_string(),
        })
    }

    /// Version marker of a tree, if it has a readable manifest
    pub fn read_version(tree: &Path) -> Option<Version> {
        Self::load(tree).ok().map(|m| m.version)
    }

    /// Structural integrity of `tree` against this manifest.
    ///
    /// With `probe_exec`, every entry point must also be executable.
    pub fn check_tree(&self, tree: &Path, probe_exec: bool) -> std::result::Result<(), String> {
        for entry in &self.entry_points {
            if !fsutil::is_contained(entry) {
                return Err(format!("entry point {} escapes the tree", entry.display()));
            }
            let path = tree.join(entry);
            if !path.is_file() {
                return Err(format!("entry point {} missing", entry.display()));
            }
            if probe_exec && !fsutil::is_executable(&path) {
                return Err(format!("entry point {} is not executable", entry.display()));
            }
        }

        for (rel, expected) in &self.checksums {
            if !fsutil::is_contained(rel) {
                return Err(format!("checksum path {} escapes the tree", rel.display()));
            }
            let actual = fsutil::sha256_file(&tree.join(rel)).map_err(|e| e.to_string())?;
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(format!(
                    "checksum mismatch for {}: expected {}, got {}",
                    rel.display(),
                    expected,
                    actual
                ));
            }
        }

        Ok(())
    }
}
