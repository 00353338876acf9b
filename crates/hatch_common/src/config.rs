//! Configuration management for Hatch.
//!
//! Loads settings from `R/hatch.toml` (or an explicit path) and falls back
//! to defaults for anything not set.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{HatchError, Result};
use crate::paths;

/// Where candidate versions come from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceConfig {
    /// A git remote with `v<version>` tags
    Git { url: String },
    /// A local directory of `<version>/` release trees
    Directory { path: PathBuf },
}

/// Update engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateConfig {
    /// Number of backups retained after a successful apply
    #[serde(default = "default_backup_retention")]
    pub backup_retention: usize,

    /// Upper bound for fetching a candidate, in seconds
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,

    /// Managed service restarted after apply/rollback
    #[serde(default)]
    pub service: Option<String>,

    /// Version source
    #[serde(default)]
    pub source: Option<SourceConfig>,
}

fn default_backup_retention() -> usize {
    3
}

fn default_fetch_timeout() -> u64 {
    300
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            backup_retention: default_backup_retention(),
            fetch_timeout_secs: default_fetch_timeout(),
            service: None,
            source: None,
        }
    }
}

impl UpdateConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

/// What happens to already-initialized siblings when a load batch fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchFailurePolicy {
    /// Leave them active; init side effects may not be reversible
    #[default]
    Keep,
    /// Run their cleanup hooks in reverse order and unmark them
    Unwind,
}

/// Module discovery settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModulesConfig {
    /// User-scope module directory
    #[serde(default = "paths::default_user_modules_dir")]
    pub user_dir: Option<PathBuf>,

    /// System-scope module directory
    #[serde(default = "default_system_dir")]
    pub system_dir: Option<PathBuf>,

    #[serde(default)]
    pub on_batch_failure: BatchFailurePolicy,
}

fn default_system_dir() -> Option<PathBuf> {
    Some(paths::default_system_modules_dir())
}

impl Default for ModulesConfig {
    fn default() -> Self {
        Self {
            user_dir: paths::default_user_modules_dir(),
            system_dir: default_system_dir(),
            on_batch_failure: BatchFailurePolicy::default(),
        }
    }
}

/// Settings for updating the framework itself
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SelfUpdateConfig {
    /// The framework's own installation root
    #[serde(default)]
    pub root: Option<PathBuf>,

    #[serde(default)]
    pub source: Option<SourceConfig>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HatchConfig {
    #[serde(default)]
    pub update: UpdateConfig,

    #[serde(default)]
    pub modules: ModulesConfig,

    #[serde(default)]
    pub self_update: SelfUpdateConfig,
}

impl HatchConfig {
    /// Load configuration from `path`; a missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).map_err(|e| HatchError::io(path, e))?;
        Self::parse(&content).map_err(|reason| HatchError::Config {
            path: path.to_path_buf(),
            reason,
        })
    }

    pub fn parse(content: &str) -> std::result::Result<Self, String> {
        let config: Self = toml::from_str(content).map_err(|e| e.to_string())?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> std::result::Result<(), String> {
        // The backup just taken by an apply must survive pruning
        if self.update.backup_retention == 0 {
            return Err("update.backup_retention must be at least 1".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = HatchConfig::default();
        assert_eq!(config.update.backup_retention, 3);
        assert_eq!(config.update.fetch_timeout(), Duration::from_secs(300));
        assert!(config.update.service.is_none());
        assert_eq!(config.modules.on_batch_failure, BatchFailurePolicy::Keep);
    }

    #[test]
    fn test_parse_partial() {
        let config = HatchConfig::parse(
            r#"
            [update]
            backup_retention = 5
            service = "myapp"
            source = { kind = "directory", path = "/srv/releases" }

            [modules]
            on_batch_failure = "unwind"
            "#,
        )
        .unwrap();

        assert_eq!(config.update.backup_retention, 5);
        assert_eq!(config.update.fetch_timeout_secs, 300);
        assert_eq!(config.update.service.as_deref(), Some("myapp"));
        assert_eq!(
            config.update.source,
            Some(SourceConfig::Directory {
                path: PathBuf::from("/srv/releases")
            })
        );
        assert_eq!(config.modules.on_batch_failure, BatchFailurePolicy::Unwind);
    }

    #[test]
    fn test_parse_git_source() {
        let config = HatchConfig::parse(
            r#"
            [update.source]
            kind = "git"
            url = "https://example.org/app.git"
            "#,
        )
        .unwrap();
        assert!(matches!(config.update.source, Some(SourceConfig::Git { .. })));
    }

    #[test]
    fn test_missing_file_is_default() {
        let temp = tempfile::TempDir::new().unwrap();
        let config = HatchConfig::load(&temp.path().join("hatch.toml")).unwrap();
        assert_eq!(config.update.backup_retention, 3);
    }

    #[test]
    fn test_zero_retention_rejected() {
        let err = HatchConfig::parse("[update]\nbackup_retention = 0\n").unwrap_err();
        assert!(err.contains("backup_retention"));

        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("hatch.toml");
        fs::write(&path, "[update]\nbackup_retention = 0\n").unwrap();
        assert!(matches!(
            HatchConfig::load(&path),
            Err(HatchError::Config { .. })
        ));
    }

    #[test]
    fn test_invalid_file_reports_path() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("hatch.toml");
        fs::write(&path, "[update]\nbackup_retention = \"many\"\n").unwrap();
        let err = HatchConfig::load(&path).unwrap_err();
        assert!(matches!(err, HatchError::Config { .. }));
    }
}
