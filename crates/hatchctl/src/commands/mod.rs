//! Command handlers for hatchctl.

pub mod module;
pub mod status;
pub mod update;

use std::path::PathBuf;

use anyhow::Result;
use hatch_common::{HatchConfig, InstallLayout};
use tracing::debug;

/// Root used when neither `--root` nor `HATCH_ROOT` is given
pub const DEFAULT_ROOT: &str = "/opt/hatch";

pub const ROOT_ENV: &str = "HATCH_ROOT";

/// Installation root and its configuration
pub struct Context {
    pub layout: InstallLayout,
    pub config: HatchConfig,
}

impl Context {
    pub fn open(root: Option<PathBuf>, config: Option<PathBuf>) -> Result<Self> {
        let root = root
            .or_else(|| std::env::var_os(ROOT_ENV).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_ROOT));
        let layout = InstallLayout::new(root);

        let config_path = config.unwrap_or_else(|| layout.config_file());
        let config = HatchConfig::load(&config_path)?;
        debug!(
            "Root {}, config {}",
            layout.root().display(),
            config_path.display()
        );

        Ok(Self { layout, config })
    }
}
