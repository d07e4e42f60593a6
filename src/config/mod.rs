pub mod session_config;

use std::path::{Path, PathBuf};

use anyhow::Result;
use serde::{Deserialize, Serialize};

pub use crate::config::session_config::SessionConfig;

/// Directory name under the user config dir
pub const APP_DIR_NAME: &str = "watchface-bridge";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    pub session: SessionConfig,
}

impl AppConfig {
    pub async fn load(config_dir: &Path) -> Result<Self> {
        Ok(AppConfig {
            session: SessionConfig::load_config(config_dir).await?,
        })
    }
}

/// Returns the per-user config directory of the bridge
pub fn default_config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(APP_DIR_NAME))
}
