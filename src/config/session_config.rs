use std::path::Path;

use anyhow::Result;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::core::bluetooth::{DEFAULT_SCAN_CYCLE_SECS, MIN_RSSI_THRESHOLD};
use crate::utils::ensure_directory_exists;

const CONFIG_FILE_NAME: &str = "session_config.json";

/// Watch session settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Seconds a connect attempt may stay pending before it is abandoned
    pub connect_timeout_secs: u64,
    /// Seconds an upload may run without reaching a terminal progress value
    pub transfer_timeout_secs: u64,
    /// Length of one scan cycle; scanning restarts until stopped
    pub scan_cycle_secs: u64,
    /// Let the vendor plugin retry the connection on its own
    pub auto_connect: bool,
    /// Devices weaker than this are not reported
    pub min_rssi: i16,
    /// Advertised name prefix of the watch family, sorted first for display
    pub product_name_prefix: String,
    /// Face slot used when a package upload names none
    pub default_bin_index: i32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            connect_timeout_secs: 15,
            transfer_timeout_secs: 120,
            scan_cycle_secs: DEFAULT_SCAN_CYCLE_SECS,
            auto_connect: false,
            min_rssi: MIN_RSSI_THRESHOLD,
            product_name_prefix: "AW12".to_string(),
            default_bin_index: 0,
        }
    }
}

impl SessionConfig {
    /// Loads the config from a configuration file.
    pub async fn load_config(config_dir: &Path) -> Result<Self> {
        let file_path = config_dir.join(CONFIG_FILE_NAME);
        let file_path_str = file_path.to_string_lossy().into_owned();

        if !file_path.exists() {
            warn!(
                "Session config file not found at {:?}, using default.",
                file_path_str
            );
            return Ok(Self::default());
        }

        let config_json = fs::read_to_string(file_path).await?;
        let config: Self = serde_json::from_str(&config_json)?;

        info!("Session config loaded from {:?}", file_path_str);
        Ok(config)
    }

    /// Saves the current config to a configuration file.
    pub async fn save_config(&self, config_dir: &Path) -> Result<()> {
        ensure_directory_exists(config_dir).await?;

        let file_path = config_dir.join(CONFIG_FILE_NAME);
        let file_path_str = file_path.to_string_lossy().into_owned();

        let config_json = match serde_json::to_string_pretty(&self) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize session config to JSON: {}", e);
                return Err(e.into());
            }
        };

        fs::write(file_path, config_json).await?;
        info!("Session config saved to {:?}", file_path_str);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = SessionConfig::load_config(dir.path()).await.unwrap();
        assert_eq!(config, SessionConfig::default());
        assert_eq!(config.connect_timeout_secs, 15);
        assert_eq!(config.transfer_timeout_secs, 120);
    }

    #[tokio::test]
    async fn saved_config_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let config_dir = dir.path().join("watchface-bridge");
        let config = SessionConfig {
            auto_connect: true,
            product_name_prefix: "AW20".to_string(),
            ..SessionConfig::default()
        };

        config.save_config(&config_dir).await.unwrap();

        assert_eq!(SessionConfig::load_config(&config_dir).await.unwrap(), config);
    }

    #[tokio::test]
    async fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE_NAME), r#"{"connect_timeout_secs": 30}"#).unwrap();

        let config = SessionConfig::load_config(dir.path()).await.unwrap();

        assert_eq!(config.connect_timeout_secs, 30);
        assert_eq!(config.scan_cycle_secs, 10);
        assert_eq!(config.product_name_prefix, "AW12");
    }
}
