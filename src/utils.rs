use std::path::Path;

use anyhow::Result;
use log::{error, info};
use tokio::fs;

/// Asynchronously ensures that a directory exists, creating it if it does not.
/// This function is idempotent.
pub async fn ensure_directory_exists<P: AsRef<Path>>(path: P) -> Result<()> {
    let path = path.as_ref();
    if !path.exists() {
        if let Err(e) = fs::create_dir_all(path).await {
            error!("Failed to create directory at {:?}: {}", path, e);
            return Err(e.into());
        }
        info!("Created directory at: {:?}", path);
    }
    Ok(())
}

/// Formats a 0..=100 battery level, or "unknown"
pub fn format_battery(level: i32) -> String {
    if (0..=100).contains(&level) {
        format!("{}%", level)
    } else {
        "unknown".to_string()
    }
}
