//! Application state management
//! This module builds the transport and the watch session the commands act on.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{Result, anyhow};
use bluest::Adapter;
use log::info;
use tokio::sync::Mutex;

use crate::config::{AppConfig, SessionConfig};
use crate::core::bluetooth::mock::MockVendorPlugin;
use crate::core::bluetooth::{
    BluetoothScanner, DeviceCache, DeviceSource, DualTransport, GattVendorPlugin, Transport,
};
use crate::core::session::{
    JsonPairingStore, MemoryPairingStore, PairingStore, WatchSession, pairing_path,
};

/// Global application state
pub struct AppState {
    pub config: AppConfig,
    /// The watch session instance
    pub session: Arc<Mutex<WatchSession>>,
}

impl AppState {
    /// Creates the state over the system adapter, or over the in-process
    /// simulator when `simulate` is set. The pairing record lives in `config_dir`.
    pub async fn new(config: AppConfig, config_dir: &Path, simulate: bool) -> Result<Self> {
        let transport: Arc<dyn Transport>;
        let store: Arc<dyn PairingStore>;
        if simulate {
            info!("Using the simulated watch transport");
            let vendor = Arc::new(MockVendorPlugin::simulated());
            transport = DualTransport::new(None, vendor, config.session.auto_connect);
            store = Arc::new(MemoryPairingStore::new());
        } else {
            info!("Initializing Bluetooth transport...");
            transport = build_transport(&config.session).await?;
            store = open_pairing_store(config_dir)?;
        }

        let session = WatchSession::new(transport, store, config.session.clone());
        session.init()?;
        Ok(Self {
            config,
            session: Arc::new(Mutex::new(session)),
        })
    }

    /// Gets a reference to the watch session
    pub fn get_session_arc(&self) -> Arc<Mutex<WatchSession>> {
        self.session.clone()
    }
}

fn open_pairing_store(config_dir: &Path) -> Result<Arc<dyn PairingStore>> {
    let path = pairing_path(config_dir);
    info!("Pairing record at {:?}", path);
    Ok(Arc::new(JsonPairingStore::new(path)?))
}

/// Generic scanner plus GATT vendor plugin over the default adapter
async fn build_transport(config: &SessionConfig) -> Result<Arc<dyn Transport>> {
    let adapter = Adapter::default()
        .await
        .ok_or_else(|| anyhow!("No Bluetooth adapter found"))?;
    let devices: DeviceCache = Arc::new(StdMutex::new(HashMap::new()));
    let cycle = Duration::from_secs(config.scan_cycle_secs);

    let primary = Arc::new(BluetoothScanner::new(
        adapter.clone(),
        devices.clone(),
        DeviceSource::PrimaryScanner,
        Vec::new(),
        cycle,
        config.min_rssi,
    ));
    let vendor = Arc::new(GattVendorPlugin::new(adapter, devices, cycle, config.min_rssi));
    Ok(DualTransport::new(Some(primary), vendor, config.auto_connect))
}

/// Where the config is read from: `--config-dir`, else the user config dir
pub fn resolve_config_dir(explicit: Option<PathBuf>) -> Result<PathBuf> {
    explicit
        .or_else(crate::config::default_config_dir)
        .ok_or_else(|| anyhow!("Cannot determine the user config directory"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pairing_record_follows_the_config_dir() {
        let dir = tempfile::tempdir().unwrap();

        let store = open_pairing_store(dir.path()).unwrap();
        store.set("AA:01", "AW12-X").unwrap();

        assert!(dir.path().join("last_paired.json").is_file());
        assert_eq!(resolve_config_dir(Some(dir.path().to_path_buf())).unwrap(), dir.path());
    }
}
