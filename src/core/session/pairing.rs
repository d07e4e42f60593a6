//! Last-paired device persistence.
//!
//! The session only relies on the three-operation [`PairingStore`] contract;
//! the JSON file store is the default medium.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use log::debug;

use crate::core::session::types::LastPairedDevice;

/// Errors from pairing store operations.
#[derive(Debug, thiserror::Error)]
pub enum PairingError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Durable record of the last paired watch.
pub trait PairingStore: Send + Sync {
    fn get(&self) -> Result<Option<LastPairedDevice>, PairingError>;
    fn set(&self, address: &str, name: &str) -> Result<(), PairingError>;
    fn clear(&self) -> Result<(), PairingError>;
}

/// Pairing record cached in memory and persisted to a JSON file.
pub struct JsonPairingStore {
    path: PathBuf,
    record: Mutex<Option<LastPairedDevice>>,
}

impl JsonPairingStore {
    /// Creates the store, loading an existing record from disk.
    pub fn new(path: PathBuf) -> Result<Self, PairingError> {
        let record = load_record(&path)?;
        Ok(Self {
            path,
            record: Mutex::new(record),
        })
    }

    fn persist(&self, record: Option<&LastPairedDevice>) -> Result<(), PairingError> {
        match record {
            Some(record) => {
                let json = serde_json::to_string_pretty(record)?;
                if let Some(parent) = self.path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(&self.path, json)?;
                debug!("persisted pairing record for {} to {:?}", record.address, self.path);
            }
            None => {
                if self.path.exists() {
                    std::fs::remove_file(&self.path)?;
                }
                debug!("removed pairing record {:?}", self.path);
            }
        }
        Ok(())
    }
}

impl PairingStore for JsonPairingStore {
    fn get(&self) -> Result<Option<LastPairedDevice>, PairingError> {
        Ok(self.record.lock().unwrap().clone())
    }

    fn set(&self, address: &str, name: &str) -> Result<(), PairingError> {
        let record = LastPairedDevice {
            address: address.to_string(),
            name: name.to_string(),
        };
        let mut guard = self.record.lock().unwrap();
        self.persist(Some(&record))?;
        *guard = Some(record);
        Ok(())
    }

    fn clear(&self) -> Result<(), PairingError> {
        let mut guard = self.record.lock().unwrap();
        self.persist(None)?;
        *guard = None;
        Ok(())
    }
}

/// Loads the record from a JSON file on disk.
fn load_record(path: &Path) -> Result<Option<LastPairedDevice>, PairingError> {
    if !path.exists() {
        return Ok(None);
    }
    let data = std::fs::read_to_string(path)?;
    let record: LastPairedDevice = serde_json::from_str(&data)?;
    debug!("loaded pairing record for {} from {:?}", record.address, path);
    Ok(Some(record))
}

/// File name of the pairing record inside the config directory.
pub const PAIRING_FILE_NAME: &str = "last_paired.json";

/// Returns the pairing record path inside `config_dir`.
pub fn pairing_path(config_dir: &Path) -> PathBuf {
    config_dir.join(PAIRING_FILE_NAME)
}

/// Pairing record that lives only as long as the process.
#[derive(Default)]
pub struct MemoryPairingStore {
    record: Mutex<Option<LastPairedDevice>>,
}

impl MemoryPairingStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PairingStore for MemoryPairingStore {
    fn get(&self) -> Result<Option<LastPairedDevice>, PairingError> {
        Ok(self.record.lock().unwrap().clone())
    }

    fn set(&self, address: &str, name: &str) -> Result<(), PairingError> {
        *self.record.lock().unwrap() = Some(LastPairedDevice {
            address: address.to_string(),
            name: name.to_string(),
        });
        Ok(())
    }

    fn clear(&self) -> Result<(), PairingError> {
        self.record.lock().unwrap().take();
        Ok(())
    }
}
