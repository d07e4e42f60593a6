//! Defines shared data structures for the Bluetooth module.

use std::path::PathBuf;

use serde::Serialize;

/// Which discovery source reported a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceSource {
    /// The generic BLE scanner
    PrimaryScanner,
    /// The vendor plugin's own scanner
    VendorScanner,
}

/// Represents a discovered Bluetooth device
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveredDevice {
    /// The advertised name of the device
    pub name: String,
    /// The hardware address of the device, unique key in the registry
    pub address: String,
    /// The signal strength (RSSI) of the device
    pub rssi: i16,
    /// The scanner that reported the device first
    pub source: DeviceSource,
}

impl DiscoveredDevice {
    /// Creates a new DiscoveredDevice instance
    pub fn new(name: impl Into<String>, address: impl Into<String>, rssi: i16, source: DeviceSource) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            rssi,
            source,
        }
    }

    /// Returns true if the advertised name belongs to the given product family
    pub fn matches_product(&self, product_prefix: &str) -> bool {
        !product_prefix.is_empty() && self.name.starts_with(product_prefix)
    }
}

/// Vendor-agnostic link state reported by the transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum LinkState {
    /// Link up to the watch at this address
    Connected(String),
    Disconnected,
}

/// One file-transfer notification: a progress code and an optional error code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FileTransferEvent {
    pub progress: i32,
    pub error: Option<i32>,
}

impl FileTransferEvent {
    pub fn progress(progress: i32) -> Self {
        Self { progress, error: None }
    }

    pub fn failed(error: i32) -> Self {
        Self { progress: -1, error: Some(error) }
    }
}

/// Raw notifications as emitted by a vendor plugin, still carrying vendor codes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VendorEvent {
    /// Vendor connection-state code for the watch at `address`
    ConnectionState { code: i32, address: String },
    /// Battery level, 0..=100 or a vendor "unknown" marker
    Battery(i32),
    /// Firmware/info response
    Info(String),
    /// File-transfer progress
    FileTransfer(FileTransferEvent),
}

impl VendorEvent {
    pub fn connection_state(code: i32, address: impl Into<String>) -> Self {
        Self::ConnectionState {
            code,
            address: address.into(),
        }
    }
}

/// A transcoded background image ready for the vendor command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackgroundImage {
    pub primary: Vec<u8>,
    pub thumbnail: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub thumb_width: u32,
    pub thumb_height: u32,
    /// Type tag carried with the command
    pub kind: String,
}

/// Commands understood by the vendor protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VendorCommand {
    QueryFirmwareVersion,
    /// Result arrives through the battery notification channel
    QueryBattery,
    QueryDisplayFace,
    SetDisplayFace(i32),
    SendBackgroundImage {
        image: BackgroundImage,
        timeout_secs: u64,
    },
    SendBinPackage {
        path: PathBuf,
        index: i32,
        timeout_secs: u64,
    },
    /// Stops the running file transfer, if any
    CancelTransfer,
}

impl VendorCommand {
    /// Short name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            Self::QueryFirmwareVersion => "query_firmware_version",
            Self::QueryBattery => "query_battery",
            Self::QueryDisplayFace => "query_display_face",
            Self::SetDisplayFace(_) => "set_display_face",
            Self::SendBackgroundImage { .. } => "send_background_image",
            Self::SendBinPackage { .. } => "send_bin_package",
            Self::CancelTransfer => "cancel_transfer",
        }
    }
}

/// Return value of a vendor command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandReply {
    Done,
    FirmwareVersion(String),
    DisplayFace(i32),
}
