//! Bluetooth functionality for the watch face bridge
//! This module handles all radio-facing operations: scanning with two
//! discovery sources, connecting, vendor commands and file transfers.

mod commands;
mod connection;
mod constants;
pub mod mock;
mod notification;
mod plugin;
mod scanner;
mod transport;
mod types;

// Re-export types that should be publicly accessible
pub use commands::{FrameSender, TransferExecutor, TransferFrame, TransferKind};
pub use connection::{BluestFrameSender, ConnectionManager, WatchLink};
pub use constants::*; // Re-export all constants
pub use notification::NotificationHandler;
pub use plugin::GattVendorPlugin;
pub use scanner::{BluetoothScanner, DeviceCache, extract_mac_address};
pub use transport::{DualTransport, ScanProvider, Transport, TransportChannels, VendorPlugin};
pub use types::{
    BackgroundImage, CommandReply, DeviceSource, DiscoveredDevice, FileTransferEvent, LinkState,
    VendorCommand, VendorEvent,
};
