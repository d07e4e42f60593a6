//! Constants used throughout the application
//! This module contains all the constant values used in the application,
//! such as UUIDs, vendor codes, timeouts, and other configuration values.

use uuid::Uuid;

/// Standard Bluetooth Service UUIDs
pub const UUID_DEVICE_INFORMATION_SERVICE: Uuid = Uuid::from_u128(0x0000180a_0000_1000_8000_00805f9b34fb);
pub const UUID_BATTERY_SERVICE: Uuid = Uuid::from_u128(0x0000180f_0000_1000_8000_00805f9b34fb);

/// Standard Bluetooth Characteristic UUIDs
pub const UUID_FIRMWARE_REVISION: Uuid = Uuid::from_u128(0x00002a26_0000_1000_8000_00805f9b34fb);
pub const UUID_BATTERY_LEVEL: Uuid = Uuid::from_u128(0x00002a19_0000_1000_8000_00805f9b34fb);

/// The UUID of the vendor watch service
pub const UUID_WATCH_SERVICE: Uuid = Uuid::from_u128(0x0000fee7_0000_1000_8000_00805f9b34fb);

/// Vendor characteristic holding the displayed watch face index (read/write, 1 byte)
pub const UUID_WATCH_FACE_CHAR: Uuid = Uuid::from_u128(0x0000fec8_0000_1000_8000_00805f9b34fb);

/// Vendor characteristic receiving file-transfer frames
pub const UUID_WATCH_TRANSFER_CHAR: Uuid = Uuid::from_u128(0x0000fec9_0000_1000_8000_00805f9b34fb);

/// Vendor connection-state codes
pub const VENDOR_STATE_DISCONNECTED: i32 = 0;
pub const VENDOR_STATE_CONNECTING: i32 = 1;
pub const VENDOR_STATE_CONNECTED: i32 = 2;
pub const VENDOR_STATE_DISCONNECTING: i32 = 3;

/// Vendor file-transfer error codes
pub const TRANSFER_ERROR_WRITE_FAILED: i32 = 1;
pub const TRANSFER_ERROR_TIMEOUT: i32 = 2;
pub const TRANSFER_ERROR_FILE_READ: i32 = 3;
pub const TRANSFER_ERROR_NOT_CONNECTED: i32 = 4;

/// Battery value meaning "unknown"
pub const BATTERY_UNKNOWN: i32 = -1;

/// Maximum number of connection retries when auto-connect is enabled
pub const MAX_CONNECT_RETRIES: u32 = 5;

/// Delay between connection retries in milliseconds
pub const CONNECT_RETRY_DELAY_MS: u64 = 1000;

/// Default duration of one scan cycle in seconds
pub const DEFAULT_SCAN_CYCLE_SECS: u64 = 10;

/// Devices weaker than this are not reported by the generic scanner
pub const MIN_RSSI_THRESHOLD: i16 = -90;

/// Opcode and offset bytes in front of every DATA frame payload
pub const DATA_FRAME_HEADER_LEN: usize = 5;

/// Write length of a link that never negotiated a larger MTU
pub const DEFAULT_MAX_WRITE_LEN: usize = 20;

/// How long the adapter gets to report itself powered on
pub const RADIO_READY_TIMEOUT_MS: u64 = 500;

/// Capacity of every broadcast channel
pub const EVENT_CHANNEL_CAPACITY: usize = 64;
