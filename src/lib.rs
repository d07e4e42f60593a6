//! Watch face bridge library
//! This is the main library for the watch face bridge: BLE discovery,
//! the single watch connection and watch face transfers.

// Module declarations
pub mod commands;
pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod state;
pub mod utils;

pub use error::BridgeError;
