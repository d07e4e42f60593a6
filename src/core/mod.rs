//! Core functionality for the watch face bridge
//! This module contains the radio-facing transport and the session manager
//! built on top of it.

pub mod bluetooth;
pub mod session;

// Re-export commonly used types
pub use bluetooth::{DualTransport, Transport};
pub use session::WatchSession;
