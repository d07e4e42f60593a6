//! Data published by the session manager.

use serde::{Deserialize, Serialize};

use crate::core::bluetooth::BATTERY_UNKNOWN;

/// Status of the single logical connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum ConnectionStatus {
    #[default]
    Idle,
    Connecting,
    Connected,
}

/// Snapshot of the process-wide connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionSession {
    pub address: Option<String>,
    pub name: Option<String>,
    pub status: ConnectionStatus,
    /// -1 when unknown, otherwise 0..=100
    pub battery: i32,
    /// Empty when unknown
    pub firmware_version: String,
}

impl ConnectionSession {
    pub fn is_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }
}

impl Default for ConnectionSession {
    fn default() -> Self {
        Self {
            address: None,
            name: None,
            status: ConnectionStatus::Idle,
            battery: BATTERY_UNKNOWN,
            firmware_version: String::new(),
        }
    }
}

/// Identity of the last watch connected successfully
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastPairedDevice {
    pub address: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransferJobKind {
    ImageBackground,
    BinPackage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransferState {
    Preparing,
    InProgress,
    Complete,
    Failed,
}

impl TransferState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed)
    }
}

/// One republished transfer progress value
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferProgress {
    pub job_id: u64,
    pub kind: TransferJobKind,
    /// -1 before the first value, then the transport value verbatim
    pub progress: i32,
    pub state: TransferState,
}

/// Category of an error event. Data and radio errors are returned to the
/// caller instead of published.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    Transport,
    Timeout,
    Disconnected,
}

/// User-facing error published on the error stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorEvent {
    pub kind: ErrorKind,
    pub message: String,
    pub code: Option<i32>,
}

impl ErrorEvent {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(mut self, code: i32) -> Self {
        self.code = Some(code);
        self
    }

    pub fn connection_timed_out() -> Self {
        Self::new(ErrorKind::Timeout, "connection timed out")
    }

    pub fn device_disconnected() -> Self {
        Self::new(ErrorKind::Disconnected, "device disconnected")
    }
}
