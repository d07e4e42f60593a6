use std::path::PathBuf;

use thiserror::Error;

use crate::core::session::PairingError;

/// Errors returned by session operations
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("bluetooth is unavailable or switched off")]
    RadioUnavailable,

    #[error("no watch connected")]
    NotConnected,

    #[error("another transfer or watch face operation is in progress")]
    Busy,

    #[error("file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("unsupported file {path}: expected a .{expected} file")]
    WrongExtension { path: PathBuf, expected: &'static str },

    #[error("cannot decode image {path}: {reason}")]
    ImageDecode { path: PathBuf, reason: String },

    #[error("transport error: {0}")]
    Transport(#[from] anyhow::Error),

    #[error("pairing store error: {0}")]
    Storage(#[from] PairingError),

    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("session has been disposed")]
    Disposed,
}
