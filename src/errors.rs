use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serial error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("link not ready: {0}")]
    NotReady(String),
    #[error("truncated frame: expected {expected} bytes after start byte, got {got}")]
    TruncatedFrame { expected: usize, got: usize },
    #[error("checksum mismatch: received {received:#04X}, calculated {calculated:#04X}")]
    Checksum { received: u8, calculated: u8 },
    #[error("emergency stop latched; only the raw stop byte is accepted")]
    EmergencyStopLatched,
    #[error("config error: {0}")]
    Config(String),
}

impl DriverError {
    /// Whether this error means the link itself is gone (device removed, OS I/O failure).
    ///
    /// Framing, checksum and decode problems are recoverable and never close the link.
    pub fn is_transport(&self) -> bool {
        matches!(self, DriverError::Io(_) | DriverError::Serial(_))
    }
}

pub type Result<T> = std::result::Result<T, DriverError>;
