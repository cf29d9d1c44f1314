//! Link and polling settings.
//!
//! Settings come from an optional JSON file (the bench's `settings.json`) and may be
//! overridden field by field from the command line. Every field has a default, so an
//! empty object or a missing file yields a working configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{DriverError, Result};

/// Default serial baud rate of the bench controller.
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Default bound on a single blocking read.
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 100;

/// Default interval between two polling ticks.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 30;

/// Default time allowed for the device to answer `READY` after the port opens.
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 4_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub baud_rate: u32,
    pub read_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub handshake_timeout_ms: u64,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            read_timeout_ms: DEFAULT_READ_TIMEOUT_MS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
        }
    }
}

impl LinkConfig {
    /// Load settings from a JSON file. Unknown keys are ignored.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
            .map_err(|e| DriverError::Config(format!("{}: {e}", path.display())))
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let config: LinkConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the poll loop spin or block forever.
    pub fn validate(&self) -> Result<()> {
        if self.baud_rate == 0 {
            return Err(DriverError::Config("baud_rate must be positive".into()));
        }
        if self.read_timeout_ms == 0 {
            return Err(DriverError::Config(
                "read_timeout_ms must be positive".into(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(DriverError::Config(
                "poll_interval_ms must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}
