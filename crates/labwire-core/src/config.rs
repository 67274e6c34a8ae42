//! Transport configuration
//!
//! Settings are plain serde structs so a test station can keep one JSON file
//! per device. Missing fields fall back to [`TransportConfig::default`].

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::protocol::{ProtocolError, DEFAULT_BAUD_RATE, DEFAULT_TIMEOUT_MS};

/// Settings for opening and running a transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Serial port name
    pub port_name: String,
    /// Baud rate
    pub baud_rate: u32,
    /// RTS/CTS hardware flow control
    pub flow_control: bool,
    /// Receiver read timeout in microseconds; about one frame time at the
    /// configured rate keeps the receiver responsive without spinning
    pub read_timeout_us: u64,
    /// Largest single read
    pub read_chunk_size: usize,
    /// Inactivity window after which unclaimed frames are discarded
    pub queue_timeout_ms: u64,
    /// Whether the queue monitor runs at all
    pub queue_monitor_enabled: bool,
    /// Default wait for a command response
    pub response_timeout_ms: u64,
    /// Default attempts per command
    pub tries: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: DEFAULT_BAUD_RATE,
            flow_control: false,
            // 7 bytes at 115200 baud, a full HCI Command Complete event
            read_timeout_us: 608,
            read_chunk_size: 1024,
            queue_timeout_ms: 100,
            queue_monitor_enabled: true,
            response_timeout_ms: DEFAULT_TIMEOUT_MS,
            tries: 1,
        }
    }
}

impl TransportConfig {
    /// Byte-queue transport: 1 byte at 3 Mbaud read timeout, 1 MiB reads,
    /// 5 s stale window, monitor off until explicitly enabled
    pub fn raw(port_name: &str, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.to_string(),
            baud_rate,
            flow_control: false,
            read_timeout_us: 3,
            read_chunk_size: 1024 * 1024,
            queue_timeout_ms: 5000,
            queue_monitor_enabled: false,
            ..Self::default()
        }
    }

    /// HCI command transport with RTS/CTS and a 100 ms stale window
    pub fn hci(port_name: &str, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.to_string(),
            baud_rate,
            flow_control: true,
            ..Self::default()
        }
    }

    /// Receiver read timeout
    pub fn read_timeout(&self) -> Duration {
        Duration::from_micros(self.read_timeout_us)
    }

    /// Queue monitor inactivity window
    pub fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_timeout_ms)
    }

    /// Default response wait
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    /// Reject settings that cannot work
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.baud_rate == 0 {
            return Err(ProtocolError::Config("baud_rate must be non-zero".into()));
        }
        if self.read_timeout_us == 0 {
            return Err(ProtocolError::Config(
                "read_timeout_us must be non-zero".into(),
            ));
        }
        if self.read_chunk_size == 0 {
            return Err(ProtocolError::Config(
                "read_chunk_size must be non-zero".into(),
            ));
        }
        if self.tries == 0 {
            return Err(ProtocolError::Config("tries must be at least 1".into()));
        }
        Ok(())
    }

    /// Load from a JSON file
    pub fn load(path: &Path) -> Result<Self, ProtocolError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| ProtocolError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Save as pretty JSON
    pub fn save(&self, path: &Path) -> Result<(), ProtocolError> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ProtocolError::Config(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
