//! Protocol errors

use thiserror::Error;

/// Errors that can occur while talking to a device over a transport
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Serial port error: {0}")]
    SerialError(String),

    #[error("Response timeout")]
    Timeout,

    #[error("Transport is not open")]
    NotOpen,

    #[error("Transport closed while waiting for a response")]
    Closed,

    #[error("Malformed frame: {0}")]
    Malformed(String),

    #[error("Command {opcode:#06x} failed: no valid response")]
    CommandFailed { opcode: u16 },

    #[error("Failed to write to address {address:#010x}")]
    WriteFailed { address: u32 },

    #[error("Failed to read from address {address:#010x}: expected {expected} bytes, got {actual}")]
    ReadFailed {
        address: u32,
        expected: usize,
        actual: usize,
    },

    #[error(
        "Write verification failed at {address:#010x}: device CRC {observed:#010x} != data CRC {computed:#010x}"
    )]
    VerifyMismatch {
        address: u32,
        computed: u32,
        observed: u32,
    },

    #[error("Settings size is too large: {size} (max {max})")]
    SettingsTooLarge { size: usize, max: usize },

    #[error("Port not found: {0}")]
    PortNotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl From<serialport::Error> for ProtocolError {
    fn from(e: serialport::Error) -> Self {
        match e.kind() {
            serialport::ErrorKind::NoDevice => ProtocolError::PortNotFound(e.description),
            _ => ProtocolError::SerialError(e.description),
        }
    }
}
