//! # labwire Core Library
//!
//! Serial transport for test benches that drive Bluetooth controllers and
//! debug probes.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - A background receiver that turns a serial byte stream into frames
//! - A frame inbox with automatic eviction of stale, unclaimed frames
//! - Command/response exchanges with per-attempt timeouts and retries
//! - HCI packet framing and vendor commands for firmware download
//! - Chunked memory writes with sparse skipping and CRC verification
//! - An in-memory controller simulator for tests
//!
//! ## Example
//!
//! ```rust,ignore
//! use labwire_core::prelude::*;
//!
//! let transport = HciTransport::hci(TransportConfig::hci("/dev/ttyUSB0", 115200));
//! transport.open()?;
//! transport.reset()?;
//! transport.download_minidriver()?;
//! BulkTransfer::ram(&transport).write(0x0021_0000, &image, FLASH_PAD, true)?;
//! transport.launch_ram(0x0021_0000)?;
//! ```

pub mod config;
pub mod protocol;
pub mod simulator;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::TransportConfig;
    pub use crate::protocol::{
        opcode, BulkConfig, BulkTransfer, CommandPacket, HciFrame, HciTransport, ProtocolError,
        RawTransport, Status, TransportCounters, TransportState, FLASH_PAD,
    };
    pub use crate::simulator::HciSimulator;
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
