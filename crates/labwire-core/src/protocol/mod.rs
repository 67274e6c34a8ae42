//! Serial transport and HCI command protocol
//!
//! A [`Transport`] reads the serial device on a background thread, turns the
//! byte stream into frames with a [`FrameDecoder`] and queues them in an
//! inbox. Unclaimed frames are dropped by a queue monitor after a period of
//! inactivity. On top of that sit command/response exchanges
//! ([`Transport::send_command_wait_response`]), controller commands and
//! chunked memory transfers ([`BulkTransfer`]).

pub mod bulk;
pub mod commands;
pub mod decoder;
mod error;
pub mod hci;
pub mod inbox;
pub mod monitor;
mod receiver;
pub mod request;
pub mod serial;
pub mod stream;
mod transport;

pub use bulk::{BulkConfig, BulkTransfer, FLASH_PAD};
pub use decoder::{DecodeError, Decoded, FrameAssembler, FrameDecoder, RawDecoder, WireFrame};
pub use error::ProtocolError;
pub use hci::{opcode, CommandPacket, HciDecoder, HciFrame, PacketKind, Status};
pub use request::CommandResponse;
pub use serial::{list_ports, open_port, ports_for_serial_number, PortInfo};
pub use stream::{memory_pair, CommunicationChannel, DeviceHandle, MemoryChannel};
pub use transport::{
    Counters, HciTransport, RawTransport, Transport, TransportCounters, TransportState,
};

/// Default baud rate
pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// Default wait for a command response in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 1000;

/// Size of the settings area
pub const MAX_SETTINGS_SIZE: usize = 256;
