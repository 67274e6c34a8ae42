//! HCI packet encoding/decoding
//!
//! Implements the HCI UART transport framing used by Bluetooth controllers.
//!
//! Packet formats (all multi-byte fields little-endian):
//! - Command:  `0x01`, opcode (2), parameter length (1), parameters
//! - ACL data: `0x02`, handle (2), data length (2), data
//! - Event:    `0x04`, event code (1), parameter length (1), parameters
//!
//! Command Complete events carry `num_packets, opcode, status, return params`;
//! Command Status events carry `status, num_packets, opcode`.

use byteorder::{ByteOrder, LittleEndian};

use super::decoder::{DecodeError, Decoded, FrameDecoder, WireFrame};
use super::request::CommandResponse;
use super::ProtocolError;

/// Packet type indicator for commands
pub const PACKET_COMMAND: u8 = 0x01;
/// Packet type indicator for ACL data
pub const PACKET_ACL: u8 = 0x02;
/// Packet type indicator for events
pub const PACKET_EVENT: u8 = 0x04;

/// Command Complete event code
pub const EVENT_COMMAND_COMPLETE: u8 = 0x0E;
/// Command Status event code
pub const EVENT_COMMAND_STATUS: u8 = 0x0F;

/// Largest parameter block a command packet can carry
pub const MAX_COMMAND_PARAMS: usize = 255;

/// Largest return parameter block a Command Complete event can carry: the
/// 255-byte event parameters minus packet count, opcode and status
pub const MAX_RETURN_PARAMS: usize = 251;

/// Opcodes used by this crate. Vendor specific commands live in the 0xFCxx
/// range on Infineon/Cypress controllers.
pub mod opcode {
    /// HCI_Reset
    pub const RESET: u16 = 0x0C03;
    /// Enter minidriver download mode
    pub const DOWNLOAD_MINIDRIVER: u16 = 0xFC2E;
    /// Write a block of RAM/flash
    pub const WRITE_RAM: u16 = 0xFC4C;
    /// Read a block of RAM/flash
    pub const READ_RAM: u16 = 0xFC4D;
    /// Jump to an address
    pub const LAUNCH_RAM: u16 = 0xFC4E;
    /// Change the controller UART rate
    pub const UPDATE_BAUDRATE: u16 = 0xFC18;
    /// Erase all flash
    pub const CHIP_ERASE: u16 = 0xFFCE;
    /// CRC-32 over an address range
    pub const VERIFY_CRC: u16 = 0xFCCC;
}

/// HCI status codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// 0x00
    Success,
    /// 0x01
    UnknownCommand,
    /// 0x02
    UnknownConnectionId,
    /// 0x03
    HardwareFailure,
    /// 0x04
    PageTimeout,
    /// 0x05
    AuthenticationFailure,
    /// 0x07
    MemoryCapacityExceeded,
    /// 0x0C
    CommandDisallowed,
    /// 0x11
    UnsupportedFeature,
    /// 0x12
    InvalidParameters,
    /// 0x1F
    UnspecifiedError,
    /// Any code without a name here
    Other(u8),
}

impl Status {
    /// Decode a status byte
    pub fn from_byte(b: u8) -> Self {
        match b {
            0x00 => Status::Success,
            0x01 => Status::UnknownCommand,
            0x02 => Status::UnknownConnectionId,
            0x03 => Status::HardwareFailure,
            0x04 => Status::PageTimeout,
            0x05 => Status::AuthenticationFailure,
            0x07 => Status::MemoryCapacityExceeded,
            0x0C => Status::CommandDisallowed,
            0x11 => Status::UnsupportedFeature,
            0x12 => Status::InvalidParameters,
            0x1F => Status::UnspecifiedError,
            other => Status::Other(other),
        }
    }

    /// Wire value
    pub fn to_byte(self) -> u8 {
        match self {
            Status::Success => 0x00,
            Status::UnknownCommand => 0x01,
            Status::UnknownConnectionId => 0x02,
            Status::HardwareFailure => 0x03,
            Status::PageTimeout => 0x04,
            Status::AuthenticationFailure => 0x05,
            Status::MemoryCapacityExceeded => 0x07,
            Status::CommandDisallowed => 0x0C,
            Status::UnsupportedFeature => 0x11,
            Status::InvalidParameters => 0x12,
            Status::UnspecifiedError => 0x1F,
            Status::Other(b) => b,
        }
    }
}

/// Which HCI packet a frame came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    /// Host to controller command
    Command,
    /// ACL data
    AclData,
    /// Event with its event code
    Event(u8),
}

/// One decoded HCI packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HciFrame {
    kind: PacketKind,
    opcode: Option<u16>,
    status: Option<Status>,
    payload: Vec<u8>,
    raw: Vec<u8>,
}

impl HciFrame {
    /// Packet type
    pub fn kind(&self) -> PacketKind {
        self.kind
    }

    /// Command opcode this packet refers to, if any
    pub fn opcode(&self) -> Option<u16> {
        self.opcode
    }

    /// Completion status, for Command Complete/Status events
    pub fn status(&self) -> Option<Status> {
        self.status
    }

    /// Return parameters (Command Complete), parameters (commands, other
    /// events) or data (ACL)
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Full wire encoding
    pub fn raw_bytes(&self) -> &[u8] {
        &self.raw
    }
}

impl WireFrame for HciFrame {
    fn raw(&self) -> &[u8] {
        &self.raw
    }
}

impl CommandResponse for HciFrame {
    fn response_opcode(&self) -> Option<u16> {
        match self.kind {
            PacketKind::Event(EVENT_COMMAND_COMPLETE) | PacketKind::Event(EVENT_COMMAND_STATUS) => {
                self.opcode
            }
            _ => None,
        }
    }

    fn is_success(&self) -> bool {
        self.status == Some(Status::Success)
    }

    fn return_payload(&self) -> &[u8] {
        &self.payload
    }
}

fn malformed(reason: String) -> DecodeError {
    DecodeError::new(reason)
}

/// Decode one packet from the front of `buf`.
///
/// Returns `Ok(None)` when the packet is not complete yet, and the frame with
/// its encoded length otherwise.
pub fn decode_packet(buf: &[u8]) -> Result<Option<(HciFrame, usize)>, DecodeError> {
    let Some(&packet_type) = buf.first() else {
        return Ok(None);
    };

    match packet_type {
        PACKET_COMMAND => {
            if buf.len() < 4 {
                return Ok(None);
            }
            let total = 4 + buf[3] as usize;
            if buf.len() < total {
                return Ok(None);
            }
            let frame = HciFrame {
                kind: PacketKind::Command,
                opcode: Some(LittleEndian::read_u16(&buf[1..3])),
                status: None,
                payload: buf[4..total].to_vec(),
                raw: buf[..total].to_vec(),
            };
            Ok(Some((frame, total)))
        }
        PACKET_ACL => {
            if buf.len() < 5 {
                return Ok(None);
            }
            let total = 5 + LittleEndian::read_u16(&buf[3..5]) as usize;
            if buf.len() < total {
                return Ok(None);
            }
            let frame = HciFrame {
                kind: PacketKind::AclData,
                opcode: None,
                status: None,
                payload: buf[5..total].to_vec(),
                raw: buf[..total].to_vec(),
            };
            Ok(Some((frame, total)))
        }
        PACKET_EVENT => {
            if buf.len() < 3 {
                return Ok(None);
            }
            let event_code = buf[1];
            let total = 3 + buf[2] as usize;
            if buf.len() < total {
                return Ok(None);
            }
            let params = &buf[3..total];
            let (opcode, status, payload) = match event_code {
                EVENT_COMMAND_COMPLETE => {
                    if params.len() < 3 {
                        return Err(malformed(format!(
                            "command complete with {} parameter bytes",
                            params.len()
                        )));
                    }
                    let opcode = LittleEndian::read_u16(&params[1..3]);
                    let status = params.get(3).map(|&b| Status::from_byte(b));
                    let payload = params.get(4..).unwrap_or_default().to_vec();
                    (Some(opcode), status, payload)
                }
                EVENT_COMMAND_STATUS => {
                    if params.len() < 4 {
                        return Err(malformed(format!(
                            "command status with {} parameter bytes",
                            params.len()
                        )));
                    }
                    let opcode = LittleEndian::read_u16(&params[2..4]);
                    (Some(opcode), Some(Status::from_byte(params[0])), Vec::new())
                }
                _ => (None, None, params.to_vec()),
            };
            let frame = HciFrame {
                kind: PacketKind::Event(event_code),
                opcode,
                status,
                payload,
                raw: buf[..total].to_vec(),
            };
            Ok(Some((frame, total)))
        }
        other => Err(malformed(format!("unknown packet type {:#04x}", other))),
    }
}

/// Decoder for HCI UART packets
#[derive(Debug, Clone, Copy, Default)]
pub struct HciDecoder;

impl FrameDecoder for HciDecoder {
    type Frame = HciFrame;

    fn decode(&self, buf: &[u8]) -> Result<Decoded<HciFrame>, DecodeError> {
        let mut decoded = Decoded::incomplete();
        loop {
            match decode_packet(&buf[decoded.consumed..]) {
                Ok(Some((frame, len))) => {
                    decoded.frames.push(frame);
                    decoded.consumed += len;
                }
                Ok(None) => break,
                // Keep what we have; the bad bytes are reported on the next call
                Err(_) if !decoded.frames.is_empty() => break,
                Err(e) => return Err(e),
            }
        }
        Ok(decoded)
    }
}

/// An outgoing HCI command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandPacket {
    opcode: u16,
    params: Vec<u8>,
}

impl CommandPacket {
    /// Create a command, rejecting parameter blocks that do not fit the
    /// one-byte length field
    pub fn new(opcode: u16, params: impl Into<Vec<u8>>) -> Result<Self, ProtocolError> {
        let params = params.into();
        if params.len() > MAX_COMMAND_PARAMS {
            return Err(ProtocolError::Malformed(format!(
                "command {:#06x} parameters too long: {} bytes",
                opcode,
                params.len()
            )));
        }
        Ok(Self { opcode, params })
    }

    /// A command without parameters
    pub fn empty(opcode: u16) -> Self {
        Self {
            opcode,
            params: Vec::new(),
        }
    }

    /// Start building a command's parameters
    pub fn builder(opcode: u16) -> CommandBuilder {
        CommandBuilder {
            opcode,
            params: Vec::new(),
        }
    }

    /// Opcode
    pub fn opcode(&self) -> u16 {
        self.opcode
    }

    /// Parameters
    pub fn params(&self) -> &[u8] {
        &self.params
    }

    /// Encode to wire bytes
    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.encoded_size());
        bytes.push(PACKET_COMMAND);
        let mut op = [0u8; 2];
        LittleEndian::write_u16(&mut op, self.opcode);
        bytes.extend_from_slice(&op);
        bytes.push(self.params.len() as u8);
        bytes.extend_from_slice(&self.params);
        bytes
    }

    /// Get the total encoded size
    pub fn encoded_size(&self) -> usize {
        4 + self.params.len()
    }
}

/// Builder for command parameters
pub struct CommandBuilder {
    opcode: u16,
    params: Vec<u8>,
}

impl CommandBuilder {
    /// Add a single byte
    pub fn byte(mut self, b: u8) -> Self {
        self.params.push(b);
        self
    }

    /// Add a 16-bit value (little-endian)
    pub fn u16_le(mut self, value: u16) -> Self {
        let mut bytes = [0u8; 2];
        LittleEndian::write_u16(&mut bytes, value);
        self.params.extend_from_slice(&bytes);
        self
    }

    /// Add a 32-bit value (little-endian)
    pub fn u32_le(mut self, value: u32) -> Self {
        let mut bytes = [0u8; 4];
        LittleEndian::write_u32(&mut bytes, value);
        self.params.extend_from_slice(&bytes);
        self
    }

    /// Add raw bytes
    pub fn bytes(mut self, data: &[u8]) -> Self {
        self.params.extend_from_slice(data);
        self
    }

    /// Build the command
    pub fn build(self) -> Result<CommandPacket, ProtocolError> {
        CommandPacket::new(self.opcode, self.params)
    }
}

/// Encode a Command Complete event, as a controller would send it
pub fn command_complete(
    opcode: u16,
    status: Status,
    return_params: &[u8],
) -> Result<Vec<u8>, ProtocolError> {
    if return_params.len() > MAX_RETURN_PARAMS {
        return Err(ProtocolError::Malformed(format!(
            "command complete {:#06x} return parameters too long: {} bytes",
            opcode,
            return_params.len()
        )));
    }
    let mut bytes = vec![
        PACKET_EVENT,
        EVENT_COMMAND_COMPLETE,
        (4 + return_params.len()) as u8,
        1,
    ];
    let mut op = [0u8; 2];
    LittleEndian::write_u16(&mut op, opcode);
    bytes.extend_from_slice(&op);
    bytes.push(status.to_byte());
    bytes.extend_from_slice(return_params);
    Ok(bytes)
}

/// Encode a Command Status event
pub fn command_status(opcode: u16, status: Status) -> Vec<u8> {
    let mut bytes = vec![PACKET_EVENT, EVENT_COMMAND_STATUS, 4, status.to_byte(), 1];
    let mut op = [0u8; 2];
    LittleEndian::write_u16(&mut op, opcode);
    bytes.extend_from_slice(&op);
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_reset_command_encoding() {
        let reset = CommandPacket::empty(opcode::RESET);
        assert_eq!(reset.encode(), vec![0x01, 0x03, 0x0C, 0x00]);
    }

    #[test]
    fn test_builder_little_endian_fields() {
        let cmd = CommandPacket::builder(opcode::VERIFY_CRC)
            .u32_le(0x0010_2030)
            .u32_le(240)
            .build()
            .unwrap();
        assert_eq!(
            cmd.encode(),
            vec![0x01, 0xCC, 0xFC, 8, 0x30, 0x20, 0x10, 0x00, 240, 0, 0, 0]
        );
    }

    #[test]
    fn test_params_too_long_rejected() {
        assert!(CommandPacket::new(opcode::WRITE_RAM, vec![0u8; 256]).is_err());
        assert!(CommandPacket::new(opcode::WRITE_RAM, vec![0u8; 255]).is_ok());
    }

    #[test]
    fn test_command_complete_size_limit() {
        let full = command_complete(opcode::READ_RAM, Status::Success, &[0u8; 251]).unwrap();
        assert_eq!(full[2], 255);
        assert!(matches!(
            command_complete(opcode::READ_RAM, Status::Success, &[0u8; 252]),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_decode_command_complete() {
        let bytes = command_complete(0x0003, Status::Success, &[0x01, 0x02]).unwrap();
        assert_eq!(bytes, vec![0x04, 0x0E, 6, 1, 0x03, 0x00, 0x00, 0x01, 0x02]);
        let decoded = HciDecoder.decode(&bytes).unwrap();
        assert_eq!(decoded.consumed, bytes.len());
        let frame = &decoded.frames[0];
        assert_eq!(frame.kind(), PacketKind::Event(EVENT_COMMAND_COMPLETE));
        assert_eq!(frame.opcode(), Some(0x0003));
        assert_eq!(frame.status(), Some(Status::Success));
        assert_eq!(frame.payload(), &[0x01, 0x02]);
        assert_eq!(frame.raw_bytes(), bytes.as_slice());
    }

    #[test]
    fn test_decode_command_status() {
        let bytes = command_status(opcode::CHIP_ERASE, Status::CommandDisallowed);
        let frame = decode_packet(&bytes).unwrap().unwrap().0;
        assert_eq!(frame.opcode(), Some(opcode::CHIP_ERASE));
        assert_eq!(frame.status(), Some(Status::CommandDisallowed));
        assert!(!frame.is_success());
    }

    #[test]
    fn test_decode_incomplete_event() {
        let bytes = command_complete(opcode::RESET, Status::Success, &[]).unwrap();
        for cut in 0..bytes.len() {
            let decoded = HciDecoder.decode(&bytes[..cut]).unwrap();
            assert!(decoded.frames.is_empty());
            assert_eq!(decoded.consumed, 0);
        }
    }

    #[test]
    fn test_decode_multiple_and_acl() {
        let mut bytes = command_complete(opcode::RESET, Status::Success, &[]).unwrap();
        bytes.extend_from_slice(&[0x02, 0x40, 0x00, 0x02, 0x00, 0xAA, 0xBB]);
        bytes.extend_from_slice(&[0x04, 0x3E]); // partial LE meta event
        let decoded = HciDecoder.decode(&bytes).unwrap();
        assert_eq!(decoded.frames.len(), 2);
        assert_eq!(decoded.frames[1].kind(), PacketKind::AclData);
        assert_eq!(decoded.frames[1].payload(), &[0xAA, 0xBB]);
        assert_eq!(decoded.consumed, bytes.len() - 2);
    }

    #[test]
    fn test_unknown_packet_type_is_malformed() {
        assert!(HciDecoder.decode(&[0x00, 0x04, 0x0E]).is_err());
    }

    #[test]
    fn test_frames_before_garbage_are_kept() {
        let mut bytes = command_complete(opcode::RESET, Status::Success, &[]).unwrap();
        bytes.push(0xFF);
        let decoded = HciDecoder.decode(&bytes).unwrap();
        assert_eq!(decoded.frames.len(), 1);
        assert_eq!(decoded.consumed, bytes.len() - 1);
    }

    #[test]
    fn test_command_packet_decodes_as_command() {
        let cmd = CommandPacket::new(0x0003, vec![9u8]).unwrap();
        let frame = decode_packet(&cmd.encode()).unwrap().unwrap().0;
        assert_eq!(frame.kind(), PacketKind::Command);
        assert_eq!(frame.opcode(), Some(0x0003));
        // A command echoed back is never a response
        assert_eq!(frame.response_opcode(), None);
    }

    #[test]
    fn test_status_byte_roundtrip_for_unnamed_code() {
        assert_eq!(Status::from_byte(0x42), Status::Other(0x42));
        assert_eq!(Status::Other(0x42).to_byte(), 0x42);
    }
}
