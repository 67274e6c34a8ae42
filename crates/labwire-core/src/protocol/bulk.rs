//! Chunked memory transfers
//!
//! A single command packet carries at most 255 parameter bytes, so larger
//! payloads are split into chunks and sent one request at a time. Chunks made
//! entirely of the pad byte are skipped: erased flash already reads as pad.

use byteorder::{ByteOrder, LittleEndian};
use std::time::Duration;
use tracing::{debug, info};

use super::hci::{opcode, CommandPacket};
use super::{HciTransport, ProtocolError, DEFAULT_TIMEOUT_MS, MAX_SETTINGS_SIZE};

/// Filler value of erased flash
pub const FLASH_PAD: u8 = 0xFF;

/// Largest chunk a RAM write accepts
pub const WRITE_RAM_MAX_SIZE: usize = 240;

/// Largest chunk a byte-range command accepts
pub const BYTE_RANGE_MAX_SIZE: usize = 60;

/// Opcodes and limits for one kind of bulk transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkConfig {
    /// Command that writes `address u32 LE + data`
    pub write_opcode: u16,
    /// Command that reads `address u32 LE + length u8`
    pub read_opcode: u16,
    /// Command returning a CRC-32 over `address u32 LE + length u32 LE`
    pub verify_opcode: u16,
    /// Largest chunk per request
    pub chunk_max: usize,
    /// Wait per request
    pub timeout: Duration,
    /// Attempts per request
    pub tries: u32,
}

impl BulkConfig {
    /// RAM/flash writes in 240-byte chunks
    pub fn ram() -> Self {
        Self {
            write_opcode: opcode::WRITE_RAM,
            read_opcode: opcode::READ_RAM,
            verify_opcode: opcode::VERIFY_CRC,
            chunk_max: WRITE_RAM_MAX_SIZE,
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            tries: 1,
        }
    }

    /// Small byte-range accesses in 60-byte chunks
    pub fn byte_range() -> Self {
        Self {
            chunk_max: BYTE_RANGE_MAX_SIZE,
            ..Self::ram()
        }
    }

    fn write_chunk_max(&self) -> usize {
        // 4 address bytes share the parameter block
        self.chunk_max.clamp(1, super::hci::MAX_COMMAND_PARAMS - 4)
    }

    fn read_chunk_max(&self) -> usize {
        // the reply carries the data in one Command Complete event
        self.chunk_max.clamp(1, super::hci::MAX_RETURN_PARAMS)
    }
}

impl Default for BulkConfig {
    fn default() -> Self {
        Self::ram()
    }
}

/// Chunked reads and writes through an [`HciTransport`]
pub struct BulkTransfer<'a> {
    transport: &'a HciTransport,
    config: BulkConfig,
}

impl<'a> BulkTransfer<'a> {
    /// Bulk access with the given limits
    pub fn new(transport: &'a HciTransport, config: BulkConfig) -> Self {
        Self { transport, config }
    }

    /// Bulk access with [`BulkConfig::ram`]
    pub fn ram(transport: &'a HciTransport) -> Self {
        Self::new(transport, BulkConfig::ram())
    }

    /// Bulk access with [`BulkConfig::byte_range`]
    pub fn byte_range(transport: &'a HciTransport) -> Self {
        Self::new(transport, BulkConfig::byte_range())
    }

    /// Limits in use
    pub fn config(&self) -> &BulkConfig {
        &self.config
    }

    /// Write `data` starting at `address`.
    ///
    /// Chunks consisting only of `pad` are not sent but still advance the
    /// address. With `verify`, every sent chunk is read back as a CRC-32 and
    /// compared with the local one.
    pub fn write(
        &self,
        address: u32,
        data: &[u8],
        pad: u8,
        verify: bool,
    ) -> Result<(), ProtocolError> {
        // Fail on a closed transport even if every chunk would be skipped
        if !self.transport.is_open() {
            return Err(ProtocolError::NotOpen);
        }

        let total = data.len();
        let mut addr = address;
        let mut written = 0usize;

        for chunk in data.chunks(self.config.write_chunk_max()) {
            if chunk.iter().all(|&b| b == pad) {
                debug!("Pad bytes, dont write ({} at {:#010x})", chunk.len(), addr);
            } else {
                self.write_chunk(addr, chunk)?;
                if verify {
                    self.verify_chunk(addr, chunk)?;
                }
            }

            written += chunk.len();
            addr = addr.wrapping_add(chunk.len() as u32);
            debug!(
                "write {}/{} ({:.1}%)",
                written,
                total,
                written as f64 * 100.0 / total as f64
            );
        }

        info!("wrote {} bytes at {:#010x}", total, address);
        Ok(())
    }

    fn write_chunk(&self, address: u32, chunk: &[u8]) -> Result<(), ProtocolError> {
        let command = CommandPacket::builder(self.config.write_opcode)
            .u32_le(address)
            .bytes(chunk)
            .build()?;
        match self
            .transport
            .send_command_wait_response(&command, self.config.timeout, self.config.tries)?
        {
            Some(_) => Ok(()),
            None => Err(ProtocolError::WriteFailed { address }),
        }
    }

    fn verify_chunk(&self, address: u32, chunk: &[u8]) -> Result<(), ProtocolError> {
        let computed = crc32fast::hash(chunk);
        debug!("Data CRC: {:#010x}", computed);
        let observed = self.remote_crc(address, chunk.len() as u32)?;
        debug!("Read CRC: {:#010x}", observed);
        if computed != observed {
            return Err(ProtocolError::VerifyMismatch {
                address,
                computed,
                observed,
            });
        }
        Ok(())
    }

    /// CRC-32 the device reports over `length` bytes at `address`
    pub fn remote_crc(&self, address: u32, length: u32) -> Result<u32, ProtocolError> {
        let command = CommandPacket::builder(self.config.verify_opcode)
            .u32_le(address)
            .u32_le(length)
            .build()?;
        let payload =
            self.transport
                .expect_response(&command, self.config.timeout, self.config.tries)?;
        if payload.len() < 4 {
            return Err(ProtocolError::Malformed(format!(
                "CRC response has {} bytes",
                payload.len()
            )));
        }
        Ok(LittleEndian::read_u32(&payload[..4]))
    }

    /// Read `max_total_bytes` starting at `address`.
    ///
    /// Every chunk must come back with exactly the requested length.
    pub fn read(&self, address: u32, max_total_bytes: usize) -> Result<Vec<u8>, ProtocolError> {
        if !self.transport.is_open() {
            return Err(ProtocolError::NotOpen);
        }

        let mut out = Vec::with_capacity(max_total_bytes);
        let mut addr = address;
        while out.len() < max_total_bytes {
            let len = (max_total_bytes - out.len()).min(self.config.read_chunk_max());
            let command = CommandPacket::builder(self.config.read_opcode)
                .u32_le(addr)
                .byte(len as u8)
                .build()?;
            let payload = self
                .transport
                .send_command_wait_response(&command, self.config.timeout, self.config.tries)?
                .ok_or(ProtocolError::ReadFailed {
                    address: addr,
                    expected: len,
                    actual: 0,
                })?;
            if payload.len() != len {
                return Err(ProtocolError::ReadFailed {
                    address: addr,
                    expected: len,
                    actual: payload.len(),
                });
            }
            out.extend_from_slice(&payload);
            addr = addr.wrapping_add(len as u32);
        }
        Ok(out)
    }
}

impl HciTransport {
    /// Write the settings blob at address 0.
    ///
    /// Blobs larger than [`MAX_SETTINGS_SIZE`] are rejected before any I/O.
    pub fn write_settings(&self, data: &[u8]) -> Result<(), ProtocolError> {
        if data.len() > MAX_SETTINGS_SIZE {
            return Err(ProtocolError::SettingsTooLarge {
                size: data.len(),
                max: MAX_SETTINGS_SIZE,
            });
        }
        // Every settings byte is significant, so nothing is skipped as padding
        let bulk = BulkTransfer::byte_range(self);
        for (i, chunk) in data.chunks(bulk.config().write_chunk_max()).enumerate() {
            let address = (i * bulk.config().write_chunk_max()) as u32;
            bulk.write_chunk(address, chunk)?;
        }
        Ok(())
    }

    /// Read the whole settings area
    pub fn read_settings(&self) -> Result<Vec<u8>, ProtocolError> {
        BulkTransfer::byte_range(self).read(0, MAX_SETTINGS_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportConfig;
    use crate::protocol::hci::{command_complete, Status};
    use crate::protocol::stream::{memory_pair, DeviceHandle};

    fn open_hci() -> (HciTransport, DeviceHandle) {
        let transport = HciTransport::hci(TransportConfig {
            read_timeout_us: 1000,
            ..TransportConfig::hci("mem", 115_200)
        });
        let (channel, device) = memory_pair("mem");
        transport.open_with_channel(Box::new(channel)).unwrap();
        (transport, device)
    }

    fn ack_everything(device: &DeviceHandle) {
        device.set_responder(|cmd| {
            let op = LittleEndian::read_u16(&cmd[1..3]);
            command_complete(op, Status::Success, &[]).unwrap()
        });
    }

    #[test]
    fn test_chunk_limits() {
        assert_eq!(BulkConfig::ram().write_chunk_max(), 240);
        assert_eq!(BulkConfig::byte_range().read_chunk_max(), 60);
        let huge = BulkConfig {
            chunk_max: 4096,
            ..BulkConfig::ram()
        };
        assert_eq!(huge.write_chunk_max(), 251);
        assert_eq!(huge.read_chunk_max(), 251);
    }

    #[test]
    fn test_write_splits_into_chunks() {
        let (transport, device) = open_hci();
        ack_everything(&device);
        let data = vec![0x11u8; 500];
        BulkTransfer::ram(&transport)
            .write(0x1000, &data, FLASH_PAD, false)
            .unwrap();

        let writes = device.writes();
        assert_eq!(writes.len(), 3);
        // header + address + payload
        assert_eq!(writes[0].len(), 4 + 4 + 240);
        assert_eq!(&writes[1][4..8], &(0x1000u32 + 240).to_le_bytes());
        assert_eq!(writes[2].len(), 4 + 4 + 20);
    }

    #[test]
    fn test_write_failure_reports_address() {
        let (transport, device) = open_hci();
        device.set_responder(|cmd| {
            let addr = LittleEndian::read_u32(&cmd[4..8]);
            let status = if addr >= 0x2000 + 240 {
                Status::HardwareFailure
            } else {
                Status::Success
            };
            command_complete(opcode::WRITE_RAM, status, &[]).unwrap()
        });
        let result = BulkTransfer::ram(&transport).write(0x2000, &[0u8; 480], FLASH_PAD, false);
        assert!(matches!(
            result,
            Err(ProtocolError::WriteFailed { address: 0x20F0 })
        ));
    }

    #[test]
    fn test_settings_too_large_before_io() {
        let (transport, device) = open_hci();
        let result = transport.write_settings(&[0u8; MAX_SETTINGS_SIZE + 1]);
        assert!(matches!(
            result,
            Err(ProtocolError::SettingsTooLarge { size: 257, max: 256 })
        ));
        assert_eq!(device.write_count(), 0);
    }

    #[test]
    fn test_read_requires_open() {
        let transport = HciTransport::hci(TransportConfig::default());
        assert!(matches!(
            BulkTransfer::ram(&transport).read(0, 10),
            Err(ProtocolError::NotOpen)
        ));
    }
}
