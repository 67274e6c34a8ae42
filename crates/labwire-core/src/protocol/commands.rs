//! Controller commands
//!
//! Thin wrappers over [`Transport::expect_response`] for the HCI and vendor
//! commands a firmware download needs. Each fails with
//! [`ProtocolError::Timeout`] when the controller stays silent and
//! [`ProtocolError::CommandFailed`] when it rejects the command.
//!
//! [`Transport::expect_response`]: super::Transport::expect_response

use std::thread;
use std::time::Duration;
use tracing::{debug, info};

use super::bulk::BulkTransfer;
use super::hci::{opcode, CommandPacket};
use super::{HciTransport, ProtocolError};

/// Magic value that guards a full chip erase
pub const ERASE_ALL_FLASH_MAGIC: u32 = 0xFCBE_EEEF;

/// Time the controller needs to start executing from RAM
pub const LAUNCH_RAM_DELAY: Duration = Duration::from_millis(200);

impl HciTransport {
    fn run(&self, command: CommandPacket, timeout: Duration) -> Result<Vec<u8>, ProtocolError> {
        self.expect_response(&command, timeout, self.config().tries)
    }

    fn default_timeout(&self) -> Duration {
        self.config().response_timeout()
    }

    /// HCI_Reset
    pub fn reset(&self) -> Result<(), ProtocolError> {
        self.run(CommandPacket::empty(opcode::RESET), self.default_timeout())?;
        debug!("controller reset");
        Ok(())
    }

    /// Put the controller into minidriver download mode
    pub fn download_minidriver(&self) -> Result<(), ProtocolError> {
        self.run(
            CommandPacket::empty(opcode::DOWNLOAD_MINIDRIVER),
            self.default_timeout(),
        )?;
        Ok(())
    }

    /// Jump to `address` and give the new image time to start
    pub fn launch_ram(&self, address: u32) -> Result<(), ProtocolError> {
        debug!("Launch RAM {:#010x}", address);
        let command = CommandPacket::builder(opcode::LAUNCH_RAM)
            .u32_le(address)
            .build()?;
        self.run(command, self.default_timeout())?;
        thread::sleep(LAUNCH_RAM_DELAY);
        Ok(())
    }

    /// Erase all flash. Erasing takes a while, so callers usually pass a
    /// longer `timeout` than the default.
    pub fn chip_erase(&self, timeout: Duration) -> Result<(), ProtocolError> {
        let command = CommandPacket::builder(opcode::CHIP_ERASE)
            .u32_le(ERASE_ALL_FLASH_MAGIC)
            .build()?;
        self.run(command, timeout)?;
        info!("chip erased");
        Ok(())
    }

    /// Switch the controller to `baud_rate`, then retune the local port
    pub fn change_baud_rate(&self, baud_rate: u32) -> Result<(), ProtocolError> {
        let command = CommandPacket::builder(opcode::UPDATE_BAUDRATE)
            .u16_le(0)
            .u32_le(baud_rate)
            .build()?;
        self.run(command, self.default_timeout())?;
        self.set_baud_rate(baud_rate)?;
        info!("baud rate changed to {}", baud_rate);
        Ok(())
    }

    /// CRC-32 the controller computes over `length` bytes at `address`
    pub fn verify_crc(&self, address: u32, length: u32) -> Result<u32, ProtocolError> {
        BulkTransfer::ram(self).remote_crc(address, length)
    }
}
