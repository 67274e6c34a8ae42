//! Simulated HCI controller
//!
//! Answers the commands of a firmware download on the device side of a
//! [`memory_pair`], so transfers can be exercised without hardware. Memory is
//! sparse: bytes never written read back as [`FLASH_PAD`].

use byteorder::{ByteOrder, LittleEndian};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::TransportConfig;
use crate::protocol::commands::ERASE_ALL_FLASH_MAGIC;
use crate::protocol::hci::{command_complete, opcode, Status, MAX_RETURN_PARAMS};
use crate::protocol::{
    memory_pair, DeviceHandle, FrameAssembler, HciDecoder, HciTransport, PacketKind,
    ProtocolError, FLASH_PAD,
};

#[derive(Default)]
struct ControllerState {
    memory: BTreeMap<u32, u8>,
    commands: Vec<u16>,
    baud_rate: Option<u32>,
    launched: Option<u32>,
    erase_count: usize,
    forced_status: HashMap<u16, Status>,
    silent: HashSet<u16>,
    corrupt_crc: bool,
}

impl ControllerState {
    fn read(&self, address: u32, len: usize) -> Vec<u8> {
        (0..len as u32)
            .map(|i| {
                self.memory
                    .get(&address.wrapping_add(i))
                    .copied()
                    .unwrap_or(FLASH_PAD)
            })
            .collect()
    }

    fn store(&mut self, address: u32, data: &[u8]) {
        for (i, &b) in data.iter().enumerate() {
            self.memory.insert(address.wrapping_add(i as u32), b);
        }
    }

    /// Reply to one command; `None` means stay silent
    fn handle(&mut self, op: u16, params: &[u8]) -> Option<Vec<u8>> {
        self.commands.push(op);
        if self.silent.contains(&op) {
            debug!("simulator ignoring {:#06x}", op);
            return None;
        }
        if let Some(&status) = self.forced_status.get(&op) {
            return command_complete(op, status, &[]).ok();
        }

        let reply = match op {
            opcode::RESET | opcode::DOWNLOAD_MINIDRIVER => Ok(Vec::new()),
            opcode::WRITE_RAM if params.len() >= 4 => {
                let address = LittleEndian::read_u32(params);
                self.store(address, &params[4..]);
                Ok(Vec::new())
            }
            opcode::READ_RAM if params.len() == 5 => {
                let address = LittleEndian::read_u32(params);
                match usize::from(params[4]) {
                    len if len > MAX_RETURN_PARAMS => Err(Status::InvalidParameters),
                    len => Ok(self.read(address, len)),
                }
            }
            opcode::VERIFY_CRC if params.len() == 8 => {
                let address = LittleEndian::read_u32(params);
                let length = LittleEndian::read_u32(&params[4..]) as usize;
                let mut crc = crc32fast::hash(&self.read(address, length));
                if self.corrupt_crc {
                    crc ^= 1;
                }
                Ok(crc.to_le_bytes().to_vec())
            }
            opcode::LAUNCH_RAM if params.len() == 4 => {
                self.launched = Some(LittleEndian::read_u32(params));
                Ok(Vec::new())
            }
            opcode::CHIP_ERASE if params.len() == 4 => {
                if LittleEndian::read_u32(params) == ERASE_ALL_FLASH_MAGIC {
                    self.memory.clear();
                    self.erase_count += 1;
                    Ok(Vec::new())
                } else {
                    Err(Status::InvalidParameters)
                }
            }
            opcode::UPDATE_BAUDRATE if params.len() == 6 => {
                self.baud_rate = Some(LittleEndian::read_u32(&params[2..]));
                Ok(Vec::new())
            }
            opcode::WRITE_RAM
            | opcode::READ_RAM
            | opcode::VERIFY_CRC
            | opcode::LAUNCH_RAM
            | opcode::CHIP_ERASE
            | opcode::UPDATE_BAUDRATE => Err(Status::InvalidParameters),
            _ => Err(Status::UnknownCommand),
        };

        let event = match reply {
            Ok(params) => command_complete(op, Status::Success, &params),
            Err(status) => command_complete(op, status, &[]),
        };
        match event {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!("simulator cannot answer {:#06x}: {}", op, e);
                None
            }
        }
    }
}

/// In-memory controller attached to a [`DeviceHandle`]
#[derive(Clone)]
pub struct HciSimulator {
    device: DeviceHandle,
    state: Arc<Mutex<ControllerState>>,
}

impl HciSimulator {
    /// Start answering host writes on `device`
    pub fn attach(device: DeviceHandle) -> Self {
        let state = Arc::new(Mutex::new(ControllerState::default()));
        let responder_state = state.clone();
        let mut assembler = FrameAssembler::new(HciDecoder);

        device.set_responder(move |bytes| {
            let mut out = Vec::new();
            let mut state = responder_state.lock().unwrap_or_else(|e| e.into_inner());
            for packet in assembler.push(bytes) {
                if packet.kind() != PacketKind::Command {
                    continue;
                }
                let Some(op) = packet.opcode() else {
                    continue;
                };
                if let Some(reply) = state.handle(op, packet.payload()) {
                    out.extend(reply);
                }
            }
            out
        });

        Self { device, state }
    }

    /// Transport connected to a fresh simulator
    pub fn connect(config: TransportConfig) -> Result<(HciTransport, Self), ProtocolError> {
        let (channel, device) = memory_pair("simulator");
        let simulator = Self::attach(device);
        let transport = HciTransport::hci(config);
        transport.open_with_channel(Box::new(channel))?;
        Ok((transport, simulator))
    }

    fn lock(&self) -> MutexGuard<'_, ControllerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Device side of the link
    pub fn device(&self) -> &DeviceHandle {
        &self.device
    }

    /// Memory contents; unwritten bytes read as pad
    pub fn memory(&self, address: u32, len: usize) -> Vec<u8> {
        self.lock().read(address, len)
    }

    /// Preload memory
    pub fn load(&self, address: u32, data: &[u8]) {
        self.lock().store(address, data);
    }

    /// Number of bytes ever stored
    pub fn stored_bytes(&self) -> usize {
        self.lock().memory.len()
    }

    /// Opcodes received, in order
    pub fn commands(&self) -> Vec<u16> {
        self.lock().commands.clone()
    }

    /// How many times `op` was received
    pub fn command_count(&self, op: u16) -> usize {
        self.lock().commands.iter().filter(|&&c| c == op).count()
    }

    /// Rate requested by the last baud rate command
    pub fn baud_rate(&self) -> Option<u32> {
        self.lock().baud_rate
    }

    /// Address of the last launch command
    pub fn launched(&self) -> Option<u32> {
        self.lock().launched
    }

    /// Number of completed chip erases
    pub fn erase_count(&self) -> usize {
        self.lock().erase_count
    }

    /// Answer `op` with `status` from now on
    pub fn fail_opcode(&self, op: u16, status: Status) {
        self.lock().forced_status.insert(op, status);
    }

    /// Never answer `op`
    pub fn silence_opcode(&self, op: u16) {
        self.lock().silent.insert(op);
    }

    /// Report wrong CRCs
    pub fn corrupt_crc(&self, corrupt: bool) {
        self.lock().corrupt_crc = corrupt;
    }

    /// Delay every reply
    pub fn set_reply_delay(&self, delay: Duration) {
        self.device.set_reply_delay(delay);
    }
}
