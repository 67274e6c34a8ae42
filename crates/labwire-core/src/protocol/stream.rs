//! Byte stream channels
//!
//! A transport only needs a duplex byte stream with a read timeout. Real
//! hardware goes through [`SerialChannel`]; simulated devices and tests use the
//! in-memory [`MemoryChannel`] whose far end is driven through a
//! [`DeviceHandle`].

use serialport::SerialPort;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

/// Abstraction for a duplex byte stream to a device
pub trait CommunicationChannel: Read + Write + Send {
    /// Set timeout for read operations
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()>;

    /// Clear input buffers
    fn clear_input_buffer(&mut self) -> io::Result<()>;

    /// Clear output buffers
    fn clear_output_buffer(&mut self) -> io::Result<()>;

    /// Try to clone the channel so reads and writes can happen on different threads
    fn try_clone(&self) -> io::Result<Box<dyn CommunicationChannel>>;

    /// Change the line rate of the local end
    fn set_baud_rate(&mut self, baud_rate: u32) -> io::Result<()>;

    /// Human readable name used in log lines
    fn name(&self) -> String;
}

/// Outcome of a single non-fatal read attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// This many bytes were placed at the start of the buffer
    Data(usize),
    /// Nothing arrived within the read timeout
    Idle,
}

/// Read whatever is available right now.
///
/// Timeouts and interrupted reads are the normal "nothing yet" case and map to
/// [`ReadStatus::Idle`]; anything else is a device error for the caller to
/// classify.
pub fn read_available(
    channel: &mut dyn CommunicationChannel,
    buf: &mut [u8],
) -> io::Result<ReadStatus> {
    match channel.read(buf) {
        Ok(0) => Ok(ReadStatus::Idle),
        Ok(n) => Ok(ReadStatus::Data(n)),
        Err(e)
            if matches!(
                e.kind(),
                io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
            ) =>
        {
            Ok(ReadStatus::Idle)
        }
        Err(e) => Err(e),
    }
}

/// Whether a read error means the device is gone rather than a glitch
pub fn is_fatal_read_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::PermissionDenied
    )
}

/// Serial port wrapper implementing CommunicationChannel
pub struct SerialChannel {
    port: Box<dyn SerialPort>,
}

impl SerialChannel {
    /// Wrap an already opened port
    pub fn new(port: Box<dyn SerialPort>) -> Self {
        Self { port }
    }
}

impl Read for SerialChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.read(buf)
    }
}

impl Write for SerialChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.port.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port.flush()
    }
}

impl CommunicationChannel for SerialChannel {
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.port.set_timeout(timeout).map_err(io::Error::other)
    }

    fn clear_input_buffer(&mut self) -> io::Result<()> {
        self.port
            .clear(serialport::ClearBuffer::Input)
            .map_err(io::Error::other)
    }

    fn clear_output_buffer(&mut self) -> io::Result<()> {
        self.port
            .clear(serialport::ClearBuffer::Output)
            .map_err(io::Error::other)
    }

    fn try_clone(&self) -> io::Result<Box<dyn CommunicationChannel>> {
        let port_clone = self.port.try_clone().map_err(io::Error::other)?;
        Ok(Box::new(SerialChannel::new(port_clone)))
    }

    fn set_baud_rate(&mut self, baud_rate: u32) -> io::Result<()> {
        self.port.set_baud_rate(baud_rate).map_err(io::Error::other)
    }

    fn name(&self) -> String {
        self.port.name().unwrap_or_else(|| "serial".to_string())
    }
}

/// Callback invoked with every write the host makes; returns the reply bytes
pub type Responder = Box<dyn FnMut(&[u8]) -> Vec<u8> + Send>;

struct DeviceState {
    to_host: VecDeque<u8>,
    writes: Vec<Vec<u8>>,
    responder: Option<Responder>,
    reply_delay: Duration,
    fail_writes: bool,
    disconnected: bool,
    baud_rate: u32,
}

struct Shared {
    state: Mutex<DeviceState>,
    readable: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn inject(&self, bytes: &[u8]) {
        let mut state = self.lock();
        state.to_host.extend(bytes.iter().copied());
        self.readable.notify_all();
    }
}

/// In-memory channel standing in for a serial port
pub struct MemoryChannel {
    shared: Arc<Shared>,
    timeout: Duration,
    name: String,
}

/// Device side of a [`MemoryChannel`]
#[derive(Clone)]
pub struct DeviceHandle {
    shared: Arc<Shared>,
}

/// Create a connected host/device pair
pub fn memory_pair(name: &str) -> (MemoryChannel, DeviceHandle) {
    let shared = Arc::new(Shared {
        state: Mutex::new(DeviceState {
            to_host: VecDeque::new(),
            writes: Vec::new(),
            responder: None,
            reply_delay: Duration::ZERO,
            fail_writes: false,
            disconnected: false,
            baud_rate: 0,
        }),
        readable: Condvar::new(),
    });
    let channel = MemoryChannel {
        shared: shared.clone(),
        timeout: Duration::from_millis(1),
        name: name.to_string(),
    };
    (channel, DeviceHandle { shared })
}

impl Read for MemoryChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let deadline = Instant::now().checked_add(self.timeout);
        let mut state = self.shared.lock();
        while state.to_host.is_empty() && !state.disconnected {
            let Some(deadline) = deadline else {
                state = self
                    .shared
                    .readable
                    .wait(state)
                    .unwrap_or_else(|e| e.into_inner());
                continue;
            };
            let now = Instant::now();
            if now >= deadline {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out"));
            }
            state = self
                .shared
                .readable
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
        if state.to_host.is_empty() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device disconnected"));
        }
        let n = buf.len().min(state.to_host.len());
        for (slot, byte) in buf.iter_mut().zip(state.to_host.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for MemoryChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let (responder, delay) = {
            let mut state = self.shared.lock();
            if state.disconnected {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device disconnected"));
            }
            if state.fail_writes {
                return Err(io::Error::other("write rejected by device"));
            }
            state.writes.push(buf.to_vec());
            (state.responder.take(), state.reply_delay)
        };

        // The responder runs unlocked so it may use its own device state freely
        if let Some(mut responder) = responder {
            let reply = responder(buf);
            {
                let mut state = self.shared.lock();
                if state.responder.is_none() {
                    state.responder = Some(responder);
                }
            }
            if !reply.is_empty() {
                if delay.is_zero() {
                    self.shared.inject(&reply);
                } else {
                    let shared = self.shared.clone();
                    thread::spawn(move || {
                        thread::sleep(delay);
                        shared.inject(&reply);
                    });
                }
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl CommunicationChannel for MemoryChannel {
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.timeout = timeout;
        Ok(())
    }

    fn clear_input_buffer(&mut self) -> io::Result<()> {
        self.shared.lock().to_host.clear();
        Ok(())
    }

    fn clear_output_buffer(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn try_clone(&self) -> io::Result<Box<dyn CommunicationChannel>> {
        Ok(Box::new(MemoryChannel {
            shared: self.shared.clone(),
            timeout: self.timeout,
            name: self.name.clone(),
        }))
    }

    fn set_baud_rate(&mut self, baud_rate: u32) -> io::Result<()> {
        self.shared.lock().baud_rate = baud_rate;
        Ok(())
    }

    fn name(&self) -> String {
        self.name.clone()
    }
}

impl DeviceHandle {
    /// Queue bytes for the host to read
    pub fn inject(&self, bytes: &[u8]) {
        self.shared.inject(bytes);
    }

    /// Every write the host made, in order
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.shared.lock().writes.clone()
    }

    /// Number of writes the host made
    pub fn write_count(&self) -> usize {
        self.shared.lock().writes.len()
    }

    /// Forget recorded writes
    pub fn clear_writes(&self) {
        self.shared.lock().writes.clear();
    }

    /// Answer every host write with the bytes returned by `responder`
    pub fn set_responder<F>(&self, responder: F)
    where
        F: FnMut(&[u8]) -> Vec<u8> + Send + 'static,
    {
        self.shared.lock().responder = Some(Box::new(responder));
    }

    /// Stop answering writes
    pub fn clear_responder(&self) {
        self.shared.lock().responder = None;
    }

    /// Delay replies produced by the responder
    pub fn set_reply_delay(&self, delay: Duration) {
        self.shared.lock().reply_delay = delay;
    }

    /// Make host writes fail
    pub fn set_fail_writes(&self, fail: bool) {
        self.shared.lock().fail_writes = fail;
    }

    /// Simulate unplugging the device; pending and future reads fail
    pub fn disconnect(&self) {
        let mut state = self.shared.lock();
        state.disconnected = true;
        self.shared.readable.notify_all();
    }

    /// Line rate last configured by the host (0 if never set)
    pub fn baud_rate(&self) -> u32 {
        self.shared.lock().baud_rate
    }

    /// Bytes injected but not yet read by the host
    pub fn unread(&self) -> usize {
        self.shared.lock().to_host.len()
    }
}
