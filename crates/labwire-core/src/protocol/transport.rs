//! Transport lifecycle
//!
//! A [`Transport`] owns at most one open session: the writer end of the
//! channel, the inbox, the queue monitor and the receiver thread. All methods
//! take `&self` so a transport can be shared between a test thread issuing
//! commands and another thread that closes it.

use serde::{Deserialize, Serialize};
use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};

use super::decoder::{hex, FrameDecoder, RawDecoder, WireFrame};
use super::hci::HciDecoder;
use super::inbox::Inbox;
use super::monitor::QueueMonitor;
use super::receiver::Receiver;
use super::serial::open_port;
use super::stream::{CommunicationChannel, SerialChannel};
use super::ProtocolError;
use crate::config::TransportConfig;

/// Byte-queue transport
pub type RawTransport = Transport<RawDecoder>;

/// HCI command transport
pub type HciTransport = Transport<HciDecoder>;

/// Transport state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportState {
    /// Not open
    Closed,
    /// Open and receiving
    Open,
    /// Open but the device went away; close and reopen
    Error,
}

/// Cumulative traffic counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportCounters {
    /// Bytes written
    pub tx_bytes: u64,
    /// Writes issued
    pub tx_packets: u64,
    /// Bytes read
    pub rx_bytes: u64,
    /// Frames decoded
    pub rx_frames: u64,
    /// Frames discarded by the queue monitor or an explicit clear
    pub discarded_frames: u64,
    /// Bytes dropped by corruption recovery
    pub discarded_bytes: u64,
}

/// Live counters shared with the receiver thread
#[derive(Debug, Default)]
pub struct Counters {
    tx_bytes: AtomicU64,
    tx_packets: AtomicU64,
    rx_bytes: AtomicU64,
    rx_frames: AtomicU64,
    discarded_frames: AtomicU64,
    discarded_bytes: AtomicU64,
}

impl Counters {
    pub(crate) fn add_tx(&self, bytes: usize) {
        self.tx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        self.tx_packets.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add_rx_bytes(&self, bytes: usize) {
        self.rx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn add_rx_frames(&self, frames: usize) {
        self.rx_frames.fetch_add(frames as u64, Ordering::Relaxed);
    }

    pub(crate) fn add_discarded_frames(&self, frames: usize) {
        self.discarded_frames
            .fetch_add(frames as u64, Ordering::Relaxed);
    }

    pub(crate) fn add_discarded_bytes(&self, bytes: u64) {
        self.discarded_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Snapshot of the current values
    pub fn snapshot(&self) -> TransportCounters {
        TransportCounters {
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
            tx_packets: self.tx_packets.load(Ordering::Relaxed),
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            rx_frames: self.rx_frames.load(Ordering::Relaxed),
            discarded_frames: self.discarded_frames.load(Ordering::Relaxed),
            discarded_bytes: self.discarded_bytes.load(Ordering::Relaxed),
        }
    }
}

/// Log and count frames that nobody claimed
pub(crate) fn discard_frames<F: WireFrame>(
    frames: Vec<F>,
    counters: &Counters,
    why: &str,
) -> usize {
    for frame in &frames {
        debug!("{}: unhandled frame {}", why, hex(frame.raw()));
    }
    counters.add_discarded_frames(frames.len());
    frames.len()
}

/// Everything that exists only while the transport is open
pub(crate) struct Session<F> {
    pub(crate) name: String,
    /// Taken on shutdown; a session without a writer never touches the device
    writer: Mutex<Option<Box<dyn CommunicationChannel>>>,
    pub(crate) inbox: Arc<Inbox<F>>,
    pub(crate) monitor: Arc<QueueMonitor>,
    receiver: Mutex<Receiver>,
    /// Held for the whole of a command/response exchange
    pub(crate) request_lock: Mutex<()>,
}

/// Pauses the queue monitor until dropped
pub(crate) struct MonitorPause<'a> {
    monitor: &'a QueueMonitor,
}

impl<'a> MonitorPause<'a> {
    pub(crate) fn new(monitor: &'a QueueMonitor) -> Self {
        monitor.pause();
        Self { monitor }
    }
}

impl Drop for MonitorPause<'_> {
    fn drop(&mut self) {
        self.monitor.resume();
    }
}

impl<F: WireFrame> Session<F> {
    fn lock_writer(&self) -> MutexGuard<'_, Option<Box<dyn CommunicationChannel>>> {
        self.writer.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn write(&self, data: &[u8], counters: &Counters) -> Result<(), ProtocolError> {
        let mut guard = self.lock_writer();
        let writer = guard.as_mut().ok_or(ProtocolError::Closed)?;
        debug!("[{}] TX: {}", self.name, hex(data));
        writer
            .write_all(data)
            .and_then(|_| writer.flush())
            .map_err(|e| ProtocolError::SerialError(e.to_string()))?;
        counters.add_tx(data.len());
        Ok(())
    }

    pub(crate) fn clear_inbox(&self, counters: &Counters) -> usize {
        discard_frames(self.inbox.drain(), counters, "clear")
    }

    /// Release the device. Once this returns no write can reach it, even from a
    /// request that still holds a reference to the session.
    fn shutdown(&self, counters: &Counters) {
        drop(self.lock_writer().take());
        discard_frames(self.inbox.close(), counters, "close");
        self.receiver
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .stop();
        self.monitor.shutdown();
        debug!("closed {}", self.name);
    }
}

/// A duplex device link with a background receiver
pub struct Transport<D: FrameDecoder + Clone> {
    config: Mutex<TransportConfig>,
    decoder: D,
    session: Mutex<Option<Arc<Session<D::Frame>>>>,
    counters: Arc<Counters>,
}

impl RawTransport {
    /// Transport where every received byte is a frame
    pub fn raw(config: TransportConfig) -> Self {
        Self::new(config, RawDecoder)
    }
}

impl HciTransport {
    /// Transport speaking HCI packets
    pub fn hci(config: TransportConfig) -> Self {
        Self::new(config, HciDecoder)
    }
}

impl<D: FrameDecoder + Clone> Transport<D> {
    /// Create a transport (not yet open)
    pub fn new(config: TransportConfig, decoder: D) -> Self {
        Self {
            config: Mutex::new(config),
            decoder,
            session: Mutex::new(None),
            counters: Arc::new(Counters::default()),
        }
    }

    fn lock_session(&self) -> MutexGuard<'_, Option<Arc<Session<D::Frame>>>> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_config(&self) -> MutexGuard<'_, TransportConfig> {
        self.config.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current configuration
    pub fn config(&self) -> TransportConfig {
        self.lock_config().clone()
    }

    /// Open the configured serial port and start the receiver.
    ///
    /// Does nothing if the transport is already open.
    pub fn open(&self) -> Result<(), ProtocolError> {
        let mut slot = self.lock_session();
        if self.reuse_session(&mut slot) {
            return Ok(());
        }
        let config = self.config();
        config.validate()?;
        let port = open_port(
            &config.port_name,
            config.baud_rate,
            config.flow_control,
            config.read_timeout(),
        )?;
        let session = self.start_session(Box::new(SerialChannel::new(port)), &config)?;
        *slot = Some(Arc::new(session));
        Ok(())
    }

    /// Open over an already connected channel, e.g. a simulated device.
    ///
    /// Does nothing if the transport is already open.
    pub fn open_with_channel(
        &self,
        channel: Box<dyn CommunicationChannel>,
    ) -> Result<(), ProtocolError> {
        let mut slot = self.lock_session();
        if self.reuse_session(&mut slot) {
            return Ok(());
        }
        let config = self.config();
        config.validate()?;
        let session = self.start_session(channel, &config)?;
        *slot = Some(Arc::new(session));
        Ok(())
    }

    /// Keep a healthy session; tear down one whose device went away
    fn reuse_session(&self, slot: &mut Option<Arc<Session<D::Frame>>>) -> bool {
        match slot.as_ref() {
            Some(session) if !session.inbox.is_closed() => true,
            Some(_) => {
                if let Some(stale) = slot.take() {
                    stale.shutdown(&self.counters);
                }
                false
            }
            None => false,
        }
    }

    fn start_session(
        &self,
        mut channel: Box<dyn CommunicationChannel>,
        config: &TransportConfig,
    ) -> Result<Session<D::Frame>, ProtocolError> {
        let name = channel.name();
        channel.set_timeout(config.read_timeout())?;
        channel.clear_input_buffer()?;
        channel.clear_output_buffer()?;
        let reader = channel.try_clone()?;

        let inbox = Arc::new(Inbox::new());
        let evict_inbox = inbox.clone();
        let evict_counters = self.counters.clone();
        let monitor = Arc::new(QueueMonitor::spawn(
            &name,
            config.queue_timeout(),
            config.queue_monitor_enabled,
            move || discard_frames(evict_inbox.drain(), &evict_counters, "stale"),
        )?);

        let receiver = Receiver::spawn(
            &name,
            reader,
            self.decoder.clone(),
            config.read_chunk_size,
            inbox.clone(),
            monitor.clone(),
            self.counters.clone(),
        )?;
        monitor.resume();

        info!(
            port = %name,
            baud_rate = config.baud_rate,
            flow_control = config.flow_control,
            "transport open"
        );
        Ok(Session {
            name,
            writer: Mutex::new(Some(channel)),
            inbox,
            monitor,
            receiver: Mutex::new(receiver),
            request_lock: Mutex::new(()),
        })
    }

    /// Stop all threads and release the device. Safe to call repeatedly and
    /// while another thread is waiting for a response; that wait fails with
    /// [`ProtocolError::Closed`].
    pub fn close(&self) {
        let session = self.lock_session().take();
        if let Some(session) = session {
            session.shutdown(&self.counters);
        }
    }

    pub(crate) fn session(&self) -> Result<Arc<Session<D::Frame>>, ProtocolError> {
        self.lock_session().clone().ok_or(ProtocolError::NotOpen)
    }

    pub(crate) fn counters_ref(&self) -> &Counters {
        &self.counters
    }

    /// Current state
    pub fn state(&self) -> TransportState {
        match self.lock_session().as_ref() {
            None => TransportState::Closed,
            Some(session) if session.inbox.is_closed() => TransportState::Error,
            Some(_) => TransportState::Open,
        }
    }

    /// Whether the transport is open and healthy
    pub fn is_open(&self) -> bool {
        self.state() == TransportState::Open
    }

    /// Cumulative tx/rx counters
    pub fn counters(&self) -> TransportCounters {
        self.counters.snapshot()
    }

    /// Write bytes with the queue monitor paused
    pub fn send(&self, data: &[u8]) -> Result<usize, ProtocolError> {
        let session = self.session()?;
        let _paused = MonitorPause::new(&session.monitor);
        session.write(data, &self.counters)?;
        Ok(data.len())
    }

    /// Take every queued frame
    pub fn read(&self) -> Result<Vec<D::Frame>, ProtocolError> {
        let session = self.session()?;
        let _paused = MonitorPause::new(&session.monitor);
        Ok(session.inbox.drain())
    }

    /// Take the oldest frame, waiting up to `timeout`
    pub fn wait_for_frame(&self, timeout: Duration) -> Result<Option<D::Frame>, ProtocolError> {
        self.session()?.inbox.pop_timeout(timeout)
    }

    /// Wait until something is queued; false on timeout
    pub fn wait_for_bytes_received(&self, timeout: Duration) -> Result<bool, ProtocolError> {
        Ok(self.session()?.inbox.wait_for_data(timeout))
    }

    /// Discard every queued frame, returning how many were dropped
    pub fn clear_rx_queue(&self) -> Result<usize, ProtocolError> {
        Ok(self.session()?.clear_inbox(&self.counters))
    }

    /// Number of queued frames
    pub fn pending_frames(&self) -> Result<usize, ProtocolError> {
        Ok(self.session()?.inbox.len())
    }

    /// Change the stale-frame window; restarts the window if the monitor runs
    pub fn set_queue_timeout(&self, timeout: Duration) {
        let millis = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self.lock_config().queue_timeout_ms = millis;
        if let Ok(session) = self.session() {
            session.monitor.set_timeout(timeout);
        }
    }

    /// Turn stale-frame eviction on or off
    pub fn enable_queue_monitor(&self, enable: bool) {
        self.lock_config().queue_monitor_enabled = enable;
        if let Ok(session) = self.session() {
            session.monitor.set_enabled(enable);
        }
    }

    /// Change the local line rate
    pub fn set_baud_rate(&self, baud_rate: u32) -> Result<(), ProtocolError> {
        let session = self.session()?;
        session
            .lock_writer()
            .as_mut()
            .ok_or(ProtocolError::Closed)?
            .set_baud_rate(baud_rate)?;
        self.lock_config().baud_rate = baud_rate;
        debug!("[{}] baud rate {}", session.name, baud_rate);
        Ok(())
    }
}

impl<D: FrameDecoder + Clone> Drop for Transport<D> {
    fn drop(&mut self) {
        self.close();
    }
}
