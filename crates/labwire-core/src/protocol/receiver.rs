//! Background receive thread
//!
//! Drains the channel, assembles frames and queues them on the inbox. The stop
//! flag is checked on every iteration; since reads use a short timeout the
//! thread notices a stop request within one read timeout.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, trace, warn};

use super::decoder::{hex, FrameAssembler, FrameDecoder, WireFrame};
use super::inbox::Inbox;
use super::monitor::QueueMonitor;
use super::stream::{is_fatal_read_error, read_available, CommunicationChannel, ReadStatus};
use super::transport::{discard_frames, Counters};

/// Pause after a transient read error so a misbehaving driver cannot spin us
const READ_ERROR_BACKOFF: Duration = Duration::from_millis(1);

/// Handle to the receive thread
pub struct Receiver {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Receiver {
    /// Start receiving on `channel`
    pub fn spawn<D: FrameDecoder>(
        name: &str,
        channel: Box<dyn CommunicationChannel>,
        decoder: D,
        read_chunk_size: usize,
        inbox: Arc<Inbox<D::Frame>>,
        monitor: Arc<QueueMonitor>,
        counters: Arc<Counters>,
    ) -> io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let worker = Worker {
            channel,
            assembler: FrameAssembler::new(decoder),
            buf: vec![0u8; read_chunk_size.max(1)],
            inbox,
            monitor,
            counters,
            stop: stop.clone(),
        };
        let handle = thread::Builder::new()
            .name(format!("{}-rx", name))
            .spawn(move || worker.run())?;
        Ok(Self {
            stop,
            handle: Some(handle),
        })
    }

    /// Whether the thread is still running
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Signal the thread to stop and wait for it
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("receiver thread panicked");
            }
        }
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Worker<D: FrameDecoder> {
    channel: Box<dyn CommunicationChannel>,
    assembler: FrameAssembler<D>,
    buf: Vec<u8>,
    inbox: Arc<Inbox<D::Frame>>,
    monitor: Arc<QueueMonitor>,
    counters: Arc<Counters>,
    stop: Arc<AtomicBool>,
}

impl<D: FrameDecoder> Worker<D> {
    fn run(mut self) {
        let name = self.channel.name();
        debug!(port = %name, "receiver started");

        while !self.stop.load(Ordering::Acquire) {
            match read_available(self.channel.as_mut(), &mut self.buf) {
                Ok(ReadStatus::Idle) => {}
                Ok(ReadStatus::Data(n)) => self.handle_bytes(n),
                Err(e) if is_fatal_read_error(&e) => {
                    warn!(port = %name, "device error, receiver stopping: {}", e);
                    discard_frames(self.inbox.close(), &self.counters, "device lost");
                    break;
                }
                Err(e) => {
                    trace!(port = %name, "transient read error: {}", e);
                    thread::sleep(READ_ERROR_BACKOFF);
                }
            }
        }

        self.assembler.clear();
        debug!(port = %name, "receiver stopped");
    }

    fn handle_bytes(&mut self, n: usize) {
        self.counters.add_rx_bytes(n);
        let discarded_before = self.assembler.discarded();
        let frames = self.assembler.push(&self.buf[..n]);
        self.counters
            .add_discarded_bytes(self.assembler.discarded() - discarded_before);

        if frames.is_empty() {
            return;
        }
        for frame in &frames {
            debug!("RX {}", hex(frame.raw()));
        }
        self.counters.add_rx_frames(frames.len());
        self.inbox.push_all(frames);
        self.monitor.notify_activity();
    }
}
