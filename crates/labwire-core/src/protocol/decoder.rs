//! Frame decoding
//!
//! A [`FrameDecoder`] is a pure function over an accumulated byte buffer. It
//! never keeps state between calls, so a partial frame left behind by one call
//! decodes once the rest of its bytes arrive. [`FrameAssembler`] owns the
//! pending bytes and applies the recovery policy for corrupted input.

use std::fmt;
use tracing::debug;

/// A decoded protocol unit that still knows its wire encoding
pub trait WireFrame: fmt::Debug + Send + 'static {
    /// Bytes this frame was decoded from
    fn raw(&self) -> &[u8];
}

impl WireFrame for u8 {
    fn raw(&self) -> &[u8] {
        std::slice::from_ref(self)
    }
}

/// Frames found at the start of a buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decoded<F> {
    /// Complete frames in arrival order
    pub frames: Vec<F>,
    /// Number of leading bytes the frames occupied
    pub consumed: usize,
}

impl<F> Decoded<F> {
    /// Nothing complete yet
    pub fn incomplete() -> Self {
        Self {
            frames: Vec::new(),
            consumed: 0,
        }
    }
}

/// The bytes at the front of the buffer can never become a valid frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodeError {
    /// What was wrong with them
    pub reason: String,
}

impl DecodeError {
    /// Create a decode error
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reason)
    }
}

impl std::error::Error for DecodeError {}

/// Extracts frames from the front of a byte buffer.
///
/// Contract:
/// - an incomplete frame at the front yields `Ok` with no frames;
/// - frames that precede a malformed region are returned as `Ok` and the
///   malformed bytes are left unconsumed;
/// - `Err` is only returned when the very first bytes are malformed.
pub trait FrameDecoder: Send + Sync + 'static {
    /// Decoded unit
    type Frame: WireFrame;

    /// Decode as many complete frames as possible from `buf`
    fn decode(&self, buf: &[u8]) -> Result<Decoded<Self::Frame>, DecodeError>;
}

/// Every byte is its own frame
#[derive(Debug, Clone, Copy, Default)]
pub struct RawDecoder;

impl FrameDecoder for RawDecoder {
    type Frame = u8;

    fn decode(&self, buf: &[u8]) -> Result<Decoded<u8>, DecodeError> {
        Ok(Decoded {
            frames: buf.to_vec(),
            consumed: buf.len(),
        })
    }
}

/// Format bytes as comma separated hex, the way frames appear in logs
pub fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(",")
}

/// Owns the bytes read from the device that are not part of a frame yet
pub struct FrameAssembler<D: FrameDecoder> {
    decoder: D,
    pending: Vec<u8>,
    discarded: u64,
}

impl<D: FrameDecoder> FrameAssembler<D> {
    /// Create an assembler with an empty pending buffer
    pub fn new(decoder: D) -> Self {
        Self {
            decoder,
            pending: Vec::new(),
            discarded: 0,
        }
    }

    /// Append freshly read bytes and return every frame that is now complete.
    ///
    /// When the front of the pending buffer is malformed the oldest byte is
    /// dropped and decoding is retried, one byte per attempt, until a frame
    /// boundary is found again or the buffer runs dry.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<D::Frame> {
        self.pending.extend_from_slice(bytes);
        let mut frames = Vec::new();

        while !self.pending.is_empty() {
            match self.decoder.decode(&self.pending) {
                Ok(decoded) => {
                    if decoded.frames.is_empty() || decoded.consumed == 0 {
                        break;
                    }
                    self.pending.drain(..decoded.consumed.min(self.pending.len()));
                    frames.extend(decoded.frames);
                }
                Err(e) => {
                    debug!(reason = %e, "Unhandled bytes: {}", hex(&self.pending));
                    self.pending.remove(0);
                    self.discarded += 1;
                }
            }
        }

        frames
    }

    /// Bytes waiting for the rest of their frame
    pub fn pending(&self) -> &[u8] {
        &self.pending
    }

    /// Total bytes dropped by corruption recovery
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// Forget pending bytes
    pub fn clear(&mut self) {
        if !self.pending.is_empty() {
            debug!("Dropping pending bytes: {}", hex(&self.pending));
            self.discarded += self.pending.len() as u64;
            self.pending.clear();
        }
    }
}
