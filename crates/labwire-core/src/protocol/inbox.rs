//! Shared FIFO of decoded frames
//!
//! The receiver thread pushes, the request path pops and clears, and the queue
//! monitor drains stale entries. All three go through one mutex; waiting uses a
//! condvar so the lock is never held while a caller blocks.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::ProtocolError;

struct InboxState<F> {
    queue: VecDeque<F>,
    closed: bool,
}

/// Thread-safe frame queue with blocking, time-bounded reads
pub struct Inbox<F> {
    state: Mutex<InboxState<F>>,
    available: Condvar,
}

impl<F> Default for Inbox<F> {
    fn default() -> Self {
        Self::new()
    }
}

impl<F> Inbox<F> {
    /// Create an empty, open inbox
    pub fn new() -> Self {
        Self {
            state: Mutex::new(InboxState {
                queue: VecDeque::new(),
                closed: false,
            }),
            available: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, InboxState<F>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append frames in order and wake waiters. Frames pushed after
    /// [`Inbox::close`] are dropped.
    pub fn push_all(&self, frames: impl IntoIterator<Item = F>) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        state.queue.extend(frames);
        self.available.notify_all();
    }

    /// Append one frame
    pub fn push(&self, frame: F) {
        self.push_all(std::iter::once(frame));
    }

    /// Take the oldest frame, waiting up to `timeout` for one to arrive.
    ///
    /// Returns `Ok(None)` on timeout and `Err(Closed)` once the inbox has been
    /// closed, even if the caller was already waiting.
    pub fn pop_timeout(&self, timeout: Duration) -> Result<Option<F>, ProtocolError> {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.lock();
        loop {
            if state.closed {
                return Err(ProtocolError::Closed);
            }
            if let Some(frame) = state.queue.pop_front() {
                return Ok(Some(frame));
            }
            state = match self.wait(state, deadline) {
                Some(state) => state,
                None => return Ok(None),
            };
        }
    }

    /// Wait until at least one frame is queued. Returns false on timeout or
    /// when the inbox is closed.
    pub fn wait_for_data(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.lock();
        loop {
            if state.closed {
                return false;
            }
            if !state.queue.is_empty() {
                return true;
            }
            state = match self.wait(state, deadline) {
                Some(state) => state,
                None => return false,
            };
        }
    }

    /// Block on the condvar until woken or `deadline` passes. `None` as the
    /// deadline means the timeout did not fit in an `Instant`: wait without one.
    /// Returns `None` once the deadline has passed.
    fn wait<'a>(
        &self,
        state: MutexGuard<'a, InboxState<F>>,
        deadline: Option<Instant>,
    ) -> Option<MutexGuard<'a, InboxState<F>>> {
        match deadline {
            None => Some(self.available.wait(state).unwrap_or_else(|e| e.into_inner())),
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return None;
                }
                Some(
                    self.available
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(|e| e.into_inner())
                        .0,
                )
            }
        }
    }

    /// Remove and return every queued frame
    pub fn drain(&self) -> Vec<F> {
        self.lock().queue.drain(..).collect()
    }

    /// Discard every queued frame, returning how many were dropped
    pub fn clear(&self) -> usize {
        let mut state = self.lock();
        let n = state.queue.len();
        state.queue.clear();
        n
    }

    /// Number of queued frames
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.lock().queue.is_empty()
    }

    /// Fail current and future waits. Returns the frames that were still
    /// queued so the caller can account for them.
    pub fn close(&self) -> Vec<F> {
        let mut state = self.lock();
        state.closed = true;
        self.available.notify_all();
        state.queue.drain(..).collect()
    }

    /// Whether [`Inbox::close`] has been called
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}
