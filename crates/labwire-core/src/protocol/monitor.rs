//! Queue monitor
//!
//! A resettable one-shot timer on its own thread. When armed and the
//! inactivity window elapses without a `pause()`/`resume()`, it runs the
//! eviction callback once and goes to `Expired`. Frames arriving afterwards
//! re-arm it through [`QueueMonitor::notify_activity`]; a paused monitor is
//! never re-armed that way. Pauses nest, so a write and a request running on
//! different threads both keep the monitor suspended.
//!
//! Eviction runs while the control lock is held, so once `pause()` returns no
//! eviction is running or pending.

use std::io;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Where the monitor's timer is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    /// Paused (or never resumed); nothing will be evicted
    Suspended,
    /// Will evict at the given instant unless paused or reset first
    Armed(Instant),
    /// Fired; waits for new frames or an explicit resume
    Expired,
}

struct Control {
    state: MonitorState,
    timeout: Duration,
    enabled: bool,
    shutdown: bool,
    /// Outstanding pauses
    holds: usize,
}

struct Shared {
    control: Mutex<Control>,
    wake: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Evicts unclaimed frames after a period of inactivity
pub struct QueueMonitor {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl QueueMonitor {
    /// Start the monitor thread in the `Suspended` state.
    ///
    /// `evict` drains the queue and returns how many entries it discarded.
    pub fn spawn<E>(name: &str, timeout: Duration, enabled: bool, evict: E) -> io::Result<Self>
    where
        E: Fn() -> usize + Send + 'static,
    {
        let shared = Arc::new(Shared {
            control: Mutex::new(Control {
                state: MonitorState::Suspended,
                timeout,
                enabled,
                shutdown: false,
                holds: 0,
            }),
            wake: Condvar::new(),
        });

        let thread_shared = shared.clone();
        let handle = thread::Builder::new()
            .name(format!("{}-qmon", name))
            .spawn(move || run(&thread_shared, evict))?;

        Ok(Self {
            shared,
            thread: Mutex::new(Some(handle)),
        })
    }

    /// Cancel the timer. No eviction happens until every pause has been
    /// matched by a resume.
    pub fn pause(&self) {
        let mut control = self.shared.lock();
        control.holds += 1;
        control.state = MonitorState::Suspended;
        self.shared.wake.notify_all();
    }

    /// Release one pause; the last release starts a fresh inactivity window
    /// (only when enabled)
    pub fn resume(&self) {
        let mut control = self.shared.lock();
        control.holds = control.holds.saturating_sub(1);
        if control.holds == 0 {
            self.arm(&mut control);
        }
    }

    fn arm(&self, control: &mut Control) {
        if control.enabled && !control.shutdown {
            // A window too long to represent never elapses
            control.state = match Instant::now().checked_add(control.timeout) {
                Some(deadline) => MonitorState::Armed(deadline),
                None => MonitorState::Suspended,
            };
            self.shared.wake.notify_all();
        }
    }

    /// Frames arrived; re-arm a monitor that already fired
    pub fn notify_activity(&self) {
        let mut control = self.shared.lock();
        if control.state == MonitorState::Expired {
            self.arm(&mut control);
        }
    }

    /// Change the inactivity window; restarts it unless paused
    pub fn set_timeout(&self, timeout: Duration) {
        let mut control = self.shared.lock();
        control.timeout = timeout;
        if control.holds == 0 {
            self.arm(&mut control);
        }
    }

    /// Current inactivity window
    pub fn timeout(&self) -> Duration {
        self.shared.lock().timeout
    }

    /// Enable (and arm, unless paused) or disable the monitor
    pub fn set_enabled(&self, enabled: bool) {
        let mut control = self.shared.lock();
        control.enabled = enabled;
        if !enabled {
            control.state = MonitorState::Suspended;
            self.shared.wake.notify_all();
        } else if control.holds == 0 {
            self.arm(&mut control);
        }
    }

    /// Whether the monitor is enabled
    pub fn is_enabled(&self) -> bool {
        self.shared.lock().enabled
    }

    /// Current timer state
    pub fn state(&self) -> MonitorState {
        self.shared.lock().state
    }

    /// Stop the monitor thread and wait for it. Safe to call more than once.
    pub fn shutdown(&self) {
        {
            let mut control = self.shared.lock();
            control.shutdown = true;
            control.state = MonitorState::Suspended;
            self.shared.wake.notify_all();
        }
        let handle = self
            .thread
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                debug!("queue monitor thread panicked");
            }
        }
    }
}

impl Drop for QueueMonitor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run<E: Fn() -> usize>(shared: &Shared, evict: E) {
    let mut control = shared.lock();
    loop {
        if control.shutdown {
            break;
        }
        match control.state {
            MonitorState::Armed(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    control.state = MonitorState::Expired;
                    let discarded = evict();
                    if discarded > 0 {
                        debug!("Clear RX queue ({})", discarded);
                    } else {
                        trace!("queue monitor fired on an empty queue");
                    }
                } else {
                    control = shared
                        .wake
                        .wait_timeout(control, deadline - now)
                        .unwrap_or_else(|e| e.into_inner())
                        .0;
                }
            }
            MonitorState::Suspended | MonitorState::Expired => {
                control = shared.wake.wait(control).unwrap_or_else(|e| e.into_inner());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_monitor(timeout: Duration) -> (QueueMonitor, Arc<AtomicUsize>) {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let monitor = QueueMonitor::spawn("test", timeout, true, move || {
            counter.fetch_add(1, Ordering::SeqCst);
            1
        })
        .unwrap();
        (monitor, fired)
    }

    #[test]
    fn test_starts_suspended() {
        let (monitor, fired) = counting_monitor(Duration::from_millis(5));
        thread::sleep(Duration::from_millis(30));
        assert_eq!(monitor.state(), MonitorState::Suspended);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_fires_once_per_window() {
        let (monitor, fired) = counting_monitor(Duration::from_millis(10));
        monitor.resume();
        thread::sleep(Duration::from_millis(80));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(monitor.state(), MonitorState::Expired);
    }

    #[test]
    fn test_pause_prevents_eviction() {
        let (monitor, fired) = counting_monitor(Duration::from_millis(20));
        monitor.resume();
        monitor.pause();
        thread::sleep(Duration::from_millis(60));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_resume_restarts_window() {
        let (monitor, fired) = counting_monitor(Duration::from_millis(60));
        monitor.resume();
        thread::sleep(Duration::from_millis(40));
        monitor.pause();
        monitor.resume();
        thread::sleep(Duration::from_millis(40));
        // 80ms since the first resume but only 40ms since the restart
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        thread::sleep(Duration::from_millis(80));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_activity_rearms_only_after_expiry() {
        let (monitor, fired) = counting_monitor(Duration::from_millis(10));
        monitor.notify_activity();
        assert_eq!(monitor.state(), MonitorState::Suspended);

        monitor.resume();
        thread::sleep(Duration::from_millis(60));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        monitor.notify_activity();
        thread::sleep(Duration::from_millis(60));
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_nested_pauses_hold_until_last_resume() {
        let (monitor, fired) = counting_monitor(Duration::from_millis(10));
        monitor.resume();
        monitor.pause();
        monitor.pause();
        monitor.resume();
        assert_eq!(monitor.state(), MonitorState::Suspended);
        monitor.set_enabled(true);
        monitor.set_timeout(Duration::from_millis(5));
        thread::sleep(Duration::from_millis(40));
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        monitor.resume();
        thread::sleep(Duration::from_millis(60));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unbounded_window_never_fires() {
        let (monitor, fired) = counting_monitor(Duration::from_millis(5));
        monitor.set_timeout(Duration::MAX);
        monitor.resume();
        thread::sleep(Duration::from_millis(30));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(monitor.state(), MonitorState::Suspended);

        monitor.set_timeout(Duration::from_millis(5));
        thread::sleep(Duration::from_millis(40));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_disabled_monitor_never_arms() {
        let (monitor, fired) = counting_monitor(Duration::from_millis(5));
        monitor.set_enabled(false);
        monitor.resume();
        thread::sleep(Duration::from_millis(30));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(!monitor.is_enabled());
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let (monitor, _fired) = counting_monitor(Duration::from_millis(5));
        monitor.resume();
        monitor.shutdown();
        monitor.shutdown();
        monitor.resume();
        assert_eq!(monitor.state(), MonitorState::Suspended);
    }
}
