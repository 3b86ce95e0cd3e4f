//! Auto-reset wake-up event usable across processes
//!
//! The event is a single flag in shared memory. Waiters spin briefly, then
//! yield, then sleep in short slices until the flag is set or the timeout
//! elapses. A successful wait consumes the signal.
//!
//! Nothing wakes a sleeping waiter, so a wake-up is noticed up to one sleep
//! slice late. [`Event::wait`] caps the slice at [`MAX_SLEEP`]; latency
//! sensitive waiters pick a smaller cap with [`Event::wait_with_latency`]
//! and pay for it in CPU.

use crossbeam_utils::Backoff;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

/// Longest sleep slice of [`Event::wait`]
pub const MAX_SLEEP: Duration = Duration::from_millis(1);

const FIRST_SLEEP: Duration = Duration::from_micros(10);

/// Polled wake-up flag. A wait returns at most one sleep slice after
/// [`Event::set`].
#[repr(C)]
pub struct Event {
    signaled: AtomicU32,
    /// Number of times the event was set, for diagnostics
    generation: AtomicU32,
}

impl Event {
    pub const fn new() -> Self {
        Self {
            signaled: AtomicU32::new(0),
            generation: AtomicU32::new(0),
        }
    }

    pub fn set(&self) {
        self.generation.fetch_add(1, Ordering::Relaxed);
        self.signaled.store(1, Ordering::Release);
    }

    pub fn reset(&self) {
        self.signaled.store(0, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.signaled.load(Ordering::Acquire) != 0
    }

    pub fn generation(&self) -> u32 {
        self.generation.load(Ordering::Relaxed)
    }

    fn try_consume(&self) -> bool {
        self.signaled
            .compare_exchange(1, 0, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    /// Wait until the event is set, consuming the signal. Returns false if
    /// `timeout` elapsed first.
    pub fn wait(&self, timeout: Duration) -> bool {
        self.wait_with_latency(timeout, MAX_SLEEP)
    }

    /// Like [`Event::wait`], sleeping no longer than `latency` between
    /// checks of the flag
    pub fn wait_with_latency(&self, timeout: Duration, latency: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let backoff = Backoff::new();
        let latency = latency.max(Duration::from_micros(1));
        let mut sleep = FIRST_SLEEP.min(latency);
        loop {
            if self.try_consume() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            if backoff.is_completed() {
                std::thread::sleep(sleep.min(deadline - now));
                sleep = (sleep * 2).min(latency);
            } else {
                backoff.snooze();
            }
        }
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}
