//! Monotonic microsecond clock
//!
//! Every timestamp the loopback compares across threads (push times, latency
//! snapshots, adjustment cycles) comes from one shared [`Clock`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Source of monotonic time in microseconds
pub trait Clock: Send + Sync {
    /// Current time in microseconds since an arbitrary fixed origin
    fn now_usec(&self) -> u64;
}

/// Production clock backed by [`Instant`]
#[derive(Debug)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// Shared handle, the form the engine components take
    pub fn shared() -> Arc<dyn Clock> {
        Arc::new(Self::new())
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_usec(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }
}

/// Hand-driven clock for tests and offline simulation
///
/// # Example
/// ```
/// use audioloop_core::clock::{Clock, ManualClock};
///
/// let clock = ManualClock::new(1_000);
/// clock.advance(500);
/// assert_eq!(clock.now_usec(), 1_500);
/// ```
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_usec: u64) -> Self {
        Self {
            now: AtomicU64::new(start_usec),
        }
    }

    pub fn set(&self, usec: u64) {
        self.now.store(usec, Ordering::Release);
    }

    pub fn advance(&self, usec: u64) {
        self.now.fetch_add(usec, Ordering::AcqRel);
    }
}

impl Clock for ManualClock {
    fn now_usec(&self) -> u64 {
        self.now.load(Ordering::Acquire)
    }
}
