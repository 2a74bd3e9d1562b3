//! Capability interfaces the loopback expects from its source and sink
//!
//! The control thread talks to devices through [`SourceControl`] and
//! [`SinkControl`]; the real-time paths only see the cheap per-thread views
//! [`SourceThread`] and [`SinkThread`]. All methods take `&self`, so
//! implementations keep whatever they mutate behind atomics or locks.

use super::spec::SampleSpec;

/// `underrun_for` value of a sink that has been starved without bound
pub const UNDERRUN_UNBOUNDED: usize = usize::MAX;

/// How a device reports its latency
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatencyMode {
    /// Latency can be requested anywhere within `min..=max` (usec)
    Dynamic { min: u64, max: u64 },
    /// Latency is fixed by the device (usec)
    Fixed(u64),
}

impl LatencyMode {
    /// `(min, max)` latency in usec
    pub fn range(&self) -> (u64, u64) {
        match *self {
            LatencyMode::Dynamic { min, max } => (min, max),
            LatencyMode::Fixed(latency) => (latency, latency),
        }
    }
}

/// Control-thread view of the capture device
pub trait SourceControl: Send + Sync {
    fn name(&self) -> &str;

    fn sample_spec(&self) -> SampleSpec;

    fn latency_mode(&self) -> LatencyMode;

    /// Driver family, e.g. `"alsa"`; fixed-latency ALSA sources deliver one
    /// fragment per wakeup
    fn driver_api(&self) -> Option<&str> {
        None
    }

    /// User-configured compensation for the port (usec, may be negative)
    fn port_latency_offset(&self) -> i64 {
        0
    }

    /// Latency the device currently runs with (usec, 0 when unknown)
    fn requested_latency(&self) -> u64;

    /// Ask for a latency; returns the value actually granted
    fn set_requested_latency(&self, usec: u64) -> u64;

    fn is_suspended(&self) -> bool {
        false
    }
}

/// Control-thread view of the playback device
pub trait SinkControl: Send + Sync {
    fn name(&self) -> &str;

    fn sample_spec(&self) -> SampleSpec;

    fn latency_mode(&self) -> LatencyMode;

    fn port_latency_offset(&self) -> i64 {
        0
    }

    fn requested_latency(&self) -> u64;

    fn set_requested_latency(&self, usec: u64) -> u64;

    fn is_suspended(&self) -> bool {
        false
    }

    /// Run the loopback stream's resampler at `rate` instead of the base rate
    fn set_stream_rate(&self, rate: u32);
}

/// Capture-thread view of the source
pub trait SourceThread {
    /// Current device latency (usec)
    fn latency_within_thread(&self) -> i64;

    /// Captured bytes the source still holds back
    fn delay_queue_len(&self) -> usize {
        0
    }
}

/// Render-thread view of the sink
pub trait SinkThread {
    /// Current device latency (usec)
    fn latency_within_thread(&self) -> i64;

    /// Bytes already taken from the loopback but not yet played
    fn render_queue_len(&self) -> usize {
        0
    }

    /// Latency the sink is configured for right now (usec)
    fn requested_latency_within_thread(&self) -> u64;

    fn is_suspended(&self) -> bool {
        false
    }

    /// Bytes the stream has been starved for, [`UNDERRUN_UNBOUNDED`] if open-ended
    fn underrun_for(&self) -> usize {
        0
    }

    /// Largest single pull the sink issues (bytes)
    fn max_request(&self) -> usize;

    /// How far back the sink may rewind (bytes)
    fn max_rewind(&self) -> usize {
        0
    }

    /// Ask the sink to re-render the last `nbytes`
    fn request_rewind(&self, nbytes: usize);
}
