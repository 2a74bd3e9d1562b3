//! Audioloop Core - adaptive-rate loopback engine
//!
//! Bridges one capture source to one playback sink through a latency-shaping
//! queue. A control thread periodically compares the measured end-to-end
//! latency with the configured target and nudges the stream sample rate (by
//! less than 1% per cycle) until the two agree, while the input and output
//! paths run on their own real-time threads and only talk through messages.

pub mod audio;
pub mod clock;
pub mod config;
pub mod error;
pub mod stats;

pub use audio::controller::Controller;
pub use audio::session::{LoopbackSession, SessionState};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::LoopbackConfig;
pub use error::LoopbackError;
pub use stats::store::StatsStore;

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build date stamped by build.rs
pub const BUILD_DATE: &str = env!("BUILD_DATE");

/// Microseconds per millisecond
pub const USEC_PER_MSEC: u64 = 1_000;

/// Microseconds per second
pub const USEC_PER_SEC: u64 = 1_000_000;

/// Default end-to-end target latency (200ms)
pub const DEFAULT_LATENCY_MSEC: u32 = 200;

/// Largest target or maximum latency accepted from configuration (30s)
pub const MAX_LATENCY_MSEC: u32 = 30_000;

/// Default period of the rate adjustment cycle (10s)
pub const DEFAULT_ADJUST_TIME_SEC: u32 = 10;

/// Largest accepted fast-adjust threshold
pub const MAX_FAST_ADJUST_THRESHOLD_MSEC: u32 = 100;

/// Lowest supported stream sample rate
pub const MIN_SAMPLE_RATE: u32 = 4_000;

/// Highest supported stream sample rate
pub const MAX_SAMPLE_RATE: u32 = 384_000;

/// Hard cap on the adjustment queue (32 MiB)
pub const QUEUE_MAX_LENGTH: usize = 32 * 1024 * 1024;
