//! Audioloop - adaptive-rate audio loopback
//!
//! This library re-exports the loopback engine, configuration and
//! statistics from `audioloop-core`.

pub use audioloop_core::audio;
pub use audioloop_core::clock;
pub use audioloop_core::config;
pub use audioloop_core::error;
pub use audioloop_core::stats;

pub use audioloop_core::{
    Clock, Controller, LoopbackConfig, LoopbackError, LoopbackSession, ManualClock,
    MonotonicClock, SessionState, StatsStore,
};
pub use audioloop_core::{
    BUILD_DATE, DEFAULT_LATENCY_MSEC, QUEUE_MAX_LENGTH, USEC_PER_MSEC, USEC_PER_SEC, VERSION,
};
