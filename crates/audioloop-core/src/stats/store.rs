//! Time-series data storage for adjustment cycles
//!
//! Stores one record per finished cycle with automatic cleanup of old data.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;

/// Maximum number of cycles kept (10 hours at the default 10s cycle)
const MAX_HISTORY_SIZE: usize = 3600;

/// What one adjustment cycle measured and did
#[derive(Debug, Clone, Serialize)]
pub struct CycleRecord {
    /// When the cycle finished
    pub timestamp: DateTime<Utc>,
    /// Measured end-to-end latency (usec)
    pub latency_usec: i64,
    /// Latency at base rate minus the effective target (usec)
    pub latency_difference_usec: i32,
    /// Stream rate after the cycle
    pub rate: u32,
    /// Whether samples were dropped or inserted directly instead of a rate change
    pub fast_adjust: bool,
}

/// Running statistics calculated from cycles
#[derive(Debug, Default, Clone, Serialize)]
pub struct RunningStats {
    /// Last measured latency (ms)
    pub current_latency: f64,
    /// Minimum latency observed (ms)
    pub min_latency: f64,
    /// Maximum latency observed (ms)
    pub max_latency: f64,
    /// Average latency over the kept history (ms)
    pub avg_latency: f64,
    /// Current stream rate
    pub rate: u32,
    /// Rate the stream started at
    pub base_rate: u32,
    /// Cycles that produced a measurement
    pub cycle_count: u64,
    /// Cycles that dropped or inserted samples directly
    pub fast_adjust_count: u64,
    /// Underruns reported by the output path
    pub total_underruns: u64,
    /// Current lower bound for the end-to-end latency (ms)
    pub minimum_latency: f64,
}

/// Statistics store for adjustment cycles
#[derive(Debug)]
pub struct StatsStore {
    history: VecDeque<CycleRecord>,
    max_size: usize,
    stats: RunningStats,
}

impl StatsStore {
    /// Create a new statistics store
    pub fn new() -> Self {
        Self {
            history: VecDeque::with_capacity(MAX_HISTORY_SIZE),
            max_size: MAX_HISTORY_SIZE,
            stats: RunningStats {
                min_latency: f64::MAX,
                ..Default::default()
            },
        }
    }

    /// Record a finished cycle
    pub fn record_cycle(
        &mut self,
        latency_usec: i64,
        latency_difference_usec: i32,
        rate: u32,
        fast_adjust: bool,
    ) {
        let record = CycleRecord {
            timestamp: Utc::now(),
            latency_usec,
            latency_difference_usec,
            rate,
            fast_adjust,
        };

        if self.history.len() >= self.max_size {
            self.history.pop_front();
        }
        self.history.push_back(record);

        let latency_ms = latency_usec as f64 / 1000.0;
        self.stats.current_latency = latency_ms;
        self.stats.min_latency = self.stats.min_latency.min(latency_ms);
        self.stats.max_latency = self.stats.max_latency.max(latency_ms);
        self.stats.rate = rate;
        self.stats.cycle_count += 1;
        if fast_adjust {
            self.stats.fast_adjust_count += 1;
        }

        let sum: f64 = self.history.iter().map(|r| r.latency_usec as f64).sum();
        self.stats.avg_latency = sum / self.history.len() as f64 / 1000.0;
    }

    pub fn record_underrun(&mut self) {
        self.stats.total_underruns += 1;
    }

    pub fn set_minimum_latency(&mut self, usec: u64) {
        self.stats.minimum_latency = usec as f64 / 1000.0;
    }

    pub fn set_base_rate(&mut self, rate: u32) {
        self.stats.base_rate = rate;
        if self.stats.rate == 0 {
            self.stats.rate = rate;
        }
    }

    pub fn history(&self) -> &VecDeque<CycleRecord> {
        &self.history
    }

    pub fn stats(&self) -> &RunningStats {
        &self.stats
    }
}

impl Default for StatsStore {
    fn default() -> Self {
        Self::new()
    }
}
