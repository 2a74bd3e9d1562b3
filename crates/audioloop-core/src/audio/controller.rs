//! Rate and latency controller (control thread)
//!
//! Once per adjustment cycle the controller compares the end-to-end latency
//! reported by the two data paths with the configured target and moves the
//! stream rate toward the value that closes the gap. A single cycle never
//! changes the rate by 1% or more of the base rate.
//!
//! The controller also owns everything that only changes on the control
//! thread: device latency boundaries, the minimum achievable latency, the
//! underrun-driven latency floor and the adjustment timer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crossbeam_channel::Sender;

use super::device::{LatencyMode, SinkControl, SourceControl};
use super::message::{DeviceEvent, LatencySnapshot, ToInput, ToMain, ToOutput};
use super::output::{OutputParams, SinkSuspendHandle};
use super::spec::SampleSpec;
use crate::clock::Clock;
use crate::config::LoopbackConfig;
use crate::stats::store::StatsStore;
use crate::{USEC_PER_MSEC, USEC_PER_SEC};

/// Device latencies below this cause trouble (2.5ms)
pub const MIN_DEVICE_LATENCY: u64 = 2_500;

/// Delay before the first cycle after the timer is armed
pub const ADJUST_TIME_FOR_CHANGE: u64 = 333 * USEC_PER_MSEC;

/// Underruns tolerated before the latency floor is raised
pub const UNDERRUN_THRESHOLD: u32 = 2;

/// Latency floor increase per underrun reaction (5ms)
pub const UNDERRUN_LATENCY_STEP: u64 = 5 * USEC_PER_MSEC;

/// A cycle this much longer than configured means the system slept
const SLEEP_FACTOR: f64 = 1.05;

/// Fraction of the base rate one cycle may correct
const RATE_CORRECTION_LIMIT: f64 = 0.01;

const SECONDS_PER_HOUR: u64 = 3600;

/// Rate that corrects `latency_difference` without a rate step of 1% or more
///
/// # Example
/// ```
/// use audioloop_core::audio::controller::rate_controller;
///
/// // 10ms too much latency over a 10s cycle
/// assert_eq!(rate_controller(48_000, 10_000_000, 10_000), 48_043);
/// // far too little latency: slightly less than 1% slower
/// assert_eq!(rate_controller(48_000, 10_000_000, -5_000_000), 47_529);
/// ```
pub fn rate_controller(base_rate: u32, adjust_time: u64, latency_difference: i32) -> u32 {
    let adjust_time = adjust_time as f64;
    let difference = latency_difference as f64;
    let min_cycles = difference.abs() / adjust_time / RATE_CORRECTION_LIMIT + 1.0;
    (base_rate as f64 * (1.0 + difference / min_cycles / adjust_time)) as u32
}

/// `a - b` clipped at zero
fn clip_sub(a: i64, b: i64) -> u64 {
    if a > b {
        (a - b) as u64
    } else {
        0
    }
}

/// Clamp that prefers `hi` when the range is inverted
fn clamp_latency(value: u64, lo: u64, hi: u64) -> u64 {
    if value > hi {
        hi
    } else if value < lo {
        lo
    } else {
        value
    }
}

/// Device latency ranges and port offsets as last read
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LatencyBounds {
    pub min_source_latency: u64,
    pub max_source_latency: u64,
    pub min_sink_latency: u64,
    pub max_sink_latency: u64,
    pub source_latency_offset: i64,
    pub sink_latency_offset: i64,
    /// Fixed-latency ALSA source: delivers one fragment per wakeup
    pub fixed_alsa_source: bool,
}

impl LatencyBounds {
    fn offsets(&self) -> i64 {
        self.sink_latency_offset + self.source_latency_offset
    }
}

/// Which side of the loopback is corked
///
/// Written by the control thread, read by whatever drives the data paths.
#[derive(Debug)]
pub struct CorkState {
    source: AtomicBool,
    sink: AtomicBool,
}

impl CorkState {
    /// Both sides start corked
    pub fn new() -> Self {
        Self {
            source: AtomicBool::new(true),
            sink: AtomicBool::new(true),
        }
    }

    pub fn source_corked(&self) -> bool {
        self.source.load(Ordering::Acquire)
    }

    pub fn sink_corked(&self) -> bool {
        self.sink.load(Ordering::Acquire)
    }

    fn cork_source(&self, corked: bool) {
        self.source.store(corked, Ordering::Release);
    }

    fn cork_sink(&self, corked: bool) {
        self.sink.store(corked, Ordering::Release);
    }
}

impl Default for CorkState {
    fn default() -> Self {
        Self::new()
    }
}

/// Why a cycle did not touch the rate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// First cycle after a start, fast adjust or device change
    SourceSinkChanged,
    /// The cycle took much longer than configured; the system probably slept
    Suspended { elapsed: u64 },
    /// One of the two latency reports has not arrived yet
    NoSnapshot,
}

/// Result of one adjustment cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Skipped(SkipReason),
    /// Samples are dropped or inserted directly; the rate is left alone
    FastAdjust { latency_difference: i32 },
    RateUpdated { rate: u32, latency_difference: i32 },
}

/// Channels from the controller to the two data paths
pub struct ControllerLinks {
    pub to_output: Sender<ToOutput>,
    pub to_input: Sender<ToInput>,
}

/// Control-thread state of one loopback
pub struct Controller {
    source: Arc<dyn SourceControl>,
    sink: Arc<dyn SinkControl>,
    to_output: Sender<ToOutput>,
    to_input: Sender<ToInput>,
    sink_suspend: SinkSuspendHandle,
    cork: Arc<CorkState>,
    clock: Arc<dyn Clock>,
    stats: Arc<Mutex<StatsStore>>,

    /// Stream spec at the base rate
    spec: SampleSpec,
    stream_rate: u32,

    latency: u64,
    max_latency: u64,
    adjust_time: u64,
    fast_adjust_threshold: u64,
    fragment_size: u64,

    bounds: LatencyBounds,
    configured_source_latency: u64,
    configured_sink_latency: u64,
    minimum_latency: u64,
    /// Floor learned from underruns (0 = none yet)
    underrun_latency_limit: u64,

    iteration_counter: u32,
    underrun_counter: u32,
    adjust_counter: u32,
    real_adjust_time: u64,
    real_adjust_time_sum: u64,
    adjust_time_stamp: u64,
    source_sink_changed: bool,

    snapshot: LatencySnapshot,
    have_source_snapshot: bool,
    have_sink_snapshot: bool,

    timer_deadline: Option<u64>,
    source_suspended: bool,
    sink_suspended: bool,
}

impl Controller {
    /// Read device boundaries and request device latencies
    pub fn new(
        config: &LoopbackConfig,
        spec: SampleSpec,
        source: Arc<dyn SourceControl>,
        sink: Arc<dyn SinkControl>,
        links: ControllerLinks,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let adjust_time = config.adjust_time_usec();
        let source_suspended = source.is_suspended();
        let sink_suspended = sink.is_suspended();
        let stats = Arc::new(Mutex::new(StatsStore::new()));
        if let Ok(mut store) = stats.lock() {
            store.set_base_rate(spec.rate);
        }

        let mut controller = Self {
            source,
            sink,
            to_output: links.to_output,
            to_input: links.to_input,
            sink_suspend: SinkSuspendHandle::default(),
            cork: Arc::new(CorkState::new()),
            clock,
            stats,
            spec,
            stream_rate: spec.rate,
            latency: config.latency_usec(),
            max_latency: config.max_latency_usec(),
            adjust_time,
            fast_adjust_threshold: config.fast_adjust_threshold_usec(),
            fragment_size: config.default_fragment_size_usec(),
            bounds: LatencyBounds::default(),
            configured_source_latency: 0,
            configured_sink_latency: 0,
            minimum_latency: 0,
            underrun_latency_limit: 0,
            iteration_counter: 0,
            underrun_counter: 0,
            adjust_counter: 0,
            real_adjust_time: adjust_time,
            real_adjust_time_sum: 0,
            adjust_time_stamp: 0,
            source_sink_changed: true,
            snapshot: LatencySnapshot::default(),
            have_source_snapshot: false,
            have_sink_snapshot: false,
            timer_deadline: None,
            source_suspended,
            sink_suspended,
        };

        // the output path does not exist yet; it starts from output_params()
        controller.read_latency_bounds();
        controller.minimum_latency = controller.compute_minimum_latency();
        controller.log_minimum_latency();
        controller.record_minimum_latency();
        controller.set_sink_latency();
        controller.set_source_latency();
        controller
    }

    /// Starting values for the output path
    pub fn output_params(&self) -> OutputParams {
        OutputParams {
            spec: self.spec,
            latency: self.latency,
            minimum_latency: self.minimum_latency,
            effective_source_latency: self.effective_source_latency(),
            suspend: self.sink_suspend.clone(),
        }
    }

    fn read_latency_bounds(&mut self) {
        let bounds = &mut self.bounds;

        bounds.fixed_alsa_source = false;
        let (min, max) = self.source.latency_mode().range();
        if let LatencyMode::Fixed(_) = self.source.latency_mode() {
            bounds.fixed_alsa_source = self.source.driver_api() == Some("alsa");
        }
        bounds.source_latency_offset = self.source.port_latency_offset();
        bounds.max_source_latency = max;
        bounds.min_source_latency = if max >= MIN_DEVICE_LATENCY {
            min.max(MIN_DEVICE_LATENCY)
        } else {
            max
        };

        let (min, max) = self.sink.latency_mode().range();
        bounds.sink_latency_offset = self.sink.port_latency_offset();
        bounds.max_sink_latency = max;
        bounds.min_sink_latency = if max >= MIN_DEVICE_LATENCY {
            min.max(MIN_DEVICE_LATENCY)
        } else {
            max
        };
    }

    /// Re-read device ranges and offsets and recompute the minimum latency
    pub fn update_latency_boundaries(&mut self) {
        self.read_latency_bounds();
        self.update_minimum_latency(true);
    }

    fn compute_minimum_latency(&self) -> u64 {
        let mut minimum = if self.underrun_latency_limit > 0 {
            self.underrun_latency_limit
        } else {
            // a fixed ALSA source never holds much more than one fragment
            let source_part = if self.bounds.fixed_alsa_source {
                self.fragment_size
            } else {
                self.bounds.min_source_latency
            };
            // 10% margin for delays that scale with buffer sizes, plus 1.5ms
            // for those that don't
            let scaled = ((self.bounds.min_sink_latency + source_part) as f64 * 1.1) as u64;
            scaled + 1_500
        };

        let offsets = self.bounds.offsets();
        if -offsets <= minimum as i64 {
            minimum = (minimum as i64 + offsets) as u64;
        } else {
            minimum = 0;
        }
        minimum
    }

    /// Recompute the minimum latency and hand it to the output path
    pub fn update_minimum_latency(&mut self, print: bool) {
        self.minimum_latency = self.compute_minimum_latency();
        let _ = self
            .to_output
            .send(ToOutput::UpdateMinLatency(self.minimum_latency));
        self.record_minimum_latency();
        if print {
            self.log_minimum_latency();
        }
    }

    fn log_minimum_latency(&self) {
        tracing::debug!(
            minimum_latency_ms = self.minimum_latency as f64 / USEC_PER_MSEC as f64,
            "minimum_latency"
        );
        if self.latency < self.minimum_latency {
            tracing::warn!(
                latency_ms = self.latency as f64 / USEC_PER_MSEC as f64,
                "Configured latency is smaller than minimum latency, using minimum instead"
            );
        }
    }

    fn record_minimum_latency(&self) {
        if let Ok(mut stats) = self.stats.lock() {
            stats.set_minimum_latency(self.minimum_latency);
        }
    }

    /// Request a third of the latency from the sink, less if the source can't match
    fn set_sink_latency(&mut self) {
        let mut requested = self.latency / 3;
        if self.bounds.min_source_latency > requested {
            let latency = self.latency.max(self.minimum_latency);
            requested = latency.saturating_sub(self.bounds.min_source_latency) / 2;
        }

        let latency = clamp_latency(
            requested,
            self.bounds.min_sink_latency,
            self.bounds.max_sink_latency,
        );
        self.configured_sink_latency = self.sink.set_requested_latency(latency);
        if self.configured_sink_latency != requested {
            tracing::warn!(
                requested_ms = requested as f64 / USEC_PER_MSEC as f64,
                granted_ms = self.configured_sink_latency as f64 / USEC_PER_MSEC as f64,
                "Cannot set requested sink latency"
            );
        }
    }

    /// Request a third of the latency from the source, less if the sink can't match
    fn set_source_latency(&mut self) {
        let mut requested = self.latency / 3;
        if self.bounds.min_sink_latency > requested {
            let latency = self.latency.max(self.minimum_latency);
            requested = latency.saturating_sub(self.bounds.min_sink_latency) / 2;
        }

        let latency = clamp_latency(
            requested,
            self.bounds.min_source_latency,
            self.bounds.max_source_latency,
        );
        self.configured_source_latency = self.source.set_requested_latency(latency);
        if self.configured_source_latency != requested {
            tracing::warn!(
                requested_ms = requested as f64 / USEC_PER_MSEC as f64,
                granted_ms = self.configured_source_latency as f64 / USEC_PER_MSEC as f64,
                "Cannot set requested source latency"
            );
        }
    }

    /// Latency the source really runs with; a source already in use may run
    /// below the configured value
    fn effective_source_latency(&self) -> u64 {
        let requested = self.source.requested_latency();
        if requested == 0 || requested > self.configured_source_latency {
            self.configured_source_latency
        } else {
            requested
        }
    }

    pub fn update_effective_source_latency(&mut self) {
        let latency = self.effective_source_latency();
        let _ = self
            .to_output
            .send(ToOutput::SetEffectiveSourceLatency(latency));
    }

    /// Uncork the sides whose opposite device is running and arm the timer
    pub fn start(&mut self) {
        if !self.source_suspended {
            self.cork.cork_sink(false);
        }
        if !self.sink_suspended {
            self.cork.cork_source(false);
        }
        self.update_timer();
    }

    /// Stop cycling for good
    pub fn shutdown(&mut self) {
        self.adjust_time = 0;
        self.enable_timer(false);
    }

    fn enable_timer(&mut self, enable: bool) {
        if enable {
            if self.adjust_time == 0 {
                return;
            }
            // give a changed source or sink time to settle
            self.timer_deadline = Some(self.clock.now_usec() + ADJUST_TIME_FOR_CHANGE);
        } else {
            self.timer_deadline = None;
        }
    }

    fn update_timer(&mut self) {
        let corked = self.cork.source_corked() || self.cork.sink_corked();
        self.enable_timer(!corked);
    }

    /// Next time [`Controller::on_timer`] is due, if the timer is armed
    pub fn timer_deadline(&self) -> Option<u64> {
        self.timer_deadline
    }

    /// Run a cycle if the timer is due
    pub fn poll(&mut self) -> Option<CycleOutcome> {
        match self.timer_deadline {
            Some(deadline) if self.clock.now_usec() >= deadline => Some(self.on_timer()),
            _ => None,
        }
    }

    /// Timer callback: re-arm, request fresh latency reports and adjust
    pub fn on_timer(&mut self) -> CycleOutcome {
        self.timer_deadline = Some(self.clock.now_usec() + self.adjust_time);

        // the replies are used by the next cycle
        let _ = self.to_output.send(ToOutput::LatencySnapshot);
        let _ = self.to_input.send(ToInput::LatencySnapshot);

        self.adjust_rates()
    }

    fn run_hours(&self) -> u64 {
        self.iteration_counter as u64 * self.real_adjust_time / USEC_PER_SEC / SECONDS_PER_HOUR
    }

    /// One adjustment cycle against the last complete latency snapshot
    pub fn adjust_rates(&mut self) -> CycleOutcome {
        let run_hours = self.run_hours();
        self.iteration_counter += 1;

        // too many underruns: the latency is too small
        if self.underrun_counter > UNDERRUN_THRESHOLD {
            self.raise_underrun_limit();
            self.update_minimum_latency(false);
            self.underrun_counter = 0;
        }

        // one underrun per hour is forgiven
        if self.run_hours() > run_hours {
            self.underrun_counter = self.underrun_counter.saturating_sub(1);
            tracing::debug!(underrun_counter = self.underrun_counter, "underrun_amnesty");
        }

        let now = self.clock.now_usec();
        let elapsed = now.saturating_sub(self.adjust_time_stamp);
        self.adjust_time_stamp = now;

        let slept = elapsed as f64 >= self.adjust_time as f64 * SLEEP_FACTOR;
        if self.source_sink_changed || slept {
            let reason = if self.source_sink_changed {
                SkipReason::SourceSinkChanged
            } else {
                SkipReason::Suspended { elapsed }
            };
            self.source_sink_changed = false;
            tracing::debug!(?reason, "adjust_cycle_skipped");
            return CycleOutcome::Skipped(reason);
        }

        self.adjust_counter += 1;
        self.real_adjust_time_sum += elapsed;
        self.real_adjust_time = self.real_adjust_time_sum / self.adjust_counter as u64;

        if !(self.have_source_snapshot && self.have_sink_snapshot) {
            tracing::debug!("adjust_cycle_skipped_no_snapshot");
            return CycleOutcome::Skipped(SkipReason::NoSnapshot);
        }
        self.have_source_snapshot = false;
        self.have_sink_snapshot = false;

        let base_rate = self.spec.rate;
        let old_rate = self.stream_rate;
        let snapshot = self.snapshot;

        let buffer_usec = self
            .spec
            .with_rate(old_rate)
            .bytes_to_usec(snapshot.buffered_bytes()) as i64;
        let source_sink_latency =
            snapshot.sink.sink_latency + snapshot.source.source_latency - snapshot.skew();
        let current_latency = source_sink_latency + buffer_usec;
        let latency_at_base_rate =
            source_sink_latency + buffer_usec * old_rate as i64 / base_rate as i64;

        let final_latency = self.latency.max(self.minimum_latency) as i64;
        let latency_difference = (latency_at_base_rate - final_latency) as i32;

        tracing::debug!(
            sink_ms = snapshot.sink.sink_latency as f64 / 1000.0,
            buffer_ms = buffer_usec as f64 / 1000.0,
            source_ms = snapshot.source.source_latency as f64 / 1000.0,
            total_ms = current_latency as f64 / 1000.0,
            at_base_rate_ms = latency_at_base_rate as f64 / 1000.0,
            "loopback_latency"
        );

        if self.fast_adjust_threshold > 0
            && latency_difference.unsigned_abs() as u64 > self.fast_adjust_threshold
        {
            tracing::debug!(
                threshold_ms = self.fast_adjust_threshold / USEC_PER_MSEC,
                latency_difference_us = latency_difference,
                "Latency difference over threshold, skipping or inserting samples"
            );
            let _ = self
                .to_output
                .send(ToOutput::FastAdjust(source_sink_latency));
            // the next cycle must not average across the jump
            self.source_sink_changed = true;
            self.record_cycle(current_latency, latency_difference, true);
            return CycleOutcome::FastAdjust { latency_difference };
        }

        let rate = rate_controller(base_rate, self.real_adjust_time, latency_difference);
        self.stream_rate = rate;
        self.sink.set_stream_rate(rate);
        tracing::debug!(sink = self.sink.name(), rate, "Updated sampling rate");
        self.record_cycle(current_latency, latency_difference, false);

        CycleOutcome::RateUpdated {
            rate,
            latency_difference,
        }
    }

    fn raise_underrun_limit(&mut self) {
        let target = self.latency.max(self.minimum_latency) + UNDERRUN_LATENCY_STEP;
        let offsets = self.bounds.offsets();
        if self.max_latency == 0 || target < self.max_latency {
            self.underrun_latency_limit = clip_sub(target as i64, offsets);
            tracing::warn!(
                latency_ms = target as f64 / USEC_PER_MSEC as f64,
                "Too many underruns, increasing latency"
            );
        } else {
            self.underrun_latency_limit = clip_sub(self.max_latency as i64, offsets);
            tracing::warn!(
                max_latency_ms = self.max_latency as f64 / USEC_PER_MSEC as f64,
                "Too many underruns, configured maximum latency is reached; consider increasing max_latency_msec"
            );
        }
    }

    fn record_cycle(&self, latency: i64, latency_difference: i32, fast_adjust: bool) {
        if let Ok(mut stats) = self.stats.lock() {
            stats.record_cycle(latency, latency_difference, self.stream_rate, fast_adjust);
        }
    }

    /// Handle one message posted by a data path
    pub fn handle_main_message(&mut self, message: ToMain) {
        match message {
            ToMain::SourceLatencyRangeChanged => {
                self.update_effective_source_latency();
                let current = self.source.requested_latency();
                // only increases happen in practice
                if current > self.configured_source_latency {
                    tracing::warn!(
                        latency_ms = current as f64 / USEC_PER_MSEC as f64,
                        "Source minimum latency increased"
                    );
                    self.configured_source_latency = current;
                    self.update_latency_boundaries();
                    self.iteration_counter = 0;
                    self.underrun_counter = 0;
                }
            }
            ToMain::SinkLatencyRangeChanged => {
                let current = self.sink.requested_latency();
                if current > self.configured_sink_latency {
                    tracing::warn!(
                        latency_ms = current as f64 / USEC_PER_MSEC as f64,
                        "Sink minimum latency increased"
                    );
                    self.configured_sink_latency = current;
                    self.update_latency_boundaries();
                    self.iteration_counter = 0;
                    self.underrun_counter = 0;
                }
            }
            ToMain::Underrun => {
                self.underrun_counter += 1;
                if let Ok(mut stats) = self.stats.lock() {
                    stats.record_underrun();
                }
                tracing::debug!(underrun_counter = self.underrun_counter, "underrun_detected");
            }
            ToMain::SourceSnapshot(snapshot) => {
                self.snapshot.source = snapshot;
                self.have_source_snapshot = true;
            }
            ToMain::SinkSnapshot(snapshot) => {
                self.snapshot.sink = snapshot;
                self.have_sink_snapshot = true;
            }
        }
    }

    pub fn handle_device_event(&mut self, event: DeviceEvent) {
        match event {
            DeviceEvent::SourceSuspended(suspended) => self.source_suspend_changed(suspended),
            DeviceEvent::SinkSuspended(suspended) => self.sink_suspend_changed(suspended),
            DeviceEvent::SourceLatencyOffsetChanged(offset) => {
                self.bounds.source_latency_offset = offset;
                self.update_minimum_latency(true);
            }
            DeviceEvent::SinkLatencyOffsetChanged(offset) => {
                self.bounds.sink_latency_offset = offset;
                self.update_minimum_latency(true);
            }
        }
    }

    fn source_suspend_changed(&mut self, suspended: bool) {
        if suspended == self.source_suspended {
            return;
        }
        self.source_suspended = suspended;

        if suspended {
            // a resumed source is handled like a new one
            let _ = self.to_output.send(ToOutput::SourceChanged);
        } else {
            self.update_effective_source_latency();
        }
        self.cork.cork_sink(suspended);
        self.update_timer();
    }

    fn sink_suspend_changed(&mut self, suspended: bool) {
        if suspended == self.sink_suspended {
            return;
        }
        self.sink_suspended = suspended;

        if suspended {
            // the sink is stopped, nothing pulls while the flags are reset
            self.sink_suspend.reset_handshake();
        } else {
            self.update_effective_source_latency();
        }
        self.cork.cork_source(suspended);
        self.update_timer();
    }

    pub fn cork_state(&self) -> Arc<CorkState> {
        self.cork.clone()
    }

    pub fn stats(&self) -> Arc<Mutex<StatsStore>> {
        self.stats.clone()
    }

    pub fn bounds(&self) -> LatencyBounds {
        self.bounds
    }

    pub fn minimum_latency(&self) -> u64 {
        self.minimum_latency
    }

    pub fn underrun_latency_limit(&self) -> u64 {
        self.underrun_latency_limit
    }

    pub fn underrun_counter(&self) -> u32 {
        self.underrun_counter
    }

    pub fn iteration_counter(&self) -> u32 {
        self.iteration_counter
    }

    pub fn real_adjust_time(&self) -> u64 {
        self.real_adjust_time
    }

    pub fn configured_source_latency(&self) -> u64 {
        self.configured_source_latency
    }

    pub fn configured_sink_latency(&self) -> u64 {
        self.configured_sink_latency
    }

    pub fn base_rate(&self) -> u32 {
        self.spec.rate
    }

    pub fn stream_rate(&self) -> u32 {
        self.stream_rate
    }

    pub fn latency(&self) -> u64 {
        self.latency
    }

    pub fn snapshot(&self) -> LatencySnapshot {
        self.snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::message::{SinkSnapshot, SourceSnapshot};
    use crate::audio::spec::SampleFormat;
    use crate::audio::virtual_device::{VirtualSink, VirtualSource};
    use crate::clock::ManualClock;
    use crossbeam_channel::{unbounded, Receiver};

    const ADJUST: u64 = 10_000_000;

    fn spec() -> SampleSpec {
        SampleSpec::new(SampleFormat::S16Le, 48000, 2)
    }

    struct Harness {
        controller: Controller,
        output_rx: Receiver<ToOutput>,
        _input_rx: Receiver<ToInput>,
        clock: Arc<ManualClock>,
        sink: Arc<VirtualSink>,
    }

    fn harness_with(config: &str, source: VirtualSource, sink: VirtualSink) -> Harness {
        let config = LoopbackConfig::from_modargs(config).unwrap();
        let (to_output, output_rx) = unbounded();
        let (to_input, input_rx) = unbounded();
        let clock = Arc::new(ManualClock::new(1_000_000));
        let sink = Arc::new(sink);
        let controller = Controller::new(
            &config,
            spec(),
            Arc::new(source),
            sink.clone(),
            ControllerLinks {
                to_output,
                to_input,
            },
            clock.clone(),
        );
        Harness {
            controller,
            output_rx,
            _input_rx: input_rx,
            clock,
            sink,
        }
    }

    fn harness(config: &str) -> Harness {
        harness_with(
            config,
            VirtualSource::new("mic", spec(), LatencyMode::Dynamic { min: 5_000, max: 20_000 }),
            VirtualSink::new("spk", spec(), LatencyMode::Dynamic { min: 5_000, max: 20_000 }),
        )
    }

    /// Feed a snapshot that measures `latency_usec` end to end at base rate
    fn feed_snapshot(controller: &mut Controller, latency_usec: u64) {
        let queue_length = spec().usec_to_bytes(latency_usec);
        controller.handle_main_message(ToMain::SourceSnapshot(SourceSnapshot {
            send_counter: 0,
            source_latency: 0,
            timestamp: 0,
        }));
        controller.handle_main_message(ToMain::SinkSnapshot(SinkSnapshot {
            recv_counter: 0,
            queue_length,
            sink_latency: 0,
            timestamp: 0,
        }));
    }

    #[test]
    fn test_rate_controller_zero_difference_keeps_rate() {
        assert_eq!(rate_controller(44_100, ADJUST, 0), 44_100);
    }

    #[test]
    fn test_rate_controller_direction() {
        assert!(rate_controller(48_000, ADJUST, 50_000) > 48_000, "too much latency speeds up");
        assert!(rate_controller(48_000, ADJUST, -50_000) < 48_000, "too little latency slows down");
    }

    #[test]
    fn test_clamp_latency_inverted_range_prefers_max() {
        assert_eq!(clamp_latency(10, 50, 20), 20);
        assert_eq!(clamp_latency(30, 10, 20), 20);
        assert_eq!(clamp_latency(5, 10, 20), 10);
    }

    #[test]
    fn test_minimum_latency_dynamic_devices() {
        let h = harness("source=mic sink=spk");
        // (5ms + 5ms) * 1.1 + 1.5ms
        assert_eq!(h.controller.minimum_latency(), 12_500);
    }

    #[test]
    fn test_minimum_latency_fixed_sink() {
        let h = harness_with(
            "source=mic sink=spk",
            VirtualSource::new("mic", spec(), LatencyMode::Dynamic { min: 5_000, max: 20_000 }),
            VirtualSink::new("spk", spec(), LatencyMode::Fixed(20_000)),
        );
        // (20ms + 5ms) * 1.1 + 1.5ms
        assert_eq!(h.controller.minimum_latency(), 29_000);
    }

    #[test]
    fn test_minimum_latency_fixed_alsa_source_uses_fragment() {
        let h = harness_with(
            "source=mic sink=spk",
            VirtualSource::new("mic", spec(), LatencyMode::Fixed(40_000)).with_driver_api("alsa"),
            VirtualSink::new("spk", spec(), LatencyMode::Dynamic { min: 5_000, max: 20_000 }),
        );
        assert!(h.controller.bounds().fixed_alsa_source);
        // (5ms + 25ms fragment) * 1.1 + 1.5ms
        assert_eq!(h.controller.minimum_latency(), 34_500);
    }

    #[test]
    fn test_minimum_latency_offsets() {
        let h = harness_with(
            "source=mic sink=spk",
            VirtualSource::new("mic", spec(), LatencyMode::Dynamic { min: 5_000, max: 20_000 })
                .with_latency_offset(3_000),
            VirtualSink::new("spk", spec(), LatencyMode::Dynamic { min: 5_000, max: 20_000 })
                .with_latency_offset(-1_000),
        );
        assert_eq!(h.controller.minimum_latency(), 14_500);

        let h = harness_with(
            "source=mic sink=spk",
            VirtualSource::new("mic", spec(), LatencyMode::Dynamic { min: 5_000, max: 20_000 })
                .with_latency_offset(-20_000),
            VirtualSink::new("spk", spec(), LatencyMode::Dynamic { min: 5_000, max: 20_000 }),
        );
        assert_eq!(h.controller.minimum_latency(), 0, "negative result clamps to zero");
    }

    #[test]
    fn test_device_floor_of_2_5ms() {
        let h = harness_with(
            "source=mic sink=spk",
            VirtualSource::new("mic", spec(), LatencyMode::Dynamic { min: 500, max: 20_000 }),
            VirtualSink::new("spk", spec(), LatencyMode::Dynamic { min: 500, max: 2_000 }),
        );
        let bounds = h.controller.bounds();
        assert_eq!(bounds.min_source_latency, 2_500);
        assert_eq!(bounds.min_sink_latency, 2_000, "max below 2.5ms pins min to max");
    }

    #[test]
    fn test_requested_device_latencies() {
        let source = VirtualSource::new("mic", spec(), LatencyMode::Dynamic { min: 5_000, max: 20_000 });
        let sink = VirtualSink::new("spk", spec(), LatencyMode::Dynamic { min: 5_000, max: 100_000 });
        let h = harness_with("source=mic sink=spk latency_msec=90", source, sink);
        // a third of 90ms, clamped into the source range
        assert_eq!(h.controller.configured_sink_latency(), 30_000);
        assert_eq!(h.controller.configured_source_latency(), 20_000);
    }

    #[test]
    fn test_requested_latency_when_opposite_minimum_is_large() {
        let source = VirtualSource::new("mic", spec(), LatencyMode::Dynamic { min: 50_000, max: 80_000 });
        let sink = VirtualSink::new("spk", spec(), LatencyMode::Dynamic { min: 5_000, max: 100_000 });
        let h = harness_with("source=mic sink=spk latency_msec=90", source, sink);
        // source minimum 50ms exceeds 30ms: sink gets (90 - 50) / 2
        assert_eq!(h.controller.configured_sink_latency(), 20_000);
    }

    #[test]
    fn test_timer_first_fires_after_settle_time() {
        let mut h = harness("source=mic sink=spk");
        assert_eq!(h.controller.timer_deadline(), None, "corked until started");
        h.controller.start();
        assert_eq!(h.controller.timer_deadline(), Some(1_000_000 + ADJUST_TIME_FOR_CHANGE));

        assert!(h.controller.poll().is_none());
        h.clock.advance(ADJUST_TIME_FOR_CHANGE);
        assert!(h.controller.poll().is_some());
        assert_eq!(h.controller.timer_deadline(), Some(1_333_000 + ADJUST));
        assert!(h.output_rx.try_iter().any(|m| m == ToOutput::LatencySnapshot));
    }

    #[test]
    fn test_zero_adjust_time_disables_timer() {
        let mut h = harness("source=mic sink=spk adjust_time=0");
        h.controller.start();
        assert_eq!(h.controller.timer_deadline(), None);
    }

    #[test]
    fn test_first_cycle_is_skipped() {
        let mut h = harness("source=mic sink=spk");
        feed_snapshot(&mut h.controller, 200_000);
        assert_eq!(
            h.controller.adjust_rates(),
            CycleOutcome::Skipped(SkipReason::SourceSinkChanged)
        );
    }

    #[test]
    fn test_cycle_updates_rate_toward_target() {
        let mut h = harness("source=mic sink=spk");
        h.controller.adjust_rates();

        h.clock.advance(ADJUST);
        feed_snapshot(&mut h.controller, 210_000);
        match h.controller.adjust_rates() {
            CycleOutcome::RateUpdated {
                rate,
                latency_difference,
            } => {
                assert_eq!(latency_difference, 10_000);
                assert_eq!(rate, rate_controller(48_000, ADJUST, 10_000));
                assert_eq!(h.sink.applied_rates().last(), Some(&rate));
            }
            other => panic!("expected a rate update, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_snapshot_skips_cycle() {
        let mut h = harness("source=mic sink=spk");
        h.controller.adjust_rates();
        h.clock.advance(ADJUST);
        assert_eq!(
            h.controller.adjust_rates(),
            CycleOutcome::Skipped(SkipReason::NoSnapshot)
        );
    }

    #[test]
    fn test_sleep_gap_skips_cycle() {
        let mut h = harness("source=mic sink=spk");
        h.controller.adjust_rates();
        h.clock.advance(ADJUST * 2);
        feed_snapshot(&mut h.controller, 210_000);
        assert!(matches!(
            h.controller.adjust_rates(),
            CycleOutcome::Skipped(SkipReason::Suspended { .. })
        ));
        assert_eq!(h.controller.real_adjust_time(), ADJUST, "average untouched");
    }

    #[test]
    fn test_fast_adjust_posts_and_skips_next_cycle() {
        let mut h = harness("source=mic sink=spk fast_adjust_threshold_msec=50");
        h.controller.adjust_rates();
        while h.output_rx.try_recv().is_ok() {}

        h.clock.advance(ADJUST);
        feed_snapshot(&mut h.controller, 400_000);
        assert_eq!(
            h.controller.adjust_rates(),
            CycleOutcome::FastAdjust {
                latency_difference: 200_000
            }
        );
        assert_eq!(h.output_rx.try_recv(), Ok(ToOutput::FastAdjust(0)));
        assert!(h.sink.applied_rates().is_empty(), "no gradual correction");

        h.clock.advance(ADJUST);
        feed_snapshot(&mut h.controller, 200_000);
        assert_eq!(
            h.controller.adjust_rates(),
            CycleOutcome::Skipped(SkipReason::SourceSinkChanged)
        );
    }

    #[test]
    fn test_underruns_raise_latency_floor() {
        let mut h = harness("source=mic sink=spk");
        for _ in 0..3 {
            h.controller.handle_main_message(ToMain::Underrun);
        }
        h.controller.adjust_rates();
        assert_eq!(h.controller.underrun_latency_limit(), 205_000);
        assert_eq!(h.controller.minimum_latency(), 205_000);
        assert_eq!(h.controller.underrun_counter(), 0);
        assert!(h
            .output_rx
            .try_iter()
            .any(|m| m == ToOutput::UpdateMinLatency(205_000)));
    }

    #[test]
    fn test_underrun_floor_stops_at_max_latency() {
        let mut h = harness("source=mic sink=spk latency_msec=200 max_latency_msec=203");
        for _ in 0..3 {
            h.controller.handle_main_message(ToMain::Underrun);
        }
        h.controller.adjust_rates();
        assert_eq!(h.controller.underrun_latency_limit(), 203_000);
    }

    #[test]
    fn test_two_underruns_are_tolerated() {
        let mut h = harness("source=mic sink=spk");
        h.controller.handle_main_message(ToMain::Underrun);
        h.controller.handle_main_message(ToMain::Underrun);
        h.controller.adjust_rates();
        assert_eq!(h.controller.underrun_latency_limit(), 0);
        assert_eq!(h.controller.underrun_counter(), 2);
    }

    #[test]
    fn test_offset_change_updates_minimum_immediately() {
        let mut h = harness("source=mic sink=spk");
        h.controller
            .handle_device_event(DeviceEvent::SinkLatencyOffsetChanged(2_000));
        assert_eq!(h.controller.minimum_latency(), 14_500);
        assert!(h
            .output_rx
            .try_iter()
            .any(|m| m == ToOutput::UpdateMinLatency(14_500)));
    }

    #[test]
    fn test_source_suspend_corks_sink_and_stops_timer() {
        let mut h = harness("source=mic sink=spk");
        h.controller.start();
        let cork = h.controller.cork_state();
        assert!(!cork.sink_corked());

        h.controller
            .handle_device_event(DeviceEvent::SourceSuspended(true));
        assert!(cork.sink_corked());
        assert_eq!(h.controller.timer_deadline(), None);
        assert!(h.output_rx.try_iter().any(|m| m == ToOutput::SourceChanged));

        h.controller
            .handle_device_event(DeviceEvent::SourceSuspended(false));
        assert!(!cork.sink_corked());
        assert!(h.controller.timer_deadline().is_some());
        assert!(h
            .output_rx
            .try_iter()
            .any(|m| matches!(m, ToOutput::SetEffectiveSourceLatency(_))));
    }

    #[test]
    fn test_repeated_suspend_state_is_ignored() {
        let mut h = harness("source=mic sink=spk");
        h.controller.start();
        h.controller
            .handle_device_event(DeviceEvent::SourceSuspended(false));
        assert!(h.output_rx.try_recv().is_err(), "state did not change");
    }

    #[test]
    fn test_sink_range_increase_resets_counters() {
        let mut h = harness("source=mic sink=spk");
        h.controller.handle_main_message(ToMain::Underrun);
        h.controller.adjust_rates();
        assert_eq!(h.controller.iteration_counter(), 1);

        h.sink
            .set_latency_mode(LatencyMode::Dynamic { min: 90_000, max: 200_000 });
        h.sink.set_requested_latency(20_000);
        h.controller
            .handle_main_message(ToMain::SinkLatencyRangeChanged);
        assert_eq!(h.controller.configured_sink_latency(), 90_000);
        assert_eq!(h.controller.iteration_counter(), 0);
        assert_eq!(h.controller.underrun_counter(), 0);
    }
}
