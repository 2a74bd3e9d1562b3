//! In-process source and sink without real hardware
//!
//! Both devices keep their state behind atomics and mutexes so one `Arc`
//! can serve the control thread and a data thread at the same time. Used by
//! the tests and by the simulated loopback of the binary.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

use super::device::{LatencyMode, SinkControl, SinkThread, SourceControl, SourceThread};
use super::spec::SampleSpec;

/// Clamp a requested latency into the device range
fn grant(mode: LatencyMode, usec: u64) -> u64 {
    match mode {
        LatencyMode::Dynamic { min, max } => usec.clamp(min, max.max(min)),
        LatencyMode::Fixed(latency) => latency,
    }
}

/// Capture device fed by the caller
#[derive(Debug)]
pub struct VirtualSource {
    name: String,
    spec: SampleSpec,
    mode: Mutex<LatencyMode>,
    driver_api: Option<String>,
    latency_offset: AtomicI64,
    requested: AtomicU64,
    suspended: AtomicBool,
    delay_queue: AtomicUsize,
    requests: Mutex<Vec<u64>>,
}

impl VirtualSource {
    pub fn new(name: &str, spec: SampleSpec, mode: LatencyMode) -> Self {
        Self {
            name: name.to_string(),
            spec,
            mode: Mutex::new(mode),
            driver_api: None,
            latency_offset: AtomicI64::new(0),
            requested: AtomicU64::new(0),
            suspended: AtomicBool::new(false),
            delay_queue: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_driver_api(mut self, api: &str) -> Self {
        self.driver_api = Some(api.to_string());
        self
    }

    pub fn with_latency_offset(self, usec: i64) -> Self {
        self.latency_offset.store(usec, Ordering::Release);
        self
    }

    pub fn set_latency_mode(&self, mode: LatencyMode) {
        if let Ok(mut current) = self.mode.lock() {
            *current = mode;
        }
    }

    pub fn set_latency_offset(&self, usec: i64) {
        self.latency_offset.store(usec, Ordering::Release);
    }

    pub fn set_suspended(&self, suspended: bool) {
        self.suspended.store(suspended, Ordering::Release);
    }

    /// Pretend the source holds back `nbytes` of captured audio
    pub fn set_delay_queue_len(&self, nbytes: usize) {
        self.delay_queue.store(nbytes, Ordering::Release);
    }

    /// Every latency ever requested, in order
    pub fn requested_latencies(&self) -> Vec<u64> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    fn mode(&self) -> LatencyMode {
        self.mode
            .lock()
            .map(|m| *m)
            .unwrap_or(LatencyMode::Fixed(0))
    }
}

impl SourceControl for VirtualSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn sample_spec(&self) -> SampleSpec {
        self.spec
    }

    fn latency_mode(&self) -> LatencyMode {
        self.mode()
    }

    fn driver_api(&self) -> Option<&str> {
        self.driver_api.as_deref()
    }

    fn port_latency_offset(&self) -> i64 {
        self.latency_offset.load(Ordering::Acquire)
    }

    fn requested_latency(&self) -> u64 {
        self.requested.load(Ordering::Acquire)
    }

    fn set_requested_latency(&self, usec: u64) -> u64 {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(usec);
        }
        let granted = grant(self.mode(), usec);
        self.requested.store(granted, Ordering::Release);
        granted
    }

    fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }
}

impl SourceThread for VirtualSource {
    /// The device runs exactly at the granted latency
    fn latency_within_thread(&self) -> i64 {
        self.requested.load(Ordering::Acquire) as i64
    }

    fn delay_queue_len(&self) -> usize {
        self.delay_queue.load(Ordering::Acquire)
    }
}

/// Playback device drained by the caller
#[derive(Debug)]
pub struct VirtualSink {
    name: String,
    spec: SampleSpec,
    mode: Mutex<LatencyMode>,
    latency_offset: AtomicI64,
    requested: AtomicU64,
    suspended: AtomicBool,
    stream_rate: AtomicU32,
    max_request: AtomicUsize,
    max_rewind: AtomicUsize,
    underrun_for: AtomicUsize,
    render_queue: AtomicUsize,
    applied_rates: Mutex<Vec<u32>>,
    rewinds: Mutex<Vec<usize>>,
}

impl VirtualSink {
    pub fn new(name: &str, spec: SampleSpec, mode: LatencyMode) -> Self {
        // 10ms pulls unless told otherwise
        let max_request = spec.usec_to_bytes(10_000);
        Self {
            name: name.to_string(),
            spec,
            mode: Mutex::new(mode),
            latency_offset: AtomicI64::new(0),
            requested: AtomicU64::new(0),
            suspended: AtomicBool::new(false),
            stream_rate: AtomicU32::new(spec.rate),
            max_request: AtomicUsize::new(max_request),
            max_rewind: AtomicUsize::new(0),
            underrun_for: AtomicUsize::new(0),
            render_queue: AtomicUsize::new(0),
            applied_rates: Mutex::new(Vec::new()),
            rewinds: Mutex::new(Vec::new()),
        }
    }

    pub fn with_latency_offset(self, usec: i64) -> Self {
        self.latency_offset.store(usec, Ordering::Release);
        self
    }

    pub fn with_max_request(self, nbytes: usize) -> Self {
        self.max_request.store(nbytes, Ordering::Release);
        self
    }

    pub fn with_max_rewind(self, nbytes: usize) -> Self {
        self.max_rewind.store(nbytes, Ordering::Release);
        self
    }

    pub fn set_latency_mode(&self, mode: LatencyMode) {
        if let Ok(mut current) = self.mode.lock() {
            *current = mode;
        }
    }

    pub fn set_latency_offset(&self, usec: i64) {
        self.latency_offset.store(usec, Ordering::Release);
    }

    pub fn set_suspended(&self, suspended: bool) {
        self.suspended.store(suspended, Ordering::Release);
    }

    /// Account for a pull that could not be served
    pub fn record_underrun(&self, nbytes: usize) {
        let _ = self
            .underrun_for
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_add(nbytes))
            });
    }

    /// Mark the sink as starved without a known end
    pub fn set_underrun_unbounded(&self) {
        self.underrun_for
            .store(super::device::UNDERRUN_UNBOUNDED, Ordering::Release);
    }

    /// Playback resumed normally
    pub fn clear_underrun(&self) {
        self.underrun_for.store(0, Ordering::Release);
    }

    pub fn set_render_queue_len(&self, nbytes: usize) {
        self.render_queue.store(nbytes, Ordering::Release);
    }

    /// Rate the loopback stream currently runs at
    pub fn stream_rate(&self) -> u32 {
        self.stream_rate.load(Ordering::Acquire)
    }

    /// Every rate the controller applied, in order
    pub fn applied_rates(&self) -> Vec<u32> {
        self.applied_rates
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    /// Every rewind the output path asked for, in order
    pub fn rewinds(&self) -> Vec<usize> {
        self.rewinds.lock().map(|r| r.clone()).unwrap_or_default()
    }

    fn mode(&self) -> LatencyMode {
        self.mode
            .lock()
            .map(|m| *m)
            .unwrap_or(LatencyMode::Fixed(0))
    }
}

impl SinkControl for VirtualSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn sample_spec(&self) -> SampleSpec {
        self.spec
    }

    fn latency_mode(&self) -> LatencyMode {
        self.mode()
    }

    fn port_latency_offset(&self) -> i64 {
        self.latency_offset.load(Ordering::Acquire)
    }

    fn requested_latency(&self) -> u64 {
        self.requested.load(Ordering::Acquire)
    }

    fn set_requested_latency(&self, usec: u64) -> u64 {
        let granted = grant(self.mode(), usec);
        self.requested.store(granted, Ordering::Release);
        granted
    }

    fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    fn set_stream_rate(&self, rate: u32) {
        self.stream_rate.store(rate, Ordering::Release);
        if let Ok(mut rates) = self.applied_rates.lock() {
            rates.push(rate);
        }
    }
}

impl SinkThread for VirtualSink {
    fn latency_within_thread(&self) -> i64 {
        self.requested.load(Ordering::Acquire) as i64
    }

    fn render_queue_len(&self) -> usize {
        self.render_queue.load(Ordering::Acquire)
    }

    fn requested_latency_within_thread(&self) -> u64 {
        self.requested.load(Ordering::Acquire)
    }

    fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    fn underrun_for(&self) -> usize {
        self.underrun_for.load(Ordering::Acquire)
    }

    fn max_request(&self) -> usize {
        self.max_request.load(Ordering::Acquire)
    }

    fn max_rewind(&self) -> usize {
        self.max_rewind.load(Ordering::Acquire)
    }

    fn request_rewind(&self, nbytes: usize) {
        if let Ok(mut rewinds) = self.rewinds.lock() {
            rewinds.push(nbytes);
        }
        // the rewind restarts playback
        self.underrun_for.store(0, Ordering::Release);
    }
}
