//! cpal-backed loopback between a capture device and a playback device
//!
//! The input callback owns the [`InputEndpoint`], the output callback owns
//! the [`OutputEndpoint`] and the controller runs on its own control thread.
//! Nothing but channels and atomics crosses between them.
//!
//! ## Rate correction
//!
//! The playback device always runs at the base rate. The render callback
//! pulls `stream_rate / base_rate` input frames per output frame through a
//! [`LinearResampler`], so a higher stream rate drains the queue faster.
//!
//! ## Device latency
//!
//! cpal reports no device latency directly. Each callback measures the gap
//! between its own timestamp and the capture (or playback) timestamp and
//! publishes it for the latency snapshots.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, Device, Host, SampleRate, Stream, StreamConfig, SupportedBufferSize};
use crossbeam_channel::Sender;

use super::device::{LatencyMode, SinkControl, SinkThread, SourceControl, SourceThread};
use super::message::DeviceEvent;
use super::resampler::{LinearResampler, SharedRatio};
use super::runtime::{ControlHandle, ControlLoop};
use super::session::{resolve_spec, LoopbackSession};
use super::spec::{SampleFormat, SampleSpec};
use crate::clock::MonotonicClock;
use crate::config::LoopbackConfig;
use crate::error::{LoopbackError, Result};
use crate::stats::store::StatsStore;
use crate::USEC_PER_SEC;

/// Latency assumed for devices that report no buffer size range (20ms)
const DEFAULT_DEVICE_LATENCY: u64 = 20_000;

/// Engine state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Stopped,
    Running,
}

fn frames_to_usec(frames: u32, rate: u32) -> u64 {
    frames as u64 * USEC_PER_SEC / rate.max(1) as u64
}

fn usec_to_frames(usec: u64, rate: u32) -> u32 {
    (usec * rate as u64 / USEC_PER_SEC) as u32
}

/// Latency range implied by a device's supported buffer sizes
fn latency_mode(buffer: &SupportedBufferSize, rate: u32) -> LatencyMode {
    match *buffer {
        SupportedBufferSize::Range { min, max } => LatencyMode::Dynamic {
            min: frames_to_usec(min, rate),
            max: frames_to_usec(max, rate),
        },
        SupportedBufferSize::Unknown => LatencyMode::Fixed(DEFAULT_DEVICE_LATENCY),
    }
}

fn stream_error(context: &str, err: impl std::fmt::Display) -> LoopbackError {
    LoopbackError::Stream(format!("{}: {}", context, err))
}

/// Requested latency as a cpal buffer size
fn buffer_size(mode: LatencyMode, requested: u64, rate: u32) -> BufferSize {
    match mode {
        LatencyMode::Dynamic { .. } if requested > 0 => {
            BufferSize::Fixed(usec_to_frames(requested, rate).max(1))
        }
        _ => BufferSize::Default,
    }
}

/// Capture device as seen by the loopback
#[derive(Debug)]
pub struct CpalSource {
    name: String,
    spec: SampleSpec,
    mode: LatencyMode,
    requested: AtomicU64,
    /// Last measured capture-to-callback delay (usec)
    latency: AtomicI64,
}

impl CpalSource {
    fn new(name: String, spec: SampleSpec, mode: LatencyMode) -> Self {
        let initial = mode.range().1 as i64;
        Self {
            name,
            spec,
            mode,
            requested: AtomicU64::new(0),
            latency: AtomicI64::new(initial),
        }
    }

    fn record_latency(&self, info: &cpal::InputCallbackInfo) {
        let stamp = info.timestamp();
        if let Some(delay) = stamp.callback.duration_since(&stamp.capture) {
            self.latency
                .store(delay.as_micros() as i64, Ordering::Relaxed);
        }
    }
}

impl SourceControl for CpalSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn sample_spec(&self) -> SampleSpec {
        self.spec
    }

    fn latency_mode(&self) -> LatencyMode {
        self.mode
    }

    fn requested_latency(&self) -> u64 {
        self.requested.load(Ordering::Acquire)
    }

    fn set_requested_latency(&self, usec: u64) -> u64 {
        let (min, max) = self.mode.range();
        let granted = usec.clamp(min, max.max(min));
        self.requested.store(granted, Ordering::Release);
        granted
    }
}

impl SourceThread for CpalSource {
    fn latency_within_thread(&self) -> i64 {
        self.latency.load(Ordering::Relaxed)
    }
}

/// Playback device as seen by the loopback
#[derive(Debug)]
pub struct CpalSink {
    name: String,
    spec: SampleSpec,
    mode: LatencyMode,
    requested: AtomicU64,
    /// Last measured callback-to-playback delay (usec)
    latency: AtomicI64,
    ratio: SharedRatio,
    max_request: AtomicUsize,
    underrun_for: AtomicUsize,
}

impl CpalSink {
    fn new(name: String, spec: SampleSpec, mode: LatencyMode) -> Self {
        let initial = mode.range().1 as i64;
        Self {
            name,
            spec,
            mode,
            requested: AtomicU64::new(0),
            latency: AtomicI64::new(initial),
            ratio: SharedRatio::new(1.0),
            max_request: AtomicUsize::new(spec.usec_to_bytes(DEFAULT_DEVICE_LATENCY)),
            underrun_for: AtomicUsize::new(0),
        }
    }

    fn record_latency(&self, info: &cpal::OutputCallbackInfo) {
        let stamp = info.timestamp();
        if let Some(delay) = stamp.playback.duration_since(&stamp.callback) {
            self.latency
                .store(delay.as_micros() as i64, Ordering::Relaxed);
        }
    }

    fn record_underrun(&self, nbytes: usize) {
        let _ = self
            .underrun_for
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_add(nbytes))
            });
    }

    fn clear_underrun(&self) {
        self.underrun_for.store(0, Ordering::Release);
    }

    /// Input frames per output frame
    pub fn ratio(&self) -> f64 {
        self.ratio.get()
    }
}

impl SinkControl for CpalSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn sample_spec(&self) -> SampleSpec {
        self.spec
    }

    fn latency_mode(&self) -> LatencyMode {
        self.mode
    }

    fn requested_latency(&self) -> u64 {
        self.requested.load(Ordering::Acquire)
    }

    fn set_requested_latency(&self, usec: u64) -> u64 {
        let (min, max) = self.mode.range();
        let granted = usec.clamp(min, max.max(min));
        self.requested.store(granted, Ordering::Release);
        granted
    }

    fn set_stream_rate(&self, rate: u32) {
        self.ratio.set(rate as f64 / self.spec.rate as f64);
    }
}

impl SinkThread for CpalSink {
    fn latency_within_thread(&self) -> i64 {
        self.latency.load(Ordering::Relaxed)
    }

    fn requested_latency_within_thread(&self) -> u64 {
        self.requested.load(Ordering::Acquire)
    }

    fn underrun_for(&self) -> usize {
        self.underrun_for.load(Ordering::Acquire)
    }

    fn max_request(&self) -> usize {
        self.max_request.load(Ordering::Relaxed)
    }

    /// cpal cannot re-render; playback simply resumes with the next callback
    fn request_rewind(&self, nbytes: usize) {
        tracing::trace!(nbytes, "rewind_not_supported");
        self.underrun_for.store(0, Ordering::Release);
    }
}

/// Loopback between two cpal devices
pub struct AudioEngine {
    state: EngineState,
    host: Option<Host>,
    input_stream: Option<Stream>,
    output_stream: Option<Stream>,
    control: Option<ControlHandle>,
    stats: Option<Arc<Mutex<StatsStore>>>,
    running: Option<Arc<AtomicBool>>,
}

impl AudioEngine {
    pub fn new() -> Self {
        Self {
            state: EngineState::Stopped,
            host: Some(cpal::default_host()),
            input_stream: None,
            output_stream: None,
            control: None,
            stats: None,
            running: None,
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    fn host(&self) -> Result<&Host> {
        self.host
            .as_ref()
            .ok_or_else(|| LoopbackError::IllegalState("audio engine released".to_string()))
    }

    fn find_input_device(&self, name: &str) -> Result<Device> {
        self.host()?
            .input_devices()
            .map_err(|e| stream_error("listing input devices", e))?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| LoopbackError::DeviceNotFound(name.to_string()))
    }

    fn find_output_device(&self, name: &str) -> Result<Device> {
        self.host()?
            .output_devices()
            .map_err(|e| stream_error("listing output devices", e))?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| LoopbackError::DeviceNotFound(name.to_string()))
    }

    /// Open both devices named in `config` and start the loopback
    pub fn start(&mut self, config: &LoopbackConfig) -> Result<()> {
        if self.state == EngineState::Running {
            return Err(LoopbackError::IllegalState(
                "audio engine already running".to_string(),
            ));
        }
        config.validate()?;
        let source_name = config.source.clone().unwrap_or_default();
        let sink_name = config.sink.clone().unwrap_or_default();

        let input_device = self.find_input_device(&source_name)?;
        let output_device = self.find_output_device(&sink_name)?;

        let input_default = input_device
            .default_input_config()
            .map_err(|e| stream_error("input config", e))?;
        let output_default = output_device
            .default_output_config()
            .map_err(|e| stream_error("output config", e))?;

        // the loopback carries f32 frames; overrides apply on top of the source
        let source_spec = SampleSpec::new(
            SampleFormat::F32Le,
            input_default.sample_rate().0,
            input_default.channels(),
        );
        let spec = resolve_spec(config, source_spec)?;
        tracing::info!(
            source = %source_name,
            sink = %sink_name,
            rate = spec.rate,
            channels = spec.channels,
            "Opening loopback devices"
        );

        let source = Arc::new(CpalSource::new(
            source_name,
            spec,
            latency_mode(input_default.buffer_size(), spec.rate),
        ));
        let sink = Arc::new(CpalSink::new(
            sink_name,
            spec,
            latency_mode(output_default.buffer_size(), spec.rate),
        ));

        let clock = MonotonicClock::shared();
        let session = LoopbackSession::new(config, source.clone(), sink.clone(), clock.clone())?;
        let stats = session.controller().stats();
        let mut parts = session.into_parts()?;
        parts.output.attach(sink.as_ref());

        let running = Arc::new(AtomicBool::new(true));
        let channels = spec.channels as usize;

        let input_config = StreamConfig {
            channels: spec.channels,
            sample_rate: SampleRate(spec.rate),
            buffer_size: buffer_size(source.mode, source.requested_latency(), spec.rate),
        };
        let output_config = StreamConfig {
            channels: spec.channels,
            sample_rate: SampleRate(spec.rate),
            buffer_size: buffer_size(sink.mode, sink.requested_latency(), spec.rate),
        };

        // output: queue -> resampler -> device
        let mut output = parts.output;
        let output_sink = Arc::clone(&sink);
        let output_cork = Arc::clone(&parts.cork);
        let output_running = Arc::clone(&running);
        let mut resampler = LinearResampler::new(channels);
        let mut scratch: Vec<f32> = Vec::new();
        let output_stream = output_device
            .build_output_stream(
                &output_config,
                move |data: &mut [f32], info: &cpal::OutputCallbackInfo| {
                    let sink = output_sink.as_ref();
                    sink.record_latency(info);

                    let request = data.len() * std::mem::size_of::<f32>();
                    if sink.max_request.swap(request, Ordering::Relaxed) != request {
                        output.update_max_request(request);
                    }

                    if !output_running.load(Ordering::Relaxed) || output_cork.sink_corked() {
                        output.process_messages(sink);
                        data.fill(0.0);
                        return;
                    }

                    let ratio = sink.ratio();
                    let needed = resampler.input_frames_needed(data.len() / channels, ratio);
                    scratch.clear();
                    scratch.resize(needed * channels, 0.0);
                    let bytes: &mut [u8] = bytemuck::cast_slice_mut(&mut scratch[..]);
                    let wanted = bytes.len();
                    match output.pop(sink, bytes) {
                        // a full read means playback is back to normal
                        Some(n) if n == wanted => sink.clear_underrun(),
                        Some(n) => sink.record_underrun(wanted - n),
                        None if wanted > 0 => {
                            if sink.underrun_for() == 0 {
                                tracing::trace!(bytes = wanted, "render_underrun");
                            }
                            sink.record_underrun(wanted);
                            resampler.reset();
                        }
                        None => {}
                    }
                    resampler.process(&scratch, data, ratio);
                },
                move |err| {
                    tracing::error!("Output stream error: {}", err);
                },
                None,
            )
            .map_err(|e| stream_error("building output stream", e))?;

        // input: device -> input path
        let mut input = parts.input;
        let input_source = Arc::clone(&source);
        let input_cork = Arc::clone(&parts.cork);
        let input_running = Arc::clone(&running);
        let input_stream = input_device
            .build_input_stream(
                &input_config,
                move |data: &[f32], info: &cpal::InputCallbackInfo| {
                    let source = input_source.as_ref();
                    source.record_latency(info);
                    input.process_messages(source);
                    if input_running.load(Ordering::Relaxed) && !input_cork.source_corked() {
                        input.push(source, bytemuck::cast_slice(data));
                    }
                },
                move |err| {
                    tracing::error!("Input stream error: {}", err);
                },
                None,
            )
            .map_err(|e| stream_error("building input stream", e))?;

        let control = ControlLoop::spawn(parts.controller, parts.main_rx, clock)?;

        output_stream
            .play()
            .map_err(|e| stream_error("starting output stream", e))?;
        input_stream
            .play()
            .map_err(|e| stream_error("starting input stream", e))?;

        self.input_stream = Some(input_stream);
        self.output_stream = Some(output_stream);
        self.control = Some(control);
        self.stats = Some(stats);
        self.running = Some(running);
        self.state = EngineState::Running;
        tracing::info!("Audio engine started");
        Ok(())
    }

    /// Stop capture first, then playback, then the control thread
    pub fn stop(&mut self) -> Result<()> {
        if let Some(running) = self.running.take() {
            running.store(false, Ordering::Relaxed);
        }

        // the input callback is the only producer of data messages
        self.input_stream = None;
        self.output_stream = None;
        if let Some(control) = self.control.take() {
            control.stop()?;
        }

        if self.state == EngineState::Running {
            tracing::info!("Audio engine stopped");
        }
        self.state = EngineState::Stopped;
        Ok(())
    }

    /// Release the host; refused while streams are running
    pub fn release(&mut self) -> Result<()> {
        if self.state == EngineState::Running {
            return Err(LoopbackError::IllegalState(
                "cannot release audio engine while streams are running".to_string(),
            ));
        }
        self.host = None;
        Ok(())
    }

    pub fn is_released(&self) -> bool {
        self.host.is_none()
    }

    /// Statistics of the running (or last) loopback
    pub fn stats(&self) -> Option<Arc<Mutex<StatsStore>>> {
        self.stats.clone()
    }

    /// Sender for device notifications while running
    pub fn events(&self) -> Option<Sender<DeviceEvent>> {
        self.control.as_ref().map(|c| c.events())
    }
}

impl Default for AudioEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for AudioEngine {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
