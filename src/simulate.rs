//! Simulated loopback between two virtual devices
//!
//! A capture thread and a render thread each tick every 10ms of wall time.
//! The capture side runs `drift_ppm` fast relative to the render side, so
//! the controller has a real clock mismatch to correct.

use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, Result};
use audioloop::audio::device::LatencyMode;
use audioloop::audio::runtime::{ControlHandle, ControlLoop};
use audioloop::audio::spec::{SampleFormat, SampleSpec};
use audioloop::audio::virtual_device::{VirtualSink, VirtualSource};
use audioloop::{LoopbackConfig, LoopbackSession, MonotonicClock, StatsStore};
use crossbeam_channel::{bounded, select, tick, Sender};

/// Tick of both simulated device threads
const TICK: Duration = Duration::from_millis(10);

/// A device thread and the channel that stops it
struct Worker {
    stop: Sender<()>,
    thread: JoinHandle<()>,
}

impl Worker {
    fn stop(self, name: &str) -> Result<()> {
        drop(self.stop);
        self.thread
            .join()
            .map_err(|_| anyhow!("{} thread panicked", name))
    }
}

/// Running simulated loopback
pub struct Simulation {
    capture: Worker,
    render: Worker,
    control: ControlHandle,
    stats: Arc<Mutex<StatsStore>>,
}

impl Simulation {
    /// Build the loopback and start the capture, render and control threads
    ///
    /// `drift_ppm` is how much faster the source clock runs than the sink's.
    pub fn start(config: &LoopbackConfig, drift_ppm: f64) -> Result<Self> {
        let spec = SampleSpec::new(
            SampleFormat::S16Le,
            config.sample_rate.unwrap_or(48_000),
            config.channels.unwrap_or(2),
        );
        let mode = LatencyMode::Dynamic {
            min: 5_000,
            max: 20_000,
        };
        let source_name = config.source.as_deref().unwrap_or("virtual-source");
        let sink_name = config.sink.as_deref().unwrap_or("virtual-sink");
        let source = Arc::new(VirtualSource::new(source_name, spec, mode));
        let sink = Arc::new(VirtualSink::new(sink_name, spec, mode));

        let clock = MonotonicClock::shared();
        let session = LoopbackSession::new(config, source.clone(), sink.clone(), clock.clone())?;
        let spec = session.spec();
        let stats = session.controller().stats();
        let mut parts = session.into_parts()?;
        parts.output.attach(sink.as_ref());

        // capture: TICK worth of frames at the drifted source clock
        let mut input = parts.input;
        let capture_cork = Arc::clone(&parts.cork);
        let frames_per_tick = spec.rate as f64 * TICK.as_secs_f64() * (1.0 + drift_ppm / 1e6);
        let (capture_stop, stop_rx) = bounded::<()>(0);
        let capture_thread = thread::Builder::new()
            .name("audioloop-capture".to_string())
            .spawn(move || {
                let ticker = tick(TICK);
                let mut pending = 0.0f64;
                let mut chunk = Vec::new();
                loop {
                    select! {
                        recv(ticker) -> _ => {}
                        recv(stop_rx) -> _ => break,
                    }
                    pending += frames_per_tick;
                    let frames = pending.floor() as usize;
                    pending -= frames as f64;

                    input.process_messages(source.as_ref());
                    if capture_cork.source_corked() {
                        continue;
                    }
                    chunk.clear();
                    chunk.resize(frames * spec.frame_size(), spec.silence_byte());
                    input.push(source.as_ref(), &chunk);
                }
            })?;

        // render: TICK worth of frames scaled by the corrected stream rate
        let mut output = parts.output;
        let render_cork = Arc::clone(&parts.cork);
        let base_rate = spec.rate as f64;
        let (render_stop, stop_rx) = bounded::<()>(0);
        let render_thread = thread::Builder::new()
            .name("audioloop-render".to_string())
            .spawn(move || {
                let ticker = tick(TICK);
                let mut pending = 0.0f64;
                let mut buffer = Vec::new();
                loop {
                    select! {
                        recv(ticker) -> _ => {}
                        recv(stop_rx) -> _ => break,
                    }
                    let sink = sink.as_ref();
                    if render_cork.sink_corked() {
                        output.process_messages(sink);
                        continue;
                    }
                    let ratio = sink.stream_rate() as f64 / base_rate;
                    pending += base_rate * TICK.as_secs_f64() * ratio;
                    let frames = pending.floor() as usize;
                    pending -= frames as f64;

                    buffer.clear();
                    buffer.resize(frames * spec.frame_size(), 0);
                    match output.pop(sink, &mut buffer) {
                        Some(n) if n == buffer.len() => sink.clear_underrun(),
                        Some(n) => sink.record_underrun(buffer.len() - n),
                        None => sink.record_underrun(buffer.len()),
                    }
                }
            })?;

        let control = ControlLoop::spawn(parts.controller, parts.main_rx, clock)?;

        Ok(Self {
            capture: Worker {
                stop: capture_stop,
                thread: capture_thread,
            },
            render: Worker {
                stop: render_stop,
                thread: render_thread,
            },
            control,
            stats,
        })
    }

    pub fn stats(&self) -> Arc<Mutex<StatsStore>> {
        self.stats.clone()
    }

    /// Stop capture, then render, then the control thread
    pub fn stop(self) -> Result<()> {
        self.capture.stop("capture")?;
        self.render.stop("render")?;
        self.control.stop()?;
        Ok(())
    }
}
