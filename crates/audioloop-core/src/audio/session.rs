//! One source to sink loopback and its lifecycle
//!
//! `LoopbackSession` wires the controller, the input path and the output path
//! together over crossbeam channels. It can be driven directly from one
//! thread (tests, simulation) or split with [`LoopbackSession::into_parts`]
//! so every part runs on its own thread.
//!
//! Lifecycle: `Configured -> Running <-> Corked -> TornDown`. A torn-down
//! session refuses every further call.

use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver};

use super::controller::{Controller, ControllerLinks, CorkState, CycleOutcome};
use super::device::{SinkControl, SinkThread, SourceControl, SourceThread};
use super::input::InputEndpoint;
use super::message::{DeviceEvent, ToMain};
use super::output::OutputEndpoint;
use super::spec::SampleSpec;
use crate::clock::Clock;
use crate::config::LoopbackConfig;
use crate::error::{LoopbackError, Result};

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Built, both sides corked, timer off
    Configured,
    Running,
    /// At least one device is suspended
    Corked,
    TornDown,
}

/// What teardown released
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TeardownSummary {
    /// Data messages still queued toward the output path when it unlinked
    pub flushed_messages: usize,
    /// The input path was released before the output path unlinked
    pub source_detached: bool,
}

/// A session split for running each side on its own thread
pub struct SessionParts {
    pub controller: Controller,
    pub input: InputEndpoint,
    pub output: OutputEndpoint,
    pub main_rx: Receiver<ToMain>,
    pub cork: Arc<CorkState>,
}

/// Stream spec: the source's spec with the configured overrides applied
pub fn resolve_spec(config: &LoopbackConfig, source_spec: SampleSpec) -> Result<SampleSpec> {
    let mut spec = source_spec;
    if let Some(rate) = config.sample_rate {
        spec.rate = rate;
    }
    if let Some(channels) = config.channels {
        spec.channels = channels;
    }
    if !spec.is_valid() {
        return Err(LoopbackError::InvalidSampleSpec(format!(
            "{} Hz, {} channels",
            spec.rate, spec.channels
        )));
    }
    Ok(spec)
}

pub struct LoopbackSession {
    state: SessionState,
    spec: SampleSpec,
    controller: Controller,
    input: Option<InputEndpoint>,
    output: Option<OutputEndpoint>,
    main_rx: Receiver<ToMain>,
    cork: Arc<CorkState>,
}

impl LoopbackSession {
    /// Validate the configuration and build every part of the loopback
    ///
    /// Nothing is left behind when this fails.
    pub fn new(
        config: &LoopbackConfig,
        source: Arc<dyn SourceControl>,
        sink: Arc<dyn SinkControl>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let source_spec = source.sample_spec();
        let spec = resolve_spec(config, source_spec)?;

        let (data_tx, data_rx) = unbounded();
        let (control_tx, control_rx) = unbounded();
        let (input_tx, input_rx) = unbounded();
        let (main_tx, main_rx) = unbounded();

        let source_name = source.name().to_string();
        let sink_name = sink.name().to_string();

        let controller = Controller::new(
            config,
            spec,
            source,
            sink,
            ControllerLinks {
                to_output: control_tx,
                to_input: input_tx,
            },
            clock.clone(),
        );
        let output = OutputEndpoint::new(
            controller.output_params(),
            data_rx,
            control_rx,
            main_tx.clone(),
            clock.clone(),
        );
        let input = InputEndpoint::new(source_spec, data_tx, input_rx, main_tx, clock);
        let cork = controller.cork_state();

        tracing::info!(
            source = %source_name,
            sink = %sink_name,
            rate = spec.rate,
            channels = spec.channels,
            latency_ms = controller.latency() / 1000,
            minimum_latency_ms = controller.minimum_latency() as f64 / 1000.0,
            "Loopback configured"
        );

        Ok(Self {
            state: SessionState::Configured,
            spec,
            controller,
            input: Some(input),
            output: Some(output),
            main_rx,
            cork,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn spec(&self) -> SampleSpec {
        self.spec
    }

    pub fn controller(&self) -> &Controller {
        &self.controller
    }

    pub fn controller_mut(&mut self) -> &mut Controller {
        &mut self.controller
    }

    pub fn output(&self) -> Option<&OutputEndpoint> {
        self.output.as_ref()
    }

    pub fn input(&self) -> Option<&InputEndpoint> {
        self.input.as_ref()
    }

    pub fn cork_state(&self) -> Arc<CorkState> {
        self.cork.clone()
    }

    fn ensure_live(&self) -> Result<()> {
        if self.state == SessionState::TornDown {
            return Err(LoopbackError::IllegalState(
                "loopback session is torn down".to_string(),
            ));
        }
        Ok(())
    }

    fn refresh_state(&mut self) {
        if matches!(self.state, SessionState::Running | SessionState::Corked) {
            self.state = if self.cork.source_corked() || self.cork.sink_corked() {
                SessionState::Corked
            } else {
                SessionState::Running
            };
        }
    }

    /// Configure prebuffering and rewind history from the sink
    pub fn attach_sink<S: SinkThread + ?Sized>(&mut self, sink: &S) -> Result<()> {
        self.ensure_live()?;
        if let Some(output) = self.output.as_mut() {
            output.attach(sink);
        }
        Ok(())
    }

    /// Uncork both sides and arm the adjustment timer
    pub fn start(&mut self) -> Result<()> {
        match self.state {
            SessionState::Configured => {}
            SessionState::TornDown => return self.ensure_live(),
            _ => {
                return Err(LoopbackError::IllegalState(
                    "loopback session already started".to_string(),
                ))
            }
        }
        self.controller.update_effective_source_latency();
        self.controller.start();
        self.state = SessionState::Running;
        self.refresh_state();
        tracing::info!(state = ?self.state, "Loopback started");
        Ok(())
    }

    /// Capture callback: forward one chunk unless the source side is corked
    ///
    /// Returns whether the chunk was forwarded.
    pub fn capture<S: SourceThread + ?Sized>(&mut self, source: &S, chunk: &[u8]) -> Result<bool> {
        self.ensure_live()?;
        let Some(input) = self.input.as_mut() else {
            return Ok(false);
        };
        input.process_messages(source);
        if self.cork.source_corked() {
            return Ok(false);
        }
        input.push(source, chunk);
        Ok(true)
    }

    /// The source took back `nbytes` it already forwarded
    pub fn capture_rewind(&mut self, nbytes: usize) -> Result<()> {
        self.ensure_live()?;
        if let Some(input) = self.input.as_mut() {
            input.rewind(nbytes);
        }
        Ok(())
    }

    /// Render callback: fill `dst` from the adjustment queue
    ///
    /// `None` means nothing was readable (or the sink side is corked) and the
    /// sink should play silence.
    pub fn render<S: SinkThread + ?Sized>(&mut self, sink: &S, dst: &mut [u8]) -> Result<Option<usize>> {
        self.ensure_live()?;
        let Some(output) = self.output.as_mut() else {
            return Ok(None);
        };
        if self.cork.sink_corked() {
            output.process_messages(sink);
            return Ok(None);
        }
        Ok(output.pop(sink, dst))
    }

    /// The sink rewound; replay `nbytes` of queue history
    pub fn render_rewind(&mut self, nbytes: usize) -> Result<()> {
        self.ensure_live()?;
        if let Some(output) = self.output.as_mut() {
            output.process_rewind(nbytes);
        }
        Ok(())
    }

    /// Let both data paths answer pending requests without moving audio
    pub fn process_paths<S, K>(&mut self, source: &S, sink: &K) -> Result<()>
    where
        S: SourceThread + ?Sized,
        K: SinkThread + ?Sized,
    {
        self.ensure_live()?;
        if let Some(input) = self.input.as_mut() {
            input.process_messages(source);
        }
        if let Some(output) = self.output.as_mut() {
            output.process_messages(sink);
        }
        Ok(())
    }

    /// Control-thread step: consume data-path reports and run a due cycle
    pub fn process_control(&mut self) -> Result<Option<CycleOutcome>> {
        self.ensure_live()?;
        while let Ok(message) = self.main_rx.try_recv() {
            self.controller.handle_main_message(message);
        }
        Ok(self.controller.poll())
    }

    pub fn handle_device_event(&mut self, event: DeviceEvent) -> Result<()> {
        self.ensure_live()?;
        self.controller.handle_device_event(event);
        self.refresh_state();
        Ok(())
    }

    /// Stop the timer and release the input path, then the output path
    ///
    /// Only the input path produces data messages, so releasing it first
    /// guarantees nothing arrives after the output path flushed its queue.
    pub fn teardown(&mut self) -> Result<TeardownSummary> {
        self.ensure_live()?;
        self.controller.shutdown();

        let source_detached = self.input.take().is_some();
        let flushed_messages = match self.output.take() {
            Some(mut output) => output.unlink(),
            None => 0,
        };

        self.state = SessionState::TornDown;
        tracing::info!(flushed_messages, "Loopback torn down");
        Ok(TeardownSummary {
            flushed_messages,
            source_detached,
        })
    }

    /// Split into independently owned parts
    pub fn into_parts(mut self) -> Result<SessionParts> {
        self.ensure_live()?;
        match (self.input.take(), self.output.take()) {
            (Some(input), Some(output)) => Ok(SessionParts {
                controller: self.controller,
                input,
                output,
                main_rx: self.main_rx,
                cork: self.cork,
            }),
            _ => Err(LoopbackError::IllegalState(
                "loopback session has no data paths".to_string(),
            )),
        }
    }
}
