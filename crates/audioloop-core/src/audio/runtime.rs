//! Control thread of a split session
//!
//! Waits on data-path reports, device events and shutdown at once, using the
//! controller's timer deadline as the wait timeout.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender};

use super::controller::{Controller, CycleOutcome};
use super::message::{DeviceEvent, ToMain};
use crate::clock::Clock;
use crate::error::{LoopbackError, Result};

/// Wait while the timer is off
const IDLE_WAIT: Duration = Duration::from_millis(500);

/// Handle for feeding and stopping a running [`ControlLoop`]
pub struct ControlHandle {
    events: Sender<DeviceEvent>,
    shutdown: Sender<()>,
    thread: Option<JoinHandle<Controller>>,
}

impl ControlHandle {
    /// Deliver a device notification to the control thread
    pub fn send_event(&self, event: DeviceEvent) -> Result<()> {
        self.events
            .send(event)
            .map_err(|_| LoopbackError::IllegalState("control thread has exited".to_string()))
    }

    /// Sender for device notifications, for device callbacks to hold
    pub fn events(&self) -> Sender<DeviceEvent> {
        self.events.clone()
    }

    /// Stop the thread and get the controller back
    pub fn stop(mut self) -> Result<Controller> {
        let _ = self.shutdown.send(());
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .map_err(|_| LoopbackError::IllegalState("control thread panicked".to_string())),
            None => Err(LoopbackError::IllegalState(
                "control thread already joined".to_string(),
            )),
        }
    }
}

impl Drop for ControlHandle {
    fn drop(&mut self) {
        if let Some(thread) = self.thread.take() {
            let _ = self.shutdown.send(());
            let _ = thread.join();
        }
    }
}

/// Main-thread side of a loopback running on its own thread
pub struct ControlLoop {
    controller: Controller,
    main_rx: Receiver<ToMain>,
    events_rx: Receiver<DeviceEvent>,
    shutdown_rx: Receiver<()>,
    clock: Arc<dyn Clock>,
}

impl ControlLoop {
    /// Start the controller's timer and run it on a new thread
    pub fn spawn(
        mut controller: Controller,
        main_rx: Receiver<ToMain>,
        clock: Arc<dyn Clock>,
    ) -> Result<ControlHandle> {
        let (events, events_rx) = unbounded();
        let (shutdown, shutdown_rx) = bounded(1);

        controller.update_effective_source_latency();
        controller.start();

        let control = ControlLoop {
            controller,
            main_rx,
            events_rx,
            shutdown_rx,
            clock,
        };
        let thread = thread::Builder::new()
            .name("audioloop-control".to_string())
            .spawn(move || control.run())?;

        Ok(ControlHandle {
            events,
            shutdown,
            thread: Some(thread),
        })
    }

    fn timeout(&self) -> Duration {
        match self.controller.timer_deadline() {
            Some(deadline) => {
                Duration::from_micros(deadline.saturating_sub(self.clock.now_usec()))
            }
            None => IDLE_WAIT,
        }
    }

    fn run(mut self) -> Controller {
        tracing::debug!("control_loop_started");
        loop {
            let timeout = self.timeout();
            select! {
                recv(self.main_rx) -> message => match message {
                    Ok(message) => self.controller.handle_main_message(message),
                    // both data paths are gone
                    Err(_) => break,
                },
                recv(self.events_rx) -> event => match event {
                    Ok(event) => self.controller.handle_device_event(event),
                    Err(_) => break,
                },
                recv(self.shutdown_rx) -> _ => break,
                default(timeout) => {}
            }

            if let Some(outcome) = self.controller.poll() {
                match outcome {
                    CycleOutcome::RateUpdated { rate, latency_difference } => {
                        tracing::trace!(rate, latency_difference, "adjust_cycle_done")
                    }
                    other => tracing::trace!(outcome = ?other, "adjust_cycle_done"),
                }
            }
        }

        // whatever was already delivered still counts
        while let Ok(event) = self.events_rx.try_recv() {
            self.controller.handle_device_event(event);
        }
        while let Ok(message) = self.main_rx.try_recv() {
            self.controller.handle_main_message(message);
        }

        self.controller.shutdown();
        tracing::debug!("control_loop_stopped");
        self.controller
    }
}
