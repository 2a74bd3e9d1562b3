//! Capture side of the loopback
//!
//! Runs on the source's real-time thread. Every captured chunk is tagged with
//! the source latency and the capture time and forwarded to the output path;
//! nothing here touches the adjustment queue directly.

use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};

use super::device::SourceThread;
use super::message::{SourceSnapshot, ToInput, ToMain, ToOutput};
use super::spec::SampleSpec;
use crate::clock::Clock;

/// Source-side endpoint of a loopback session
pub struct InputEndpoint {
    /// Spec of the source, used to convert its delay queue to time
    spec: SampleSpec,
    data_tx: Sender<ToOutput>,
    control_rx: Receiver<ToInput>,
    main_tx: Sender<ToMain>,
    clock: Arc<dyn Clock>,
    /// Bytes forwarded so far, net of rewinds
    send_counter: i64,
}

impl InputEndpoint {
    pub fn new(
        spec: SampleSpec,
        data_tx: Sender<ToOutput>,
        control_rx: Receiver<ToInput>,
        main_tx: Sender<ToMain>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            spec,
            data_tx,
            control_rx,
            main_tx,
            clock,
            send_counter: 0,
        }
    }

    pub fn send_counter(&self) -> i64 {
        self.send_counter
    }

    /// Forward one captured chunk to the output path
    pub fn push<S: SourceThread + ?Sized>(&mut self, source: &S, chunk: &[u8]) {
        let push_time = self.clock.now_usec();
        let source_latency = source.latency_within_thread();

        let message = ToOutput::Post {
            chunk: chunk.to_vec(),
            source_latency,
            push_time,
        };
        if self.data_tx.send(message).is_err() {
            tracing::trace!(bytes = chunk.len(), "output_path_gone_chunk_dropped");
        }
        self.send_counter += chunk.len() as i64;
    }

    /// Tell the output path the source took back `nbytes` it already forwarded
    pub fn rewind(&mut self, nbytes: usize) {
        if self.data_tx.send(ToOutput::Rewind(nbytes)).is_err() {
            tracing::trace!(nbytes, "output_path_gone_rewind_dropped");
        }
        self.send_counter -= nbytes as i64;
    }

    /// Handle pending requests from the control thread
    pub fn process_messages<S: SourceThread + ?Sized>(&mut self, source: &S) {
        while let Ok(message) = self.control_rx.try_recv() {
            match message {
                ToInput::LatencySnapshot => {
                    let snapshot = self.snapshot(source);
                    let _ = self.main_tx.send(ToMain::SourceSnapshot(snapshot));
                }
            }
        }
    }

    fn snapshot<S: SourceThread + ?Sized>(&self, source: &S) -> SourceSnapshot {
        // audio still held back by the source counts as source latency
        let delayed = self.spec.bytes_to_usec(source.delay_queue_len()) as i64;
        SourceSnapshot {
            send_counter: self.send_counter,
            source_latency: source.latency_within_thread() + delayed,
            timestamp: self.clock.now_usec(),
        }
    }

    /// The source's latency range changed; let the control thread re-evaluate
    pub fn latency_range_changed(&self) {
        let _ = self.main_tx.send(ToMain::SourceLatencyRangeChanged);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::spec::SampleFormat;
    use crate::clock::ManualClock;
    use crossbeam_channel::unbounded;

    struct FixedSource {
        latency: i64,
        delayed: usize,
    }

    impl SourceThread for FixedSource {
        fn latency_within_thread(&self) -> i64 {
            self.latency
        }

        fn delay_queue_len(&self) -> usize {
            self.delayed
        }
    }

    struct Harness {
        input: InputEndpoint,
        data_rx: Receiver<ToOutput>,
        control_tx: Sender<ToInput>,
        main_rx: Receiver<ToMain>,
        clock: Arc<ManualClock>,
    }

    fn harness() -> Harness {
        let (data_tx, data_rx) = unbounded();
        let (control_tx, control_rx) = unbounded();
        let (main_tx, main_rx) = unbounded();
        let clock = Arc::new(ManualClock::new(1_000));
        let spec = SampleSpec::new(SampleFormat::S16Le, 48000, 2);
        let input = InputEndpoint::new(spec, data_tx, control_rx, main_tx, clock.clone());
        Harness {
            input,
            data_rx,
            control_tx,
            main_rx,
            clock,
        }
    }

    #[test]
    fn test_push_tags_chunk_and_counts_bytes() {
        let mut h = harness();
        let source = FixedSource {
            latency: 4_000,
            delayed: 0,
        };

        h.input.push(&source, &[1, 2, 3, 4]);
        assert_eq!(h.input.send_counter(), 4);

        match h.data_rx.try_recv() {
            Ok(ToOutput::Post {
                chunk,
                source_latency,
                push_time,
            }) => {
                assert_eq!(chunk, vec![1, 2, 3, 4]);
                assert_eq!(source_latency, 4_000);
                assert_eq!(push_time, 1_000);
            }
            other => panic!("expected a post, got {:?}", other),
        }
    }

    #[test]
    fn test_rewind_decrements_send_counter() {
        let mut h = harness();
        let source = FixedSource {
            latency: 0,
            delayed: 0,
        };
        h.input.push(&source, &[0; 100]);
        h.input.rewind(40);
        assert_eq!(h.input.send_counter(), 60);

        let messages: Vec<_> = h.data_rx.try_iter().collect();
        assert_eq!(messages.last(), Some(&ToOutput::Rewind(40)));
    }

    #[test]
    fn test_snapshot_includes_delay_queue() {
        let mut h = harness();
        // 1920 bytes is 10ms at 48kHz stereo s16
        let source = FixedSource {
            latency: 5_000,
            delayed: 1920,
        };
        h.input.push(&source, &[0; 8]);
        h.clock.advance(250);

        h.control_tx.send(ToInput::LatencySnapshot).unwrap();
        h.input.process_messages(&source);

        match h.main_rx.try_recv() {
            Ok(ToMain::SourceSnapshot(snapshot)) => {
                assert_eq!(snapshot.send_counter, 8);
                assert_eq!(snapshot.source_latency, 15_000);
                assert_eq!(snapshot.timestamp, 1_250);
            }
            other => panic!("expected a source snapshot, got {:?}", other),
        }
    }

    #[test]
    fn test_push_after_output_gone_does_not_fail() {
        let h = harness();
        let Harness {
            mut input, data_rx, ..
        } = h;
        drop(data_rx);
        let source = FixedSource {
            latency: 0,
            delayed: 0,
        };
        input.push(&source, &[0; 4]);
        assert_eq!(input.send_counter(), 4);
    }
}
