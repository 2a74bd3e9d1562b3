//! Render side of the loopback
//!
//! Runs on the sink's real-time thread and owns the [`AdjustmentQueue`].
//! Captured chunks arrive as [`ToOutput::Post`] messages; render pulls are
//! served from the queue while its length is steered toward the target
//! latency.
//!
//! ## Handshake
//!
//! After a (re)start the queue length has to be re-based once against the
//! real source-to-sink delay. That delay is only known when a chunk arrives,
//! so the second pull arms the correction and the next post performs it:
//!
//! - first pull: `first_pop_done`
//! - second pull: `pop_called` and `pop_adjust`
//! - next post: rebase with silence allowed, clear `pop_adjust`, set `push_called`
//!
//! Until the second pull, posts only trim the queue. Until the first post
//! after that, pulls keep topping the queue up.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender};

use super::device::{SinkThread, UNDERRUN_UNBOUNDED};
use super::message::{SinkSnapshot, ToMain, ToOutput};
use super::queue::AdjustmentQueue;
use super::spec::SampleSpec;
use crate::clock::Clock;
use crate::QUEUE_MAX_LENGTH;

/// Flags of the pull/post handshake
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Handshake {
    pub in_pop: bool,
    pub pop_called: bool,
    pub pop_adjust: bool,
    pub first_pop_done: bool,
    pub push_called: bool,
}

/// Lets the control thread restart the pull side of the handshake
///
/// Only used while the sink is suspended, when no pull can race with it.
#[derive(Debug, Clone, Default)]
pub struct SinkSuspendHandle {
    reset: Arc<AtomicBool>,
}

impl SinkSuspendHandle {
    pub fn reset_handshake(&self) {
        self.reset.store(true, Ordering::Release);
    }
}

/// Latency values the output path starts with
#[derive(Debug, Clone)]
pub struct OutputParams {
    /// Stream spec at the base rate
    pub spec: SampleSpec,
    /// Configured end-to-end latency (usec)
    pub latency: u64,
    pub minimum_latency: u64,
    pub effective_source_latency: u64,
    /// Shared with the control thread
    pub suspend: SinkSuspendHandle,
}

/// Sink-side endpoint of a loopback session
pub struct OutputEndpoint {
    spec: SampleSpec,
    queue: AdjustmentQueue,
    data_rx: Receiver<ToOutput>,
    control_rx: Receiver<ToOutput>,
    main_tx: Sender<ToMain>,
    clock: Arc<dyn Clock>,
    latency: u64,
    minimum_latency: u64,
    effective_source_latency: u64,
    /// Bytes received into the queue so far, net of rewinds
    recv_counter: i64,
    handshake: Handshake,
    suspend: SinkSuspendHandle,
    rebaselines: u64,
    linked: bool,
}

impl OutputEndpoint {
    /// Create the endpoint with a queue pre-filled with `latency` of silence
    pub fn new(
        params: OutputParams,
        data_rx: Receiver<ToOutput>,
        control_rx: Receiver<ToOutput>,
        main_tx: Sender<ToMain>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let mut queue = AdjustmentQueue::new(&params.spec, QUEUE_MAX_LENGTH);
        queue.seek_relative(params.spec.usec_to_bytes(params.latency) as i64);

        Self {
            spec: params.spec,
            queue,
            data_rx,
            control_rx,
            main_tx,
            clock,
            latency: params.latency,
            minimum_latency: params.minimum_latency,
            effective_source_latency: params.effective_source_latency,
            recv_counter: 0,
            handshake: Handshake::default(),
            suspend: params.suspend,
            rebaselines: 0,
            linked: true,
        }
    }

    pub fn suspend_handle(&self) -> SinkSuspendHandle {
        self.suspend.clone()
    }

    /// Configure prebuffering and rewind history from the sink
    pub fn attach<S: SinkThread + ?Sized>(&mut self, sink: &S) {
        self.queue.set_prebuf(sink.max_request() * 2);
        self.queue.set_max_rewind(sink.max_rewind());
    }

    pub fn update_max_request(&mut self, nbytes: usize) {
        self.queue.set_prebuf(nbytes * 2);
        tracing::debug!(max_request = nbytes, "max_request_changed");
    }

    pub fn update_max_rewind(&mut self, nbytes: usize) {
        self.queue.set_max_rewind(nbytes);
    }

    /// Serve one render pull of up to `dst.len()` bytes
    ///
    /// Returns `None` when nothing is readable; the sink then plays silence
    /// and counts the underrun.
    pub fn pop<S: SinkThread + ?Sized>(&mut self, sink: &S, dst: &mut [u8]) -> Option<usize> {
        self.apply_pending_reset();
        self.process_control(sink);

        // pending posts must be in the queue before deciding anything
        self.handshake.in_pop = true;
        while let Ok(message) = self.data_rx.try_recv() {
            self.handle(sink, message);
        }
        self.handshake.in_pop = false;

        // the first pull may happen before the sink really runs, so the
        // rebase is armed on the second one
        if !self.handshake.pop_called && self.handshake.first_pop_done {
            self.handshake.pop_adjust = true;
            self.handshake.pop_called = true;
        }
        self.handshake.first_pop_done = true;

        let n = self.queue.read_into(dst)?;

        if !self.handshake.push_called {
            self.adjust(sink, 0, true);
        }
        Some(n)
    }

    /// Handle every pending message from the control thread and the input path
    pub fn process_messages<S: SinkThread + ?Sized>(&mut self, sink: &S) {
        self.apply_pending_reset();
        self.process_control(sink);
        while let Ok(message) = self.data_rx.try_recv() {
            self.handle(sink, message);
        }
    }

    fn process_control<S: SinkThread + ?Sized>(&mut self, sink: &S) {
        while let Ok(message) = self.control_rx.try_recv() {
            self.handle(sink, message);
        }
    }

    fn handle<S: SinkThread + ?Sized>(&mut self, sink: &S, message: ToOutput) {
        match message {
            ToOutput::Post {
                chunk,
                source_latency,
                push_time,
            } => self.post(sink, &chunk, source_latency, push_time),
            ToOutput::Rewind(nbytes) => {
                // nothing of ours to take back before the first post
                if self.handshake.push_called {
                    self.queue.seek_relative(-(nbytes as i64));
                }
                self.recv_counter -= nbytes as i64;
            }
            ToOutput::LatencySnapshot => {
                let snapshot = self.snapshot(sink);
                let _ = self.main_tx.send(ToMain::SinkSnapshot(snapshot));
            }
            ToOutput::SourceChanged => self.handshake.push_called = false,
            ToOutput::SetEffectiveSourceLatency(usec) => self.effective_source_latency = usec,
            ToOutput::UpdateMinLatency(usec) => self.minimum_latency = usec,
            ToOutput::FastAdjust(latency_offset) => self.adjust(sink, latency_offset, true),
        }
    }

    /// Queue one forwarded chunk and run the handshake and underrun checks
    pub fn post<S: SinkThread + ?Sized>(
        &mut self,
        sink: &S,
        chunk: &[u8],
        source_latency: i64,
        push_time: u64,
    ) {
        self.apply_pending_reset();
        if !self.queue.push(chunk) {
            tracing::warn!(bytes = chunk.len(), "adjustment_queue_full");
        }

        if self.handshake.pop_called && (!self.handshake.push_called || self.handshake.pop_adjust)
        {
            // source latency at push time, plus transit, plus sink latency
            let mut time_delta = source_latency;
            time_delta += self.clock.now_usec().saturating_sub(push_time) as i64;
            time_delta += sink.latency_within_thread();

            // the chunk is already in the queue; don't count it twice. A chunk
            // longer than the source latency means the source overran, and only
            // one source latency worth of it is subtracted.
            let chunk_usec = self.spec.bytes_to_usec(chunk.len());
            if chunk_usec > self.effective_source_latency {
                time_delta -= self.effective_source_latency as i64;
            } else {
                time_delta -= chunk_usec as i64;
            }

            self.adjust(sink, time_delta, true);
            self.handshake.pop_adjust = false;
            self.handshake.push_called = true;
            self.rebaselines += 1;
            tracing::debug!(time_delta_us = time_delta, "latency_rebaselined");
        }

        // before the sink pulls, only keep the queue from growing
        if !self.handshake.pop_called {
            self.adjust(sink, 0, false);
        }

        // end of an underrun: restart playback right away
        let underrun_for = sink.underrun_for();
        if !sink.is_suspended() && underrun_for > 0 && self.queue.is_readable() {
            let _ = self.main_tx.send(ToMain::Underrun);
            if !self.handshake.in_pop {
                let nbytes = if underrun_for == UNDERRUN_UNBOUNDED {
                    0
                } else {
                    underrun_for
                };
                tracing::debug!(nbytes, "rewind_requested_end_of_underrun");
                sink.request_rewind(nbytes);
            }
        }

        self.recv_counter += chunk.len() as i64;
    }

    /// Steer the queue toward the target latency corrected by `latency_offset`
    ///
    /// Excess audio is always dropped. Missing audio is padded with silence
    /// only when `allow_push` is set.
    pub fn adjust<S: SinkThread + ?Sized>(&mut self, sink: &S, latency_offset: i64, allow_push: bool) {
        let final_latency = self.latency.max(self.minimum_latency) as i64;

        // a large negative offset means holding more than the final latency
        let mut requested = final_latency - latency_offset;

        // at least one sink latency so the sink never starts starved
        let sink_requested = sink.requested_latency_within_thread() as i64;
        if requested < sink_requested {
            requested = sink_requested;
        }

        let target = self.spec.usec_to_bytes(requested.max(0) as u64);
        let current = self.queue.length();
        if current > target {
            let excess = current - target;
            tracing::debug!(
                dropped_us = self.spec.bytes_to_usec(excess),
                "queue_audio_dropped"
            );
            self.queue.drop_front(excess);
        } else if current < target && allow_push {
            let missing = target - current;
            tracing::debug!(
                silence_us = self.spec.bytes_to_usec(missing),
                "queue_silence_added"
            );
            self.queue.seek_relative(missing as i64);
        }
    }

    /// The sink rewound; replay `nbytes` of queue history
    pub fn process_rewind(&mut self, nbytes: usize) {
        self.queue.rewind(nbytes);
    }

    fn snapshot<S: SinkThread + ?Sized>(&self, sink: &S) -> SinkSnapshot {
        // audio already taken by the sink but not yet played counts as sink latency
        let rendered = self.spec.bytes_to_usec(sink.render_queue_len()) as i64;
        SinkSnapshot {
            recv_counter: self.recv_counter,
            queue_length: self.queue.length(),
            sink_latency: sink.latency_within_thread() + rendered,
            timestamp: self.clock.now_usec(),
        }
    }

    /// Latency held in the queue (usec)
    pub fn latency(&self) -> u64 {
        self.spec.bytes_to_usec(self.queue.length())
    }

    /// The sink was suspended; the next pulls start the handshake over
    pub fn on_sink_suspended(&mut self) {
        self.handshake.pop_called = false;
        self.handshake.first_pop_done = false;
    }

    fn apply_pending_reset(&mut self) {
        if self.suspend.reset.swap(false, Ordering::AcqRel) {
            self.on_sink_suspended();
        }
    }

    /// The sink's latency range changed; let the control thread re-evaluate
    pub fn latency_range_changed(&self) {
        let _ = self.main_tx.send(ToMain::SinkLatencyRangeChanged);
    }

    /// Detach from the input path, dropping every message still queued
    ///
    /// Returns how many messages were flushed. Only the first call flushes.
    pub fn unlink(&mut self) -> usize {
        if !self.linked {
            return 0;
        }
        self.linked = false;
        let flushed = self.data_rx.try_iter().count();
        if flushed > 0 {
            tracing::debug!(flushed, "data_queue_flushed_on_unlink");
        }
        flushed
    }

    pub fn is_linked(&self) -> bool {
        self.linked
    }

    pub fn queue_length(&self) -> usize {
        self.queue.length()
    }

    pub fn queue(&self) -> &AdjustmentQueue {
        &self.queue
    }

    pub fn recv_counter(&self) -> i64 {
        self.recv_counter
    }

    pub fn handshake(&self) -> Handshake {
        self.handshake
    }

    /// How often the deferred latency rebase has run
    pub fn rebaseline_count(&self) -> u64 {
        self.rebaselines
    }

    pub fn minimum_latency(&self) -> u64 {
        self.minimum_latency
    }

    pub fn effective_source_latency(&self) -> u64 {
        self.effective_source_latency
    }

    pub fn spec(&self) -> SampleSpec {
        self.spec
    }
}

impl Drop for OutputEndpoint {
    fn drop(&mut self) {
        self.unlink();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::spec::SampleFormat;
    use crate::clock::ManualClock;
    use crossbeam_channel::unbounded;
    use std::cell::Cell;

    /// 48kHz stereo s16: 192 bytes per millisecond
    const BYTES_PER_MS: usize = 192;

    #[derive(Default)]
    struct TestSink {
        latency: i64,
        requested: u64,
        underrun_for: Cell<usize>,
        suspended: bool,
        rewinds: Cell<Vec<usize>>,
    }

    impl SinkThread for TestSink {
        fn latency_within_thread(&self) -> i64 {
            self.latency
        }

        fn requested_latency_within_thread(&self) -> u64 {
            self.requested
        }

        fn is_suspended(&self) -> bool {
            self.suspended
        }

        fn underrun_for(&self) -> usize {
            self.underrun_for.get()
        }

        fn max_request(&self) -> usize {
            10 * BYTES_PER_MS
        }

        fn request_rewind(&self, nbytes: usize) {
            let mut rewinds = self.rewinds.take();
            rewinds.push(nbytes);
            self.rewinds.set(rewinds);
        }
    }

    struct Harness {
        output: OutputEndpoint,
        data_tx: Sender<ToOutput>,
        control_tx: Sender<ToOutput>,
        main_rx: Receiver<ToMain>,
        clock: Arc<ManualClock>,
    }

    fn harness(latency_ms: u64) -> Harness {
        let (data_tx, data_rx) = unbounded();
        let (control_tx, control_rx) = unbounded();
        let (main_tx, main_rx) = unbounded();
        let clock = Arc::new(ManualClock::new(0));
        let params = OutputParams {
            spec: SampleSpec::new(SampleFormat::S16Le, 48000, 2),
            latency: latency_ms * 1000,
            minimum_latency: 0,
            effective_source_latency: 20_000,
            suspend: SinkSuspendHandle::default(),
        };
        let output = OutputEndpoint::new(params, data_rx, control_rx, main_tx, clock.clone());
        Harness {
            output,
            data_tx,
            control_tx,
            main_rx,
            clock,
        }
    }

    fn post(tx: &Sender<ToOutput>, ms: usize, push_time: u64) {
        tx.send(ToOutput::Post {
            chunk: vec![1; ms * BYTES_PER_MS],
            source_latency: 0,
            push_time,
        })
        .unwrap();
    }

    #[test]
    fn test_queue_starts_with_latency_of_silence() {
        let h = harness(100);
        assert_eq!(h.output.queue_length(), 100 * BYTES_PER_MS);
        assert_eq!(h.output.latency(), 100_000);
    }

    #[test]
    fn test_sink_rewind_replays_kept_history() {
        let mut h = harness(50);
        let sink = TestSink::default();
        h.output.update_max_rewind(20 * BYTES_PER_MS);
        let mut buf = vec![0u8; 10 * BYTES_PER_MS];
        assert_eq!(h.output.pop(&sink, &mut buf), Some(buf.len()));
        // refilled to the target before anything was pushed
        assert_eq!(h.output.queue_length(), 50 * BYTES_PER_MS);

        h.output.process_rewind(5 * BYTES_PER_MS);
        assert_eq!(h.output.queue_length(), 55 * BYTES_PER_MS);
        h.output.process_rewind(50 * BYTES_PER_MS);
        assert_eq!(
            h.output.queue_length(),
            60 * BYTES_PER_MS,
            "only the 10ms actually played can be replayed"
        );
    }

    #[test]
    fn test_max_request_change_doubles_prebuf() {
        let mut h = harness(50);
        h.output.attach(&TestSink::default());
        assert_eq!(h.output.queue().prebuf(), 20 * BYTES_PER_MS);
        h.output.update_max_request(25 * BYTES_PER_MS);
        assert_eq!(h.output.queue().prebuf(), 50 * BYTES_PER_MS);
    }

    #[test]
    fn test_post_before_pop_only_trims() {
        let mut h = harness(50);
        let sink = TestSink::default();
        post(&h.data_tx, 30, 0);
        h.output.process_messages(&sink);
        // 80ms queued, trimmed back to the 50ms target
        assert_eq!(h.output.queue_length(), 50 * BYTES_PER_MS);
        assert_eq!(h.output.recv_counter(), (30 * BYTES_PER_MS) as i64);
    }

    #[test]
    fn test_handshake_arms_on_second_pop_and_fires_once() {
        let mut h = harness(50);
        let sink = TestSink::default();
        let mut buf = vec![0u8; 10 * BYTES_PER_MS];

        h.output.pop(&sink, &mut buf);
        let state = h.output.handshake();
        assert!(state.first_pop_done);
        assert!(!state.pop_called, "first pop must not arm the rebase");

        h.output.pop(&sink, &mut buf);
        let state = h.output.handshake();
        assert!(state.pop_called && state.pop_adjust);

        post(&h.data_tx, 10, 0);
        h.output.process_messages(&sink);
        let state = h.output.handshake();
        assert!(state.push_called);
        assert!(!state.pop_adjust);
        assert_eq!(h.output.rebaseline_count(), 1);

        for _ in 0..5 {
            h.output.pop(&sink, &mut buf);
            post(&h.data_tx, 10, 0);
            h.output.process_messages(&sink);
        }
        assert_eq!(h.output.rebaseline_count(), 1, "rebase must happen exactly once");
    }

    #[test]
    fn test_rebase_accounts_for_source_and_sink_latency() {
        let mut h = harness(100);
        let sink = TestSink {
            latency: 20_000,
            ..Default::default()
        };
        let mut buf = vec![0u8; 10 * BYTES_PER_MS];
        h.output.pop(&sink, &mut buf);
        h.output.pop(&sink, &mut buf);

        // source 30ms + transit 5ms + sink 20ms - chunk 10ms = 45ms outside the queue
        h.clock.set(5_000);
        h.data_tx
            .send(ToOutput::Post {
                chunk: vec![1; 10 * BYTES_PER_MS],
                source_latency: 30_000,
                push_time: 0,
            })
            .unwrap();
        h.output.process_messages(&sink);
        assert_eq!(h.output.queue_length(), 55 * BYTES_PER_MS);
    }

    #[test]
    fn test_rebase_caps_overrun_chunk_at_source_latency() {
        let mut h = harness(100);
        let sink = TestSink::default();
        let mut buf = vec![0u8; 10 * BYTES_PER_MS];
        h.output.pop(&sink, &mut buf);
        h.output.pop(&sink, &mut buf);

        // a 40ms chunk against a 20ms effective source latency
        h.data_tx
            .send(ToOutput::Post {
                chunk: vec![1; 40 * BYTES_PER_MS],
                source_latency: 50_000,
                push_time: 0,
            })
            .unwrap();
        h.output.process_messages(&sink);
        // 100 - (50 - 20) = 70ms
        assert_eq!(h.output.queue_length(), 70 * BYTES_PER_MS);
    }

    #[test]
    fn test_adjust_keeps_one_sink_latency() {
        let mut h = harness(10);
        let sink = TestSink {
            requested: 30_000,
            ..Default::default()
        };
        h.output.adjust(&sink, 0, true);
        assert_eq!(h.output.queue_length(), 30 * BYTES_PER_MS);
    }

    #[test]
    fn test_adjust_honors_minimum_latency() {
        let mut h = harness(10);
        let sink = TestSink::default();
        h.control_tx.send(ToOutput::UpdateMinLatency(40_000)).unwrap();
        h.output.process_messages(&sink);
        h.output.adjust(&sink, 0, true);
        assert_eq!(h.output.queue_length(), 40 * BYTES_PER_MS);
    }

    #[test]
    fn test_adjust_without_push_never_pads() {
        let mut h = harness(10);
        let sink = TestSink::default();
        // shrink to 5ms, then ask for the 10ms target without permission to pad
        h.output.adjust(&sink, 5_000, true);
        assert_eq!(h.output.queue_length(), 5 * BYTES_PER_MS);
        h.output.adjust(&sink, 0, false);
        assert_eq!(
            h.output.queue_length(),
            5 * BYTES_PER_MS,
            "silence must not be added"
        );
    }

    #[test]
    fn test_fast_adjust_resizes_queue() {
        let mut h = harness(100);
        let sink = TestSink::default();
        h.control_tx.send(ToOutput::FastAdjust(40_000)).unwrap();
        h.output.process_messages(&sink);
        assert_eq!(h.output.queue_length(), 60 * BYTES_PER_MS);
    }

    #[test]
    fn test_rewind_ignored_before_first_push() {
        let mut h = harness(50);
        let sink = TestSink::default();
        h.data_tx.send(ToOutput::Rewind(BYTES_PER_MS)).unwrap();
        h.output.process_messages(&sink);
        assert_eq!(h.output.queue_length(), 50 * BYTES_PER_MS);
        assert_eq!(h.output.recv_counter(), -(BYTES_PER_MS as i64));
    }

    #[test]
    fn test_end_of_underrun_requests_rewind() {
        let mut h = harness(50);
        let sink = TestSink::default();
        sink.underrun_for.set(4 * BYTES_PER_MS);
        post(&h.data_tx, 10, 0);
        h.output.process_messages(&sink);

        assert_eq!(h.main_rx.try_recv(), Ok(ToMain::Underrun));
        assert_eq!(sink.rewinds.take(), vec![4 * BYTES_PER_MS]);
    }

    #[test]
    fn test_end_of_underrun_inside_pop_skips_rewind() {
        let mut h = harness(50);
        let sink = TestSink::default();
        sink.underrun_for.set(UNDERRUN_UNBOUNDED);
        post(&h.data_tx, 10, 0);
        let mut buf = vec![0u8; BYTES_PER_MS];
        h.output.pop(&sink, &mut buf);

        assert_eq!(h.main_rx.try_recv(), Ok(ToMain::Underrun));
        assert!(sink.rewinds.take().is_empty(), "no reentrant rewind from pop");
    }

    #[test]
    fn test_suspend_handle_restarts_pop_side() {
        let mut h = harness(50);
        let sink = TestSink::default();
        let mut buf = vec![0u8; BYTES_PER_MS];
        h.output.pop(&sink, &mut buf);
        h.output.pop(&sink, &mut buf);
        assert!(h.output.handshake().pop_called);

        h.output.suspend_handle().reset_handshake();
        h.output.process_messages(&sink);
        let state = h.output.handshake();
        assert!(!state.pop_called && !state.first_pop_done);
    }

    #[test]
    fn test_snapshot_reports_queue_and_sink_latency() {
        let mut h = harness(50);
        let sink = TestSink {
            latency: 8_000,
            ..Default::default()
        };
        h.clock.set(777);
        h.control_tx.send(ToOutput::LatencySnapshot).unwrap();
        h.output.process_messages(&sink);

        match h.main_rx.try_recv() {
            Ok(ToMain::SinkSnapshot(snapshot)) => {
                assert_eq!(snapshot.queue_length, 50 * BYTES_PER_MS);
                assert_eq!(snapshot.sink_latency, 8_000);
                assert_eq!(snapshot.timestamp, 777);
            }
            other => panic!("expected a sink snapshot, got {:?}", other),
        }
    }

    #[test]
    fn test_unlink_flushes_pending_posts_once() {
        let mut h = harness(50);
        post(&h.data_tx, 1, 0);
        post(&h.data_tx, 1, 0);
        assert_eq!(h.output.unlink(), 2);
        assert_eq!(h.output.unlink(), 0);
        assert!(!h.output.is_linked());
    }
}
