//! Typed messages exchanged between the control, input and output threads
//!
//! Each direction has its own enum so a receiver can only ever see the
//! messages meant for it. All payloads are owned value snapshots.

/// Messages consumed by the output (sink) thread
#[derive(Debug, Clone, PartialEq)]
pub enum ToOutput {
    /// Captured audio forwarded from the input thread
    Post {
        chunk: Vec<u8>,
        /// Source latency at capture time (usec)
        source_latency: i64,
        /// Clock time of the capture push (usec)
        push_time: u64,
    },
    /// The source rewound this many bytes it had already forwarded
    Rewind(usize),
    /// Report queue and sink latency state to the control thread
    LatencySnapshot,
    /// The source was suspended; the next push must re-baseline latency
    SourceChanged,
    SetEffectiveSourceLatency(u64),
    UpdateMinLatency(u64),
    /// Resize the queue immediately against this source+sink latency (usec)
    FastAdjust(i64),
}

/// Messages consumed by the input (source) thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToInput {
    LatencySnapshot,
}

/// Messages consumed by the control thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToMain {
    SourceLatencyRangeChanged,
    SinkLatencyRangeChanged,
    /// The sink recovered from an underrun
    Underrun,
    SourceSnapshot(SourceSnapshot),
    SinkSnapshot(SinkSnapshot),
}

/// Input-side half of a latency snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceSnapshot {
    /// Bytes forwarded to the output thread so far
    pub send_counter: i64,
    /// Source device latency including its delay queue (usec)
    pub source_latency: i64,
    pub timestamp: u64,
}

/// Output-side half of a latency snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkSnapshot {
    /// Bytes received into the adjustment queue so far
    pub recv_counter: i64,
    pub queue_length: usize,
    /// Sink device latency including its render queue (usec)
    pub sink_latency: i64,
    pub timestamp: u64,
}

/// Both halves as last reported, consumed once per adjustment cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LatencySnapshot {
    pub source: SourceSnapshot,
    pub sink: SinkSnapshot,
}

impl LatencySnapshot {
    /// Bytes buffered between source and sink, including forwarded bytes
    /// that have not reached the queue yet
    pub fn buffered_bytes(&self) -> usize {
        let queued = self.sink.queue_length;
        let send = self.source.send_counter;
        let recv = self.sink.recv_counter;
        if recv <= send {
            queued + (send - recv) as usize
        } else {
            queued.saturating_sub((recv - send) as usize)
        }
    }

    /// How much later the source half was taken than the sink half (usec)
    pub fn skew(&self) -> i64 {
        self.source.timestamp as i64 - self.sink.timestamp as i64
    }
}

/// Device notifications delivered to the control thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEvent {
    SourceSuspended(bool),
    SinkSuspended(bool),
    SourceLatencyOffsetChanged(i64),
    SinkLatencyOffsetChanged(i64),
}
