//! Latency-shaping FIFO between capture forwarding and render consumption
//!
//! The queue tracks absolute read and write positions in bytes. The write
//! position can be moved independently of the data (forward seeks leave
//! silence behind, backward seeks discard not-yet-played bytes), which is
//! what the output path uses to pad or trim the buffered latency.
//!
//! After the reader runs dry the queue re-enters a prebuffer phase and only
//! becomes readable again once `prebuf` bytes are buffered.

use std::collections::VecDeque;

use super::spec::SampleSpec;

/// Byte FIFO with silence padding, bounded rewind history and prebuffering
///
/// # Example
/// ```
/// use audioloop_core::audio::queue::AdjustmentQueue;
/// use audioloop_core::audio::spec::{SampleFormat, SampleSpec};
///
/// let spec = SampleSpec::new(SampleFormat::S16Le, 48000, 2);
/// let mut queue = AdjustmentQueue::new(&spec, 1 << 20);
/// queue.seek_relative(16);
/// queue.push(&[1, 2, 3, 4]);
/// assert_eq!(queue.length(), 20);
///
/// let mut out = [0xFFu8; 8];
/// assert_eq!(queue.read_into(&mut out), Some(8));
/// assert_eq!(out, [0; 8]); // padded silence comes out first
/// ```
#[derive(Debug)]
pub struct AdjustmentQueue {
    /// Bytes from `start` up to `write_index`, including rewind history
    buf: VecDeque<u8>,
    /// Absolute position of `buf[0]`
    start: i64,
    read_index: i64,
    write_index: i64,
    max_length: usize,
    prebuf: usize,
    in_prebuf: bool,
    max_rewind: usize,
    silence: u8,
}

impl AdjustmentQueue {
    /// Create an empty queue holding at most `max_length` unread bytes
    pub fn new(spec: &SampleSpec, max_length: usize) -> Self {
        Self {
            buf: VecDeque::new(),
            start: 0,
            read_index: 0,
            write_index: 0,
            max_length,
            prebuf: 0,
            in_prebuf: true,
            max_rewind: 0,
            silence: spec.silence_byte(),
        }
    }

    /// Unread bytes (zero when the write position is behind the reader)
    pub fn length(&self) -> usize {
        (self.write_index - self.read_index).max(0) as usize
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    pub fn prebuf(&self) -> usize {
        self.prebuf
    }

    pub fn max_rewind(&self) -> usize {
        self.max_rewind
    }

    pub fn is_empty(&self) -> bool {
        self.length() == 0
    }

    fn prebuf_active(&self) -> bool {
        if self.in_prebuf {
            self.length() < self.prebuf
        } else {
            self.prebuf > 0 && self.read_index >= self.write_index
        }
    }

    fn update_prebuf(&mut self) {
        if self.in_prebuf {
            if self.length() >= self.prebuf {
                self.in_prebuf = false;
            }
        } else if self.prebuf > 0 && self.read_index >= self.write_index {
            self.in_prebuf = true;
        }
    }

    /// Whether a reader would get data right now
    pub fn is_readable(&self) -> bool {
        !self.prebuf_active() && self.length() > 0
    }

    /// Append audio at the write position
    ///
    /// Returns false (and keeps nothing) when the data would push the queue
    /// beyond its maximum length.
    pub fn push(&mut self, data: &[u8]) -> bool {
        if self.length() + data.len() > self.max_length {
            tracing::trace!(
                bytes = data.len(),
                length = self.length(),
                "queue_full_push_dropped"
            );
            return false;
        }
        self.buf.extend(data.iter().copied());
        self.write_index += data.len() as i64;
        self.update_prebuf();
        true
    }

    /// Move the write position
    ///
    /// A forward move pads with silence (never beyond the maximum length), a
    /// backward move forgets the most recently written bytes.
    pub fn seek_relative(&mut self, offset: i64) {
        if offset >= 0 {
            let room = self.max_length.saturating_sub(self.length()) as i64;
            let offset = if self.write_index < self.read_index {
                // the part below the reader is never played and costs no room
                offset.min(self.read_index - self.write_index + room)
            } else {
                offset.min(room)
            };
            self.buf
                .extend(std::iter::repeat(self.silence).take(offset as usize));
            self.write_index += offset;
        } else {
            self.write_index += offset;
            if self.write_index <= self.start {
                self.buf.clear();
                self.start = self.write_index;
            } else {
                self.buf.truncate((self.write_index - self.start) as usize);
            }
        }
        self.update_prebuf();
    }

    /// Discard up to `nbytes` unread bytes from the front
    pub fn drop_front(&mut self, nbytes: usize) {
        let n = nbytes.min(self.length());
        self.read_index += n as i64;
        self.trim_history();
        self.update_prebuf();
    }

    /// Copy readable bytes into `dst` and consume them
    ///
    /// Returns `None` when the queue is empty or still prebuffering.
    pub fn read_into(&mut self, dst: &mut [u8]) -> Option<usize> {
        if !self.is_readable() {
            self.update_prebuf();
            return None;
        }
        let n = dst.len().min(self.length());
        let offset = (self.read_index - self.start) as usize;
        for (d, s) in dst.iter_mut().zip(self.buf.range(offset..offset + n)) {
            *d = *s;
        }
        self.drop_front(n);
        Some(n)
    }

    /// Move the read position back into already played history
    pub fn rewind(&mut self, nbytes: usize) -> usize {
        let history = (self.read_index - self.start).max(0) as usize;
        let n = nbytes.min(history);
        self.read_index -= n as i64;
        self.update_prebuf();
        n
    }

    pub fn set_prebuf(&mut self, bytes: usize) {
        self.prebuf = bytes.min(self.max_length);
        if self.prebuf == 0 || self.length() >= self.prebuf {
            self.in_prebuf = false;
        }
    }

    pub fn set_max_rewind(&mut self, bytes: usize) {
        self.max_rewind = bytes;
        self.trim_history();
    }

    /// Drop all unread audio and rewind history
    pub fn flush(&mut self) {
        self.buf.clear();
        self.read_index = self.write_index;
        self.start = self.write_index;
        self.in_prebuf = self.prebuf > 0;
    }

    fn trim_history(&mut self) {
        let keep_from = (self.read_index - self.max_rewind as i64).min(self.write_index);
        if keep_from > self.start {
            let n = ((keep_from - self.start) as usize).min(self.buf.len());
            self.buf.drain(..n);
            self.start += n as i64;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::spec::SampleFormat;

    fn spec() -> SampleSpec {
        SampleSpec::new(SampleFormat::S16Le, 48000, 2)
    }

    #[test]
    fn test_push_and_read_in_order() {
        let mut queue = AdjustmentQueue::new(&spec(), 1024);
        assert!(queue.push(&[1, 2, 3, 4]));
        assert!(queue.push(&[5, 6]));

        let mut out = [0u8; 4];
        assert_eq!(queue.read_into(&mut out), Some(4));
        assert_eq!(out, [1, 2, 3, 4]);
        assert_eq!(queue.length(), 2);
    }

    #[test]
    fn test_empty_queue_is_not_readable() {
        let mut queue = AdjustmentQueue::new(&spec(), 1024);
        let mut out = [0u8; 4];
        assert!(!queue.is_readable());
        assert_eq!(queue.read_into(&mut out), None);
    }

    #[test]
    fn test_push_beyond_max_length_is_rejected() {
        let mut queue = AdjustmentQueue::new(&spec(), 8);
        assert!(queue.push(&[0; 6]));
        assert!(!queue.push(&[0; 4]), "would exceed max length");
        assert_eq!(queue.length(), 6);
    }

    #[test]
    fn test_silence_seek_is_capped_by_max_length() {
        let mut queue = AdjustmentQueue::new(&spec(), 100);
        queue.seek_relative(500);
        assert_eq!(queue.length(), 100);
    }

    #[test]
    fn test_negative_seek_discards_newest_bytes() {
        let mut queue = AdjustmentQueue::new(&spec(), 1024);
        queue.push(&[1, 2, 3, 4, 5, 6, 7, 8]);
        queue.seek_relative(-4);
        assert_eq!(queue.length(), 4);
        queue.push(&[9, 9]);

        let mut out = [0u8; 6];
        assert_eq!(queue.read_into(&mut out), Some(6));
        assert_eq!(out, [1, 2, 3, 4, 9, 9]);
    }

    #[test]
    fn test_negative_seek_behind_reader_skips_stale_writes() {
        let mut queue = AdjustmentQueue::new(&spec(), 1024);
        queue.push(&[1, 2, 3, 4]);
        let mut out = [0u8; 4];
        queue.read_into(&mut out);

        queue.seek_relative(-4);
        assert_eq!(queue.length(), 0);
        // these bytes land below the read position and are never played
        queue.push(&[7, 7, 7, 7]);
        assert_eq!(queue.length(), 0);
        queue.push(&[8, 8]);
        assert_eq!(queue.length(), 2);
        let mut out = [0u8; 2];
        assert_eq!(queue.read_into(&mut out), Some(2));
        assert_eq!(out, [8, 8]);
    }

    #[test]
    fn test_drop_front_is_bounded_by_length() {
        let mut queue = AdjustmentQueue::new(&spec(), 1024);
        queue.push(&[0; 10]);
        queue.drop_front(100);
        assert_eq!(queue.length(), 0);
    }

    #[test]
    fn test_prebuf_after_underrun() {
        let mut queue = AdjustmentQueue::new(&spec(), 1024);
        queue.set_prebuf(8);
        queue.push(&[1; 4]);
        assert!(!queue.is_readable(), "still below prebuf");
        queue.push(&[2; 4]);
        assert!(queue.is_readable());

        let mut out = [0u8; 8];
        assert_eq!(queue.read_into(&mut out), Some(8));
        // ran dry, so prebuffering starts over
        queue.push(&[3; 4]);
        assert!(!queue.is_readable());
        queue.push(&[4; 4]);
        assert!(queue.is_readable());
    }

    #[test]
    fn test_rewind_is_limited_to_history() {
        let mut queue = AdjustmentQueue::new(&spec(), 1024);
        queue.set_max_rewind(4);
        queue.push(&[1, 2, 3, 4, 5, 6, 7, 8]);

        let mut out = [0u8; 8];
        queue.read_into(&mut out);
        assert_eq!(queue.rewind(100), 4, "only max_rewind bytes are kept");
        assert_eq!(queue.length(), 4);

        let mut out = [0u8; 4];
        queue.read_into(&mut out);
        assert_eq!(out, [5, 6, 7, 8]);
    }

    #[test]
    fn test_flush_empties_queue() {
        let mut queue = AdjustmentQueue::new(&spec(), 1024);
        queue.push(&[1; 16]);
        queue.flush();
        assert!(queue.is_empty());
        assert!(!queue.is_readable());
    }

    #[test]
    fn test_u8_silence_padding() {
        let spec = SampleSpec::new(SampleFormat::U8, 8000, 1);
        let mut queue = AdjustmentQueue::new(&spec, 64);
        queue.seek_relative(3);
        let mut out = [0u8; 3];
        queue.read_into(&mut out);
        assert_eq!(out, [0x80; 3]);
    }
}
