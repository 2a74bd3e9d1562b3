//! Stream sample format and byte/time conversions

use serde::{Deserialize, Serialize};

use crate::{MAX_SAMPLE_RATE, MIN_SAMPLE_RATE, USEC_PER_SEC};

/// Sample encoding of the bytes carried through the loopback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleFormat {
    U8,
    S16Le,
    S32Le,
    F32Le,
}

impl SampleFormat {
    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleFormat::U8 => 1,
            SampleFormat::S16Le => 2,
            SampleFormat::S32Le | SampleFormat::F32Le => 4,
        }
    }
}

/// Format, rate and channel count of a stream
///
/// Conversions between bytes and microseconds always work on whole frames
/// and truncate, so a partial frame never counts as latency.
///
/// # Example
/// ```
/// use audioloop_core::audio::spec::{SampleFormat, SampleSpec};
///
/// let spec = SampleSpec::new(SampleFormat::S16Le, 48000, 2);
/// assert_eq!(spec.frame_size(), 4);
/// assert_eq!(spec.usec_to_bytes(10_000), 1920);
/// assert_eq!(spec.bytes_to_usec(1920), 10_000);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleSpec {
    pub format: SampleFormat,
    pub rate: u32,
    pub channels: u16,
}

impl SampleSpec {
    pub const fn new(format: SampleFormat, rate: u32, channels: u16) -> Self {
        Self {
            format,
            rate,
            channels,
        }
    }

    /// Bytes per frame (one sample for every channel)
    pub fn frame_size(&self) -> usize {
        self.format.bytes_per_sample() * self.channels as usize
    }

    pub fn bytes_to_usec(&self, bytes: usize) -> u64 {
        let frames = (bytes / self.frame_size()) as u64;
        frames * USEC_PER_SEC / self.rate as u64
    }

    pub fn usec_to_bytes(&self, usec: u64) -> usize {
        let frames = usec * self.rate as u64 / USEC_PER_SEC;
        frames as usize * self.frame_size()
    }

    /// Byte value that decodes to silence
    pub fn silence_byte(&self) -> u8 {
        match self.format {
            SampleFormat::U8 => 0x80,
            _ => 0,
        }
    }

    /// Same spec running at a different rate
    pub fn with_rate(self, rate: u32) -> Self {
        Self { rate, ..self }
    }

    pub fn is_valid(&self) -> bool {
        (MIN_SAMPLE_RATE..=MAX_SAMPLE_RATE).contains(&self.rate) && self.channels >= 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_frames_are_truncated() {
        let spec = SampleSpec::new(SampleFormat::S16Le, 44100, 2);
        // 3 bytes is less than one 4-byte frame
        assert_eq!(spec.bytes_to_usec(3), 0);
        // 1ms at 44.1kHz is 44.1 frames, truncated to 44
        assert_eq!(spec.usec_to_bytes(1_000), 44 * 4);
    }

    #[test]
    fn test_silence_byte() {
        assert_eq!(SampleSpec::new(SampleFormat::U8, 8000, 1).silence_byte(), 0x80);
        assert_eq!(SampleSpec::new(SampleFormat::F32Le, 48000, 2).silence_byte(), 0);
    }

    #[test]
    fn test_validity_bounds() {
        assert!(SampleSpec::new(SampleFormat::S16Le, 4000, 1).is_valid());
        assert!(SampleSpec::new(SampleFormat::S16Le, 384000, 8).is_valid());
        assert!(!SampleSpec::new(SampleFormat::S16Le, 3999, 1).is_valid());
        assert!(!SampleSpec::new(SampleFormat::S16Le, 48000, 0).is_valid());
    }
}
