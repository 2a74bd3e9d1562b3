//! Variable-ratio linear resampler for the render callback
//!
//! The loopback stream runs at the controller's corrected rate while the
//! playback device runs at the base rate. `ratio` is input frames consumed
//! per output frame (`stream_rate / base_rate`); it may change between
//! calls without clicks because the fractional position carries over.

use std::sync::atomic::{AtomicU64, Ordering};

/// Resampling ratio shared between the control thread and the render callback
///
/// Stored as `f64` bits so the callback never takes a lock.
#[derive(Debug)]
pub struct SharedRatio(AtomicU64);

impl SharedRatio {
    pub fn new(ratio: f64) -> Self {
        Self(AtomicU64::new(ratio.to_bits()))
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }

    pub fn set(&self, ratio: f64) {
        self.0.store(ratio.to_bits(), Ordering::Relaxed);
    }
}

/// Interleaved `f32` linear interpolator
#[derive(Debug, Clone)]
pub struct LinearResampler {
    channels: usize,
    /// Fractional position between `previous` and `current`, in `0.0..1.0`
    position: f64,
    previous: Vec<f32>,
    current: Vec<f32>,
}

impl LinearResampler {
    pub fn new(channels: usize) -> Self {
        let channels = channels.max(1);
        Self {
            channels,
            position: 0.0,
            previous: vec![0.0; channels],
            current: vec![0.0; channels],
        }
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Input frames [`LinearResampler::process`] consumes for `frames` output frames
    pub fn input_frames_needed(&self, frames: usize, ratio: f64) -> usize {
        (self.position + frames as f64 * ratio).floor() as usize
    }

    /// Fill `output` from `input`, both interleaved
    ///
    /// `input` should hold [`LinearResampler::input_frames_needed`] frames;
    /// if it runs short the last frame is held.
    pub fn process(&mut self, input: &[f32], output: &mut [f32], ratio: f64) {
        let channels = self.channels;
        let mut frames_in = input.chunks_exact(channels);

        for frame in output.chunks_exact_mut(channels) {
            let t = self.position as f32;
            for (ch, sample) in frame.iter_mut().enumerate() {
                let a = self.previous[ch];
                let b = self.current[ch];
                *sample = a + (b - a) * t;
            }

            self.position += ratio;
            while self.position >= 1.0 {
                self.position -= 1.0;
                self.previous.copy_from_slice(&self.current);
                if let Some(next) = frames_in.next() {
                    self.current.copy_from_slice(next);
                }
            }
        }
    }

    /// Forget interpolation history, e.g. after an underrun
    pub fn reset(&mut self) {
        self.position = 0.0;
        self.previous.fill(0.0);
        self.current.fill(0.0);
    }
}
