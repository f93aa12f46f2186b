//! Device-free sources and sinks
//!
//! Used for test tones from the command line and by the test suites.

use parking_lot::Mutex;
use std::f32::consts::TAU;
use std::sync::Arc;

use crate::audio::{f32_to_i16, AudioSink, AudioSource, PcmChunk, StreamFormat};
use crate::error::DeviceError;

/// Sine generator. Not real-time: the sender engine paces it.
pub struct ToneSource {
    format: StreamFormat,
    frequency: f32,
    amplitude: f32,
    phase: f32,
}

impl ToneSource {
    pub fn new(format: StreamFormat, frequency: f32) -> Self {
        Self {
            format,
            frequency,
            amplitude: 0.25,
            phase: 0.0,
        }
    }
}

impl AudioSource for ToneSource {
    fn capture(&mut self) -> Result<PcmChunk, DeviceError> {
        let channels = self.format.channels as usize;
        let step = TAU * self.frequency / self.format.sample_rate as f32;
        let mut samples = Vec::with_capacity(self.format.chunk_frames as usize * channels);

        for _ in 0..self.format.chunk_frames {
            let value = f32_to_i16(self.phase.sin() * self.amplitude);
            samples.extend(std::iter::repeat(value).take(channels));
            self.phase = (self.phase + step) % TAU;
        }

        Ok(PcmChunk::new(self.format.sample_rate, self.format.channels, samples))
    }

    fn is_realtime(&self) -> bool {
        false
    }
}

/// Sink that records every chunk it is handed
#[derive(Clone, Default)]
pub struct CollectingSink {
    played: Arc<Mutex<Vec<PcmChunk>>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything played so far
    pub fn played(&self) -> Vec<PcmChunk> {
        self.played.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.played.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.played.lock().is_empty()
    }
}

impl AudioSink for CollectingSink {
    fn play(&mut self, chunk: &PcmChunk) -> Result<(), DeviceError> {
        self.played.lock().push(chunk.clone());
        Ok(())
    }
}
