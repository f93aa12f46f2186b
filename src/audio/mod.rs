//! Audio subsystem module
//!
//! The engines only see the [`AudioSource`] and [`AudioSink`] traits; cpal
//! devices and the synthetic test sources plug in behind them.

pub mod buffer;
pub mod capture;
pub mod device;
pub mod playback;
pub mod synthetic;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::constants::{DEFAULT_CHANNELS, DEFAULT_CHUNK_FRAMES, DEFAULT_SAMPLE_RATE, MAX_AUDIO_PAYLOAD};
use crate::error::DeviceError;

pub use buffer::{JitterBuffer, JitterBufferEntry, JitterBufferStats, Playout};
pub use capture::CpalSource;
pub use device::{get_device_by_id, list_devices, AudioDevice, AudioDeviceInfo};
pub use playback::CpalSink;
pub use synthetic::{CollectingSink, ToneSource};

/// Bytes per i16 sample
pub const SAMPLE_BYTES: usize = 2;

/// Block of interleaved signed 16-bit PCM
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcmChunk {
    pub sample_rate: u32,
    pub channels: u16,
    pub samples: Vec<i16>,
}

impl PcmChunk {
    pub fn new(sample_rate: u32, channels: u16, samples: Vec<i16>) -> Self {
        Self {
            sample_rate,
            channels,
            samples,
        }
    }

    pub fn silence(format: &StreamFormat) -> Self {
        Self::new(
            format.sample_rate,
            format.channels,
            vec![0; format.chunk_frames as usize * format.channels as usize],
        )
    }

    /// Number of samples per channel
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }

    /// Playback duration of this chunk
    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.frames() as f64 / self.sample_rate.max(1) as f64)
    }

    pub fn to_le_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.samples.len() * SAMPLE_BYTES);
        for &sample in &self.samples {
            buf.put_i16_le(sample);
        }
        buf.freeze()
    }

    pub fn from_le_bytes(sample_rate: u32, channels: u16, bytes: &[u8]) -> Self {
        let samples = bytes
            .chunks_exact(SAMPLE_BYTES)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        Self::new(sample_rate, channels, samples)
    }

    /// Split into consecutive chunks of at most `max_frames` frames each
    pub fn split(&self, max_frames: usize) -> impl Iterator<Item = PcmChunk> + '_ {
        let step = max_frames.max(1) * self.channels.max(1) as usize;
        self.samples
            .chunks(step)
            .map(move |samples| PcmChunk::new(self.sample_rate, self.channels, samples.to_vec()))
    }

    pub fn matches(&self, format: &StreamFormat) -> bool {
        self.sample_rate == format.sample_rate && self.channels == format.channels
    }
}

/// Stream parameters agreed at session start
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamFormat {
    pub sample_rate: u32,
    pub channels: u16,
    /// Frames per capture cycle
    pub chunk_frames: u32,
}

impl Default for StreamFormat {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: DEFAULT_CHANNELS,
            chunk_frames: DEFAULT_CHUNK_FRAMES,
        }
    }
}

impl StreamFormat {
    pub fn bytes_per_frame(&self) -> usize {
        self.channels as usize * SAMPLE_BYTES
    }

    /// Frames carried by each AUDIO packet.
    ///
    /// A chunk whose payload would exceed [`MAX_AUDIO_PAYLOAD`] is divided into
    /// the fewest equal parts that fit.
    pub fn frames_per_packet(&self) -> usize {
        let max_frames = (MAX_AUDIO_PAYLOAD / self.bytes_per_frame().max(1)).max(1);
        let chunk = (self.chunk_frames as usize).max(1);
        let packets = chunk.div_ceil(max_frames);
        chunk.div_ceil(packets)
    }

    /// Nominal capture cycle period
    pub fn chunk_period(&self) -> Duration {
        Duration::from_secs_f64(self.chunk_frames as f64 / self.sample_rate.max(1) as f64)
    }

    /// Nominal playback cycle period (one AUDIO packet)
    pub fn packet_period(&self) -> Duration {
        Duration::from_secs_f64(self.frames_per_packet() as f64 / self.sample_rate.max(1) as f64)
    }

    pub fn validate(&self) -> Result<(), String> {
        if !(8_000..=192_000).contains(&self.sample_rate) {
            return Err(format!("sample rate {} out of range", self.sample_rate));
        }
        if !(1..=8).contains(&self.channels) {
            return Err(format!("channel count {} out of range", self.channels));
        }
        if self.chunk_frames == 0 {
            return Err("chunk size must be non-zero".to_string());
        }
        Ok(())
    }
}

impl std::fmt::Display for StreamFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} Hz, {} ch, {} frames/chunk", self.sample_rate, self.channels, self.chunk_frames)
    }
}

/// Capture collaborator: yields one chunk per call
pub trait AudioSource: Send + 'static {
    /// Block until the next chunk is available. Errors end the streaming session.
    fn capture(&mut self) -> Result<PcmChunk, DeviceError>;

    /// Whether `capture` itself waits for real time. Software sources return
    /// `false` and the sender engine paces them.
    fn is_realtime(&self) -> bool {
        true
    }
}

/// Playback collaborator: consumes one chunk per call
pub trait AudioSink: Send + 'static {
    fn play(&mut self, chunk: &PcmChunk) -> Result<(), DeviceError>;
}

/// Convert a normalized float sample to i16
pub fn f32_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

/// Convert an i16 sample to a normalized float
pub fn i16_to_f32(sample: i16) -> f32 {
    sample as f32 / 32768.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_format_splits_into_two_packets() {
        let format = StreamFormat::default();
        assert_eq!(format.frames_per_packet(), 256);
        assert!(format.frames_per_packet() * format.bytes_per_frame() <= MAX_AUDIO_PAYLOAD);
        assert_eq!(format.chunk_period().as_micros(), 10_666);
    }

    #[test]
    fn test_mono_chunk_fits_single_packet() {
        let format = StreamFormat {
            channels: 1,
            ..StreamFormat::default()
        };
        assert_eq!(format.frames_per_packet(), 512);
    }

    #[test]
    fn test_split_preserves_samples() {
        let chunk = PcmChunk::new(48000, 2, (0..1024).map(|s| s as i16).collect());
        let parts: Vec<_> = chunk.split(256).collect();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].frames(), 256);
        let joined: Vec<i16> = parts.iter().flat_map(|p| p.samples.clone()).collect();
        assert_eq!(joined, chunk.samples);
    }

    #[test]
    fn test_le_bytes_roundtrip() {
        let chunk = PcmChunk::new(44100, 1, vec![i16::MIN, -1, 0, 1, i16::MAX]);
        let bytes = chunk.to_le_bytes();
        assert_eq!(bytes.len(), 10);
        assert_eq!(PcmChunk::from_le_bytes(44100, 1, &bytes), chunk);
    }

    #[test]
    fn test_format_validation() {
        assert!(StreamFormat::default().validate().is_ok());
        let bad = StreamFormat {
            channels: 0,
            ..StreamFormat::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_sample_conversion_clamps() {
        assert_eq!(f32_to_i16(2.0), i16::MAX);
        assert_eq!(f32_to_i16(-2.0), -i16::MAX);
        assert!((i16_to_f32(16384) - 0.5).abs() < 1e-6);
    }
}
