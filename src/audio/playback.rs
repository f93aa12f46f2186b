//! Audio playback to output devices
//!
//! [`CpalSink::play`] pushes converted chunks into a lock-free queue that the
//! cpal output callback drains; when the queue runs dry the callback writes
//! silence.

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::StreamConfig;
use crossbeam::queue::ArrayQueue;
use crossbeam_channel::{bounded, Receiver};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::device::get_device_by_id;
use crate::audio::{i16_to_f32, AudioSink, PcmChunk, StreamFormat};
use crate::error::DeviceError;

/// Chunks allowed to queue in front of the device before the oldest audio is dropped
const MAX_QUEUED_CHUNKS: usize = 8;

/// Queue a chunk for the callback, displacing the oldest one when full.
/// Returns `true` if a chunk was displaced.
fn enqueue(queue: &ArrayQueue<Vec<f32>>, chunk: &PcmChunk) -> bool {
    if chunk.samples.is_empty() {
        return false;
    }
    let samples: Vec<f32> = chunk.samples.iter().copied().map(i16_to_f32).collect();
    queue.force_push(samples).is_some()
}

/// Callback-side read position: the chunk being played and a cursor into it
#[derive(Default)]
struct OutputFeed {
    current: Vec<f32>,
    cursor: usize,
}

impl OutputFeed {
    /// Fill `data` from the queue, padding with silence. Returns `true` if it ran dry.
    fn fill(&mut self, data: &mut [f32], queue: &ArrayQueue<Vec<f32>>) -> bool {
        let mut starved = false;
        for out in data.iter_mut() {
            if self.cursor == self.current.len() {
                match queue.pop() {
                    Some(next) => {
                        self.current = next;
                        self.cursor = 0;
                    }
                    None => {
                        starved = true;
                        *out = 0.0;
                        continue;
                    }
                }
            }
            *out = self.current[self.cursor];
            self.cursor += 1;
        }
        starved
    }
}

/// Playback collaborator backed by a cpal output device
pub struct CpalSink {
    format: StreamFormat,
    queue: Arc<ArrayQueue<Vec<f32>>>,
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
    error_rx: Receiver<DeviceError>,
    underruns: Arc<AtomicU64>,
    overflows: Arc<AtomicU64>,
}

impl CpalSink {
    /// Open `device_id` (or the default output) and start the output stream
    pub fn open(device_id: Option<&str>, format: StreamFormat) -> Result<Self, DeviceError> {
        let device = get_device_by_id(device_id, false)?;
        let device_name = device.name.clone();

        let config = StreamConfig {
            channels: format.channels,
            sample_rate: cpal::SampleRate(format.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let queue = Arc::new(ArrayQueue::<Vec<f32>>::new(MAX_QUEUED_CHUNKS));
        let (error_tx, error_rx) = bounded::<DeviceError>(16);
        let (ready_tx, ready_rx) = bounded::<Result<(), DeviceError>>(1);

        let running = Arc::new(AtomicBool::new(true));
        let running_for_loop = running.clone();
        let underruns = Arc::new(AtomicU64::new(0));
        let underruns_cb = underruns.clone();
        let queue_cb = queue.clone();

        let handle = thread::Builder::new()
            .name("audio-playback".to_string())
            .spawn(move || {
                let cpal_device = device.into_inner();

                let mut feed = OutputFeed::default();

                let stream = cpal_device.build_output_stream(
                    &config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        if feed.fill(data, &queue_cb) {
                            underruns_cb.fetch_add(1, Ordering::Relaxed);
                        }
                    },
                    move |err| {
                        let _ = error_tx.try_send(DeviceError::Stream(err.to_string()));
                    },
                    None,
                );

                let stream = match stream {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(DeviceError::Stream(e.to_string())));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(DeviceError::Stream(e.to_string())));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                while running_for_loop.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(10));
                }
            })
            .map_err(|e| DeviceError::Stream(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = handle.join();
                return Err(e);
            }
            Err(_) => return Err(DeviceError::Stream("playback thread exited".to_string())),
        }

        tracing::info!("Playing to {} ({})", device_name, format);

        Ok(Self {
            format,
            queue,
            running,
            thread_handle: Some(handle),
            error_rx,
            underruns,
            overflows: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Device callbacks that ran out of audio
    pub fn underruns(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }

    /// Chunks discarded because the device fell behind
    pub fn overflows(&self) -> u64 {
        self.overflows.load(Ordering::Relaxed)
    }

    /// Stop the output stream
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

impl AudioSink for CpalSink {
    fn play(&mut self, chunk: &PcmChunk) -> Result<(), DeviceError> {
        if let Ok(err) = self.error_rx.try_recv() {
            return Err(err);
        }
        if !chunk.matches(&self.format) {
            return Err(DeviceError::FormatMismatch {
                expected: format!("{} Hz/{} ch", self.format.sample_rate, self.format.channels),
                actual: format!("{} Hz/{} ch", chunk.sample_rate, chunk.channels),
            });
        }

        if enqueue(&self.queue, chunk) {
            self.overflows.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }
}

impl Drop for CpalSink {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(samples: &[i16]) -> PcmChunk {
        PcmChunk::new(48000, 1, samples.to_vec())
    }

    #[test]
    fn test_feed_spans_chunk_boundaries() {
        let queue = ArrayQueue::new(4);
        enqueue(&queue, &chunk(&[i16::MAX, 0, 0]));
        enqueue(&queue, &chunk(&[0, i16::MIN]));

        let mut feed = OutputFeed::default();
        let mut out = [1.0f32; 4];
        assert!(!feed.fill(&mut out, &queue));
        assert!((out[0] - 1.0).abs() < 1e-3);
        assert_eq!(&out[1..], &[0.0, 0.0, 0.0]);

        let mut out = [1.0f32; 3];
        assert!(feed.fill(&mut out, &queue));
        assert!((out[0] + 1.0).abs() < 1e-3);
        assert_eq!(&out[1..], &[0.0, 0.0]);
    }

    #[test]
    fn test_full_queue_drops_oldest_chunk() {
        let queue = ArrayQueue::new(2);
        assert!(!enqueue(&queue, &chunk(&[1])));
        assert!(!enqueue(&queue, &chunk(&[2])));
        assert!(enqueue(&queue, &chunk(&[3])));
        assert!(!enqueue(&queue, &chunk(&[])));

        let first = queue.pop().unwrap();
        assert_eq!(first, vec![i16_to_f32(2)]);
        assert_eq!(queue.len(), 1);
    }
}
