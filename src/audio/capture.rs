//! Audio capture from input devices
//!
//! The cpal stream lives on its own thread (streams are not `Send` on every
//! platform). Its callback forwards converted samples over a bounded channel
//! and [`CpalSource::capture`] regroups them into fixed-size chunks.

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::StreamConfig;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::audio::device::get_device_by_id;
use crate::audio::{f32_to_i16, AudioSource, PcmChunk, StreamFormat};
use crate::error::DeviceError;

/// How long `capture` waits for the device before declaring it stalled
const STALL_TIMEOUT: Duration = Duration::from_secs(1);

/// Callback buffers queued between the device and the sender engine
const CALLBACK_QUEUE: usize = 64;

/// Capture collaborator backed by a cpal input device
pub struct CpalSource {
    format: StreamFormat,
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
    samples_rx: Receiver<Vec<i16>>,
    error_rx: Receiver<DeviceError>,
    pending: Vec<i16>,
    dropped_buffers: Arc<AtomicU64>,
}

impl CpalSource {
    /// Open `device_id` (or the default input) and start capturing
    pub fn open(device_id: Option<&str>, format: StreamFormat) -> Result<Self, DeviceError> {
        let device = get_device_by_id(device_id, true)?;
        let device_name = device.name.clone();

        let config = StreamConfig {
            channels: format.channels,
            sample_rate: cpal::SampleRate(format.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let (samples_tx, samples_rx) = bounded::<Vec<i16>>(CALLBACK_QUEUE);
        let (error_tx, error_rx) = bounded::<DeviceError>(16);
        let (ready_tx, ready_rx) = bounded::<Result<(), DeviceError>>(1);

        let running = Arc::new(AtomicBool::new(true));
        let running_for_loop = running.clone();
        let dropped_buffers = Arc::new(AtomicU64::new(0));
        let dropped = dropped_buffers.clone();

        let handle = thread::Builder::new()
            .name("audio-capture".to_string())
            .spawn(move || {
                let cpal_device = device.into_inner();

                let stream = cpal_device.build_input_stream(
                    &config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        let samples: Vec<i16> = data.iter().copied().map(f32_to_i16).collect();
                        if samples_tx.try_send(samples).is_err() {
                            dropped.fetch_add(1, Ordering::Relaxed);
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

                // Keep thread alive while running
                while running_for_loop.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(10));
                }
                // Stream is dropped here, stopping capture
            })
            .map_err(|e| DeviceError::Stream(e.to_string()))?;

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = handle.join();
                return Err(e);
            }
            Err(_) => return Err(DeviceError::Stream("capture thread exited".to_string())),
        }

        tracing::info!("Capturing from {} ({})", device_name, format);

        Ok(Self {
            format,
            running,
            thread_handle: Some(handle),
            samples_rx,
            error_rx,
            pending: Vec::new(),
            dropped_buffers,
        })
    }

    /// Callback buffers dropped because the engine fell behind
    pub fn dropped_buffers(&self) -> u64 {
        self.dropped_buffers.load(Ordering::Relaxed)
    }

    /// Stop capturing audio
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

impl AudioSource for CpalSource {
    fn capture(&mut self) -> Result<PcmChunk, DeviceError> {
        let chunk_samples = self.format.chunk_frames as usize * self.format.channels as usize;

        while self.pending.len() < chunk_samples {
            if let Ok(err) = self.error_rx.try_recv() {
                return Err(err);
            }
            match self.samples_rx.recv_timeout(STALL_TIMEOUT) {
                Ok(samples) => self.pending.extend_from_slice(&samples),
                Err(RecvTimeoutError::Timeout) => return Err(DeviceError::Stalled(STALL_TIMEOUT)),
                Err(RecvTimeoutError::Disconnected) => return Err(DeviceError::Disconnected),
            }
        }

        let samples: Vec<i16> = self.pending.drain(..chunk_samples).collect();
        Ok(PcmChunk::new(self.format.sample_rate, self.format.channels, samples))
    }
}

impl Drop for CpalSource {
    fn drop(&mut self) {
        self.stop();
    }
}
