//! Receiver playback engine
//!
//! Two workers share the jitter buffer: an async task inserting frames as the
//! dispatch loop delivers them, and a blocking playback worker that pops one
//! decision per cycle and feeds the sink at the stream's real-time rate.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::audio::buffer::InsertOutcome;
use crate::audio::{AudioSink, JitterBuffer, JitterBufferStats, Playout, StreamFormat};
use crate::config::PlaybackConfig;
use crate::error::{DeviceError, SessionError};
use crate::network::udp::Inbound;
use crate::protocol::AudioFrame;
use crate::session::SessionEvent;

/// Consecutive sink failures after which the device is considered gone
const MAX_CONSECUTIVE_PLAY_FAILURES: u32 = 100;

/// Longest uninterrupted sleep of the playback worker
const SLEEP_SLICE: Duration = Duration::from_millis(5);

/// Receiver engine lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverState {
    Idle,
    Listening,
    Stopped,
}

struct ActiveListen {
    cancel: CancellationToken,
    supervisor: JoinHandle<()>,
}

/// Reorders incoming frames and plays them out in sequence
pub struct PlaybackEngine {
    format: StreamFormat,
    buffer: Arc<Mutex<JitterBuffer>>,
    audio_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Inbound<AudioFrame>>>>,
    events: broadcast::Sender<SessionEvent>,
    state: Arc<Mutex<ReceiverState>>,
    active: Mutex<Option<ActiveListen>>,
    cancel: CancellationToken,
}

impl PlaybackEngine {
    pub fn new(
        format: StreamFormat,
        config: PlaybackConfig,
        audio_rx: mpsc::Receiver<Inbound<AudioFrame>>,
        events: broadcast::Sender<SessionEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            format,
            buffer: Arc::new(Mutex::new(JitterBuffer::new(config).with_format(format))),
            audio_rx: Arc::new(tokio::sync::Mutex::new(audio_rx)),
            events,
            state: Arc::new(Mutex::new(ReceiverState::Idle)),
            active: Mutex::new(None),
            cancel,
        }
    }

    pub fn state(&self) -> ReceiverState {
        *self.state.lock()
    }

    pub fn stats(&self) -> JitterBufferStats {
        self.buffer.lock().stats()
    }

    /// Start accepting frames and playing them to `sink`
    pub fn start_listening(&self, sink: Box<dyn AudioSink>) -> Result<(), SessionError> {
        if self.cancel.is_cancelled() {
            return Err(SessionError::Stopped);
        }
        let mut active = self.active.lock();
        if *self.state.lock() == ReceiverState::Listening {
            return Err(SessionError::AlreadyRunning);
        }

        // Nothing from a previous listen carries over
        self.buffer.lock().reset();

        *self.state.lock() = ReceiverState::Listening;
        let _ = self.events.send(SessionEvent::Playback {
            state: ReceiverState::Listening,
            cause: None,
        });
        tracing::info!("Listening for audio ({})", self.format);

        let cancel = self.cancel.child_token();
        let inserter = tokio::spawn(insert_loop(
            self.audio_rx.clone(),
            self.buffer.clone(),
            cancel.clone(),
        ));

        let buffer = self.buffer.clone();
        let period = self.format.packet_period();
        let playback_cancel = cancel.clone();
        let playback = tokio::task::spawn_blocking(move || {
            playback_loop(sink, buffer, period, playback_cancel)
        });

        let supervisor = tokio::spawn(supervise(
            playback,
            inserter,
            cancel.clone(),
            self.state.clone(),
            self.events.clone(),
        ));

        *active = Some(ActiveListen { cancel, supervisor });
        Ok(())
    }

    /// Stop playback and release the sink
    pub async fn stop_listening(&self) {
        let active = self.active.lock().take();
        if let Some(active) = active {
            active.cancel.cancel();
            let _ = active.supervisor.await;
        }
    }
}

async fn supervise(
    playback: JoinHandle<Result<(), DeviceError>>,
    inserter: JoinHandle<()>,
    cancel: CancellationToken,
    state: Arc<Mutex<ReceiverState>>,
    events: broadcast::Sender<SessionEvent>,
) {
    let cause = match playback.await {
        Ok(Ok(())) => None,
        Ok(Err(e)) => {
            tracing::error!("Playback failed, stopping: {}", e);
            Some(e.to_string())
        }
        Err(e) => {
            tracing::error!("Playback worker panicked: {}", e);
            Some("playback worker panicked".to_string())
        }
    };

    cancel.cancel();
    let _ = inserter.await;

    *state.lock() = ReceiverState::Stopped;
    tracing::info!("Playback stopped");
    let _ = events.send(SessionEvent::Playback {
        state: ReceiverState::Stopped,
        cause,
    });
}

async fn insert_loop(
    audio_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Inbound<AudioFrame>>>>,
    buffer: Arc<Mutex<JitterBuffer>>,
    cancel: CancellationToken,
) {
    let mut audio_rx = audio_rx.lock().await;

    loop {
        let inbound = tokio::select! {
            _ = cancel.cancelled() => break,
            inbound = audio_rx.recv() => match inbound {
                Some(inbound) => inbound,
                None => break,
            },
        };

        let outcome = buffer.lock().insert(&inbound.message, inbound.received_at);
        match outcome {
            InsertOutcome::NewSession => tracing::info!(
                "New stream session {:08x} from {}",
                inbound.message.session_id(),
                inbound.from
            ),
            InsertOutcome::Late => tracing::trace!(
                "Discarding late frame {} from {}",
                inbound.message.sequence(),
                inbound.from
            ),
            InsertOutcome::Rejected => tracing::debug!(
                "Rejecting {} Hz/{} ch frame from {}",
                inbound.message.sample_rate(),
                inbound.message.channels(),
                inbound.from
            ),
            InsertOutcome::Duplicate | InsertOutcome::Buffered => {}
        }
    }
}

fn playback_loop(
    mut sink: Box<dyn AudioSink>,
    buffer: Arc<Mutex<JitterBuffer>>,
    nominal_period: Duration,
    cancel: CancellationToken,
) -> Result<(), DeviceError> {
    let mut deadline = Instant::now();
    let mut consecutive_failures: u32 = 0;

    while !cancel.is_cancelled() {
        // Lock only for the decision, never across the sink call
        let decision = buffer.lock().pop(Instant::now());

        let period = match decision {
            Playout::Play(entry) => {
                match sink.play(&entry.chunk) {
                    Ok(()) => consecutive_failures = 0,
                    Err(e) => {
                        consecutive_failures += 1;
                        if consecutive_failures >= MAX_CONSECUTIVE_PLAY_FAILURES {
                            return Err(e);
                        }
                        if consecutive_failures == 1 {
                            tracing::warn!("Playback of frame {} failed: {}", entry.sequence, e);
                        }
                    }
                }
                entry.chunk.duration().min(nominal_period)
            }
            Playout::Buffering | Playout::Waiting { .. } | Playout::Empty => nominal_period,
        };

        deadline += period;
        let now = Instant::now();
        if deadline > now {
            sleep_until(deadline, &cancel);
        } else if now - deadline > nominal_period * 4 {
            // Stalled (e.g. a slow sink); resynchronize instead of bursting
            deadline = now;
        }
    }

    // `sink` drops here, releasing the device
    Ok(())
}

fn sleep_until(deadline: Instant, cancel: &CancellationToken) {
    loop {
        let now = Instant::now();
        if now >= deadline || cancel.is_cancelled() {
            return;
        }
        std::thread::sleep((deadline - now).min(SLEEP_SLICE));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{CollectingSink, PcmChunk};
    use std::net::SocketAddr;

    struct BrokenSink;

    impl AudioSink for BrokenSink {
        fn play(&mut self, _chunk: &PcmChunk) -> Result<(), DeviceError> {
            Err(DeviceError::Disconnected)
        }
    }

    fn inbound(session: u32, sequence: u32) -> Inbound<AudioFrame> {
        let samples = vec![sequence as i16; 2 * 256];
        let chunk = PcmChunk::new(48000, 2, samples);
        let frame = AudioFrame::new(session, sequence, 0, 48000, 2, chunk.to_le_bytes()).unwrap();
        Inbound {
            from: SocketAddr::from(([127, 0, 0, 1], 5000)),
            received_at: Instant::now(),
            message: frame,
        }
    }

    fn engine(
        config: PlaybackConfig,
    ) -> (PlaybackEngine, mpsc::Sender<Inbound<AudioFrame>>, broadcast::Receiver<SessionEvent>) {
        let (tx, rx) = mpsc::channel(64);
        let (events, events_rx) = broadcast::channel(64);
        let engine = PlaybackEngine::new(
            StreamFormat::default(),
            config,
            rx,
            events,
            CancellationToken::new(),
        );
        (engine, tx, events_rx)
    }

    async fn wait_for(sink: &CollectingSink, n: usize) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while sink.len() < n && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_reordered_frames_play_in_sequence() {
        let (engine, tx, _events) = engine(PlaybackConfig {
            prefill_frames: 4,
            ..PlaybackConfig::default()
        });
        let sink = CollectingSink::new();
        engine.start_listening(Box::new(sink.clone())).unwrap();
        assert_eq!(engine.state(), ReceiverState::Listening);

        for sequence in [1, 0, 3, 2, 5, 4] {
            tx.send(inbound(1, sequence)).await.unwrap();
        }
        wait_for(&sink, 6).await;

        let played: Vec<i16> = sink.played().iter().map(|c| c.samples[0]).collect();
        assert_eq!(played, vec![0, 1, 2, 3, 4, 5]);

        engine.stop_listening().await;
        assert_eq!(engine.state(), ReceiverState::Stopped);
        assert_eq!(engine.stats().played, 6);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_gap_is_skipped() {
        let (engine, tx, _events) = engine(PlaybackConfig {
            prefill_frames: 1,
            jitter_tolerance: 2,
            ..PlaybackConfig::default()
        });
        let sink = CollectingSink::new();
        engine.start_listening(Box::new(sink.clone())).unwrap();

        for sequence in [0, 1, 3, 4] {
            tx.send(inbound(1, sequence)).await.unwrap();
        }
        wait_for(&sink, 4).await;

        let played: Vec<i16> = sink.played().iter().map(|c| c.samples[0]).collect();
        assert_eq!(played, vec![0, 1, 3, 4]);
        assert_eq!(engine.stats().lost, 1);
        engine.stop_listening().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_foreign_format_frame_does_not_delay_stop() {
        let (engine, tx, _events) = engine(PlaybackConfig {
            prefill_frames: 1,
            ..PlaybackConfig::default()
        });
        let sink = CollectingSink::new();
        engine.start_listening(Box::new(sink.clone())).unwrap();

        // 600 frames at 1 Hz would be ten minutes of audio
        let foreign = AudioFrame::new(1, 0, 0, 1, 1, vec![0u8; 1200].into()).unwrap();
        tx.send(Inbound {
            from: SocketAddr::from(([127, 0, 0, 1], 5000)),
            received_at: Instant::now(),
            message: foreign,
        })
        .await
        .unwrap();
        tx.send(inbound(2, 0)).await.unwrap();
        wait_for(&sink, 1).await;

        let started = Instant::now();
        tokio::time::timeout(Duration::from_secs(1), engine.stop_listening())
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_millis(500));

        let stats = engine.stats();
        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.played, 1);
        assert!(sink.played().iter().all(|c| c.sample_rate == 48000));
    }

    #[test]
    fn test_sleep_until_honors_cancel() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let started = Instant::now();
        sleep_until(started + Duration::from_secs(60), &cancel);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_broken_sink_stops_with_cause() {
        let (engine, tx, mut events) = engine(PlaybackConfig {
            prefill_frames: 1,
            ..PlaybackConfig::default()
        });
        engine.start_listening(Box::new(BrokenSink)).unwrap();

        // Keep frames coming so every cycle reaches the sink
        let feeder = tokio::spawn(async move {
            for sequence in 0..1000 {
                if tx.send(inbound(1, sequence)).await.is_err() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        });

        let cause = loop {
            let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
                .await
                .unwrap()
                .unwrap();
            if let SessionEvent::Playback {
                state: ReceiverState::Stopped,
                cause,
            } = event
            {
                break cause;
            }
        };
        assert!(cause.is_some());
        feeder.abort();
        engine.stop_listening().await;
    }
}
