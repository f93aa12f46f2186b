//! Sender stream engine
//!
//! A blocking capture worker turns each captured chunk into sequenced
//! [`AudioFrame`]s and hands them over a bounded queue to an async fan-out
//! task, which sends every frame independently to each live receiver.

use futures_util::future::join_all;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::audio::{AudioSource, StreamFormat};
use crate::error::{DeviceError, SessionError};
use crate::network::discovery::PeerTable;
use crate::network::udp::Transport;
use crate::protocol::{self, AudioFrame, Message, Role};
use crate::session::SessionEvent;

/// Frames queued between the capture worker and the fan-out task
const FRAME_QUEUE: usize = 32;

/// Log the first send failure to a peer and then every this many
const SEND_FAILURE_LOG_EVERY: u64 = 100;

/// Sender engine lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderState {
    Idle,
    Streaming,
    Stopped,
}

struct ActiveStream {
    cancel: CancellationToken,
    supervisor: JoinHandle<()>,
}

/// Captures, frames and fans out audio to every known receiver
pub struct SenderEngine {
    transport: Transport,
    peers: PeerTable,
    format: StreamFormat,
    events: broadcast::Sender<SessionEvent>,
    state: Arc<Mutex<SenderState>>,
    active: Mutex<Option<ActiveStream>>,
    cancel: CancellationToken,
}

impl SenderEngine {
    pub fn new(
        transport: Transport,
        peers: PeerTable,
        format: StreamFormat,
        events: broadcast::Sender<SessionEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            transport,
            peers,
            format,
            events,
            state: Arc::new(Mutex::new(SenderState::Idle)),
            active: Mutex::new(None),
            cancel,
        }
    }

    pub fn state(&self) -> SenderState {
        *self.state.lock()
    }

    pub fn format(&self) -> StreamFormat {
        self.format
    }

    /// Begin a new streaming session from `source`
    ///
    /// Every call starts a fresh session id with sequence numbers from zero.
    pub fn start_streaming(&self, source: Box<dyn AudioSource>) -> Result<(), SessionError> {
        if self.cancel.is_cancelled() {
            return Err(SessionError::Stopped);
        }
        let mut active = self.active.lock();
        if *self.state.lock() == SenderState::Streaming {
            return Err(SessionError::AlreadyRunning);
        }

        let session_id = Uuid::new_v4().as_u128() as u32;
        let cancel = self.cancel.child_token();
        let (frame_tx, frame_rx) = mpsc::channel(FRAME_QUEUE);

        // Published before the workers exist so a fast failure cannot be overwritten
        *self.state.lock() = SenderState::Streaming;
        let _ = self.events.send(SessionEvent::Streaming {
            state: SenderState::Streaming,
            cause: None,
        });
        tracing::info!("Streaming started (session {:08x}, {})", session_id, self.format);

        let format = self.format;
        let capture_cancel = cancel.clone();
        let capture = tokio::task::spawn_blocking(move || {
            capture_loop(source, format, session_id, frame_tx, capture_cancel)
        });

        let fanout = tokio::spawn(fanout_loop(
            self.transport.clone(),
            self.peers.clone(),
            frame_rx,
            cancel.clone(),
        ));

        let supervisor = tokio::spawn(supervise(
            capture,
            fanout,
            cancel.clone(),
            self.state.clone(),
            self.events.clone(),
        ));

        *active = Some(ActiveStream { cancel, supervisor });
        Ok(())
    }

    /// Stop streaming and release the capture source
    pub async fn stop_streaming(&self) {
        let active = self.active.lock().take();
        if let Some(active) = active {
            active.cancel.cancel();
            let _ = active.supervisor.await;
        }
    }
}

/// Wait for the capture worker to finish, then tear down the fan-out and
/// publish the final state
async fn supervise(
    capture: JoinHandle<Result<(), DeviceError>>,
    fanout: JoinHandle<()>,
    cancel: CancellationToken,
    state: Arc<Mutex<SenderState>>,
    events: broadcast::Sender<SessionEvent>,
) {
    let cause = match capture.await {
        Ok(Ok(())) => None,
        Ok(Err(e)) => {
            tracing::error!("Capture failed, stopping stream: {}", e);
            Some(e.to_string())
        }
        Err(e) => {
            tracing::error!("Capture worker panicked: {}", e);
            Some("capture worker panicked".to_string())
        }
    };

    cancel.cancel();
    let _ = fanout.await;

    *state.lock() = SenderState::Stopped;
    tracing::info!("Streaming stopped");
    let _ = events.send(SessionEvent::Streaming {
        state: SenderState::Stopped,
        cause,
    });
}

fn capture_loop(
    mut source: Box<dyn AudioSource>,
    format: StreamFormat,
    session_id: u32,
    frame_tx: mpsc::Sender<AudioFrame>,
    cancel: CancellationToken,
) -> Result<(), DeviceError> {
    let packet_frames = format.frames_per_packet();
    let paced = !source.is_realtime();
    let started = Instant::now();
    let mut deadline = started;
    let mut sequence: u32 = 0;
    let mut dropped: u64 = 0;

    while !cancel.is_cancelled() {
        let chunk = source.capture()?;
        if !chunk.matches(&format) {
            return Err(DeviceError::FormatMismatch {
                expected: format!("{} Hz/{} ch", format.sample_rate, format.channels),
                actual: format!("{} Hz/{} ch", chunk.sample_rate, chunk.channels),
            });
        }

        let timestamp_us = started.elapsed().as_micros() as u64;
        for part in chunk.split(packet_frames) {
            let frame = AudioFrame::new(
                session_id,
                sequence,
                timestamp_us,
                part.sample_rate,
                part.channels,
                part.to_le_bytes(),
            )
            .map_err(|e| DeviceError::UnsupportedFormat(e.to_string()))?;
            sequence = sequence.wrapping_add(1);

            match frame_tx.try_send(frame) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    dropped += 1;
                    if dropped % SEND_FAILURE_LOG_EVERY == 1 {
                        tracing::warn!("Fan-out falling behind, {} frames dropped", dropped);
                    }
                }
                Err(mpsc::error::TrySendError::Closed(_)) => return Ok(()),
            }
        }

        if paced {
            deadline += chunk.duration();
            let now = Instant::now();
            if deadline > now {
                std::thread::sleep(deadline - now);
            } else if now - deadline > format.chunk_period() * 4 {
                // Too far behind to catch up; restart the schedule
                deadline = now;
            }
        }
    }

    // `source` drops here, releasing the device
    Ok(())
}

async fn fanout_loop(
    transport: Transport,
    peers: PeerTable,
    mut frame_rx: mpsc::Receiver<AudioFrame>,
    cancel: CancellationToken,
) {
    let mut failures: HashMap<SocketAddr, u64> = HashMap::new();

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = frame_rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        // Fresh snapshot every frame so expired peers are never sent to
        let targets = peers.addresses(Role::Receiver, Instant::now());
        if targets.is_empty() {
            continue;
        }
        failures.retain(|addr, _| targets.contains(addr));

        let packet = protocol::encode(&Message::Audio(frame));
        let sends = targets.iter().map(|&dest| {
            let transport = &transport;
            let packet = &packet;
            async move { (dest, transport.send_bytes(dest, packet).await) }
        });

        for (dest, result) in join_all(sends).await {
            if let Err(e) = result {
                let count = failures.entry(dest).or_insert(0);
                *count += 1;
                if *count % SEND_FAILURE_LOG_EVERY == 1 {
                    tracing::warn!("Audio send to {} failed ({} so far): {}", dest, count, e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{PcmChunk, ToneSource};
    use crate::protocol::Presence;
    use std::time::Duration;
    use tokio::net::UdpSocket;

    struct FailingSource {
        remaining: usize,
        format: StreamFormat,
    }

    impl AudioSource for FailingSource {
        fn capture(&mut self) -> Result<PcmChunk, DeviceError> {
            if self.remaining == 0 {
                return Err(DeviceError::Disconnected);
            }
            self.remaining -= 1;
            Ok(PcmChunk::silence(&self.format))
        }

        fn is_realtime(&self) -> bool {
            false
        }
    }

    fn engine(peers: PeerTable) -> (SenderEngine, broadcast::Receiver<SessionEvent>) {
        let transport = Transport::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let (events, rx) = broadcast::channel(64);
        let engine = SenderEngine::new(
            transport,
            peers,
            StreamFormat::default(),
            events,
            CancellationToken::new(),
        );
        (engine, rx)
    }

    #[tokio::test]
    async fn test_frames_reach_each_receiver_in_sequence() {
        let peers = PeerTable::new(Duration::from_secs(5));
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        for socket in [&a, &b] {
            let presence = Presence::new(Uuid::new_v4(), Role::Receiver, "rx");
            peers.upsert(socket.local_addr().unwrap(), &presence, Instant::now());
        }

        let (engine, _events) = engine(peers);
        engine
            .start_streaming(Box::new(ToneSource::new(StreamFormat::default(), 440.0)))
            .unwrap();
        assert_eq!(engine.state(), SenderState::Streaming);
        assert_eq!(
            engine.start_streaming(Box::new(ToneSource::new(StreamFormat::default(), 440.0))),
            Err(SessionError::AlreadyRunning)
        );

        for socket in [&a, &b] {
            let mut buf = [0u8; 2048];
            let mut sequences = Vec::new();
            while sequences.len() < 4 {
                let (len, _) = tokio::time::timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
                    .await
                    .unwrap()
                    .unwrap();
                match protocol::decode(&buf[..len]).unwrap() {
                    Message::Audio(frame) => {
                        assert_eq!(frame.frames(), 256);
                        sequences.push(frame.sequence());
                    }
                    other => panic!("unexpected message: {:?}", other),
                }
            }
            assert_eq!(sequences, vec![0, 1, 2, 3]);
        }

        engine.stop_streaming().await;
        assert_eq!(engine.state(), SenderState::Stopped);
    }

    #[tokio::test]
    async fn test_device_error_stops_with_cause() {
        let (engine, mut events) = engine(PeerTable::new(Duration::from_secs(5)));
        engine
            .start_streaming(Box::new(FailingSource {
                remaining: 3,
                format: StreamFormat::default(),
            }))
            .unwrap();

        let cause = loop {
            let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
                .await
                .unwrap()
                .unwrap();
            if let SessionEvent::Streaming {
                state: SenderState::Stopped,
                cause,
            } = event
            {
                break cause;
            }
        };
        assert!(cause.unwrap().contains("disconnected"));
        assert_eq!(engine.state(), SenderState::Stopped);

        // A stopped engine may start a new session
        engine
            .start_streaming(Box::new(ToneSource::new(StreamFormat::default(), 220.0)))
            .unwrap();
        engine.stop_streaming().await;
    }

    #[test]
    fn test_tone_pacing_matches_real_time() {
        let format = StreamFormat::default();
        let (tx, mut rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        let stopper = cancel.clone();

        let started = Instant::now();
        let worker = std::thread::spawn(move || {
            capture_loop(Box::new(ToneSource::new(format, 440.0)), format, 9, tx, cancel)
        });

        let mut frames = 0usize;
        while frames < 20 {
            if let Some(frame) = rx.blocking_recv() {
                frames += 1;
                assert_eq!(frame.session_id(), 9);
            }
        }
        stopper.cancel();
        worker.join().unwrap().unwrap();

        // 20 packets of 256 frames; the last chunk may still be in its sleep window
        let nominal = Duration::from_secs_f64(18.0 * 256.0 / format.sample_rate as f64);
        assert!(started.elapsed() >= nominal, "ran ahead of real time: {:?}", started.elapsed());
    }
}
