//! Session root: owns the socket, the peer set and every worker of one node

use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::audio::{AudioSink, AudioSource, JitterBufferStats};
use crate::config::AppConfig;
use crate::constants::INBOUND_QUEUE_CAPACITY;
use crate::error::{Result, SessionError, TransportError};
use crate::network::{
    ChatChannel, DiscoveryService, PeerRecord, PeerTable, PlaybackEngine, ReceiverState, Routes,
    SenderEngine, SenderState, Transport, TransportStats,
};
use crate::protocol::{ChatMessage, Role};

/// Events queued per subscriber before the slowest one starts lagging
const EVENT_CAPACITY: usize = 256;

/// Everything the UI layer needs to observe
#[derive(Debug, Clone)]
pub enum SessionEvent {
    PeerJoined(PeerRecord),
    PeerLeft(PeerRecord),
    Chat {
        from: SocketAddr,
        message: ChatMessage,
    },
    Streaming {
        state: SenderState,
        cause: Option<String>,
    },
    Playback {
        state: ReceiverState,
        cause: Option<String>,
    },
    /// The session is torn down; `cause` is set on a fatal transport error
    Stopped { cause: Option<String> },
}

enum Engine {
    Sender(SenderEngine),
    Receiver(PlaybackEngine),
}

/// One running node, either a sender or a receiver
pub struct StreamSession {
    role: Role,
    node_id: Uuid,
    transport: Transport,
    discovery: DiscoveryService,
    chat: ChatChannel,
    engine: Engine,
    events: broadcast::Sender<SessionEvent>,
    cancel: CancellationToken,
    stop_reported: Arc<AtomicBool>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl StreamSession {
    /// Bind the socket and start discovery and chat. The audio engine stays
    /// idle until `start_streaming` / `start_listening`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(role: Role, config: AppConfig) -> Result<Self> {
        config.validate()?;

        let node_id = Uuid::new_v4();
        let transport = Transport::bind(config.network.bind_addr)?;
        let peers = PeerTable::new(config.network.peer_timeout());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let cancel = CancellationToken::new();

        let (presence_tx, presence_rx) = mpsc::channel(INBOUND_QUEUE_CAPACITY);
        let (chat_tx, chat_rx) = mpsc::channel(INBOUND_QUEUE_CAPACITY);
        let mut routes = Routes::new().presence(presence_tx).chat(chat_tx);

        let engine = match role {
            Role::Sender => Engine::Sender(SenderEngine::new(
                transport.clone(),
                peers.clone(),
                config.stream,
                events.clone(),
                cancel.clone(),
            )),
            Role::Receiver => {
                let (audio_tx, audio_rx) = mpsc::channel(INBOUND_QUEUE_CAPACITY);
                routes = routes.audio(audio_tx);
                Engine::Receiver(PlaybackEngine::new(
                    config.stream,
                    config.playback,
                    audio_rx,
                    events.clone(),
                    cancel.clone(),
                ))
            }
        };

        let stop_reported = Arc::new(AtomicBool::new(false));
        let dispatch = transport.spawn_dispatch(routes, cancel.clone());
        let watcher = tokio::spawn(watch_dispatch(
            dispatch,
            cancel.clone(),
            events.clone(),
            stop_reported.clone(),
        ));

        let discovery = DiscoveryService::new(
            transport.clone(),
            peers.clone(),
            node_id,
            &config.network,
            presence_rx,
            events.clone(),
            cancel.child_token(),
        );
        discovery.start(role, &config.node.display_name);

        let chat = ChatChannel::new(
            transport.clone(),
            peers,
            node_id,
            role,
            &config.node.display_name,
            chat_rx,
            events.clone(),
            cancel.child_token(),
        );
        chat.start();

        tracing::info!(
            "{} session {} started on {}",
            role,
            node_id,
            transport.local_addr()
        );

        Ok(Self {
            role,
            node_id,
            transport,
            discovery,
            chat,
            engine,
            events,
            cancel,
            stop_reported,
            watcher: Mutex::new(Some(watcher)),
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn node_id(&self) -> Uuid {
        self.node_id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    /// Subscribe to session events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Currently live peers, sorted by address
    pub fn peers(&self) -> Vec<PeerRecord> {
        self.discovery.peers()
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    pub fn start_streaming(&self, source: Box<dyn AudioSource>) -> std::result::Result<(), SessionError> {
        self.sender()?.start_streaming(source)
    }

    pub async fn stop_streaming(&self) -> std::result::Result<(), SessionError> {
        self.sender()?.stop_streaming().await;
        Ok(())
    }

    pub fn start_listening(&self, sink: Box<dyn AudioSink>) -> std::result::Result<(), SessionError> {
        self.receiver()?.start_listening(sink)
    }

    pub async fn stop_listening(&self) -> std::result::Result<(), SessionError> {
        self.receiver()?.stop_listening().await;
        Ok(())
    }

    /// Send a chat line; returns the message as sent for local echo
    pub async fn send_chat(
        &self,
        text: &str,
        broadcast: bool,
    ) -> std::result::Result<ChatMessage, SessionError> {
        self.chat.send(text, broadcast).await
    }

    pub fn transport_stats(&self) -> TransportStats {
        self.transport.stats()
    }

    /// Jitter buffer counters; `None` for a sender
    pub fn playback_stats(&self) -> Option<JitterBufferStats> {
        match &self.engine {
            Engine::Receiver(engine) => Some(engine.stats()),
            Engine::Sender(_) => None,
        }
    }

    /// Tear down every worker and release the socket
    pub async fn stop(&self) {
        match &self.engine {
            Engine::Sender(engine) => engine.stop_streaming().await,
            Engine::Receiver(engine) => engine.stop_listening().await,
        }
        self.chat.stop().await;
        self.discovery.stop().await;
        self.cancel.cancel();

        let watcher = self.watcher.lock().take();
        if let Some(watcher) = watcher {
            let _ = watcher.await;
        }

        if !self.stop_reported.swap(true, Ordering::SeqCst) {
            tracing::info!("Session {} stopped", self.node_id);
            let _ = self.events.send(SessionEvent::Stopped { cause: None });
        }
    }

    fn sender(&self) -> std::result::Result<&SenderEngine, SessionError> {
        match &self.engine {
            Engine::Sender(engine) => Ok(engine),
            Engine::Receiver(_) => Err(SessionError::WrongRole {
                expected: Role::Sender,
                actual: self.role,
            }),
        }
    }

    fn receiver(&self) -> std::result::Result<&PlaybackEngine, SessionError> {
        match &self.engine {
            Engine::Receiver(engine) => Ok(engine),
            Engine::Sender(_) => Err(SessionError::WrongRole {
                expected: Role::Receiver,
                actual: self.role,
            }),
        }
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// A failed receive loop takes the whole session down with it
async fn watch_dispatch(
    dispatch: JoinHandle<std::result::Result<(), TransportError>>,
    cancel: CancellationToken,
    events: broadcast::Sender<SessionEvent>,
    stop_reported: Arc<AtomicBool>,
) {
    let cause = match dispatch.await {
        Ok(Ok(())) => return,
        Ok(Err(e)) => e.to_string(),
        Err(e) => format!("receive loop panicked: {}", e),
    };

    tracing::error!("Session stopping on fatal transport error: {}", cause);
    cancel.cancel();
    if !stop_reported.swap(true, Ordering::SeqCst) {
        let _ = events.send(SessionEvent::Stopped { cause: Some(cause) });
    }
}
