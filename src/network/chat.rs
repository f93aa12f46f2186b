//! Text chat over the shared transport

use parking_lot::Mutex;
use std::time::Instant;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::SessionError;
use crate::network::discovery::PeerTable;
use crate::network::udp::{Inbound, Transport};
use crate::protocol::{self, ChatMessage, Message, Role};
use crate::session::SessionEvent;

/// Frames outgoing chat and forwards incoming chat to the event stream
pub struct ChatChannel {
    transport: Transport,
    peers: PeerTable,
    node_id: Uuid,
    role: Role,
    display_name: String,
    events: broadcast::Sender<SessionEvent>,
    chat_rx: Mutex<Option<mpsc::Receiver<Inbound<ChatMessage>>>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ChatChannel {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transport: Transport,
        peers: PeerTable,
        node_id: Uuid,
        role: Role,
        display_name: &str,
        chat_rx: mpsc::Receiver<Inbound<ChatMessage>>,
        events: broadcast::Sender<SessionEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            transport,
            peers,
            node_id,
            role,
            display_name: display_name.to_string(),
            events,
            chat_rx: Mutex::new(Some(chat_rx)),
            cancel,
            task: Mutex::new(None),
        }
    }

    /// Start delivering inbound chat. Returns `false` if already started.
    pub fn start(&self) -> bool {
        let Some(chat_rx) = self.chat_rx.lock().take() else {
            return false;
        };
        let relay = (self.role == Role::Sender).then(|| Relay {
            transport: self.transport.clone(),
            peers: self.peers.clone(),
        });
        *self.task.lock() = Some(tokio::spawn(inbound_loop(
            chat_rx,
            self.node_id,
            relay,
            self.events.clone(),
            self.cancel.clone(),
        )));
        true
    }

    /// Send `text` to every live peer, or only to our counterparts.
    /// Returns the message as sent for local echo.
    pub async fn send(&self, text: &str, broadcast: bool) -> Result<ChatMessage, SessionError> {
        if self.cancel.is_cancelled() {
            return Err(SessionError::Stopped);
        }

        let now = Instant::now();
        let targets: Vec<_> = if broadcast {
            self.peers.snapshot(now).into_iter().map(|p| p.address).collect()
        } else {
            self.peers.addresses(self.role.counterpart(), now)
        };
        if targets.is_empty() {
            return Err(SessionError::NoCounterpart);
        }

        let message = ChatMessage::new(self.node_id, &self.display_name, text, broadcast);
        let packet = protocol::encode(&Message::Chat(message.clone()));
        for target in targets {
            if let Err(e) = self.transport.send_bytes(target, &packet).await {
                tracing::warn!("Chat to {} failed: {}", target, e);
            }
        }
        Ok(message)
    }

    pub async fn stop(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

/// A sender passes chat addressed to it by one receiver on to the others
struct Relay {
    transport: Transport,
    peers: PeerTable,
}

impl Relay {
    async fn forward(&self, inbound: &Inbound<ChatMessage>) {
        let receivers = self.peers.addresses(Role::Receiver, Instant::now());
        if !receivers.contains(&inbound.from) {
            return;
        }
        let packet = protocol::encode(&Message::Chat(inbound.message.clone()));
        for target in receivers.into_iter().filter(|&addr| addr != inbound.from) {
            if let Err(e) = self.transport.send_bytes(target, &packet).await {
                tracing::warn!("Chat relay to {} failed: {}", target, e);
            }
        }
    }
}

async fn inbound_loop(
    mut chat_rx: mpsc::Receiver<Inbound<ChatMessage>>,
    node_id: Uuid,
    relay: Option<Relay>,
    events: broadcast::Sender<SessionEvent>,
    cancel: CancellationToken,
) {
    loop {
        let inbound = tokio::select! {
            _ = cancel.cancelled() => break,
            inbound = chat_rx.recv() => match inbound {
                Some(inbound) => inbound,
                None => break,
            },
        };
        if inbound.message.sender_id == node_id {
            continue;
        }
        tracing::debug!(
            "Chat from '{}' at {}: {} bytes",
            inbound.message.sender_name,
            inbound.from,
            inbound.message.text.len()
        );
        // Broadcast chat already went to every peer
        if let Some(relay) = relay.as_ref().filter(|_| !inbound.message.broadcast) {
            relay.forward(&inbound).await;
        }
        let _ = events.send(SessionEvent::Chat {
            from: inbound.from,
            message: inbound.message,
        });
    }
}
