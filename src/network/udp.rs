//! UDP transport multiplexer
//!
//! One socket per node carries PRESENCE, AUDIO and CHAT. The dispatch loop
//! decodes each datagram once and hands it to the consumer registered for its
//! kind. Consumers are fed with `try_send` so a slow one never stalls the loop
//! or the others.

use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::TransportError;
use crate::protocol::{self, AudioFrame, ChatMessage, Message, Presence};

/// Receive buffer; larger than any packet we send so oversized foreign
/// datagrams are read whole and rejected by the decoder
const RECV_BUFFER_LEN: usize = 65_536;

/// Kernel socket buffer size requested for bursts of audio
const SOCKET_BUFFER_BYTES: usize = 1 << 20;

/// A decoded message together with where and when it arrived
#[derive(Debug, Clone)]
pub struct Inbound<T> {
    pub from: SocketAddr,
    pub received_at: Instant,
    pub message: T,
}

/// Per-kind consumers of the dispatch loop. Kinds without a consumer are dropped.
#[derive(Clone, Default)]
pub struct Routes {
    presence: Option<mpsc::Sender<Inbound<Presence>>>,
    audio: Option<mpsc::Sender<Inbound<AudioFrame>>>,
    chat: Option<mpsc::Sender<Inbound<ChatMessage>>>,
}

impl Routes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn presence(mut self, tx: mpsc::Sender<Inbound<Presence>>) -> Self {
        self.presence = Some(tx);
        self
    }

    pub fn audio(mut self, tx: mpsc::Sender<Inbound<AudioFrame>>) -> Self {
        self.audio = Some(tx);
        self
    }

    pub fn chat(mut self, tx: mpsc::Sender<Inbound<ChatMessage>>) -> Self {
        self.chat = Some(tx);
        self
    }

    fn dispatch(&self, from: SocketAddr, message: Message, counters: &Counters) {
        let received_at = Instant::now();
        let delivered = match message {
            Message::Presence(message) => forward(&self.presence, Inbound { from, received_at, message }),
            Message::Audio(message) => forward(&self.audio, Inbound { from, received_at, message }),
            Message::Chat(message) => forward(&self.chat, Inbound { from, received_at, message }),
        };
        if !delivered {
            counters.unrouted.fetch_add(1, Ordering::Relaxed);
        }
    }
}

fn forward<T>(route: &Option<mpsc::Sender<Inbound<T>>>, inbound: Inbound<T>) -> bool {
    let Some(tx) = route else {
        return false;
    };
    match tx.try_send(inbound) {
        Ok(()) => true,
        Err(TrySendError::Full(inbound)) => {
            tracing::trace!("Consumer queue full, dropping packet from {}", inbound.from);
            false
        }
        Err(TrySendError::Closed(_)) => false,
    }
}

#[derive(Default)]
struct Counters {
    packets_sent: AtomicU64,
    bytes_sent: AtomicU64,
    send_errors: AtomicU64,
    packets_received: AtomicU64,
    bytes_received: AtomicU64,
    malformed: AtomicU64,
    unrouted: AtomicU64,
}

/// Transport statistics
#[derive(Debug, Clone, Default)]
pub struct TransportStats {
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub send_errors: u64,
    pub packets_received: u64,
    pub bytes_received: u64,
    pub malformed: u64,
    pub unrouted: u64,
}

/// Create a non-blocking UDP socket with address reuse and broadcast enabled
pub fn create_socket(addr: SocketAddr) -> Result<std::net::UdpSocket, TransportError> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    if addr.is_ipv4() {
        socket.set_broadcast(true)?;
    }
    // Best effort; the kernel may clamp or refuse
    let _ = socket.set_recv_buffer_size(SOCKET_BUFFER_BYTES);
    let _ = socket.set_send_buffer_size(SOCKET_BUFFER_BYTES);
    socket.set_nonblocking(true)?;
    socket
        .bind(&addr.into())
        .map_err(|source| TransportError::Bind { addr, source })?;
    Ok(socket.into())
}

/// Shared handle to the node's socket
#[derive(Clone)]
pub struct Transport {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    counters: Arc<Counters>,
}

impl Transport {
    /// Bind the node socket. Must be called from within a Tokio runtime.
    pub fn bind(addr: SocketAddr) -> Result<Self, TransportError> {
        let socket = UdpSocket::from_std(create_socket(addr)?)?;
        let local_addr = socket.local_addr()?;
        tracing::info!("Transport bound to {}", local_addr);
        Ok(Self {
            socket: Arc::new(socket),
            local_addr,
            counters: Arc::new(Counters::default()),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Encode and send one message
    pub async fn send(&self, dest: SocketAddr, message: &Message) -> Result<(), TransportError> {
        self.send_bytes(dest, &protocol::encode(message)).await
    }

    /// Send an already encoded datagram, e.g. one frame fanned out to many peers
    pub async fn send_bytes(&self, dest: SocketAddr, bytes: &[u8]) -> Result<(), TransportError> {
        match self.socket.send_to(bytes, dest).await {
            Ok(sent) => {
                self.counters.packets_sent.fetch_add(1, Ordering::Relaxed);
                self.counters.bytes_sent.fetch_add(sent as u64, Ordering::Relaxed);
                Ok(())
            }
            Err(source) => {
                self.counters.send_errors.fetch_add(1, Ordering::Relaxed);
                Err(TransportError::Send { dest, source })
            }
        }
    }

    /// Run the receive loop until `cancel` fires or the socket itself fails
    pub fn spawn_dispatch(
        &self,
        routes: Routes,
        cancel: CancellationToken,
    ) -> JoinHandle<Result<(), TransportError>> {
        let socket = self.socket.clone();
        let counters = self.counters.clone();
        tokio::spawn(async move { dispatch_loop(socket, routes, counters, cancel).await })
    }

    pub fn stats(&self) -> TransportStats {
        let c = &self.counters;
        TransportStats {
            packets_sent: c.packets_sent.load(Ordering::Relaxed),
            bytes_sent: c.bytes_sent.load(Ordering::Relaxed),
            send_errors: c.send_errors.load(Ordering::Relaxed),
            packets_received: c.packets_received.load(Ordering::Relaxed),
            bytes_received: c.bytes_received.load(Ordering::Relaxed),
            malformed: c.malformed.load(Ordering::Relaxed),
            unrouted: c.unrouted.load(Ordering::Relaxed),
        }
    }
}

async fn dispatch_loop(
    socket: Arc<UdpSocket>,
    routes: Routes,
    counters: Arc<Counters>,
    cancel: CancellationToken,
) -> Result<(), TransportError> {
    let mut buf = vec![0u8; RECV_BUFFER_LEN];

    loop {
        let (len, from) = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            result = socket.recv_from(&mut buf) => match result {
                Ok(received) => received,
                Err(e) if is_transient(&e) => {
                    tracing::debug!("Transient receive error: {}", e);
                    continue;
                }
                Err(e) => {
                    tracing::error!("Receive loop failed: {}", e);
                    return Err(TransportError::Receive(e));
                }
            },
        };

        counters.packets_received.fetch_add(1, Ordering::Relaxed);
        counters.bytes_received.fetch_add(len as u64, Ordering::Relaxed);

        match protocol::decode(&buf[..len]) {
            Ok(message) => routes.dispatch(from, message, &counters),
            Err(e) => {
                counters.malformed.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Dropping malformed datagram from {}: {}", from, e);
            }
        }
    }
}

/// Errors a UDP socket reports on behalf of a remote party (e.g. ICMP
/// unreachable on Windows); the socket itself is still usable
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Role;
    use std::time::Duration;
    use uuid::Uuid;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[tokio::test]
    async fn test_malformed_datagram_is_dropped() {
        let transport = Transport::bind(loopback()).unwrap();
        let (chat_tx, mut chat_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let handle = transport.spawn_dispatch(Routes::new().chat(chat_tx), cancel.clone());

        let peer = Transport::bind(loopback()).unwrap();
        peer.send_bytes(transport.local_addr(), &[1, 2, 3]).await.unwrap();
        let chat = ChatMessage::new(Uuid::new_v4(), "peer", "still here", true);
        peer.send(transport.local_addr(), &Message::Chat(chat.clone()))
            .await
            .unwrap();

        let inbound = tokio::time::timeout(Duration::from_secs(2), chat_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(inbound.message.text, "still here");
        assert_eq!(inbound.from, peer.local_addr());
        assert_eq!(transport.stats().malformed, 1);

        cancel.cancel();
        assert!(handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_unrouted_kind_is_counted() {
        let transport = Transport::bind(loopback()).unwrap();
        let (presence_tx, mut presence_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let _handle = transport.spawn_dispatch(Routes::new().presence(presence_tx), cancel.clone());

        let peer = Transport::bind(loopback()).unwrap();
        let chat = ChatMessage::new(Uuid::new_v4(), "peer", "nobody listens", false);
        peer.send(transport.local_addr(), &Message::Chat(chat)).await.unwrap();
        let presence = Presence::new(Uuid::new_v4(), Role::Receiver, "peer");
        peer.send(transport.local_addr(), &Message::Presence(presence))
            .await
            .unwrap();

        let inbound = tokio::time::timeout(Duration::from_secs(2), presence_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(inbound.message.display_name, "peer");
        assert_eq!(transport.stats().unrouted, 1);
        cancel.cancel();
    }

    #[tokio::test]
    async fn test_send_counts_bytes() {
        let transport = Transport::bind(loopback()).unwrap();
        let peer = Transport::bind(loopback()).unwrap();
        transport
            .send_bytes(peer.local_addr(), &[0u8; 10])
            .await
            .unwrap();
        let stats = transport.stats();
        assert_eq!(stats.packets_sent, 1);
        assert_eq!(stats.bytes_sent, 10);
    }
}
