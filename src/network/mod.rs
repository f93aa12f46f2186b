//! Network subsystem: shared UDP transport and the engines built on it

pub mod chat;
pub mod discovery;
pub mod receiver;
pub mod sender;
pub mod udp;

pub use chat::ChatChannel;
pub use discovery::{DiscoveryService, PeerRecord, PeerTable};
pub use receiver::{PlaybackEngine, ReceiverState};
pub use sender::{SenderEngine, SenderState};
pub use udp::{Inbound, Routes, Transport, TransportStats};
