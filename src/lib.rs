//! # LAN Audio Sync
//!
//! Live PCM audio distribution from one sender to many receivers on a LAN,
//! with automatic peer discovery and a side-channel text chat.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                              SENDER                                  │
//! │  ┌─────────────┐    ┌──────────────────┐    ┌──────────────────┐     │
//! │  │ AudioSource │───▶│  Capture worker  │───▶│  Fan-out task    │     │
//! │  │ (cpal/tone) │    │ chunk -> frames  │    │ one send / peer  │     │
//! │  └─────────────┘    └──────────────────┘    └────────┬─────────┘     │
//! │                                                      │ PeerTable     │
//! │  ┌──────────────────┐   ┌──────────────┐             │ addresses()   │
//! │  │ DiscoveryService │──▶│  PeerTable   │◀────────────┘               │
//! │  └────────┬─────────┘   └──────────────┘                             │
//! │           ▼                                                          │
//! │  ┌────────────────────────────────────────────────────────────────┐  │
//! │  │   Transport (network::udp) - one socket, PRESENCE|AUDIO|CHAT   │  │
//! │  └────────────────────────────────────────────────────────────────┘  │
//! └───────────────────────────────────┼──────────────────────────────────┘
//!                                     │ UDP over LAN
//!                                     ▼
//! ┌───────────────────────────────────┼──────────────────────────────────┐
//! │                              RECEIVER                                │
//! │  ┌────────────────────────────────────────────────────────────────┐  │
//! │  │   Transport dispatch loop - demux by kind tag                  │  │
//! │  └──────┬──────────────────────┬─────────────────────┬────────────┘  │
//! │         ▼ PRESENCE             ▼ AUDIO               ▼ CHAT          │
//! │  ┌─────────────┐      ┌─────────────────┐     ┌─────────────┐        │
//! │  │  Discovery  │      │  Jitter Buffer  │     │ ChatChannel │        │
//! │  └─────────────┘      └────────┬────────┘     └─────────────┘        │
//! │                                ▼                                     │
//! │                       ┌─────────────────┐     ┌─────────────┐        │
//! │                       │ Playback worker │────▶│  AudioSink  │        │
//! │                       └─────────────────┘     └─────────────┘        │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod config;
pub mod error;
pub mod network;
pub mod protocol;
pub mod session;

pub use error::{Error, Result};
pub use session::{SessionEvent, StreamSession};

/// Application-wide constants
pub mod constants {
    /// Wire protocol version carried in every packet header
    pub const PROTOCOL_VERSION: u8 = 1;

    /// Default sample rate for audio processing
    pub const DEFAULT_SAMPLE_RATE: u32 = 48000;

    /// Default channel count (stereo)
    pub const DEFAULT_CHANNELS: u16 = 2;

    /// Default capture chunk size in frames (samples per channel)
    pub const DEFAULT_CHUNK_FRAMES: u32 = 512;

    /// Default UDP port shared by discovery, audio and chat
    pub const DEFAULT_UDP_PORT: u16 = 5000;

    /// Default presence broadcast interval in milliseconds
    pub const DEFAULT_PRESENCE_INTERVAL_MS: u64 = 1000;

    /// Peer liveness timeout as a multiple of the presence interval
    pub const PEER_TIMEOUT_FACTOR: u32 = 3;

    /// Largest PCM payload carried by a single AUDIO packet
    pub const MAX_AUDIO_PAYLOAD: usize = 1200;

    /// Maximum packet size for UDP
    pub const MAX_PACKET_SIZE: usize = 1472; // MTU - IP/UDP headers

    /// Display names are truncated to this many bytes on the wire
    pub const MAX_DISPLAY_NAME_BYTES: usize = 64;

    /// Chat text is truncated to this many bytes on the wire
    pub const MAX_CHAT_BYTES: usize = 1024;

    /// Frames that must be buffered before playback begins
    pub const DEFAULT_PREFILL_FRAMES: usize = 2;

    /// Playback cycles to wait for a missing frame before skipping it
    pub const DEFAULT_JITTER_TOLERANCE: u32 = 3;

    /// Frames older than this are evicted from the jitter buffer
    pub const DEFAULT_MAX_BUFFER_DELAY_MS: u64 = 200;

    /// Jitter buffer capacity (in frames)
    pub const DEFAULT_JITTER_CAPACITY: usize = 64;

    /// Capacity of the per-consumer inbound queues fed by the dispatch loop
    pub const INBOUND_QUEUE_CAPACITY: usize = 256;
}
