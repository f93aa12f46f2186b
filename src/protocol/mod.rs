//! Wire messages exchanged between nodes
//!
//! Every datagram carries exactly one [`Message`]. The three kinds share a
//! common header so a single socket can multiplex all traffic; see
//! [`wire`] for the byte layout.

pub mod wire;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::constants::{MAX_AUDIO_PAYLOAD, MAX_CHAT_BYTES, MAX_DISPLAY_NAME_BYTES, PROTOCOL_VERSION};
use crate::error::MalformedPacket;

pub use wire::{decode, encode};

/// Role a node plays in the stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Sender,
    Receiver,
}

impl Role {
    pub(crate) fn to_wire(self) -> u8 {
        match self {
            Role::Sender => 1,
            Role::Receiver => 2,
        }
    }

    pub(crate) fn from_wire(value: u8) -> Option<Self> {
        match value {
            1 => Some(Role::Sender),
            2 => Some(Role::Receiver),
            _ => None,
        }
    }

    /// The role this node streams to or from
    pub fn counterpart(self) -> Self {
        match self {
            Role::Sender => Role::Receiver,
            Role::Receiver => Role::Sender,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Sender => f.write_str("sender"),
            Role::Receiver => f.write_str("receiver"),
        }
    }
}

/// Periodic announcement of a node's identity and role
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Presence {
    pub node_id: Uuid,
    pub role: Role,
    pub display_name: String,
    pub protocol_version: u8,
    /// Set on unicast answers to another node's announcement. Replies are never answered.
    pub reply: bool,
}

impl Presence {
    pub fn new(node_id: Uuid, role: Role, display_name: &str) -> Self {
        Self {
            node_id,
            role,
            display_name: truncate_utf8(display_name, MAX_DISPLAY_NAME_BYTES).to_string(),
            protocol_version: PROTOCOL_VERSION,
            reply: false,
        }
    }

    /// The unicast answer to someone else's announcement
    pub fn as_reply(&self) -> Self {
        Self {
            reply: true,
            ..self.clone()
        }
    }
}

/// One sub-MTU block of interleaved little-endian i16 PCM
///
/// Immutable once built; the constructor enforces the payload bound so that
/// encoding never has to fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    session_id: u32,
    sequence: u32,
    timestamp_us: u64,
    sample_rate: u32,
    channels: u16,
    payload: Bytes,
}

impl AudioFrame {
    pub fn new(
        session_id: u32,
        sequence: u32,
        timestamp_us: u64,
        sample_rate: u32,
        channels: u16,
        payload: Bytes,
    ) -> Result<Self, MalformedPacket> {
        if sample_rate == 0 {
            return Err(MalformedPacket::InvalidField("sample_rate"));
        }
        if channels == 0 {
            return Err(MalformedPacket::InvalidField("channels"));
        }
        if payload.len() > MAX_AUDIO_PAYLOAD {
            return Err(MalformedPacket::PayloadTooLarge(payload.len()));
        }
        if payload.len() % (channels as usize * 2) != 0 {
            return Err(MalformedPacket::InvalidField("payload_len"));
        }

        Ok(Self {
            session_id,
            sequence,
            timestamp_us,
            sample_rate,
            channels,
            payload,
        })
    }

    /// Random identifier of the sender's streaming session
    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Capture time in microseconds since the session started
    pub fn timestamp_us(&self) -> u64 {
        self.timestamp_us
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Number of samples per channel
    pub fn frames(&self) -> usize {
        self.payload.len() / (self.channels as usize * 2)
    }
}

/// A side-channel text message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub sender_id: Uuid,
    pub sender_name: String,
    pub timestamp: DateTime<Utc>,
    pub text: String,
    pub broadcast: bool,
}

impl ChatMessage {
    pub fn new(sender_id: Uuid, sender_name: &str, text: &str, broadcast: bool) -> Self {
        Self {
            sender_id,
            sender_name: truncate_utf8(sender_name, MAX_DISPLAY_NAME_BYTES).to_string(),
            timestamp: Utc::now(),
            text: truncate_utf8(text, MAX_CHAT_BYTES).to_string(),
            broadcast,
        }
    }
}

/// Kind tag leading every packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Presence = 1,
    Audio = 2,
    Chat = 3,
}

impl MessageKind {
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(MessageKind::Presence),
            2 => Some(MessageKind::Audio),
            3 => Some(MessageKind::Chat),
            _ => None,
        }
    }
}

/// Any message that can travel over the shared socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Presence(Presence),
    Audio(AudioFrame),
    Chat(ChatMessage),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Presence(_) => MessageKind::Presence,
            Message::Audio(_) => MessageKind::Audio,
            Message::Chat(_) => MessageKind::Chat,
        }
    }
}

/// Cut `s` to at most `max` bytes without splitting a character
pub(crate) fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
