//! Byte layout of the three message kinds
//!
//! All integers are big-endian.
//!
//! ```text
//! header   : magic "LA" (2) | version (1) | kind (1)
//! PRESENCE : node_id (16) | role (1) | flags (1) | name_len (1) | name
//! AUDIO    : session_id (4) | sequence (4) | timestamp_us (8)
//!            | sample_rate (4) | channels (2) | payload_len (2) | payload
//! CHAT     : sender_id (16) | timestamp_ms (8) | flags (1)
//!            | name_len (1) | name | text_len (2) | text
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::DateTime;
use uuid::Uuid;

use super::{truncate_utf8, AudioFrame, ChatMessage, Message, MessageKind, Presence, Role};
use crate::constants::{MAX_CHAT_BYTES, MAX_DISPLAY_NAME_BYTES, PROTOCOL_VERSION};
use crate::error::MalformedPacket;

const MAGIC: [u8; 2] = *b"LA";

/// Common header length (magic + version + kind)
pub const HEADER_LEN: usize = 4;

/// Fixed part of an AUDIO packet that precedes the payload
pub const AUDIO_HEADER_LEN: usize = HEADER_LEN + 4 + 4 + 8 + 4 + 2 + 2;

const FLAG_REPLY: u8 = 0b0000_0001;
const FLAG_BROADCAST: u8 = 0b0000_0001;

/// Serialize a message into a single datagram
pub fn encode(message: &Message) -> Bytes {
    let mut buf = BytesMut::with_capacity(match message {
        Message::Audio(frame) => AUDIO_HEADER_LEN + frame.payload().len(),
        _ => 128,
    });

    buf.put_slice(&MAGIC);
    buf.put_u8(PROTOCOL_VERSION);
    buf.put_u8(message.kind() as u8);

    match message {
        Message::Presence(presence) => {
            buf.put_slice(presence.node_id.as_bytes());
            buf.put_u8(presence.role.to_wire());
            buf.put_u8(if presence.reply { FLAG_REPLY } else { 0 });
            let name = truncate_utf8(&presence.display_name, MAX_DISPLAY_NAME_BYTES);
            buf.put_u8(name.len() as u8);
            buf.put_slice(name.as_bytes());
        }
        Message::Audio(frame) => {
            buf.put_u32(frame.session_id());
            buf.put_u32(frame.sequence());
            buf.put_u64(frame.timestamp_us());
            buf.put_u32(frame.sample_rate());
            buf.put_u16(frame.channels());
            buf.put_u16(frame.payload().len() as u16);
            buf.put_slice(frame.payload());
        }
        Message::Chat(chat) => {
            buf.put_slice(chat.sender_id.as_bytes());
            buf.put_i64(chat.timestamp.timestamp_millis());
            buf.put_u8(if chat.broadcast { FLAG_BROADCAST } else { 0 });
            let name = truncate_utf8(&chat.sender_name, MAX_DISPLAY_NAME_BYTES);
            buf.put_u8(name.len() as u8);
            buf.put_slice(name.as_bytes());
            let text = truncate_utf8(&chat.text, MAX_CHAT_BYTES);
            buf.put_u16(text.len() as u16);
            buf.put_slice(text.as_bytes());
        }
    }

    buf.freeze()
}

/// Parse a datagram. Never panics; anything unexpected is a [`MalformedPacket`].
pub fn decode(packet: &[u8]) -> Result<Message, MalformedPacket> {
    let mut buf = packet;

    ensure(&buf, HEADER_LEN)?;
    if buf[..2] != MAGIC {
        return Err(MalformedPacket::BadMagic);
    }
    buf.advance(2);

    let version = buf.get_u8();
    if version != PROTOCOL_VERSION {
        return Err(MalformedPacket::VersionMismatch {
            expected: PROTOCOL_VERSION,
            found: version,
        });
    }

    let tag = buf.get_u8();
    let kind = MessageKind::from_tag(tag).ok_or(MalformedPacket::UnknownKind(tag))?;

    let message = match kind {
        MessageKind::Presence => Message::Presence(decode_presence(&mut buf, version)?),
        MessageKind::Audio => Message::Audio(decode_audio(&mut buf)?),
        MessageKind::Chat => Message::Chat(decode_chat(&mut buf)?),
    };

    if buf.has_remaining() {
        return Err(MalformedPacket::TrailingBytes(buf.remaining()));
    }

    Ok(message)
}

fn decode_presence(buf: &mut &[u8], version: u8) -> Result<Presence, MalformedPacket> {
    let node_id = read_uuid(buf)?;

    ensure(buf, 3)?;
    let role = Role::from_wire(buf.get_u8()).ok_or(MalformedPacket::InvalidField("role"))?;
    let flags = buf.get_u8();
    let name_len = buf.get_u8() as usize;
    let display_name = read_string(buf, name_len, "display_name")?;

    Ok(Presence {
        node_id,
        role,
        display_name,
        protocol_version: version,
        reply: flags & FLAG_REPLY != 0,
    })
}

fn decode_audio(buf: &mut &[u8]) -> Result<AudioFrame, MalformedPacket> {
    ensure(buf, AUDIO_HEADER_LEN - HEADER_LEN)?;
    let session_id = buf.get_u32();
    let sequence = buf.get_u32();
    let timestamp_us = buf.get_u64();
    let sample_rate = buf.get_u32();
    let channels = buf.get_u16();
    let payload_len = buf.get_u16() as usize;

    ensure(buf, payload_len)?;
    let payload = Bytes::copy_from_slice(&buf[..payload_len]);
    buf.advance(payload_len);

    AudioFrame::new(session_id, sequence, timestamp_us, sample_rate, channels, payload)
}

fn decode_chat(buf: &mut &[u8]) -> Result<ChatMessage, MalformedPacket> {
    let sender_id = read_uuid(buf)?;

    ensure(buf, 8 + 1 + 1)?;
    let timestamp = DateTime::from_timestamp_millis(buf.get_i64())
        .ok_or(MalformedPacket::InvalidField("timestamp"))?;
    let flags = buf.get_u8();
    let name_len = buf.get_u8() as usize;
    let sender_name = read_string(buf, name_len, "sender_name")?;

    ensure(buf, 2)?;
    let text_len = buf.get_u16() as usize;
    if text_len > MAX_CHAT_BYTES {
        return Err(MalformedPacket::PayloadTooLarge(text_len));
    }
    let text = read_string(buf, text_len, "text")?;

    Ok(ChatMessage {
        sender_id,
        sender_name,
        timestamp,
        text,
        broadcast: flags & FLAG_BROADCAST != 0,
    })
}

fn ensure(buf: &&[u8], needed: usize) -> Result<(), MalformedPacket> {
    if buf.remaining() < needed {
        Err(MalformedPacket::Truncated {
            needed,
            available: buf.remaining(),
        })
    } else {
        Ok(())
    }
}

fn read_uuid(buf: &mut &[u8]) -> Result<Uuid, MalformedPacket> {
    ensure(buf, 16)?;
    let mut bytes = [0u8; 16];
    buf.copy_to_slice(&mut bytes);
    Ok(Uuid::from_bytes(bytes))
}

fn read_string(buf: &mut &[u8], len: usize, field: &'static str) -> Result<String, MalformedPacket> {
    ensure(buf, len)?;
    let s = std::str::from_utf8(&buf[..len])
        .map_err(|_| MalformedPacket::InvalidUtf8(field))?
        .to_string();
    buf.advance(len);
    Ok(s)
}
