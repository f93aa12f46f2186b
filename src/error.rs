//! Error types for the audio streaming application

use std::net::SocketAddr;
use thiserror::Error;

use crate::protocol::Role;

/// Main error type for the application
#[derive(Error, Debug)]
pub enum Error {
    #[error("Malformed packet: {0}")]
    Malformed(#[from] MalformedPacket),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Decode failures. Dropped at the transport boundary, never surfaced past it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MalformedPacket {
    #[error("Truncated packet: needed {needed} more bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("Bad magic bytes")]
    BadMagic,

    #[error("Protocol version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u8, found: u8 },

    #[error("Unknown message kind: {0}")]
    UnknownKind(u8),

    #[error("Invalid field: {0}")]
    InvalidField(&'static str),

    #[error("Invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),

    #[error("Payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),
}

/// Socket-level failures
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Socket bind to {addr} failed: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    #[error("Send to {dest} failed: {source}")]
    Send {
        dest: SocketAddr,
        source: std::io::Error,
    },

    #[error("Receive failed: {0}")]
    Receive(std::io::Error),

    #[error("Socket setup failed: {0}")]
    Socket(#[from] std::io::Error),
}

/// Capture/playback collaborator failures
#[derive(Error, Debug, Clone)]
pub enum DeviceError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to open stream: {0}")]
    Stream(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Format mismatch: expected {expected}, got {actual}")]
    FormatMismatch { expected: String, actual: String },

    #[error("Device stalled: no audio for {0:?}")]
    Stalled(std::time::Duration),

    #[error("Device disconnected")]
    Disconnected,
}

/// Command failures reported to the UI collaborator
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Operation requires the {expected} role, session is {actual}")]
    WrongRole { expected: Role, actual: Role },

    #[error("Engine is already running")]
    AlreadyRunning,

    #[error("No peer to deliver to")]
    NoCounterpart,

    #[error("Session has been stopped")]
    Stopped,
}

/// Result type alias for the application
pub type Result<T> = std::result::Result<T, Error>;
