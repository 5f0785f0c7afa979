//! Error taxonomy for the sync engine.
//!
//! | Class | Type | Policy |
//! |-------|------|--------|
//! | Transport connection failure | [`TransportError`] | Session → `Disconnected`, surfaced, no retry |
//! | Durable write/read failure | [`StoreError`] | Logged, reflected in `pending_changes` |
//! | Malformed broadcast payload | [`EventError`] | Dropped before it reaches any handler |
//! | Malformed relay frame | [`FrameError`] | Logged and ignored by the relay |

use thiserror::Error;

/// Failures of the pub/sub transport primitive.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Transport unreachable: {0}")]
    Unreachable(String),

    #[error("Channel '{0}' is full")]
    ChannelFull(String),

    #[error("Unknown channel handle")]
    UnknownHandle,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("Relay rejected request: {0}")]
    Rejected(String),

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),
}

/// Failures of the durable store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Compression error: {0}")]
    Compression(String),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Reasons an inbound broadcast is rejected.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EventError {
    #[error("Unknown event type '{0}'")]
    UnknownType(String),

    #[error("Malformed payload: {0}")]
    Malformed(String),

    #[error("Invalid payload: {0}")]
    Invalid(&'static str),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Relay wire codec failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("Frame encode failed: {0}")]
    Encode(String),

    #[error("Frame decode failed: {0}")]
    Decode(String),
}

/// Top-level error returned by the session API.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Event error: {0}")]
    Event(#[from] EventError),

    #[error("Session is not connected")]
    NotConnected,

    #[error("Local event queue is full")]
    QueueFull,
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;
