//! Relay wire frames.
//!
//! Binary WebSocket messages, bincode-encoded (standard config):
//!
//! ```text
//! client                              relay
//!   │ ── Open { channel } ──────────►  │
//!   │ ◄───────────── Opened { id } ──  │
//!   │ ◄──── Event(PresenceSync) ─────  │
//!   │ ── Track { payload } ─────────►  │
//!   │ ◄──────────────────── Tracked ─  │
//!   │ ── Broadcast { .. } ──────────►  │   (no reply)
//!   │ ◄──────── Event(Broadcast) ────  │
//!   │ ── Close ─────────────────────►  │
//! ```
//!
//! Presence and broadcast payloads stay opaque bytes here; the JSON inside
//! is the session layer's business.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

use super::ChannelEvent;
use crate::error::FrameError;

/// Client → relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientFrame {
    /// Must be the first frame on a connection.
    Open { channel: String },
    Track { payload: Vec<u8> },
    Broadcast { event_type: String, payload: Vec<u8> },
    Close,
}

/// Relay → client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerFrame {
    Opened { handle_id: Uuid },
    /// Acknowledges a `Track`.
    Tracked,
    Event(ChannelEvent),
    Error { message: String },
}

fn encode<T: Serialize>(frame: &T) -> Result<Vec<u8>, FrameError> {
    bincode::serde::encode_to_vec(frame, bincode::config::standard())
        .map_err(|e| FrameError::Encode(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, FrameError> {
    let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map_err(|e| FrameError::Decode(e.to_string()))?;
    Ok(frame)
}

impl ClientFrame {
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        decode(bytes)
    }
}

impl ServerFrame {
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        decode(bytes)
    }
}
