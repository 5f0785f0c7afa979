//! Named-channel pub/sub transport.
//!
//! The engine never talks to a socket directly. It opens a channel, gets a
//! stream of [`ChannelEvent`]s back, and pushes presence and broadcasts
//! through a [`ChannelHandle`]:
//!
//! ```text
//!            open_channel("room:r1")
//! Session ───────────────────────────► Transport
//!    ▲        track / broadcast           │
//!    │                                    │
//!    └──── mpsc::Receiver<ChannelEvent> ◄─┘
//!          PresenceSync | PresenceJoin | PresenceLeave | Broadcast
//! ```
//!
//! The end of the event stream means the subscription is gone.
//!
//! Implementations:
//! - [`hub::LocalHub`] — in-process, used by tests and by the relay server
//! - [`ws::WsTransport`] — WebSocket client for a [`crate::server::RelayServer`]

pub mod frame;
pub mod hub;
pub mod ws;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::TransportError;

pub use hub::LocalHub;
pub use ws::WsTransport;

/// One subscription to one channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelHandle {
    /// Unique per subscription. Doubles as the presence key.
    pub id: Uuid,
    pub channel: String,
}

/// A tracked presence record: opaque payload keyed by subscription id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub key: Uuid,
    pub payload: Vec<u8>,
}

/// Events delivered to a subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelEvent {
    /// Full presence snapshot of the channel.
    PresenceSync(Vec<PresenceRecord>),
    PresenceJoin(PresenceRecord),
    PresenceLeave(PresenceRecord),
    /// Peer broadcast. Never delivered back to its origin subscription.
    Broadcast {
        origin: Uuid,
        event_type: String,
        payload: Vec<u8>,
    },
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Subscribe to `name`. The first event on the stream is the current
    /// presence snapshot.
    async fn open_channel(
        &self,
        name: &str,
    ) -> Result<(ChannelHandle, mpsc::Receiver<ChannelEvent>), TransportError>;

    /// Publish (or replace) this subscription's presence record.
    async fn track(&self, handle: &ChannelHandle, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Fire-and-forget publish to every other subscriber. Never blocks.
    fn broadcast(
        &self,
        handle: &ChannelHandle,
        event_type: &str,
        payload: Vec<u8>,
    ) -> Result<(), TransportError>;

    /// Drop the subscription and its presence record.
    async fn unsubscribe(&self, handle: &ChannelHandle) -> Result<(), TransportError>;
}
