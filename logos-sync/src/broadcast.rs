//! Broadcast router: typed peer events in, local handlers out.
//!
//! Outbound, [`BroadcastRouter::send`] encodes an event and hands it to the
//! transport without waiting. Inbound, the session loop passes raw
//! transport broadcasts through [`BroadcastRouter::accept`] (decode,
//! validate, drop own echoes) and then [`BroadcastRouter::dispatch`]es the
//! survivors to every handler registered for that kind.
//!
//! Delivery is best-effort and at-most-once. There is no ordering across
//! event kinds.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::SyncError;
use crate::model::UserId;
use crate::protocol::{BroadcastEvent, EventKind};
use crate::transport::{ChannelHandle, Transport};

/// Local callback for peer-originated events.
pub type EventHandler = Arc<dyn Fn(&BroadcastEvent) + Send + Sync>;

/// Router statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouterStats {
    pub events_sent: u64,
    pub events_received: u64,
    /// Malformed, invalid, or echoed inbound events.
    pub events_dropped: u64,
    pub send_failures: u64,
}

#[derive(Default)]
struct AtomicRouterStats {
    events_sent: AtomicU64,
    events_received: AtomicU64,
    events_dropped: AtomicU64,
    send_failures: AtomicU64,
}

pub struct BroadcastRouter {
    transport: Arc<dyn Transport>,
    local_user_id: UserId,
    /// Set while the session holds a live subscription.
    handle: RwLock<Option<ChannelHandle>>,
    handlers: RwLock<HashMap<EventKind, Vec<EventHandler>>>,
    stats: AtomicRouterStats,
}

impl BroadcastRouter {
    pub fn new(transport: Arc<dyn Transport>, local_user_id: impl Into<UserId>) -> Self {
        Self {
            transport,
            local_user_id: local_user_id.into(),
            handle: RwLock::new(None),
            handlers: RwLock::new(HashMap::new()),
            stats: AtomicRouterStats::default(),
        }
    }

    pub fn attach(&self, handle: ChannelHandle) {
        *self.handle.write() = Some(handle);
    }

    pub fn detach(&self) -> Option<ChannelHandle> {
        self.handle.write().take()
    }

    pub fn handle(&self) -> Option<ChannelHandle> {
        self.handle.read().clone()
    }

    pub fn is_attached(&self) -> bool {
        self.handle.read().is_some()
    }

    /// Fire-and-forget publish to the room.
    pub fn send(&self, event: &BroadcastEvent) -> Result<(), SyncError> {
        let handle = self.handle.read().clone().ok_or(SyncError::NotConnected)?;
        let kind = event.kind();
        let payload = event.encode()?;

        match self.transport.broadcast(&handle, kind.as_str(), payload) {
            Ok(()) => {
                self.stats.events_sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.stats.send_failures.fetch_add(1, Ordering::Relaxed);
                Err(e.into())
            }
        }
    }

    /// Register a handler for peer events of `kind`.
    pub fn on_event<F>(&self, kind: EventKind, handler: F)
    where
        F: Fn(&BroadcastEvent) + Send + Sync + 'static,
    {
        self.handlers.write().entry(kind).or_default().push(Arc::new(handler));
    }

    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.handlers.read().get(&kind).map_or(0, Vec::len)
    }

    /// Decode and validate a raw broadcast. Returns `None` if it was dropped.
    pub fn accept(&self, event_type: &str, payload: &[u8]) -> Option<BroadcastEvent> {
        let event = match BroadcastEvent::decode(event_type, payload) {
            Ok(event) => event,
            Err(e) => {
                self.stats.events_dropped.fetch_add(1, Ordering::Relaxed);
                log::warn!("Dropping inbound '{event_type}' broadcast: {e}");
                return None;
            }
        };

        if event.origin_user_id == self.local_user_id {
            self.stats.events_dropped.fetch_add(1, Ordering::Relaxed);
            log::trace!("Dropping echo of own '{event_type}'");
            return None;
        }

        self.stats.events_received.fetch_add(1, Ordering::Relaxed);
        Some(event)
    }

    /// Invoke every handler registered for the event's kind.
    pub fn dispatch(&self, event: &BroadcastEvent) {
        // Clone out so handlers can register more handlers.
        let handlers: Vec<EventHandler> = self
            .handlers
            .read()
            .get(&event.kind())
            .cloned()
            .unwrap_or_default();

        for handler in handlers {
            handler(event);
        }
    }

    pub fn stats(&self) -> RouterStats {
        RouterStats {
            events_sent: self.stats.events_sent.load(Ordering::Relaxed),
            events_received: self.stats.events_received.load(Ordering::Relaxed),
            events_dropped: self.stats.events_dropped.load(Ordering::Relaxed),
            send_failures: self.stats.send_failures.load(Ordering::Relaxed),
        }
    }
}
