//! In-process transport hub.
//!
//! One [`HubChannel`] per channel name, each with a tokio broadcast sender
//! for O(1) fan-out and a presence table. Every subscription gets a
//! forwarder task that copies hub traffic into the subscriber's bounded
//! mpsc queue, skipping the subscriber's own broadcasts.
//!
//! ```text
//!  track(A) ──► members[A] = payload ──► Join(A) + Sync(all) ─┐
//!                                                             ▼
//!                                              broadcast::Sender<HubMessage>
//!                                                 │          │          │
//!                                             forwarder  forwarder  forwarder
//!                                                 ▼          ▼          ▼
//!                                               sub A      sub B      sub C
//! ```
//!
//! Presence events are published while the members lock is held, so every
//! subscriber observes snapshots in the same order. A forwarder whose
//! receiver is gone removes its own subscription.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::{ChannelEvent, ChannelHandle, PresenceRecord, Transport};
use crate::config::RelayConfig;
use crate::error::TransportError;

#[derive(Debug, Clone)]
struct HubMessage {
    /// Subscription that must not receive this message.
    skip: Option<Uuid>,
    event: ChannelEvent,
}

/// Statistics for one hub channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubChannelStats {
    pub subscribers: usize,
    pub tracked: usize,
    pub broadcasts: u64,
    pub presence_updates: u64,
}

struct HubChannel {
    name: String,
    sender: broadcast::Sender<Arc<HubMessage>>,
    /// Subscription id → tracked payload (`None` until `track`).
    members: Mutex<BTreeMap<Uuid, Option<Vec<u8>>>>,
    broadcasts: AtomicU64,
    presence_updates: AtomicU64,
}

impl HubChannel {
    fn new(name: &str, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            name: name.to_string(),
            sender,
            members: Mutex::new(BTreeMap::new()),
            broadcasts: AtomicU64::new(0),
            presence_updates: AtomicU64::new(0),
        }
    }

    fn publish(&self, skip: Option<Uuid>, event: ChannelEvent) {
        // No receivers is not an error for a best-effort channel.
        let _ = self.sender.send(Arc::new(HubMessage { skip, event }));
    }

    fn stats(&self) -> HubChannelStats {
        let members = self.members.lock();
        HubChannelStats {
            subscribers: members.len(),
            tracked: members.values().filter(|p| p.is_some()).count(),
            broadcasts: self.broadcasts.load(Ordering::Relaxed),
            presence_updates: self.presence_updates.load(Ordering::Relaxed),
        }
    }
}

fn snapshot(members: &BTreeMap<Uuid, Option<Vec<u8>>>) -> Vec<PresenceRecord> {
    members
        .iter()
        .filter_map(|(key, payload)| {
            payload.as_ref().map(|payload| PresenceRecord {
                key: *key,
                payload: payload.clone(),
            })
        })
        .collect()
}

struct Subscription {
    channel: Arc<HubChannel>,
    forwarder: JoinHandle<()>,
}

struct HubInner {
    channels: Mutex<HashMap<String, Arc<HubChannel>>>,
    subscriptions: Mutex<HashMap<Uuid, Subscription>>,
    broadcast_capacity: usize,
    event_queue_capacity: usize,
    max_peers_per_channel: usize,
}

impl HubInner {
    fn subscription_channel(&self, handle: &ChannelHandle) -> Result<Arc<HubChannel>, TransportError> {
        self.subscriptions
            .lock()
            .get(&handle.id)
            .map(|sub| sub.channel.clone())
            .ok_or(TransportError::UnknownHandle)
    }

    /// Remove subscription `id` and its presence. The caller owns the
    /// returned forwarder.
    fn drop_subscription(&self, id: Uuid) -> Option<JoinHandle<()>> {
        let sub = self.subscriptions.lock().remove(&id)?;
        self.remove_member(&sub.channel, id);
        Some(sub.forwarder)
    }

    fn remove_member(&self, channel: &Arc<HubChannel>, id: Uuid) {
        let empty = {
            let mut members = channel.members.lock();
            if let Some(Some(payload)) = members.remove(&id) {
                channel.publish(None, ChannelEvent::PresenceLeave(PresenceRecord { key: id, payload }));
                channel.publish(None, ChannelEvent::PresenceSync(snapshot(&members)));
                channel.presence_updates.fetch_add(1, Ordering::Relaxed);
            }
            members.is_empty()
        };

        if empty {
            let mut channels = self.channels.lock();
            // Re-check under the map lock: a new subscriber may have joined.
            if channels
                .get(&channel.name)
                .is_some_and(|c| Arc::ptr_eq(c, channel) && c.members.lock().is_empty())
            {
                channels.remove(&channel.name);
                log::debug!("Hub channel '{}' closed", channel.name);
            }
        }
    }
}

/// In-process [`Transport`].
///
/// Cheap to share: wrap in an `Arc` and hand the same hub to every session
/// that should see each other.
///
/// A subscriber that drops its event receiver without calling
/// [`Transport::unsubscribe`] is reaped by its forwarder: its presence is
/// removed and peers see the leave.
pub struct LocalHub {
    inner: Arc<HubInner>,
}

impl LocalHub {
    pub fn new() -> Self {
        Self::with_config(&RelayConfig::default())
    }

    pub fn with_config(config: &RelayConfig) -> Self {
        Self {
            inner: Arc::new(HubInner {
                channels: Mutex::new(HashMap::new()),
                subscriptions: Mutex::new(HashMap::new()),
                broadcast_capacity: config.broadcast_capacity,
                event_queue_capacity: config.broadcast_capacity,
                max_peers_per_channel: config.max_peers_per_channel,
            }),
        }
    }

    /// Server-side drop of a subscription: the subscriber's event stream
    /// ends and its presence record is removed, as if its connection died.
    pub fn disconnect(&self, handle: &ChannelHandle) -> bool {
        match self.inner.drop_subscription(handle.id) {
            Some(forwarder) => {
                forwarder.abort();
                true
            }
            None => false,
        }
    }

    pub fn channel_count(&self) -> usize {
        self.inner.channels.lock().len()
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.lock().len()
    }

    pub fn channel_stats(&self, name: &str) -> Option<HubChannelStats> {
        self.inner.channels.lock().get(name).map(|c| c.stats())
    }
}

impl Default for LocalHub {
    fn default() -> Self {
        Self::new()
    }
}

async fn forward(
    id: Uuid,
    channel_name: String,
    mut hub_rx: broadcast::Receiver<Arc<HubMessage>>,
    tx: mpsc::Sender<ChannelEvent>,
    hub: Weak<HubInner>,
) {
    loop {
        tokio::select! {
            msg = hub_rx.recv() => match msg {
                Ok(msg) => {
                    if msg.skip == Some(id) {
                        continue;
                    }
                    if tx.send(msg.event.clone()).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    log::warn!("Subscriber {id} on '{channel_name}' lagged, {n} events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            },
            _ = tx.closed() => break,
        }
    }

    // Receiver dropped without an unsubscribe.
    if let Some(hub) = hub.upgrade() {
        if hub.drop_subscription(id).is_some() {
            log::debug!("Hub: subscription {id} on '{channel_name}' abandoned, reaped");
        }
    }
}

#[async_trait]
impl Transport for LocalHub {
    async fn open_channel(
        &self,
        name: &str,
    ) -> Result<(ChannelHandle, mpsc::Receiver<ChannelEvent>), TransportError> {
        let id = Uuid::new_v4();
        let inner = &self.inner;

        let (channel, initial, hub_rx) = {
            // Channel map lock first, then members: same order as reaping.
            let mut channels = inner.channels.lock();
            let channel = channels
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(HubChannel::new(name, inner.broadcast_capacity)))
                .clone();
            let mut members = channel.members.lock();
            if members.len() >= inner.max_peers_per_channel {
                return Err(TransportError::ChannelFull(name.to_string()));
            }
            members.insert(id, None);
            // Subscribe under the lock so no presence update slips between
            // the snapshot and the first live event.
            let initial = snapshot(&members);
            let hub_rx = channel.sender.subscribe();
            drop(members);
            (channel, initial, hub_rx)
        };

        let (tx, rx) = mpsc::channel(inner.event_queue_capacity.max(1));
        // Fresh queue, capacity >= 1: cannot fail.
        let _ = tx.try_send(ChannelEvent::PresenceSync(initial));

        {
            // Insert before the forwarder can look itself up.
            let mut subscriptions = inner.subscriptions.lock();
            let forwarder = tokio::spawn(forward(id, name.to_string(), hub_rx, tx, Arc::downgrade(inner)));
            subscriptions.insert(id, Subscription { channel, forwarder });
        }

        log::debug!("Hub: subscription {id} opened '{name}'");
        Ok((
            ChannelHandle {
                id,
                channel: name.to_string(),
            },
            rx,
        ))
    }

    async fn track(&self, handle: &ChannelHandle, payload: Vec<u8>) -> Result<(), TransportError> {
        let channel = self.inner.subscription_channel(handle)?;
        let mut members = channel.members.lock();
        members.insert(handle.id, Some(payload.clone()));
        channel.publish(
            None,
            ChannelEvent::PresenceJoin(PresenceRecord {
                key: handle.id,
                payload,
            }),
        );
        channel.publish(None, ChannelEvent::PresenceSync(snapshot(&members)));
        channel.presence_updates.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn broadcast(
        &self,
        handle: &ChannelHandle,
        event_type: &str,
        payload: Vec<u8>,
    ) -> Result<(), TransportError> {
        let channel = self.inner.subscription_channel(handle)?;
        channel.publish(
            Some(handle.id),
            ChannelEvent::Broadcast {
                origin: handle.id,
                event_type: event_type.to_string(),
                payload,
            },
        );
        channel.broadcasts.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn unsubscribe(&self, handle: &ChannelHandle) -> Result<(), TransportError> {
        if self.disconnect(handle) {
            log::debug!("Hub: subscription {} left '{}'", handle.id, handle.channel);
            Ok(())
        } else {
            Err(TransportError::UnknownHandle)
        }
    }
}
