//! Session lifecycle and the per-session event loop.
//!
//! ```text
//!            join                                      leave / stream end
//! Disconnected ──► Connecting ──► Subscribed ──► Connected ──► Disconnected
//!                  (load_all)    (channel open)  (presence tracked)
//! ```
//!
//! ## Single writer
//!
//! The presence registry and the item cache are only ever mutated by the
//! session's event loop task. It consumes two bounded queues, one message
//! at a time:
//!
//! ```text
//! Transport ──ChannelEvent──┐
//!                           ├──► EventLoop ──► PresenceRegistry
//! Session  ──Command────────┘        │    ──► ItemCache
//!                                    │    ──► host handlers
//!                                    └──────► watch<SyncSnapshot>
//! ```
//!
//! Host handlers run on the loop task. Anything they broadcast goes out
//! through the transport and never re-enters the registry synchronously.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::broadcast::{BroadcastRouter, RouterStats};
use crate::cache::ItemCache;
use crate::config::SyncConfig;
use crate::error::{Result, SyncError, TransportError};
use crate::model::{
    now_millis, pick_color, ConnectionState, ItemId, PresenceEntry, RoomId, SyncedItem, UserId, ViewState,
};
use crate::presence::PresenceRegistry;
use crate::protocol::{BroadcastEvent, EventKind, EventPayload};
use crate::reconcile::{ReconcileStatus, Reconciler, RetryReport};
use crate::storage::DurableStore;
use crate::throttle::CursorThrottler;
use crate::transport::{ChannelEvent, ChannelHandle, Transport};

/// What the host can read at any time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncSnapshot {
    pub others: Vec<PresenceEntry>,
    pub connection_state: ConnectionState,
    pub last_synced_at: Option<u64>,
    pub pending_changes: usize,
}

/// Local mutations of loop-owned state.
#[derive(Debug)]
enum Command {
    ApplyItem(SyncedItem),
    RemoveItem(ItemId),
    ReplaceItems(Vec<SyncedItem>),
}

// ─── Session ──────────────────────────────────────────────────────────

/// Handle to one room membership. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    id: Uuid,
    room_id: RoomId,
    local_user_id: UserId,
    config: SyncConfig,
    transport: Arc<dyn Transport>,
    router: Arc<BroadcastRouter>,
    reconciler: Arc<Reconciler>,
    throttler: Mutex<CursorThrottler>,
    cache: Arc<RwLock<ItemCache>>,
    local_presence: Mutex<PresenceEntry>,
    snapshot: Arc<watch::Sender<SyncSnapshot>>,
    /// Subscription handle, held until `leave` or drop even after the
    /// router detaches on a dead stream.
    channel: Mutex<Option<ChannelHandle>>,
    commands: Mutex<Option<mpsc::Sender<Command>>>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
    left: AtomicBool,
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        if let Some(task) = self.event_loop.get_mut().take() {
            task.abort();
        }
        if self.left.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(handle) = self.channel.get_mut().take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let transport = self.transport.clone();
                runtime.spawn(async move { release(transport.as_ref(), &handle).await });
            }
            Err(_) => log::warn!(
                "Session {} dropped outside a runtime, '{}' not unsubscribed",
                self.id,
                handle.channel
            ),
        }
    }
}

/// Unsubscribe `handle`. A transport that already dropped it is fine.
async fn release(transport: &dyn Transport, handle: &ChannelHandle) {
    match transport.unsubscribe(handle).await {
        Ok(()) | Err(TransportError::UnknownHandle) => {}
        Err(e) => log::debug!("Unsubscribe from {} failed: {e}", handle.channel),
    }
}

impl Session {
    /// Join `room_id` as `local_user_id`.
    ///
    /// On failure the session ends `Disconnected` and the error is returned.
    /// There is no retry; reconnecting is a fresh join.
    pub async fn join(
        transport: Arc<dyn Transport>,
        store: Arc<dyn DurableStore>,
        config: SyncConfig,
        room_id: impl Into<RoomId>,
        local_user_id: impl Into<UserId>,
        local_user_name: impl Into<String>,
    ) -> Result<Session> {
        let room_id = room_id.into();
        let local_user_id = local_user_id.into();
        let id = Uuid::new_v4();
        let color = pick_color(&config.palette, id);

        let router = Arc::new(BroadcastRouter::new(transport.clone(), local_user_id.clone()));
        let reconciler = Arc::new(Reconciler::new(store, room_id.clone(), config.collection.clone()));
        let (snapshot, _) = watch::channel(SyncSnapshot::default());

        let session = Session {
            inner: Arc::new(SessionInner {
                id,
                room_id: room_id.clone(),
                local_user_id: local_user_id.clone(),
                transport: transport.clone(),
                router: router.clone(),
                reconciler: reconciler.clone(),
                throttler: Mutex::new(CursorThrottler::new(config.cursor_window)),
                cache: Arc::new(RwLock::new(ItemCache::new())),
                local_presence: Mutex::new(PresenceEntry::new(
                    local_user_id.clone(),
                    local_user_name,
                    color,
                )),
                snapshot: Arc::new(snapshot),
                channel: Mutex::new(None),
                commands: Mutex::new(None),
                event_loop: Mutex::new(None),
                left: AtomicBool::new(false),
                config,
            }),
        };
        let inner = &session.inner;
        inner.set_state(ConnectionState::Connecting);

        // Seed the cache before any peer event can touch it.
        if inner.config.load_on_join {
            let items = reconciler.load_all(&local_user_id).await;
            inner.cache.write().replace_all(items);
        }

        let channel = inner.config.channel_name(&room_id);
        let (handle, events) = match transport.open_channel(&channel).await {
            Ok(opened) => opened,
            Err(e) => {
                log::error!("Join of room {room_id} failed: {e}");
                inner.set_state(ConnectionState::Disconnected);
                inner.left.store(true, Ordering::SeqCst);
                return Err(e.into());
            }
        };
        router.attach(handle.clone());
        *inner.channel.lock() = Some(handle);
        inner.set_state(ConnectionState::Subscribed);

        let (command_tx, command_rx) = mpsc::channel(inner.config.command_queue_capacity.max(1));
        *inner.commands.lock() = Some(command_tx);

        let event_loop = EventLoop {
            room_id: room_id.clone(),
            registry: PresenceRegistry::new(local_user_id.clone()),
            events,
            commands: command_rx,
            status: reconciler.subscribe(),
            router: router.clone(),
            cache: inner.cache.clone(),
            snapshot: inner.snapshot.clone(),
        };
        *inner.event_loop.lock() = Some(tokio::spawn(event_loop.run()));

        if let Err(e) = session.track_presence().await {
            log::error!("Publishing presence in room {room_id} failed: {e}");
            session.leave().await;
            return Err(e);
        }

        // The loop may already have seen the stream end.
        inner.snapshot.send_if_modified(|s| {
            if s.connection_state == ConnectionState::Subscribed {
                s.connection_state = ConnectionState::Connected;
                true
            } else {
                false
            }
        });
        log::info!("User {local_user_id} joined room {room_id} (session {id})");
        Ok(session)
    }

    /// Leave the room. Idempotent, and safe after a failed join.
    pub async fn leave(&self) {
        let inner = &self.inner;
        if inner.left.swap(true, Ordering::SeqCst) {
            return;
        }

        inner.router.detach();
        // Take first: the guard must not live across the await below.
        let handle = inner.channel.lock().take();
        if let Some(handle) = handle {
            release(inner.transport.as_ref(), &handle).await;
        }
        inner.commands.lock().take();
        let task = inner.event_loop.lock().take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }

        inner.snapshot.send_modify(|s| {
            s.connection_state = ConnectionState::Disconnected;
            s.others.clear();
        });
        log::info!("User {} left room {}", inner.local_user_id, inner.room_id);
    }

    // ─── Accessors ────────────────────────────────────────────────────

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn room_id(&self) -> &str {
        &self.inner.room_id
    }

    pub fn local_user_id(&self) -> &str {
        &self.inner.local_user_id
    }

    pub fn local_user_name(&self) -> String {
        self.inner.local_presence.lock().display_name.clone()
    }

    /// Palette colour picked once when the session was created.
    pub fn assigned_color(&self) -> String {
        self.inner.local_presence.lock().color.clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.snapshot.borrow().connection_state
    }

    /// Current state, with the durable-path counters read live.
    pub fn snapshot(&self) -> SyncSnapshot {
        let mut snapshot = self.inner.snapshot.borrow().clone();
        let status = self.inner.reconciler.status();
        snapshot.pending_changes = status.pending_changes;
        snapshot.last_synced_at = status.last_synced_at;
        snapshot
    }

    /// Change notifications. Durable-path counters update while connected.
    pub fn subscribe(&self) -> watch::Receiver<SyncSnapshot> {
        self.inner.snapshot.subscribe()
    }

    pub fn others(&self) -> Vec<PresenceEntry> {
        self.inner.snapshot.borrow().others.clone()
    }

    pub fn items(&self) -> Vec<SyncedItem> {
        self.inner.cache.read().items()
    }

    pub fn item(&self, id: &str) -> Option<SyncedItem> {
        self.inner.cache.read().get(id).cloned()
    }

    /// The transport subscription this session holds, until it leaves.
    pub fn channel_handle(&self) -> Option<ChannelHandle> {
        self.inner.channel.lock().clone()
    }

    pub fn router_stats(&self) -> RouterStats {
        self.inner.router.stats()
    }

    pub fn reconcile_status(&self) -> ReconcileStatus {
        self.inner.reconciler.status()
    }

    // ─── Ephemeral path ───────────────────────────────────────────────

    /// Submit a pointer sample. Returns `true` if it was broadcast.
    pub fn broadcast_cursor(&self, x: f64, y: f64) -> bool {
        if self.connection_state() != ConnectionState::Connected {
            return false;
        }
        let Some(position) = self.inner.throttler.lock().submit(x, y) else {
            return false;
        };
        let event = BroadcastEvent::new(self.inner.local_user_id.clone(), EventPayload::CursorMove(position));
        match self.inner.router.send(&event) {
            Ok(()) => true,
            Err(e) => {
                log::trace!("Cursor broadcast dropped: {e}");
                false
            }
        }
    }

    /// Broadcast the local selection. Returns `true` if it was sent.
    pub fn broadcast_selection(&self, item_ids: Vec<ItemId>) -> bool {
        if self.connection_state() != ConnectionState::Connected {
            return false;
        }
        let event = BroadcastEvent::new(
            self.inner.local_user_id.clone(),
            EventPayload::SelectionChange { item_ids },
        );
        match self.inner.router.send(&event) {
            Ok(()) => true,
            Err(e) => {
                log::debug!("Selection broadcast dropped: {e}");
                false
            }
        }
    }

    /// Re-publish the local presence entry with a new viewport.
    pub async fn update_view(&self, view: ViewState) -> Result<()> {
        self.inner.local_presence.lock().current_view = Some(view);
        self.track_presence().await
    }

    async fn track_presence(&self) -> Result<()> {
        let handle = self.inner.router.handle().ok_or(SyncError::NotConnected)?;
        let payload = {
            let mut entry = self.inner.local_presence.lock();
            entry.last_active_at = now_millis();
            entry
                .encode()
                .map_err(|e| crate::error::EventError::Serialization(e.to_string()))?
        };
        self.inner.transport.track(&handle, payload).await?;
        Ok(())
    }

    // ─── Durable path: fan-out ────────────────────────────────────────

    pub fn broadcast_item_create(&self, item: SyncedItem) -> Result<()> {
        self.broadcast_item(EventPayload::ItemCreate(item))
    }

    pub fn broadcast_item_update(&self, item: SyncedItem) -> Result<()> {
        self.broadcast_item(EventPayload::ItemUpdate(item))
    }

    pub fn broadcast_item_delete(&self, id: impl Into<ItemId>) -> Result<()> {
        self.broadcast_item(EventPayload::ItemDelete { id: id.into() })
    }

    /// Apply to the local cache, then publish to peers.
    fn broadcast_item(&self, payload: EventPayload) -> Result<()> {
        if !self.inner.router.is_attached() {
            return Err(SyncError::NotConnected);
        }
        let event = BroadcastEvent::new(self.inner.local_user_id.clone(), payload);
        event.validate()?;

        let command = match &event.payload {
            EventPayload::ItemCreate(item) | EventPayload::ItemUpdate(item) => Command::ApplyItem(item.clone()),
            EventPayload::ItemDelete { id } => Command::RemoveItem(id.clone()),
            _ => return Err(SyncError::Event(crate::error::EventError::Invalid("not an item event"))),
        };
        self.enqueue(command)?;
        self.inner.router.send(&event)
    }

    fn enqueue(&self, command: Command) -> Result<()> {
        let commands = self.inner.commands.lock();
        let tx = commands.as_ref().ok_or(SyncError::NotConnected)?;
        tx.try_send(command).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SyncError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => SyncError::NotConnected,
        })
    }

    // ─── Durable path: store ──────────────────────────────────────────

    /// Upsert into the durable store. Failures stay in `pending_changes`.
    pub async fn persist_item(&self, item: &SyncedItem) -> Result<()> {
        self.inner.reconciler.persist(item).await?;
        Ok(())
    }

    /// Best-effort durable delete.
    pub async fn delete_item(&self, id: &str) -> Result<()> {
        self.inner.reconciler.remove(id).await?;
        Ok(())
    }

    /// Reload every item from the durable store and reseed the cache.
    pub async fn load_all(&self) -> Vec<SyncedItem> {
        let items = self.inner.reconciler.load_all(&self.inner.local_user_id).await;
        let tx = self.inner.commands.lock().clone();
        match tx {
            Some(tx) => {
                if tx.send(Command::ReplaceItems(items.clone())).await.is_err() {
                    self.inner.cache.write().replace_all(items.clone());
                }
            }
            // No loop running: nobody else writes the cache.
            None => self.inner.cache.write().replace_all(items.clone()),
        }
        items
    }

    /// Host-triggered retry of failed durable writes.
    pub async fn retry_failed(&self) -> RetryReport {
        self.inner.reconciler.retry_failed().await
    }

    // ─── Host callbacks ───────────────────────────────────────────────

    pub fn on_event<F>(&self, kind: EventKind, handler: F)
    where
        F: Fn(&BroadcastEvent) + Send + Sync + 'static,
    {
        self.inner.router.on_event(kind, handler);
    }

    /// `handler(item, origin_user_id)` for every peer `item_create`.
    pub fn on_item_create<F>(&self, handler: F)
    where
        F: Fn(&SyncedItem, &str) + Send + Sync + 'static,
    {
        self.inner.router.on_event(EventKind::ItemCreate, move |event| {
            if let EventPayload::ItemCreate(item) = &event.payload {
                handler(item, &event.origin_user_id);
            }
        });
    }

    /// `handler(item, origin_user_id)` for every peer `item_update`.
    pub fn on_item_update<F>(&self, handler: F)
    where
        F: Fn(&SyncedItem, &str) + Send + Sync + 'static,
    {
        self.inner.router.on_event(EventKind::ItemUpdate, move |event| {
            if let EventPayload::ItemUpdate(item) = &event.payload {
                handler(item, &event.origin_user_id);
            }
        });
    }

    /// `handler(item_id, origin_user_id)` for every peer `item_delete`.
    pub fn on_item_delete<F>(&self, handler: F)
    where
        F: Fn(&str, &str) + Send + Sync + 'static,
    {
        self.inner.router.on_event(EventKind::ItemDelete, move |event| {
            if let EventPayload::ItemDelete { id } = &event.payload {
                handler(id, &event.origin_user_id);
            }
        });
    }
}

impl SessionInner {
    fn set_state(&self, state: ConnectionState) {
        self.snapshot.send_modify(|s| s.connection_state = state);
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("room_id", &self.inner.room_id)
            .field("local_user_id", &self.inner.local_user_id)
            .field("connection_state", &self.connection_state())
            .finish()
    }
}

// ─── Event loop ───────────────────────────────────────────────────────

struct EventLoop {
    room_id: RoomId,
    registry: PresenceRegistry,
    events: mpsc::Receiver<ChannelEvent>,
    commands: mpsc::Receiver<Command>,
    status: watch::Receiver<ReconcileStatus>,
    router: Arc<BroadcastRouter>,
    cache: Arc<RwLock<ItemCache>>,
    snapshot: Arc<watch::Sender<SyncSnapshot>>,
}

impl EventLoop {
    async fn run(mut self) {
        loop {
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => {
                        self.on_stream_end();
                        break;
                    }
                },
                Some(command) = self.commands.recv() => self.handle_command(command),
                Ok(()) = self.status.changed() => {
                    let status = *self.status.borrow_and_update();
                    self.snapshot.send_modify(|s| {
                        s.pending_changes = status.pending_changes;
                        s.last_synced_at = status.last_synced_at;
                    });
                }
            }
        }
    }

    fn handle_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::PresenceSync(records) => {
                let count = self.registry.sync(&records);
                log::debug!("Presence sync in room {}: {count} others", self.room_id);
                self.publish_others();
            }
            ChannelEvent::PresenceJoin(record) => self.registry.join(&record),
            ChannelEvent::PresenceLeave(record) => self.registry.leave(&record),
            ChannelEvent::Broadcast { event_type, payload, .. } => {
                if let Some(event) = self.router.accept(&event_type, &payload) {
                    self.apply(&event);
                    self.router.dispatch(&event);
                }
            }
        }
    }

    fn apply(&mut self, event: &BroadcastEvent) {
        let origin = event.origin_user_id.as_str();
        match &event.payload {
            EventPayload::CursorMove(position) => {
                if self.registry.apply_cursor(origin, *position) {
                    self.publish_others();
                }
            }
            EventPayload::SelectionChange { item_ids } => {
                if self.registry.apply_selection(origin, item_ids.clone()) {
                    self.publish_others();
                }
            }
            EventPayload::ItemCreate(item) | EventPayload::ItemUpdate(item) => {
                log::debug!("{} {} from {origin}", event.kind(), item.id);
                self.cache.write().apply(item.clone());
            }
            EventPayload::ItemDelete { id } => {
                log::debug!("item_delete {id} from {origin}");
                self.cache.write().remove(id);
            }
        }
    }

    fn handle_command(&mut self, command: Command) {
        let mut cache = self.cache.write();
        match command {
            Command::ApplyItem(item) => {
                cache.apply(item);
            }
            Command::RemoveItem(id) => {
                cache.remove(&id);
            }
            Command::ReplaceItems(items) => cache.replace_all(items),
        }
    }

    fn publish_others(&self) {
        let others = self.registry.others();
        self.snapshot.send_modify(|s| s.others = others);
    }

    fn on_stream_end(&mut self) {
        log::warn!("Transport stream for room {} ended", self.room_id);
        self.registry.clear();
        self.router.detach();
        self.snapshot.send_modify(|s| {
            s.connection_state = ConnectionState::Disconnected;
            s.others.clear();
        });
    }
}

// ─── Coordinator ──────────────────────────────────────────────────────

/// Owns at most one live session and tears it down on room change.
pub struct SessionCoordinator {
    transport: Arc<dyn Transport>,
    store: Arc<dyn DurableStore>,
    config: SyncConfig,
    current: tokio::sync::Mutex<Option<Session>>,
}

impl SessionCoordinator {
    pub fn new(transport: Arc<dyn Transport>, store: Arc<dyn DurableStore>, config: SyncConfig) -> Self {
        Self {
            transport,
            store,
            config,
            current: tokio::sync::Mutex::new(None),
        }
    }

    /// Join a room. Re-joining the live room returns the same session;
    /// joining another room leaves the current one first.
    pub async fn join(
        &self,
        room_id: &str,
        local_user_id: &str,
        local_user_name: &str,
    ) -> Result<Session> {
        let mut current = self.current.lock().await;

        if let Some(session) = current.take() {
            let same_room = session.room_id() == room_id && session.local_user_id() == local_user_id;
            if same_room && session.connection_state() == ConnectionState::Connected {
                *current = Some(session.clone());
                return Ok(session);
            }
            session.leave().await;
        }

        let session = Session::join(
            self.transport.clone(),
            self.store.clone(),
            self.config.clone(),
            room_id,
            local_user_id,
            local_user_name,
        )
        .await?;
        *current = Some(session.clone());
        Ok(session)
    }

    /// Leave the current room, if any.
    pub async fn leave(&self) {
        let session = self.current.lock().await.take();
        if let Some(session) = session {
            session.leave().await;
        }
    }

    pub async fn current(&self) -> Option<Session> {
        self.current.lock().await.clone()
    }
}
