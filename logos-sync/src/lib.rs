//! # logos-sync — Real-time multi-user canvas sync engine
//!
//! Keeps a shared canvas room consistent across participants: who is here,
//! where their cursors are, and which items exist.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ Session (per room membership)                │
//! │                                              │
//! │  CursorThrottler ──┐                         │       ┌─────────────┐
//! │                    ▼                         │ track │             │
//! │  BroadcastRouter ─────── send ───────────────┼──────►│  Transport  │
//! │        ▲                                     │       │ (LocalHub / │
//! │        │ accept + dispatch                   │◄──────┤ WsTransport)│
//! │  EventLoop ──► PresenceRegistry, ItemCache   │events └──────┬──────┘
//! │                                              │              │
//! │  Reconciler ── upsert / query / delete ──┐   │       ┌──────┴──────┐
//! └──────────────────────────────────────────┼───┘       │ RelayServer │
//!                                            ▼           └─────────────┘
//!                                    ┌──────────────┐
//!                                    │ DurableStore │
//!                                    │ (Rocks/Mem)  │
//!                                    └──────────────┘
//! ```
//!
//! Two paths, never mixed:
//! - **Ephemeral** — cursors, selections, presence. Broadcast only, lost on
//!   disconnect.
//! - **Durable** — item create/update/delete. Broadcast for low-latency
//!   fan-out, persisted through the [`Reconciler`] as the source of truth.
//!
//! ## Modules
//!
//! - [`session`] — Session lifecycle and the single-writer event loop
//! - [`presence`] — Who else is in the room
//! - [`throttle`] — Outbound cursor rate limiting
//! - [`broadcast`] — Typed event routing to host handlers
//! - [`reconcile`] — Durable writes with failure accounting
//! - [`transport`] — Pub/sub contract, in-process hub, WebSocket client
//! - [`server`] — WebSocket relay in front of a hub
//! - [`storage`] — Durable store contract, RocksDB and in-memory stores

pub mod broadcast;
pub mod cache;
pub mod config;
pub mod error;
pub mod model;
pub mod presence;
pub mod protocol;
pub mod reconcile;
pub mod server;
pub mod session;
pub mod storage;
pub mod throttle;
pub mod transport;

// Re-exports for convenience
pub use broadcast::{BroadcastRouter, RouterStats};
pub use config::{RelayConfig, StoreConfig, SyncConfig};
pub use error::{EventError, FrameError, StoreError, SyncError, TransportError};
pub use model::{
    ConnectionState, CursorPosition, PresenceEntry, SyncedItem, ViewState,
};
pub use presence::PresenceRegistry;
pub use protocol::{BroadcastEvent, EventKind, EventPayload};
pub use reconcile::{ReconcileStatus, Reconciler, RetryReport};
pub use server::{RelayServer, RelayStats};
pub use session::{Session, SessionCoordinator, SyncSnapshot};
pub use storage::{DurableStore, MemoryStore, RecordFilter, RecordKey, RocksStore};
pub use throttle::CursorThrottler;
pub use transport::{ChannelEvent, ChannelHandle, LocalHub, Transport, WsTransport};
