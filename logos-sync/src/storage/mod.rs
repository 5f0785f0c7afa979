//! Durable store contract and implementations.
//!
//! ```text
//! ┌─────────────┐  upsert / query / delete   ┌──────────────────────┐
//! │ Reconciler  │ ─────────────────────────► │ dyn DurableStore     │
//! └─────────────┘                            ├──────────────────────┤
//!                                            │ MemoryStore (tests)  │
//!                                            │ RocksStore (RocksDB) │
//!                                            └──────────────────────┘
//! ```
//!
//! The store is the system of record. Records are opaque bytes keyed by
//! `(collection, room_id, id)`; an upsert overwrites whatever was there, so
//! the last write to arrive wins.

pub mod memory;
pub mod rocks;

use async_trait::async_trait;

use crate::error::StoreError;
use crate::model::{ItemId, RoomId};

pub use crate::config::StoreConfig;
pub use memory::MemoryStore;
pub use rocks::RocksStore;

/// Primary key of a stored record within a collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordKey {
    pub room_id: RoomId,
    pub id: ItemId,
}

impl RecordKey {
    pub fn new(room_id: impl Into<RoomId>, id: impl Into<ItemId>) -> Self {
        Self {
            room_id: room_id.into(),
            id: id.into(),
        }
    }
}

/// Query filter: every record of one room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordFilter {
    pub room_id: RoomId,
}

impl RecordFilter {
    pub fn room(room_id: impl Into<RoomId>) -> Self {
        Self { room_id: room_id.into() }
    }
}

#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Insert or overwrite the record at `key`.
    async fn upsert(&self, collection: &str, key: &RecordKey, value: Vec<u8>) -> Result<(), StoreError>;

    /// All records matching `filter`, ordered by id.
    async fn query(&self, collection: &str, filter: &RecordFilter) -> Result<Vec<Vec<u8>>, StoreError>;

    /// Delete the record at `key`. Deleting a missing record is not an error.
    async fn delete(&self, collection: &str, key: &RecordKey) -> Result<(), StoreError>;
}
