//! In-memory durable store.
//!
//! Keeps an arrival-ordered write log next to the records so tests can
//! tell which of several concurrent upserts reached the store last, and
//! can switch reads and writes into a failing mode.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{DurableStore, RecordFilter, RecordKey};
use crate::error::StoreError;

type StoreKey = (String, RecordKey);

/// One applied write, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    Upsert { key: RecordKey, value: Vec<u8> },
    Delete { key: RecordKey },
}

#[derive(Default)]
struct Inner {
    records: BTreeMap<StoreKey, Vec<u8>>,
    log: Vec<WriteOp>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
    fail_writes: AtomicBool,
    fail_reads: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every upsert and delete fail with `Unavailable`.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make every query fail with `Unavailable`.
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Applied writes, oldest first.
    pub async fn write_log(&self) -> Vec<WriteOp> {
        self.inner.read().await.log.clone()
    }

    /// Value of the last upsert applied to `key`, if any.
    pub async fn last_upsert(&self, key: &RecordKey) -> Option<Vec<u8>> {
        self.inner.read().await.log.iter().rev().find_map(|op| match op {
            WriteOp::Upsert { key: k, value } if k == key => Some(value.clone()),
            _ => None,
        })
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.records.is_empty()
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn upsert(&self, collection: &str, key: &RecordKey, value: Vec<u8>) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store writes disabled".to_string()));
        }
        let mut inner = self.inner.write().await;
        inner.records.insert((collection.to_string(), key.clone()), value.clone());
        inner.log.push(WriteOp::Upsert { key: key.clone(), value });
        Ok(())
    }

    async fn query(&self, collection: &str, filter: &RecordFilter) -> Result<Vec<Vec<u8>>, StoreError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store reads disabled".to_string()));
        }
        let inner = self.inner.read().await;
        Ok(inner
            .records
            .iter()
            .filter(|((c, key), _)| c == collection && key.room_id == filter.room_id)
            .map(|(_, value)| value.clone())
            .collect())
    }

    async fn delete(&self, collection: &str, key: &RecordKey) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store writes disabled".to_string()));
        }
        let mut inner = self.inner.write().await;
        inner.records.remove(&(collection.to_string(), key.clone()));
        inner.log.push(WriteOp::Delete { key: key.clone() });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_upsert_overwrites() {
        let store = MemoryStore::new();
        let key = RecordKey::new("r1", "x1");
        store.upsert("items", &key, b"v1".to_vec()).await.unwrap();
        store.upsert("items", &key, b"v2".to_vec()).await.unwrap();

        let values = store.query("items", &RecordFilter::room("r1")).await.unwrap();
        assert_eq!(values, vec![b"v2".to_vec()]);
        assert_eq!(store.write_log().await.len(), 2);
        assert_eq!(store.last_upsert(&key).await, Some(b"v2".to_vec()));
    }

    #[tokio::test]
    async fn test_query_scoped_by_collection_and_room() {
        let store = MemoryStore::new();
        store.upsert("items", &RecordKey::new("r1", "a"), b"a".to_vec()).await.unwrap();
        store.upsert("items", &RecordKey::new("r2", "b"), b"b".to_vec()).await.unwrap();
        store.upsert("other", &RecordKey::new("r1", "c"), b"c".to_vec()).await.unwrap();

        let values = store.query("items", &RecordFilter::room("r1")).await.unwrap();
        assert_eq!(values, vec![b"a".to_vec()]);
    }

    #[tokio::test]
    async fn test_delete_missing_is_ok() {
        let store = MemoryStore::new();
        store.delete("items", &RecordKey::new("r1", "nope")).await.unwrap();
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let store = MemoryStore::new();
        let key = RecordKey::new("r1", "x1");

        store.set_fail_writes(true);
        assert!(matches!(
            store.upsert("items", &key, vec![]).await,
            Err(StoreError::Unavailable(_))
        ));
        assert!(store.write_log().await.is_empty());

        store.set_fail_writes(false);
        store.set_fail_reads(true);
        store.upsert("items", &key, vec![]).await.unwrap();
        assert!(store.query("items", &RecordFilter::room("r1")).await.is_err());
    }
}
