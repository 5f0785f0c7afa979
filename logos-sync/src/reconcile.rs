//! Reconciler: local mutations → durable store.
//!
//! ## Pending changes
//!
//! ```text
//! pending_changes = in_flight + Σ ledger[item].failures
//!
//! persist(item) ── in_flight += 1 ──► upsert ──┬─ ok ──► clear ledger[item], in_flight -= 1
//!                                             └─ err ─► ledger[item].failures += 1, in_flight -= 1
//! retry_failed() ── for each ledger item ──► upsert newest value ──┬─ ok ──► clear ledger[item]
//!                                                                 └─ err ─► keep entry
//! ```
//!
//! Every failed write counts once, so two failed edits of the same item
//! leave `pending_changes` at 2. The ledger replays only the newest failed
//! value per item. Because writes are whole-object overwrites, a later
//! successful write of that item (from `persist` or a retry) lands every
//! earlier unsynced version and clears all of the item's units at once.
//!
//! Writes to one item are serialised by a per-item lock held across the
//! upsert and the ledger update, so a retry can never land an older value
//! after a newer `persist` of the same item. A retried entry stays in the
//! ledger until its upsert returns, which keeps `pending_changes` from
//! dipping while the retry is in flight.
//!
//! Nothing retries on its own: a failed write stays visible until the host
//! calls [`Reconciler::retry_failed`] or a newer write to the same item
//! succeeds. Conflict policy: the store keeps whichever upsert arrives last.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{watch, OwnedMutexGuard};

use crate::error::StoreError;
use crate::model::{now_millis, ItemId, RoomId, SyncedItem};
use crate::storage::{DurableStore, RecordFilter, RecordKey};

/// Durable-path state surfaced to the host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileStatus {
    /// Writes started but not yet confirmed durable: in flight plus every
    /// failed write not yet superseded or retried.
    pub pending_changes: usize,
    /// Items whose newest write failed.
    pub failed_writes: usize,
    /// Unix millis of the last successful write or load.
    pub last_synced_at: Option<u64>,
}

/// Result of one [`Reconciler::retry_failed`] pass, counted per item.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryReport {
    pub succeeded: usize,
    pub failed: usize,
}

#[derive(Debug, Clone)]
struct FailedWrite {
    key: RecordKey,
    /// Newest failed value.
    value: Vec<u8>,
    /// Failed writes this entry stands for.
    failures: usize,
    attempts: u32,
}

#[derive(Debug, Default)]
struct PendingState {
    in_flight: usize,
    ledger: Vec<FailedWrite>,
}

impl PendingState {
    fn pending(&self) -> usize {
        self.in_flight + self.ledger.iter().map(|entry| entry.failures).sum::<usize>()
    }
}

type KeyLock = Arc<tokio::sync::Mutex<()>>;

pub struct Reconciler {
    store: Arc<dyn DurableStore>,
    room_id: RoomId,
    collection: String,
    pending: Mutex<PendingState>,
    key_locks: Mutex<HashMap<RecordKey, KeyLock>>,
    /// 0 = never.
    last_synced_at: AtomicU64,
    status: watch::Sender<ReconcileStatus>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn DurableStore>, room_id: impl Into<RoomId>, collection: impl Into<String>) -> Self {
        let (status, _) = watch::channel(ReconcileStatus::default());
        Self {
            store,
            room_id: room_id.into(),
            collection: collection.into(),
            pending: Mutex::new(PendingState::default()),
            key_locks: Mutex::new(HashMap::new()),
            last_synced_at: AtomicU64::new(0),
            status,
        }
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Upsert `item` keyed by `(room_id, item.id)`.
    ///
    /// On failure the error is logged and returned, and the write stays
    /// counted in `pending_changes`.
    pub async fn persist(&self, item: &SyncedItem) -> Result<(), StoreError> {
        let value = serde_json::to_vec(item).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let key = RecordKey::new(self.room_id.clone(), item.id.clone());

        self.pending.lock().in_flight += 1;
        self.publish();

        let guard = self.lock_key(&key).await;
        let result = self.store.upsert(&self.collection, &key, value.clone()).await;
        {
            let mut pending = self.pending.lock();
            match &result {
                Ok(()) => {
                    supersede(&mut pending.ledger, &key);
                    self.mark_synced();
                    log::debug!("Persisted item {} in room {}", key.id, key.room_id);
                }
                Err(e) => {
                    log::error!("Failed to persist item {} in room {}: {e}", key.id, key.room_id);
                    record_failure(&mut pending.ledger, &key, value);
                }
            }
            pending.in_flight -= 1;
        }
        self.unlock_key(&key, guard);

        self.publish();
        result
    }

    /// Read every item of the room. Never fails: an unreachable store or an
    /// undecodable record is logged and yields fewer (or zero) items.
    pub async fn load_all(&self, local_user_id: &str) -> Vec<SyncedItem> {
        let records = match self
            .store
            .query(&self.collection, &RecordFilter::room(self.room_id.clone()))
            .await
        {
            Ok(records) => records,
            Err(e) => {
                log::warn!(
                    "Could not load items for room {} (user {local_user_id}): {e}",
                    self.room_id
                );
                return Vec::new();
            }
        };

        let total = records.len();
        let items: Vec<SyncedItem> = records
            .iter()
            .filter_map(|bytes| match serde_json::from_slice::<SyncedItem>(bytes) {
                Ok(item) => Some(item),
                Err(e) => {
                    log::warn!("Skipping undecodable record in room {}: {e}", self.room_id);
                    None
                }
            })
            .collect();

        self.mark_synced();
        self.publish();
        log::info!(
            "Loaded {}/{total} items for room {} (user {local_user_id})",
            items.len(),
            self.room_id
        );
        items
    }

    /// Delete an item. Best-effort: a failure is logged and not retried.
    pub async fn remove(&self, item_id: &str) -> Result<(), StoreError> {
        let key = RecordKey::new(self.room_id.clone(), item_id);

        self.pending.lock().in_flight += 1;
        self.publish();

        let guard = self.lock_key(&key).await;
        let result = self.store.delete(&self.collection, &key).await;
        {
            let mut pending = self.pending.lock();
            match &result {
                Ok(()) => {
                    supersede(&mut pending.ledger, &key);
                    self.mark_synced();
                }
                Err(e) => log::error!("Failed to delete item {item_id} in room {}: {e}", self.room_id),
            }
            pending.in_flight -= 1;
        }
        self.unlock_key(&key, guard);

        self.publish();
        result
    }

    /// Re-attempt every failed item once, with its newest failed value.
    pub async fn retry_failed(&self) -> RetryReport {
        let keys: Vec<RecordKey> = self.pending.lock().ledger.iter().map(|entry| entry.key.clone()).collect();
        let mut report = RetryReport::default();

        for key in keys {
            let guard = self.lock_key(&key).await;
            // Re-read under the item lock: a newer write may have landed.
            let entry = {
                let mut pending = self.pending.lock();
                pending.ledger.iter_mut().find(|entry| entry.key == key).map(|entry| {
                    entry.attempts += 1;
                    (entry.value.clone(), entry.attempts)
                })
            };
            let Some((value, attempts)) = entry else {
                self.unlock_key(&key, guard);
                continue;
            };

            match self.store.upsert(&self.collection, &key, value).await {
                Ok(()) => {
                    supersede(&mut self.pending.lock().ledger, &key);
                    self.mark_synced();
                    report.succeeded += 1;
                    log::info!("Retried item {} after {attempts} attempts", key.id);
                }
                Err(e) => {
                    report.failed += 1;
                    log::warn!("Retry of item {} failed (attempt {attempts}): {e}", key.id);
                }
            }
            self.unlock_key(&key, guard);
            self.publish();
        }

        report
    }

    pub fn pending_changes(&self) -> usize {
        self.pending.lock().pending()
    }

    pub fn failed_writes(&self) -> usize {
        self.pending.lock().ledger.len()
    }

    /// Item ids with a failed, not yet retried write.
    pub fn failed_item_ids(&self) -> Vec<ItemId> {
        self.pending.lock().ledger.iter().map(|entry| entry.key.id.clone()).collect()
    }

    pub fn last_synced_at(&self) -> Option<u64> {
        match self.last_synced_at.load(Ordering::SeqCst) {
            0 => None,
            ms => Some(ms),
        }
    }

    pub fn status(&self) -> ReconcileStatus {
        let (pending_changes, failed_writes) = {
            let pending = self.pending.lock();
            (pending.pending(), pending.ledger.len())
        };
        ReconcileStatus {
            pending_changes,
            failed_writes,
            last_synced_at: self.last_synced_at(),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ReconcileStatus> {
        self.status.subscribe()
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    fn publish(&self) {
        self.status.send_replace(self.status());
    }

    fn mark_synced(&self) {
        self.last_synced_at.store(now_millis().max(1), Ordering::SeqCst);
    }

    async fn lock_key(&self, key: &RecordKey) -> OwnedMutexGuard<()> {
        let lock = self.key_locks.lock().entry(key.clone()).or_default().clone();
        lock.lock_owned().await
    }

    fn unlock_key(&self, key: &RecordKey, guard: OwnedMutexGuard<()>) {
        drop(guard);
        let mut locks = self.key_locks.lock();
        // Only the map holds it: nobody is waiting.
        if locks.get(key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(key);
        }
    }
}

/// A successful write to `key` lands every earlier version of the item.
fn supersede(ledger: &mut Vec<FailedWrite>, key: &RecordKey) {
    let before = ledger.len();
    ledger.retain(|entry| &entry.key != key);
    if ledger.len() != before {
        log::debug!("Cleared failed writes for item {}", key.id);
    }
}

fn record_failure(ledger: &mut Vec<FailedWrite>, key: &RecordKey, value: Vec<u8>) {
    match ledger.iter_mut().find(|entry| &entry.key == key) {
        Some(entry) => {
            entry.value = value;
            entry.failures += 1;
        }
        None => ledger.push(FailedWrite {
            key: key.clone(),
            value,
            failures: 1,
            attempts: 1,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use async_trait::async_trait;
    use std::time::Duration;

    /// Memory store that holds writes carrying `"v":1` for a while.
    struct SlowFirstVersionStore {
        inner: MemoryStore,
    }

    #[async_trait]
    impl DurableStore for SlowFirstVersionStore {
        async fn upsert(&self, collection: &str, key: &RecordKey, value: Vec<u8>) -> Result<(), StoreError> {
            let first_version = value.windows(5).any(|w| w == b"\"v\":1");
            if first_version {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            self.inner.upsert(collection, key, value).await
        }

        async fn query(&self, collection: &str, filter: &RecordFilter) -> Result<Vec<Vec<u8>>, StoreError> {
            self.inner.query(collection, filter).await
        }

        async fn delete(&self, collection: &str, key: &RecordKey) -> Result<(), StoreError> {
            self.inner.delete(collection, key).await
        }
    }

    fn setup() -> (Arc<MemoryStore>, Reconciler) {
        let store = Arc::new(MemoryStore::new());
        let reconciler = Reconciler::new(store.clone(), "r1", "canvas_items");
        (store, reconciler)
    }

    #[tokio::test]
    async fn test_persist_then_load() {
        let (_store, reconciler) = setup();
        let item = SyncedItem::new("x1", "note").with_field("text", "hi");

        reconciler.persist(&item).await.unwrap();
        assert_eq!(reconciler.pending_changes(), 0);
        assert!(reconciler.last_synced_at().is_some());

        assert_eq!(reconciler.load_all("me").await, vec![item]);
    }

    #[tokio::test]
    async fn test_failed_persist_stays_pending() {
        let (store, reconciler) = setup();
        store.set_fail_writes(true);

        let err = reconciler.persist(&SyncedItem::new("x1", "note")).await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
        assert_eq!(reconciler.pending_changes(), 1);
        assert_eq!(reconciler.failed_item_ids(), vec!["x1"]);
        assert!(reconciler.last_synced_at().is_none());
    }

    #[tokio::test]
    async fn test_retry_failed_clears_pending() {
        let (store, reconciler) = setup();
        store.set_fail_writes(true);
        reconciler.persist(&SyncedItem::new("x1", "note")).await.ok();
        reconciler.persist(&SyncedItem::new("x2", "note")).await.ok();
        assert_eq!(reconciler.pending_changes(), 2);

        let report = reconciler.retry_failed().await;
        assert_eq!(report, RetryReport { succeeded: 0, failed: 2 });
        assert_eq!(reconciler.pending_changes(), 2);

        store.set_fail_writes(false);
        let report = reconciler.retry_failed().await;
        assert_eq!(report, RetryReport { succeeded: 2, failed: 0 });
        assert_eq!(reconciler.pending_changes(), 0);
        assert_eq!(reconciler.load_all("me").await.len(), 2);
    }

    #[tokio::test]
    async fn test_ledger_keeps_newest_value_per_item() {
        let (store, reconciler) = setup();
        store.set_fail_writes(true);
        reconciler.persist(&SyncedItem::new("x1", "note").with_field("v", 1)).await.ok();
        reconciler.persist(&SyncedItem::new("x1", "note").with_field("v", 2)).await.ok();
        assert_eq!(reconciler.failed_writes(), 1);
        assert_eq!(reconciler.failed_item_ids(), vec!["x1"]);
        // Each failed edit counts.
        assert_eq!(reconciler.pending_changes(), 2);

        store.set_fail_writes(false);
        assert_eq!(reconciler.retry_failed().await, RetryReport { succeeded: 1, failed: 0 });
        assert_eq!(reconciler.pending_changes(), 0);
        let items = reconciler.load_all("me").await;
        assert_eq!(items[0].field("v"), Some(&serde_json::json!(2)));
    }

    #[tokio::test]
    async fn test_successful_write_supersedes_failed_one() {
        let (store, reconciler) = setup();
        store.set_fail_writes(true);
        reconciler.persist(&SyncedItem::new("x1", "note").with_field("v", 1)).await.ok();

        store.set_fail_writes(false);
        reconciler.persist(&SyncedItem::new("x1", "note").with_field("v", 2)).await.unwrap();
        assert_eq!(reconciler.pending_changes(), 0);

        // Nothing stale left to resurrect.
        assert_eq!(reconciler.retry_failed().await, RetryReport::default());
        let items = reconciler.load_all("me").await;
        assert_eq!(items[0].field("v"), Some(&serde_json::json!(2)));
    }

    #[tokio::test]
    async fn test_load_all_unreachable_returns_empty() {
        let (store, reconciler) = setup();
        reconciler.persist(&SyncedItem::new("x1", "note")).await.unwrap();
        store.set_fail_reads(true);
        assert!(reconciler.load_all("me").await.is_empty());
    }

    #[tokio::test]
    async fn test_load_all_skips_undecodable_records() {
        let (store, reconciler) = setup();
        reconciler.persist(&SyncedItem::new("x1", "note")).await.unwrap();
        store
            .upsert("canvas_items", &RecordKey::new("r1", "bad"), b"not json".to_vec())
            .await
            .unwrap();

        let items = reconciler.load_all("me").await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].id, "x1");
    }

    #[tokio::test]
    async fn test_remove_is_best_effort() {
        let (store, reconciler) = setup();
        reconciler.persist(&SyncedItem::new("x1", "note")).await.unwrap();

        store.set_fail_writes(true);
        assert!(reconciler.remove("x1").await.is_err());
        assert_eq!(reconciler.pending_changes(), 0, "deletes are not retried");

        store.set_fail_writes(false);
        reconciler.remove("x1").await.unwrap();
        assert!(reconciler.load_all("me").await.is_empty());
    }

    #[tokio::test]
    async fn test_status_is_published() {
        let (store, reconciler) = setup();
        let rx = reconciler.subscribe();
        store.set_fail_writes(true);
        reconciler.persist(&SyncedItem::new("x1", "note")).await.ok();

        let status = *rx.borrow();
        assert_eq!(status.pending_changes, 1);
        assert_eq!(status.failed_writes, 1);
    }

    #[tokio::test]
    async fn test_retry_never_overwrites_newer_write() {
        let store = Arc::new(SlowFirstVersionStore { inner: MemoryStore::new() });
        let reconciler = Arc::new(Reconciler::new(store.clone(), "r1", "canvas_items"));

        store.inner.set_fail_writes(true);
        reconciler.persist(&SyncedItem::new("x1", "note").with_field("v", 1)).await.ok();
        store.inner.set_fail_writes(false);

        let retrying = reconciler.clone();
        let retry = tokio::spawn(async move { retrying.retry_failed().await });
        // Let the retry reach its slow upsert of v1.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(reconciler.pending_changes(), 1, "retried write still counts");

        reconciler.persist(&SyncedItem::new("x1", "note").with_field("v", 2)).await.unwrap();
        retry.await.unwrap();

        let items = reconciler.load_all("me").await;
        assert_eq!(items[0].field("v"), Some(&serde_json::json!(2)));
        assert_eq!(reconciler.pending_changes(), 0);
    }

    #[tokio::test]
    async fn test_pending_never_dips_during_retry() {
        let store = Arc::new(SlowFirstVersionStore { inner: MemoryStore::new() });
        let reconciler = Arc::new(Reconciler::new(store.clone(), "r1", "canvas_items"));
        let rx = reconciler.subscribe();

        store.inner.set_fail_writes(true);
        reconciler.persist(&SyncedItem::new("x1", "note").with_field("v", 1)).await.ok();
        store.inner.set_fail_writes(false);

        let retrying = reconciler.clone();
        let retry = tokio::spawn(async move { retrying.retry_failed().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(reconciler.status().pending_changes, 1);
        assert_eq!(reconciler.failed_writes(), 1);

        assert_eq!(retry.await.unwrap(), RetryReport { succeeded: 1, failed: 0 });
        assert_eq!(rx.borrow().pending_changes, 0);
    }

    #[tokio::test]
    async fn test_successful_write_clears_every_failed_edit() {
        let (store, reconciler) = setup();
        store.set_fail_writes(true);
        for v in 1..=3 {
            reconciler.persist(&SyncedItem::new("x1", "note").with_field("v", v)).await.ok();
        }
        reconciler.persist(&SyncedItem::new("x2", "note")).await.ok();
        assert_eq!(reconciler.pending_changes(), 4);

        store.set_fail_writes(false);
        reconciler.persist(&SyncedItem::new("x1", "note").with_field("v", 4)).await.unwrap();
        assert_eq!(reconciler.pending_changes(), 1);
        assert_eq!(reconciler.failed_item_ids(), vec!["x2"]);
    }
}
