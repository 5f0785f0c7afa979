//! RocksDB-backed durable store.
//!
//! Column families:
//! - `records` — item records, LZ4 compressed, keyed by
//!   `len(collection) <collection> len(room_id) <room_id> <id>`
//!   with each length a big-endian `u32`
//!
//! All records of a room share the length-prefixed collection and room
//! segments, so a room query is one forward prefix scan in id order. The
//! lengths keep segments apart whatever bytes ids and rooms contain.
//!
//! RocksDB calls block, so the async [`DurableStore`] impl runs every
//! operation on the blocking pool.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use rocksdb::{
    BlockBasedOptions, Cache, ColumnFamilyDescriptor, DBCompressionType, DBWithThreadMode,
    Direction, IteratorMode, Options, SingleThreaded, WriteBatch, WriteOptions,
};

use super::{DurableStore, RecordFilter, RecordKey};
use crate::config::StoreConfig;
use crate::error::StoreError;

const CF_RECORDS: &str = "records";

const COLUMN_FAMILIES: &[&str] = &[CF_RECORDS];

/// Synchronous core, shared with blocking tasks.
struct RocksInner {
    db: DBWithThreadMode<SingleThreaded>,
    config: StoreConfig,
}

pub struct RocksStore {
    inner: Arc<RocksInner>,
}

impl RocksStore {
    /// Open the store at the configured path, creating it if missing.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(config.max_open_files);
        db_opts.set_keep_log_file_num(5);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Self::cf_options(&config)))
            .collect();

        let db = DBWithThreadMode::<SingleThreaded>::open_cf_descriptors(
            &db_opts,
            &config.path,
            cf_descriptors,
        )?;

        log::info!("Opened durable store at {}", config.path.display());
        Ok(Self {
            inner: Arc::new(RocksInner { db, config }),
        })
    }

    fn cf_options(config: &StoreConfig) -> Options {
        let mut opts = Options::default();

        let mut block_opts = BlockBasedOptions::default();
        let cache = Cache::new_lru_cache(config.block_cache_size);
        block_opts.set_block_cache(&cache);
        block_opts.set_bloom_filter(config.bloom_filter_bits as f64, false);
        opts.set_block_based_table_factory(&block_opts);

        // Values are LZ4-compressed before they reach RocksDB.
        opts.set_compression_type(DBCompressionType::None);
        opts.set_write_buffer_size(config.write_buffer_size);
        opts.set_max_write_buffer_number(2);
        opts
    }

    // ─── Synchronous API ──────────────────────────────────────────────

    pub fn put(&self, collection: &str, key: &RecordKey, value: &[u8]) -> Result<(), StoreError> {
        self.inner.put(collection, key, value)
    }

    pub fn get(&self, collection: &str, key: &RecordKey) -> Result<Option<Vec<u8>>, StoreError> {
        self.inner.get(collection, key)
    }

    pub fn scan(&self, collection: &str, filter: &RecordFilter) -> Result<Vec<Vec<u8>>, StoreError> {
        self.inner.scan(collection, filter)
    }

    pub fn remove(&self, collection: &str, key: &RecordKey) -> Result<(), StoreError> {
        self.inner.remove(collection, key)
    }

    /// Delete every record of a room. Returns how many were removed.
    pub fn clear_room(&self, collection: &str, room_id: &str) -> Result<u64, StoreError> {
        self.inner.clear_room(collection, room_id)
    }

    /// Flush memtables to disk.
    pub fn flush(&self) -> Result<(), StoreError> {
        self.inner.db.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.inner.config.path
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&RocksInner) -> Result<T, StoreError> + Send + 'static,
    {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || op(&inner))
            .await
            .map_err(|e| StoreError::Unavailable(format!("blocking task failed: {e}")))?
    }
}

impl RocksInner {
    fn cf(&self, name: &str) -> Result<&rocksdb::ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Column family '{name}' not found")))
    }

    fn write_opts(&self) -> WriteOptions {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.config.sync_writes);
        write_opts
    }

    fn put(&self, collection: &str, key: &RecordKey, value: &[u8]) -> Result<(), StoreError> {
        let cf = self.cf(CF_RECORDS)?;
        let compressed = lz4_flex::compress_prepend_size(value);
        self.db
            .put_cf_opt(cf, record_key(collection, key), compressed, &self.write_opts())?;
        Ok(())
    }

    fn get(&self, collection: &str, key: &RecordKey) -> Result<Option<Vec<u8>>, StoreError> {
        let cf = self.cf(CF_RECORDS)?;
        match self.db.get_cf(cf, record_key(collection, key))? {
            Some(compressed) => Ok(Some(decompress(&compressed)?)),
            None => Ok(None),
        }
    }

    fn scan(&self, collection: &str, filter: &RecordFilter) -> Result<Vec<Vec<u8>>, StoreError> {
        let cf = self.cf(CF_RECORDS)?;
        let prefix = room_prefix(collection, &filter.room_id);

        let mut values = Vec::new();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            values.push(decompress(&value)?);
        }
        Ok(values)
    }

    fn remove(&self, collection: &str, key: &RecordKey) -> Result<(), StoreError> {
        let cf = self.cf(CF_RECORDS)?;
        self.db
            .delete_cf_opt(cf, record_key(collection, key), &self.write_opts())?;
        Ok(())
    }

    fn clear_room(&self, collection: &str, room_id: &str) -> Result<u64, StoreError> {
        let cf = self.cf(CF_RECORDS)?;
        let prefix = room_prefix(collection, room_id);

        let mut batch = WriteBatch::default();
        let mut count = 0u64;
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward));
        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            batch.delete_cf(cf, &key);
            count += 1;
        }

        if count > 0 {
            self.db.write_opt(batch, &self.write_opts())?;
        }
        Ok(count)
    }
}

fn push_segment(bytes: &mut Vec<u8>, segment: &str) {
    // Segments are ids and names, far below u32::MAX.
    bytes.extend_from_slice(&(segment.len() as u32).to_be_bytes());
    bytes.extend_from_slice(segment.as_bytes());
}

fn room_prefix(collection: &str, room_id: &str) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(collection.len() + room_id.len() + 8);
    push_segment(&mut prefix, collection);
    push_segment(&mut prefix, room_id);
    prefix
}

fn record_key(collection: &str, key: &RecordKey) -> Vec<u8> {
    let mut bytes = room_prefix(collection, &key.room_id);
    bytes.extend_from_slice(key.id.as_bytes());
    bytes
}

fn decompress(bytes: &[u8]) -> Result<Vec<u8>, StoreError> {
    lz4_flex::decompress_size_prepended(bytes).map_err(|e| StoreError::Compression(e.to_string()))
}

#[async_trait]
impl DurableStore for RocksStore {
    async fn upsert(&self, collection: &str, key: &RecordKey, value: Vec<u8>) -> Result<(), StoreError> {
        let collection = collection.to_string();
        let key = key.clone();
        self.blocking(move |inner| inner.put(&collection, &key, &value)).await
    }

    async fn query(&self, collection: &str, filter: &RecordFilter) -> Result<Vec<Vec<u8>>, StoreError> {
        let collection = collection.to_string();
        let filter = filter.clone();
        self.blocking(move |inner| inner.scan(&collection, &filter)).await
    }

    async fn delete(&self, collection: &str, key: &RecordKey) -> Result<(), StoreError> {
        let collection = collection.to_string();
        let key = key.clone();
        self.blocking(move |inner| inner.remove(&collection, &key)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_temp() -> (TempDir, RocksStore) {
        let dir = TempDir::new().unwrap();
        let store = RocksStore::open(StoreConfig::for_testing(dir.path())).unwrap();
        (dir, store)
    }

    #[test]
    fn test_put_get_roundtrip_compressed() {
        let (_dir, store) = open_temp();
        let key = RecordKey::new("r1", "x1");
        let value = br#"{"id":"x1","type":"note","text":"hello hello hello hello"}"#;

        store.put("canvas_items", &key, value).unwrap();
        assert_eq!(store.get("canvas_items", &key).unwrap(), Some(value.to_vec()));
        assert_eq!(store.get("canvas_items", &RecordKey::new("r1", "nope")).unwrap(), None);
    }

    #[test]
    fn test_scan_stops_at_room_boundary() {
        let (_dir, store) = open_temp();
        store.put("items", &RecordKey::new("r1", "b"), b"b").unwrap();
        store.put("items", &RecordKey::new("r1", "a"), b"a").unwrap();
        // "r10" shares the textual prefix "r1" but not the length.
        store.put("items", &RecordKey::new("r10", "c"), b"c").unwrap();
        store.put("other", &RecordKey::new("r1", "d"), b"d").unwrap();

        let values = store.scan("items", &RecordFilter::room("r1")).unwrap();
        assert_eq!(values, vec![b"a".to_vec(), b"b".to_vec()]);
    }

    #[test]
    fn test_put_overwrites_and_remove() {
        let (_dir, store) = open_temp();
        let key = RecordKey::new("r1", "x1");
        store.put("items", &key, b"v1").unwrap();
        store.put("items", &key, b"v2").unwrap();
        assert_eq!(store.scan("items", &RecordFilter::room("r1")).unwrap(), vec![b"v2".to_vec()]);

        store.remove("items", &key).unwrap();
        store.remove("items", &key).unwrap();
        assert!(store.scan("items", &RecordFilter::room("r1")).unwrap().is_empty());
    }

    #[test]
    fn test_clear_room() {
        let (_dir, store) = open_temp();
        for id in ["a", "b", "c"] {
            store.put("items", &RecordKey::new("r1", id), id.as_bytes()).unwrap();
        }
        store.put("items", &RecordKey::new("r2", "z"), b"z").unwrap();

        assert_eq!(store.clear_room("items", "r1").unwrap(), 3);
        assert!(store.scan("items", &RecordFilter::room("r1")).unwrap().is_empty());
        assert_eq!(store.scan("items", &RecordFilter::room("r2")).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_async_contract() {
        let (_dir, store) = open_temp();
        let key = RecordKey::new("r1", "x1");
        store.upsert("items", &key, b"v".to_vec()).await.unwrap();
        assert_eq!(
            store.query("items", &RecordFilter::room("r1")).await.unwrap(),
            vec![b"v".to_vec()]
        );
        store.delete("items", &key).await.unwrap();
        assert!(store.query("items", &RecordFilter::room("r1")).await.unwrap().is_empty());
    }

    #[test]
    fn test_nul_bytes_do_not_collide_across_rooms() {
        let (_dir, store) = open_temp();
        store.put("items", &RecordKey::new("r1", "a\0b"), b"first").unwrap();
        store.put("items", &RecordKey::new("r1\0a", "b"), b"second").unwrap();

        assert_eq!(
            store.get("items", &RecordKey::new("r1", "a\0b")).unwrap(),
            Some(b"first".to_vec())
        );
        assert_eq!(store.scan("items", &RecordFilter::room("r1")).unwrap(), vec![b"first".to_vec()]);
        assert_eq!(store.scan("items", &RecordFilter::room("r1\0a")).unwrap(), vec![b"second".to_vec()]);
        assert_eq!(store.clear_room("items", "r1").unwrap(), 1);
        assert_eq!(
            store.get("items", &RecordKey::new("r1\0a", "b")).unwrap(),
            Some(b"second".to_vec())
        );
    }
}
