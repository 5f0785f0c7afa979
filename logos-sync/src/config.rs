//! Configuration for sessions, the relay, and the RocksDB store.

use std::path::PathBuf;
use std::time::Duration;

use crate::model::DEFAULT_PALETTE;
use crate::throttle::DEFAULT_CURSOR_WINDOW;

/// Per-session engine configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Minimum interval between outbound cursor broadcasts (default: 50ms)
    pub cursor_window: Duration,
    /// Bounded queue for local commands into the session loop (default: 64)
    pub command_queue_capacity: usize,
    /// Durable store collection holding canvas items
    pub collection: String,
    /// Prefix prepended to the room id to form the channel name
    pub channel_prefix: String,
    /// Seed the item cache from the durable store on join (default: true)
    pub load_on_join: bool,
    /// Colours assigned to participants
    pub palette: Vec<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            cursor_window: DEFAULT_CURSOR_WINDOW,
            command_queue_capacity: 64,
            collection: "canvas_items".to_string(),
            channel_prefix: "room:".to_string(),
            load_on_join: true,
            palette: DEFAULT_PALETTE.iter().map(|c| c.to_string()).collect(),
        }
    }
}

impl SyncConfig {
    /// Channel name for a room.
    pub fn channel_name(&self, room_id: &str) -> String {
        format!("{}{}", self.channel_prefix, room_id)
    }
}

/// Relay server configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Broadcast channel capacity per channel
    pub broadcast_capacity: usize,
    /// Maximum subscribers per channel
    pub max_peers_per_channel: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9191".to_string(),
            broadcast_capacity: 256,
            max_peers_per_channel: 100,
        }
    }
}

impl RelayConfig {
    /// Defaults overridden by `LOGOS_SYNC_BIND`, `LOGOS_SYNC_BROADCAST_CAPACITY`
    /// and `LOGOS_SYNC_MAX_PEERS`. Unparseable values are ignored with a warning.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(bind) = lookup("LOGOS_SYNC_BIND") {
            config.bind_addr = bind;
        }
        if let Some(capacity) = parse_var(&lookup, "LOGOS_SYNC_BROADCAST_CAPACITY") {
            config.broadcast_capacity = capacity;
        }
        if let Some(max_peers) = parse_var(&lookup, "LOGOS_SYNC_MAX_PEERS") {
            config.max_peers_per_channel = max_peers;
        }
        config
    }
}

fn parse_var(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<usize> {
    let raw = lookup(key)?;
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("Ignoring {key}={raw:?}: not a number");
            None
        }
    }
}

/// RocksDB store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database directory path
    pub path: PathBuf,
    /// Block cache size in bytes (default: 64MB)
    pub block_cache_size: usize,
    /// Bloom filter bits per key (default: 10)
    pub bloom_filter_bits: i32,
    /// Enable fsync on every write (default: false)
    pub sync_writes: bool,
    /// Max open files for RocksDB (default: 256)
    pub max_open_files: i32,
    /// Write buffer size (default: 32MB)
    pub write_buffer_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("logos_sync_data"),
            block_cache_size: 64 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 256,
            write_buffer_size: 32 * 1024 * 1024,
        }
    }
}

impl StoreConfig {
    /// Create config for testing (small caches, temp directory).
    pub fn for_testing(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            block_cache_size: 8 * 1024 * 1024,
            bloom_filter_bits: 10,
            sync_writes: false,
            max_open_files: 64,
            write_buffer_size: 4 * 1024 * 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_sync_config_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.cursor_window, Duration::from_millis(50));
        assert_eq!(config.collection, "canvas_items");
        assert_eq!(config.palette.len(), DEFAULT_PALETTE.len());
        assert_eq!(config.channel_name("r1"), "room:r1");
    }

    #[test]
    fn test_relay_config_env_overrides() {
        let config = RelayConfig::from_lookup(lookup_from(&[
            ("LOGOS_SYNC_BIND", "0.0.0.0:7000"),
            ("LOGOS_SYNC_MAX_PEERS", "8"),
        ]));
        assert_eq!(config.bind_addr, "0.0.0.0:7000");
        assert_eq!(config.max_peers_per_channel, 8);
        assert_eq!(config.broadcast_capacity, 256);
    }

    #[test]
    fn test_relay_config_ignores_garbage() {
        let config = RelayConfig::from_lookup(lookup_from(&[("LOGOS_SYNC_BROADCAST_CAPACITY", "lots")]));
        assert_eq!(config.broadcast_capacity, RelayConfig::default().broadcast_capacity);
    }

    #[test]
    fn test_store_config_for_testing() {
        let config = StoreConfig::for_testing("/tmp/x");
        assert_eq!(config.path, PathBuf::from("/tmp/x"));
        assert!(config.block_cache_size < StoreConfig::default().block_cache_size);
    }
}
