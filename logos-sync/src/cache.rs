//! Local projection of durable item state.
//!
//! Every mutation is "set to payload": applying the same create/update
//! twice yields the same map, so duplicate deliveries are harmless.

use std::collections::HashMap;

use crate::model::{ItemId, SyncedItem};

#[derive(Debug, Default, Clone)]
pub struct ItemCache {
    items: HashMap<ItemId, SyncedItem>,
}

impl ItemCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `item` as-is, overwriting any previous version.
    /// Returns the replaced item, if there was one.
    pub fn apply(&mut self, item: SyncedItem) -> Option<SyncedItem> {
        self.items.insert(item.id.clone(), item)
    }

    pub fn remove(&mut self, id: &str) -> Option<SyncedItem> {
        self.items.remove(id)
    }

    /// Reseed from the durable store.
    pub fn replace_all(&mut self, items: Vec<SyncedItem>) {
        self.items = items.into_iter().map(|item| (item.id.clone(), item)).collect();
    }

    pub fn get(&self, id: &str) -> Option<&SyncedItem> {
        self.items.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.items.contains_key(id)
    }

    /// All items, ordered by id.
    pub fn items(&self) -> Vec<SyncedItem> {
        let mut items: Vec<SyncedItem> = self.items.values().cloned().collect();
        items.sort_by(|a, b| a.id.cmp(&b.id));
        items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
