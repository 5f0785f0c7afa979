//! Presence registry: "who else is in this room right now".
//!
//! ## Update rules
//!
//! ```text
//! transport sync(snapshot) ──► replace everything (minus local user)
//! transport join / leave   ──► log only; the next sync carries the truth
//! cursor_move broadcast    ──► patch `cursor` of an existing entry
//! selection_change         ──► patch `selected_item_ids` of an existing entry
//! ```
//!
//! Entries are only ever created by `sync`. A cursor or selection event for
//! a user the registry has not seen yet is dropped instead of fabricating a
//! partial entry.

use std::collections::HashMap;

use crate::model::{now_millis, CursorPosition, ItemId, PresenceEntry, UserId};
use crate::transport::PresenceRecord;

pub struct PresenceRegistry {
    local_user_id: UserId,
    others: HashMap<UserId, PresenceEntry>,
    /// Unix millis of the last processed snapshot.
    last_sync_at: Option<u64>,
    /// Records dropped because they failed to decode.
    rejected_records: u64,
}

impl PresenceRegistry {
    pub fn new(local_user_id: impl Into<UserId>) -> Self {
        Self {
            local_user_id: local_user_id.into(),
            others: HashMap::new(),
            last_sync_at: None,
            rejected_records: 0,
        }
    }

    /// Replace the whole view with `snapshot`, minus the local user.
    ///
    /// A user present under several transport keys (an old connection that
    /// has not been reaped yet) keeps only the most recently active entry.
    /// Returns the number of other users after the sync.
    pub fn sync(&mut self, snapshot: &[PresenceRecord]) -> usize {
        let mut next: HashMap<UserId, PresenceEntry> = HashMap::with_capacity(snapshot.len());

        for record in snapshot {
            let entry = match PresenceEntry::decode(&record.payload) {
                Ok(entry) => entry,
                Err(e) => {
                    self.rejected_records += 1;
                    log::warn!("Dropping malformed presence record {}: {e}", record.key);
                    continue;
                }
            };
            if entry.user_id.is_empty() || entry.user_id == self.local_user_id {
                continue;
            }
            match next.get(&entry.user_id) {
                Some(existing) if existing.last_active_at > entry.last_active_at => {}
                _ => {
                    next.insert(entry.user_id.clone(), entry);
                }
            }
        }

        self.others = next;
        self.last_sync_at = Some(now_millis());
        self.others.len()
    }

    /// Join notification. Informational only.
    pub fn join(&self, record: &PresenceRecord) {
        match PresenceEntry::decode(&record.payload) {
            Ok(entry) if entry.user_id != self.local_user_id => {
                log::debug!("Presence: {} ({}) joined", entry.display_name, entry.user_id);
            }
            Ok(_) => {}
            Err(_) => log::debug!("Presence: {} joined (undecodable record)", record.key),
        }
    }

    /// Leave notification. Informational only.
    pub fn leave(&self, record: &PresenceRecord) {
        match PresenceEntry::decode(&record.payload) {
            Ok(entry) if entry.user_id != self.local_user_id => {
                log::debug!("Presence: {} ({}) left", entry.display_name, entry.user_id);
            }
            Ok(_) => {}
            Err(_) => log::debug!("Presence: {} left (undecodable record)", record.key),
        }
    }

    /// Patch the cursor of an existing entry. Returns `false` if dropped.
    pub fn apply_cursor(&mut self, user_id: &str, position: CursorPosition) -> bool {
        match self.others.get_mut(user_id) {
            Some(entry) => {
                entry.cursor = Some(position);
                entry.last_active_at = now_millis();
                true
            }
            None => {
                log::trace!("Cursor from unknown user {user_id} dropped");
                false
            }
        }
    }

    /// Patch the selection of an existing entry. Returns `false` if dropped.
    pub fn apply_selection(&mut self, user_id: &str, item_ids: Vec<ItemId>) -> bool {
        match self.others.get_mut(user_id) {
            Some(entry) => {
                entry.selected_item_ids = item_ids;
                entry.last_active_at = now_millis();
                true
            }
            None => {
                log::debug!("Selection from unknown user {user_id} dropped");
                false
            }
        }
    }

    /// Other users, ordered by user id.
    pub fn others(&self) -> Vec<PresenceEntry> {
        let mut others: Vec<PresenceEntry> = self.others.values().cloned().collect();
        others.sort_by(|a, b| a.user_id.cmp(&b.user_id));
        others
    }

    pub fn get(&self, user_id: &str) -> Option<&PresenceEntry> {
        self.others.get(user_id)
    }

    pub fn len(&self) -> usize {
        self.others.len()
    }

    pub fn is_empty(&self) -> bool {
        self.others.is_empty()
    }

    /// Drop all ephemeral state (on disconnect).
    pub fn clear(&mut self) {
        self.others.clear();
        self.last_sync_at = None;
    }

    pub fn local_user_id(&self) -> &str {
        &self.local_user_id
    }

    pub fn last_sync_at(&self) -> Option<u64> {
        self.last_sync_at
    }

    pub fn rejected_records(&self) -> u64 {
        self.rejected_records
    }
}
