//! Data model shared by every component of the engine.
//!
//! Two families of state live here and must never be mixed:
//!
//! - **Ephemeral** — [`PresenceEntry`], [`CursorPosition`], [`ViewState`].
//!   Rebuilt from scratch on every connection.
//! - **Durable** — [`SyncedItem`]. Owned by the durable store; the local
//!   copy is a disposable projection.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

pub type RoomId = String;
pub type UserId = String;
pub type ItemId = String;

/// Fixed cursor/selection palette. A session draws its colour once, at creation.
pub const DEFAULT_PALETTE: &[&str] = &[
    "#E57373", "#F06292", "#BA68C8", "#7986CB",
    "#4FC3F7", "#4DB6AC", "#AED581", "#FFB74D",
];

/// Pointer position in canvas (world) coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CursorPosition {
    pub x: f64,
    pub y: f64,
}

impl CursorPosition {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

/// The part of the canvas a participant is looking at.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ViewState {
    pub x: f64,
    pub y: f64,
    pub zoom: f64,
}

/// Live metadata for one participant of a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub user_id: UserId,
    pub display_name: String,
    #[serde(default)]
    pub avatar_ref: Option<String>,
    #[serde(default)]
    pub cursor: Option<CursorPosition>,
    #[serde(default)]
    pub selected_item_ids: Vec<ItemId>,
    #[serde(default)]
    pub current_view: Option<ViewState>,
    /// Unix milliseconds of the last observed activity.
    pub last_active_at: u64,
    pub color: String,
}

impl PresenceEntry {
    pub fn new(user_id: impl Into<UserId>, display_name: impl Into<String>, color: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
            avatar_ref: None,
            cursor: None,
            selected_item_ids: Vec::new(),
            current_view: None,
            last_active_at: now_millis(),
            color: color.into(),
        }
    }

    pub fn with_avatar(mut self, avatar_ref: impl Into<String>) -> Self {
        self.avatar_ref = Some(avatar_ref.into());
        self
    }

    /// Encode as a transport presence record.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decode a transport presence record.
    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// A canvas item mirrored to the durable store.
///
/// `id` and `type` are fixed; everything else the host attaches
/// (geometry, text, style) rides along in `fields` untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncedItem {
    pub id: ItemId,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<u64>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl SyncedItem {
    pub fn new(id: impl Into<ItemId>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: kind.into(),
            author_id: None,
            updated_at: None,
            fields: Map::new(),
        }
    }

    pub fn with_author(mut self, author_id: impl Into<UserId>) -> Self {
        self.author_id = Some(author_id.into());
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }
}

/// Session connection state machine.
///
/// `Disconnected → Connecting → Subscribed → Connected → Disconnected`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    /// Channel open, local presence not yet tracked.
    Subscribed,
    Connected,
}

/// Pick a palette colour from a random seed.
pub fn pick_color(palette: &[String], seed: Uuid) -> String {
    if palette.is_empty() {
        return DEFAULT_PALETTE[0].to_string();
    }
    let index = (seed.as_u128() % palette.len() as u128) as usize;
    palette[index].clone()
}

/// Wall-clock unix milliseconds.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
