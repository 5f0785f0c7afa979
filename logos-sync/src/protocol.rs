//! Broadcast event protocol.
//!
//! Wire format: the transport carries an `event_type` string plus an opaque
//! payload. The payload is JSON:
//!
//! ```text
//! event_type        payload
//! ───────────────── ──────────────────────────────────────────────────
//! cursor_move       {"origin_user_id": "u1", "payload": {"x": 1, "y": 2}}
//! selection_change  {"origin_user_id": "u1", "payload": {"item_ids": ["a"]}}
//! item_create       {"origin_user_id": "u1", "payload": {"id": "x1", "type": "note", ...}}
//! item_update       {"origin_user_id": "u1", "payload": {"id": "x1", "type": "note", ...}}
//! item_delete       {"origin_user_id": "u1", "payload": {"id": "x1"}}
//! ```
//!
//! Inbound payloads come from other peers and are untrusted: every decode
//! goes through [`BroadcastEvent::validate`] before anything is routed.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::EventError;
use crate::model::{CursorPosition, ItemId, SyncedItem, UserId};

/// Broadcast event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    CursorMove,
    SelectionChange,
    ItemCreate,
    ItemUpdate,
    ItemDelete,
}

impl EventKind {
    pub const ALL: [EventKind; 5] = [
        EventKind::CursorMove,
        EventKind::SelectionChange,
        EventKind::ItemCreate,
        EventKind::ItemUpdate,
        EventKind::ItemDelete,
    ];

    /// Transport-level event type name.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::CursorMove => "cursor_move",
            EventKind::SelectionChange => "selection_change",
            EventKind::ItemCreate => "item_create",
            EventKind::ItemUpdate => "item_update",
            EventKind::ItemDelete => "item_delete",
        }
    }

    /// Ephemeral kinds only touch presence; durable kinds touch items.
    pub fn is_ephemeral(&self) -> bool {
        matches!(self, EventKind::CursorMove | EventKind::SelectionChange)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| EventError::UnknownType(s.to_string()))
    }
}

/// Event body, one variant per [`EventKind`].
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    CursorMove(CursorPosition),
    SelectionChange { item_ids: Vec<ItemId> },
    ItemCreate(SyncedItem),
    ItemUpdate(SyncedItem),
    ItemDelete { id: ItemId },
}

/// A peer-originated event. Transient: routed, never stored.
#[derive(Debug, Clone, PartialEq)]
pub struct BroadcastEvent {
    pub origin_user_id: UserId,
    pub payload: EventPayload,
}

#[derive(Serialize, Deserialize)]
struct Envelope<T> {
    origin_user_id: UserId,
    payload: T,
}

#[derive(Serialize, Deserialize)]
struct SelectionBody {
    item_ids: Vec<ItemId>,
}

#[derive(Serialize, Deserialize)]
struct DeleteBody {
    id: ItemId,
}

impl BroadcastEvent {
    pub fn new(origin_user_id: impl Into<UserId>, payload: EventPayload) -> Self {
        Self {
            origin_user_id: origin_user_id.into(),
            payload,
        }
    }

    pub fn kind(&self) -> EventKind {
        match &self.payload {
            EventPayload::CursorMove(_) => EventKind::CursorMove,
            EventPayload::SelectionChange { .. } => EventKind::SelectionChange,
            EventPayload::ItemCreate(_) => EventKind::ItemCreate,
            EventPayload::ItemUpdate(_) => EventKind::ItemUpdate,
            EventPayload::ItemDelete { .. } => EventKind::ItemDelete,
        }
    }

    /// Encode the JSON payload. The event type travels separately.
    pub fn encode(&self) -> Result<Vec<u8>, EventError> {
        let origin_user_id = self.origin_user_id.clone();
        let encoded = match &self.payload {
            EventPayload::CursorMove(position) => serde_json::to_vec(&Envelope {
                origin_user_id,
                payload: position,
            }),
            EventPayload::SelectionChange { item_ids } => serde_json::to_vec(&Envelope {
                origin_user_id,
                payload: SelectionBody { item_ids: item_ids.clone() },
            }),
            EventPayload::ItemCreate(item) | EventPayload::ItemUpdate(item) => {
                serde_json::to_vec(&Envelope {
                    origin_user_id,
                    payload: item,
                })
            }
            EventPayload::ItemDelete { id } => serde_json::to_vec(&Envelope {
                origin_user_id,
                payload: DeleteBody { id: id.clone() },
            }),
        };
        encoded.map_err(|e| EventError::Serialization(e.to_string()))
    }

    /// Decode and validate an inbound event.
    pub fn decode(event_type: &str, bytes: &[u8]) -> Result<Self, EventError> {
        let kind: EventKind = event_type.parse()?;
        let event = match kind {
            EventKind::CursorMove => {
                let env: Envelope<CursorPosition> = parse(bytes)?;
                Self::new(env.origin_user_id, EventPayload::CursorMove(env.payload))
            }
            EventKind::SelectionChange => {
                let env: Envelope<SelectionBody> = parse(bytes)?;
                Self::new(
                    env.origin_user_id,
                    EventPayload::SelectionChange { item_ids: env.payload.item_ids },
                )
            }
            EventKind::ItemCreate => {
                let env: Envelope<SyncedItem> = parse(bytes)?;
                Self::new(env.origin_user_id, EventPayload::ItemCreate(env.payload))
            }
            EventKind::ItemUpdate => {
                let env: Envelope<SyncedItem> = parse(bytes)?;
                Self::new(env.origin_user_id, EventPayload::ItemUpdate(env.payload))
            }
            EventKind::ItemDelete => {
                let env: Envelope<DeleteBody> = parse(bytes)?;
                Self::new(env.origin_user_id, EventPayload::ItemDelete { id: env.payload.id })
            }
        };
        event.validate()?;
        Ok(event)
    }

    /// Structural checks that serde cannot express.
    pub fn validate(&self) -> Result<(), EventError> {
        if self.origin_user_id.is_empty() {
            return Err(EventError::Invalid("empty origin_user_id"));
        }
        match &self.payload {
            EventPayload::CursorMove(position) if !position.is_finite() => {
                Err(EventError::Invalid("non-finite cursor coordinate"))
            }
            EventPayload::SelectionChange { item_ids } if item_ids.iter().any(|id| id.is_empty()) => {
                Err(EventError::Invalid("empty id in selection"))
            }
            EventPayload::ItemCreate(item) | EventPayload::ItemUpdate(item) if item.id.is_empty() => {
                Err(EventError::Invalid("empty item id"))
            }
            EventPayload::ItemDelete { id } if id.is_empty() => {
                Err(EventError::Invalid("empty item id"))
            }
            _ => Ok(()),
        }
    }
}

fn parse<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T, EventError> {
    serde_json::from_slice(bytes).map_err(|e| EventError::Malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decode_json(event_type: &str, value: serde_json::Value) -> Result<BroadcastEvent, EventError> {
        BroadcastEvent::decode(event_type, &serde_json::to_vec(&value).unwrap())
    }

    #[test]
    fn test_event_kind_names() {
        for kind in EventKind::ALL {
            assert_eq!(kind.as_str().parse::<EventKind>().unwrap(), kind);
        }
        assert_eq!(EventKind::ItemDelete.to_string(), "item_delete");
    }

    #[test]
    fn test_unknown_event_type_rejected() {
        let err = "item_explode".parse::<EventKind>().unwrap_err();
        assert_eq!(err, EventError::UnknownType("item_explode".into()));
    }

    #[test]
    fn test_item_create_wire_shape() {
        let event = BroadcastEvent::new(
            "u1",
            EventPayload::ItemCreate(SyncedItem::new("x1", "note").with_field("text", "hi")),
        );
        let value: serde_json::Value = serde_json::from_slice(&event.encode().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"origin_user_id": "u1", "payload": {"id": "x1", "type": "note", "text": "hi"}})
        );
    }

    #[test]
    fn test_decode_item_create() {
        let event = decode_json(
            "item_create",
            json!({"origin_user_id": "u1", "payload": {"id": "x1", "type": "note"}}),
        )
        .unwrap();
        assert_eq!(event.kind(), EventKind::ItemCreate);
        assert_eq!(event.payload, EventPayload::ItemCreate(SyncedItem::new("x1", "note")));
    }

    #[test]
    fn test_decode_selection_and_delete() {
        let selection = decode_json(
            "selection_change",
            json!({"origin_user_id": "u1", "payload": {"item_ids": ["a", "b"]}}),
        )
        .unwrap();
        assert_eq!(
            selection.payload,
            EventPayload::SelectionChange { item_ids: vec!["a".into(), "b".into()] }
        );

        let delete = decode_json("item_delete", json!({"origin_user_id": "u1", "payload": {"id": "x1"}}))
            .unwrap();
        assert_eq!(delete.payload, EventPayload::ItemDelete { id: "x1".into() });
    }

    #[test]
    fn test_payload_of_wrong_shape_is_malformed() {
        let err = decode_json("cursor_move", json!({"origin_user_id": "u1", "payload": {"id": "x1"}}))
            .unwrap_err();
        assert!(matches!(err, EventError::Malformed(_)));

        let err = BroadcastEvent::decode("item_update", b"\xFF\xFE not json").unwrap_err();
        assert!(matches!(err, EventError::Malformed(_)));
    }

    #[test]
    fn test_validation_rejects_empty_ids() {
        let err = decode_json("item_update", json!({"origin_user_id": "u1", "payload": {"id": "", "type": "note"}}))
            .unwrap_err();
        assert_eq!(err, EventError::Invalid("empty item id"));

        let err = decode_json("item_delete", json!({"origin_user_id": "", "payload": {"id": "x1"}}))
            .unwrap_err();
        assert_eq!(err, EventError::Invalid("empty origin_user_id"));

        let err = decode_json(
            "selection_change",
            json!({"origin_user_id": "u1", "payload": {"item_ids": ["a", ""]}}),
        )
        .unwrap_err();
        assert_eq!(err, EventError::Invalid("empty id in selection"));
    }

    #[test]
    fn test_validation_rejects_non_finite_cursor() {
        let event = BroadcastEvent::new("u1", EventPayload::CursorMove(CursorPosition::new(f64::NAN, 0.0)));
        assert_eq!(event.validate(), Err(EventError::Invalid("non-finite cursor coordinate")));
    }

    #[test]
    fn test_ephemeral_kinds() {
        assert!(EventKind::CursorMove.is_ephemeral());
        assert!(EventKind::SelectionChange.is_ephemeral());
        assert!(!EventKind::ItemCreate.is_ephemeral());
        assert!(!EventKind::ItemDelete.is_ephemeral());
    }
}
