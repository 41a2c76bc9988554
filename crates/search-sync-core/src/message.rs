//! Message types for the search index synchronizer
//!
//! Defines the read-model record, the change notification variants and the
//! envelope that carries them over the message transport.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Read-model record mirrored from the upstream service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    /// Stable identifier, unique across the index
    pub id: String,

    /// Monotonic marker from upstream used to order writes for the same id
    #[serde(default)]
    pub version: u64,

    /// Last time the upstream changed this item
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,

    /// Denormalized searchable fields
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl Item {
    /// Create a new item with an explicit version
    pub fn new(id: impl Into<String>, version: u64, payload: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            version,
            updated_at: None,
            payload,
        }
    }

    /// Create an item whose version is derived from its upstream timestamp
    pub fn from_updated_at(
        id: impl Into<String>,
        updated_at: DateTime<Utc>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: id.into(),
            version: updated_at.timestamp_millis().max(0) as u64,
            updated_at: Some(updated_at),
            payload,
        }
    }

    /// Whether this record may overwrite `stored` (last writer by upstream order)
    pub fn supersedes(&self, stored: &Item) -> bool {
        self.version >= stored.version
    }
}

/// Kind of change carried by a notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

impl ChangeKind {
    /// Returns the subject suffix for this kind
    pub fn as_subject_suffix(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::Deleted => "deleted",
        }
    }
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_subject_suffix())
    }
}

/// Domain-change notification published by the upstream service
///
/// Delivered at-least-once, with no ordering guarantee across ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChangeNotification {
    Created { item: Item },
    Updated { item: Item },
    Deleted { id: String },
}

impl ChangeNotification {
    pub fn created(item: Item) -> Self {
        Self::Created { item }
    }

    pub fn updated(item: Item) -> Self {
        Self::Updated { item }
    }

    pub fn deleted(id: impl Into<String>) -> Self {
        Self::Deleted { id: id.into() }
    }

    /// Identifier of the item this notification is about
    pub fn item_id(&self) -> &str {
        match self {
            Self::Created { item } | Self::Updated { item } => &item.id,
            Self::Deleted { id } => id,
        }
    }

    pub fn kind(&self) -> ChangeKind {
        match self {
            Self::Created { .. } => ChangeKind::Created,
            Self::Updated { .. } => ChangeKind::Updated,
            Self::Deleted { .. } => ChangeKind::Deleted,
        }
    }

    /// Generate the transport subject for this notification
    ///
    /// Format: `{prefix}.{kind}`
    pub fn to_subject(&self, prefix: &str) -> String {
        format!("{}.{}", prefix, self.kind().as_subject_suffix())
    }
}

/// Message metadata for tracking and observability
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    /// Unique message identifier (UUIDv7 for time-ordering)
    pub msg_id: Uuid,

    /// Timestamp when the change was published
    pub timestamp: DateTime<Utc>,

    /// Publishing service identifier
    pub source: String,

    /// Correlation ID for request tracing
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    /// Custom headers for extensibility
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
}

impl Metadata {
    /// Create new metadata with current timestamp
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            msg_id: Uuid::now_v7(),
            timestamp: Utc::now(),
            source: source.into(),
            correlation_id: None,
            headers: HashMap::new(),
        }
    }
}

impl Default for Metadata {
    fn default() -> Self {
        Self::new("unknown")
    }
}

/// Message envelope wrapping change notifications
///
/// This is the canonical wire format for all messages in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Message metadata
    pub metadata: Metadata,

    /// The change notification payload
    pub notification: ChangeNotification,
}

impl Envelope {
    /// Create a new envelope
    pub fn new(metadata: Metadata, notification: ChangeNotification) -> Self {
        Self {
            metadata,
            notification,
        }
    }

    /// Create envelope with auto-generated metadata
    pub fn wrap(notification: ChangeNotification, source: impl Into<String>) -> Self {
        Self {
            metadata: Metadata::new(source),
            notification,
        }
    }

    /// Serialize to JSON bytes
    pub fn to_bytes(&self) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(self).map(Bytes::from)
    }

    /// Deserialize from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Get the transport subject for this envelope
    pub fn subject(&self, prefix: &str) -> String {
        self.notification.to_subject(prefix)
    }

    pub fn item_id(&self) -> &str {
        self.notification.item_id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_notification_wire_format() {
        let created = ChangeNotification::created(Item::new("42", 3, json!({"title": "Watch"})));
        let value = serde_json::to_value(&created).unwrap();
        assert_eq!(value["kind"], "created");
        assert_eq!(value["item"]["id"], "42");
        assert_eq!(value["item"]["version"], 3);

        let deleted: ChangeNotification =
            serde_json::from_value(json!({"kind": "deleted", "id": "7"})).unwrap();
        assert_eq!(deleted, ChangeNotification::deleted("7"));
    }

    #[test]
    fn test_item_version_defaults_to_zero() {
        let item: Item = serde_json::from_value(json!({"id": "A1", "payload": "Watch"})).unwrap();
        assert_eq!(item.version, 0);
        assert_eq!(item.payload, json!("Watch"));
    }

    #[test]
    fn test_supersedes_is_inclusive() {
        let stored = Item::new("1", 5, json!({}));
        assert!(Item::new("1", 5, json!({})).supersedes(&stored));
        assert!(Item::new("1", 6, json!({})).supersedes(&stored));
        assert!(!Item::new("1", 4, json!({})).supersedes(&stored));
    }

    #[test]
    fn test_version_from_timestamp() {
        let ts = DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let item = Item::from_updated_at("1", ts, json!({}));
        assert_eq!(item.version, 1_704_067_200_000);
    }

    #[test]
    fn test_subject_generation() {
        let envelope = Envelope::wrap(ChangeNotification::deleted("9"), "items-svc");
        assert_eq!(envelope.subject("search.items"), "search.items.deleted");
        assert_eq!(envelope.item_id(), "9");

        let bytes = envelope.to_bytes().unwrap();
        let restored = Envelope::from_bytes(&bytes).unwrap();
        assert_eq!(restored.metadata.msg_id, envelope.metadata.msg_id);
    }
}
