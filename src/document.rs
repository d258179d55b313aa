//! Document model shared by the snapshot and action collections.
//!
//! The storage engine deals in raw JSON documents; the public surface deals
//! in typed records. A stored document is the record's JSON form plus the
//! storage-internal `_key` field, which is censored away before any document
//! crosses the public boundary.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::keys::{StorageKey, StreamId};

/// Field holding the storage-internal primary key inside a stored document.
pub const KEY_FIELD: &str = "_key";
/// Field holding the reserved record metadata block.
pub const META_FIELD: &str = "meta";
/// Metadata field holding the record's sequence number.
pub const SEQUENCE_FIELD: &str = "sequence_number";
/// Metadata field holding an action's commit timestamp.
pub const TIMESTAMP_FIELD: &str = "timestamp";

/// Raw document as the storage engine sees it.
pub type Document = Value;

/// Reserved metadata carried by every snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub stream_id: StreamId,
    pub sequence_number: u64,
}

/// Reserved metadata carried by every action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionMeta {
    pub stream_id: StreamId,
    pub sequence_number: u64,
    pub timestamp: DateTime<Utc>,
}

impl ActionMeta {
    /// Metadata for a new action, stamped with the current instant.
    pub fn new(stream_id: StreamId, sequence_number: u64) -> Self {
        Self {
            stream_id,
            sequence_number,
            timestamp: Utc::now(),
        }
    }
}

/// Latest materialized state for a stream.
///
/// Application state lives in the flattened `state` map; the `meta` name is
/// reserved for the metadata block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub meta: SnapshotMeta,
    #[serde(flatten)]
    pub state: Map<String, Value>,
}

/// One immutable, sequence-numbered event appended to a stream's log.
///
/// Application fields live in the flattened `payload` map; the `meta` name is
/// reserved for the metadata block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub meta: ActionMeta,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

/// Return a copy of `document` with the storage-internal key field removed.
///
/// Applied to every document before it crosses the public boundary, never
/// before a write. The input is left untouched.
pub fn censor(document: &Document) -> Document {
    match document {
        Value::Object(fields) => {
            let censored: Map<String, Value> = fields
                .iter()
                .filter(|(name, _)| name.as_str() != KEY_FIELD)
                .map(|(name, value)| (name.clone(), value.clone()))
                .collect();
            Value::Object(censored)
        }
        other => other.clone(),
    }
}

/// Encode a record into its stored document, forcing the primary key.
pub(crate) fn to_document<T: Serialize>(
    record: &T,
    key: &StorageKey,
) -> serde_json::Result<Document> {
    let mut document = serde_json::to_value(record)?;
    if let Value::Object(fields) = &mut document {
        fields.insert(KEY_FIELD.to_string(), Value::String(key.as_str().to_string()));
    }
    Ok(document)
}

/// Decode a stored document into a public record.
///
/// Censors first: records flatten unknown fields into their payload map, so
/// the key field must be gone before deserialization.
pub(crate) fn from_document<T: DeserializeOwned>(document: &Document) -> serde_json::Result<T> {
    serde_json::from_value(censor(document))
}
