//! Document-collection collaborator contract.
//!
//! The store core never talks to a concrete engine; it talks to this trait.
//! The unique-key constraint on `insert_one` and the match-predicate replace
//! of `update_one` are the only coordination primitives the layers above
//! rely on, so implementations must make both atomic.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde_json::Value;

use crate::document::{Document, KEY_FIELD, META_FIELD, SEQUENCE_FIELD, TIMESTAMP_FIELD};
use crate::keys::StorageKey;

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors surfaced by a storage engine.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Duplicate key: {0}")]
    DuplicateKey(StorageKey),

    #[error("Document has no primary key field")]
    MissingKey,

    #[error("Storage engine unreachable: {0}")]
    Connection(String),
}

/// Match predicate for a conditional replace.
///
/// Matches the document whose primary key equals `key`; when
/// `sequence_number` is set, the document's metadata sequence number must
/// also equal it. The snapshot compare-and-swap is built entirely on this
/// predicate plus the affected count the engine reports.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchPredicate {
    pub key: StorageKey,
    pub sequence_number: Option<u64>,
}

impl MatchPredicate {
    /// Match on primary key alone.
    pub fn key(key: StorageKey) -> Self {
        Self {
            key,
            sequence_number: None,
        }
    }

    /// Match on primary key plus an expected stored sequence number.
    pub fn key_at_sequence(key: StorageKey, sequence_number: u64) -> Self {
        Self {
            key,
            sequence_number: Some(sequence_number),
        }
    }

    /// Evaluate this predicate against a raw document.
    pub fn matches(&self, document: &Document) -> bool {
        if document.get(KEY_FIELD).and_then(Value::as_str) != Some(self.key.as_str()) {
            return false;
        }

        match self.sequence_number {
            None => true,
            Some(expected) => {
                document
                    .get(META_FIELD)
                    .and_then(|meta| meta.get(SEQUENCE_FIELD))
                    .and_then(Value::as_u64)
                    == Some(expected)
            }
        }
    }
}

/// Filter for the continuous change feed.
///
/// Matches newly inserted documents whose embedded metadata timestamp is
/// strictly after `after`, which bounds a watch to genuinely new writes.
#[derive(Debug, Clone, Copy)]
pub struct WatchFilter {
    pub after: DateTime<Utc>,
}

impl WatchFilter {
    /// Filter that admits only documents committed after this instant.
    pub fn starting_now() -> Self {
        Self { after: Utc::now() }
    }

    /// Evaluate this filter against a raw document.
    pub fn matches(&self, document: &Document) -> bool {
        document
            .get(META_FIELD)
            .and_then(|meta| meta.get(TIMESTAMP_FIELD))
            .and_then(Value::as_str)
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|timestamp| timestamp.with_timezone(&Utc) > self.after)
            .unwrap_or(false)
    }
}

/// Live, ordered stream of newly inserted documents.
pub type DocumentStream = BoxStream<'static, Document>;

/// One document collection inside an abstract storage engine.
///
/// Implementations:
/// - `MemoryCollection`: in-memory engine bundled with the crate
#[async_trait]
pub trait DocumentCollection: Send + Sync {
    /// Durably persist `document`.
    ///
    /// Fails with [`StorageError::DuplicateKey`] if a document with the same
    /// primary key already exists; exactly one of two concurrent inserts for
    /// the same key wins.
    async fn insert_one(&self, document: Document) -> Result<()>;

    /// Atomically replace at most one document matching `predicate` with
    /// `document`, reporting how many documents were affected (0 or 1).
    ///
    /// Callers use the affected count to detect a failed optimistic
    /// concurrency check.
    async fn update_one(&self, predicate: MatchPredicate, document: Document) -> Result<u64>;

    /// Point read by primary key.
    async fn find_one(&self, key: &StorageKey) -> Result<Option<Document>>;

    /// Predicate read: every document matching `predicate`.
    async fn find(&self, predicate: MatchPredicate) -> Result<Vec<Document>>;

    /// Remove a document by primary key; reports whether one was removed.
    async fn delete_one(&self, key: &StorageKey) -> Result<bool>;

    /// Continuous, ordered stream of newly inserted documents matching
    /// `filter`, starting from watch creation time.
    async fn watch(&self, filter: WatchFilter) -> Result<DocumentStream>;
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use crate::keys::derive_key;

    use super::*;

    #[test]
    fn test_match_predicate_on_key_and_sequence() {
        let key = derive_key(&json!("orders"));
        let document = json!({
            KEY_FIELD: key.as_str(),
            META_FIELD: {"stream_id": "orders", SEQUENCE_FIELD: 4},
        });

        assert!(MatchPredicate::key(key.clone()).matches(&document));
        assert!(MatchPredicate::key_at_sequence(key.clone(), 4).matches(&document));
        assert!(!MatchPredicate::key_at_sequence(key.clone(), 5).matches(&document));

        let other = derive_key(&json!("carts"));
        assert!(!MatchPredicate::key(other).matches(&document));
    }

    #[test]
    fn test_watch_filter_is_strictly_after() {
        let cutoff = Utc.with_ymd_and_hms(2026, 8, 7, 12, 0, 0).unwrap();
        let filter = WatchFilter { after: cutoff };

        let at = json!({META_FIELD: {TIMESTAMP_FIELD: "2026-08-07T12:00:00Z"}});
        let later = json!({META_FIELD: {TIMESTAMP_FIELD: "2026-08-07T12:00:01Z"}});
        let unstamped = json!({META_FIELD: {"stream_id": "orders"}});

        assert!(!filter.matches(&at));
        assert!(filter.matches(&later));
        assert!(!filter.matches(&unstamped));
    }
}
