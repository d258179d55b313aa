//! Deterministic storage-key derivation.
//!
//! Stream identifiers are arbitrary JSON values chosen by the application.
//! Instead of storing an identifier verbatim as a primary key, it is digested
//! into a fixed-width hex key, which keeps keys small and indexable no matter
//! how large or structured the identifier is.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Application-chosen identifier for one logical stream of actions.
pub type StreamId = Value;

/// Fixed-width digest used as a document's primary key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StorageKey(String);

impl StorageKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derive the storage key for a stream identifier.
///
/// Structurally equal inputs always produce the same key: serde_json objects
/// keep their entries sorted, so two identifiers that differ only in field
/// order serialize to identical bytes.
pub fn derive_key(value: &Value) -> StorageKey {
    // Serializing a `Value` cannot fail: map keys are strings and numbers
    // are always finite.
    let canonical = serde_json::to_vec(value).expect("serializing a JSON value");

    let mut hasher = Sha256::new();
    hasher.update(&canonical);
    StorageKey(hex::encode(hasher.finalize()))
}

/// Derive the storage key for one appended action.
///
/// The digest input is the `(stream, sequence)` composite, so every action in
/// a stream gets its own key and the same pair always maps back to it.
pub fn derive_action_key(stream_id: &StreamId, sequence_number: u64) -> StorageKey {
    derive_key(&serde_json::json!({
        "sequence_number": sequence_number,
        "stream_id": stream_id,
    }))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_derivation_is_deterministic() {
        let id = json!({"tenant": "acme", "cart": 42});
        assert_eq!(derive_key(&id), derive_key(&id));
        assert_eq!(derive_key(&id), derive_key(&id.clone()));
    }

    #[test]
    fn test_field_order_is_normalized() {
        let a = json!({"cart": 42, "tenant": "acme"});
        let b = json!({"tenant": "acme", "cart": 42});
        assert_eq!(derive_key(&a), derive_key(&b));
    }

    #[test]
    fn test_distinct_identifiers_get_distinct_keys() {
        assert_ne!(derive_key(&json!("orders")), derive_key(&json!("carts")));
        assert_ne!(derive_key(&json!("1")), derive_key(&json!(1)));
        assert_ne!(
            derive_key(&json!({"id": 1})),
            derive_key(&json!({"id": 2}))
        );
    }

    #[test]
    fn test_action_keys_are_scoped_to_stream_and_sequence() {
        let orders = json!("orders");
        let carts = json!("carts");

        assert_eq!(
            derive_action_key(&orders, 0),
            derive_action_key(&orders, 0)
        );
        assert_ne!(
            derive_action_key(&orders, 0),
            derive_action_key(&orders, 1)
        );
        assert_ne!(derive_action_key(&orders, 0), derive_action_key(&carts, 0));
        // An action key never collides with its stream's snapshot key.
        assert_ne!(derive_action_key(&orders, 0), derive_key(&orders));
    }

    #[test]
    fn test_keys_are_fixed_width_hex() {
        let key = derive_key(&json!(["a", "deeply", {"nested": "id"}]));
        assert_eq!(key.as_str().len(), 64);
        assert!(key.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }
}
