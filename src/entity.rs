// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Entity data structure.
//!
//! The [`Entity`] is the opaque keyed unit the engine moves between stores.
//! The engine never looks inside the payload except when reconciliation
//! compares JSON objects field by field.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// An opaque, versioned payload addressed by a globally unique ID.
///
/// # Example
///
/// ```
/// use dual_write_engine::Entity;
/// use serde_json::json;
///
/// let entity = Entity::from_json("account.42", &json!({"name": "Ada"}));
///
/// assert_eq!(entity.id, "account.42");
/// assert_eq!(entity.version, 0); // assigned by the store on first write
/// assert_eq!(entity.payload_json().unwrap()["name"], "Ada");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    /// Globally unique, immutable ID
    pub id: String,
    /// Raw payload bytes
    pub payload: Vec<u8>,
    /// Monotonic per-entity version. `0` asks the store to assign the next one.
    pub version: i64,
}

impl Entity {
    pub fn new(id: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id: id.into(),
            payload: payload.into(),
            version: 0,
        }
    }

    /// Build an entity whose payload is the serialized JSON value
    pub fn from_json(id: impl Into<String>, value: &Value) -> Self {
        Self::new(id, value.to_string().into_bytes())
    }

    #[must_use]
    pub fn with_version(mut self, version: i64) -> Self {
        self.version = version;
        self
    }

    /// Parse the payload as JSON, if it is JSON
    #[must_use]
    pub fn payload_json(&self) -> Option<Value> {
        serde_json::from_slice(&self.payload).ok()
    }

    /// SHA-256 of the payload, hex encoded
    #[must_use]
    pub fn payload_digest(&self) -> String {
        payload_digest(&self.payload)
    }

    /// Approximate in-memory size
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        std::mem::size_of::<Self>() + self.id.len() + self.payload.len()
    }
}

/// SHA-256 of arbitrary bytes, hex encoded
#[must_use]
pub fn payload_digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_entity() {
        let entity = Entity::new("order.7", b"raw".to_vec());

        assert_eq!(entity.id, "order.7");
        assert_eq!(entity.payload, b"raw");
        assert_eq!(entity.version, 0);
    }

    #[test]
    fn test_with_version() {
        let entity = Entity::new("order.7", b"raw".to_vec()).with_version(4);
        assert_eq!(entity.version, 4);
    }

    #[test]
    fn test_payload_json_roundtrip() {
        let entity = Entity::from_json("user.1", &json!({"name": "Ada", "age": 36}));
        let value = entity.payload_json().unwrap();

        assert_eq!(value["name"], "Ada");
        assert_eq!(value["age"], 36);
    }

    #[test]
    fn test_payload_json_none_for_binary() {
        let entity = Entity::new("blob.1", vec![0xff, 0x00, 0x13]);
        assert!(entity.payload_json().is_none());
    }

    #[test]
    fn test_digest_is_stable_and_content_sensitive() {
        let a = Entity::new("a", b"same".to_vec());
        let b = Entity::new("b", b"same".to_vec());
        let c = Entity::new("a", b"different".to_vec());

        assert_eq!(a.payload_digest(), b.payload_digest());
        assert_ne!(a.payload_digest(), c.payload_digest());
        assert_eq!(a.payload_digest().len(), 64);
    }

    #[test]
    fn test_size_includes_payload() {
        let small = Entity::new("x", vec![0u8; 10]);
        let large = Entity::new("x", vec![0u8; 10_000]);
        assert!(large.size_bytes() > small.size_bytes());
        assert!(large.size_bytes() > 10_000);
    }
}
