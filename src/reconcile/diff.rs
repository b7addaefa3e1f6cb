// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Field-level comparison of one entity across the two stores.
//!
//! - present on one side only → one `@entity` discrepancy
//! - both JSON objects → one discrepancy per differing top-level key
//! - anything else → one `@payload` discrepancy with SHA-256 digests
//! - versions differ → an extra `@version` discrepancy
//!
//! The `@` prefix keeps the whole-entity fields apart from payload keys, so a
//! document with its own `version` key still yields two separate records.

use std::collections::BTreeSet;

use serde_json::Value;

use super::types::Discrepancy;
use crate::entity::Entity;

pub const ENTITY_FIELD: &str = "@entity";
pub const PAYLOAD_FIELD: &str = "@payload";
pub const VERSION_FIELD: &str = "@version";

fn presence(entity: Option<&Entity>) -> Option<String> {
    entity.map(|e| format!("present (v{})", e.version))
}

pub fn compare(
    entity_id: &str,
    primary: Option<&Entity>,
    secondary: Option<&Entity>,
    now_millis: i64,
) -> Vec<Discrepancy> {
    let found = |field: &str, primary_value: Option<String>, secondary_value: Option<String>| Discrepancy {
        entity_id: entity_id.to_string(),
        field: field.to_string(),
        primary_value,
        secondary_value,
        detected_at: now_millis,
        resolved_at: None,
    };

    let (p, s) = match (primary, secondary) {
        (None, None) => return Vec::new(),
        (Some(p), Some(s)) => (p, s),
        (p, s) => return vec![found(ENTITY_FIELD, presence(p), presence(s))],
    };

    let mut out = Vec::new();
    if p.payload != s.payload {
        match (p.payload_json(), s.payload_json()) {
            (Some(Value::Object(pm)), Some(Value::Object(sm))) => {
                let keys: BTreeSet<&String> = pm.keys().chain(sm.keys()).collect();
                for key in keys {
                    let (pv, sv) = (pm.get(key), sm.get(key));
                    if pv != sv {
                        out.push(found(key.as_str(), pv.map(Value::to_string), sv.map(Value::to_string)));
                    }
                }
            }
            _ => out.push(found(PAYLOAD_FIELD, Some(p.payload_digest()), Some(s.payload_digest()))),
        }
    }
    if p.version != s.version {
        out.push(found(VERSION_FIELD, Some(p.version.to_string()), Some(s.version.to_string())));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const NOW: i64 = 1_700_000_000_000;

    fn doc(value: serde_json::Value, version: i64) -> Entity {
        Entity::from_json("e", &value).with_version(version)
    }

    #[test]
    fn test_identical_entities_match() {
        let a = doc(json!({"name": "Ada", "age": 36}), 2);
        assert!(compare("e", Some(&a), Some(&a.clone()), NOW).is_empty());
        assert!(compare("e", None, None, NOW).is_empty());
    }

    #[test]
    fn test_single_mismatched_field() {
        let a = doc(json!({"name": "Ada", "age": 36}), 2);
        let b = doc(json!({"name": "Ada", "age": 37}), 2);

        let found = compare("e", Some(&a), Some(&b), NOW);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].field, "age");
        assert_eq!(found[0].primary_value.as_deref(), Some("36"));
        assert_eq!(found[0].secondary_value.as_deref(), Some("37"));
        assert_eq!(found[0].detected_at, NOW);
    }

    #[test]
    fn test_key_missing_on_one_side() {
        let a = doc(json!({"name": "Ada", "email": "ada@example.com"}), 1);
        let b = doc(json!({"name": "Ada"}), 1);

        let found = compare("e", Some(&a), Some(&b), NOW);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].field, "email");
        assert!(found[0].secondary_value.is_none());
    }

    #[test]
    fn test_missing_entity() {
        let a = doc(json!({"name": "Ada"}), 3);

        let found = compare("e", Some(&a), None, NOW);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].field, ENTITY_FIELD);
        assert_eq!(found[0].primary_value.as_deref(), Some("present (v3)"));
        assert!(found[0].secondary_value.is_none());
    }

    #[test]
    fn test_binary_payload_compares_digests() {
        let a = Entity::new("e", vec![1, 2, 3]).with_version(1);
        let b = Entity::new("e", vec![1, 2, 4]).with_version(1);

        let found = compare("e", Some(&a), Some(&b), NOW);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].field, PAYLOAD_FIELD);
        assert_eq!(found[0].primary_value, Some(a.payload_digest()));
    }

    #[test]
    fn test_version_difference_reported() {
        let a = doc(json!({"name": "Ada"}), 4);
        let b = doc(json!({"name": "Ada"}), 3);

        let found = compare("e", Some(&a), Some(&b), NOW);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].field, VERSION_FIELD);
    }

    #[test]
    fn test_payload_key_named_like_entity_field_kept_apart() {
        let a = doc(json!({"version": 1, "entity": "a"}), 5);
        let b = doc(json!({"version": 2, "entity": "a"}), 4);

        let found = compare("e", Some(&a), Some(&b), NOW);
        let fields: Vec<&str> = found.iter().map(|d| d.field.as_str()).collect();
        assert_eq!(fields, vec!["version", VERSION_FIELD]);
        assert_eq!(found[0].primary_value.as_deref(), Some("1"));
        assert_eq!(found[1].primary_value.as_deref(), Some("5"));
    }
}
