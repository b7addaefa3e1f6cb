// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-memory [`StoreAdapter`] with real compare-and-swap semantics.
//!
//! Used as the reference adapter in tests and for embedding the engine
//! without external stores. Deleted IDs keep a tombstone version so a
//! recreated entity continues numbering where the old one stopped.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::{Mutex, RwLock};

use super::traits::{EntityStream, QuerySpec, StorageError, StoreAdapter};
use crate::entity::Entity;
use crate::resilience::cancel::CancelToken;

pub struct InMemoryStore {
    name: String,
    data: RwLock<BTreeMap<String, Entity>>,
    /// Last version of deleted IDs. Locked after `data`.
    tombstones: Mutex<HashMap<String, i64>>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: RwLock::new(BTreeMap::new()),
            tombstones: Mutex::new(HashMap::new()),
        }
    }

    /// Get current entity count
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    /// Check if empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// Clear all entities
    pub fn clear(&self) {
        self.data.write().clear();
        self.tombstones.lock().clear();
    }

    /// Direct read without going through the async contract
    #[must_use]
    pub fn peek(&self, id: &str) -> Option<Entity> {
        self.data.read().get(id).cloned()
    }

    /// Next entity after `after` that matches `prefix`
    fn next_after(&self, after: Option<&str>, prefix: Option<&str>) -> Option<Entity> {
        let data = self.data.read();
        let lower = match after {
            Some(id) => Bound::Excluded(id),
            None => Bound::Unbounded,
        };
        for (id, entity) in data.range::<str, _>((lower, Bound::Unbounded)) {
            match prefix {
                Some(p) if !id.starts_with(p) => {
                    // Ordered keys: once past the prefix range nothing else can match
                    if id.as_str() > p {
                        return None;
                    }
                }
                _ => return Some(entity.clone()),
            }
        }
        None
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new("memory")
    }
}

struct Cursor {
    after: Option<String>,
    yielded: usize,
    done: bool,
}

#[async_trait]
impl StoreAdapter for InMemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, id: &str, _cancel: &CancelToken) -> Result<Option<Entity>, StorageError> {
        Ok(self.data.read().get(id).cloned())
    }

    async fn put(
        &self,
        entity: &Entity,
        expected: Option<i64>,
        _cancel: &CancelToken,
    ) -> Result<i64, StorageError> {
        if entity.id.is_empty() {
            return Err(StorageError::Validation("entity id must not be empty".into()));
        }
        if entity.version < 0 {
            return Err(StorageError::Validation(format!(
                "negative version {} for '{}'",
                entity.version, entity.id
            )));
        }

        let mut data = self.data.write();
        let current = data.get(&entity.id).map_or(0, |e| e.version);

        if let Some(expected) = expected {
            if expected != current {
                return Err(StorageError::Conflict {
                    id: entity.id.clone(),
                    expected,
                    actual: current,
                });
            }
        }

        let version = if entity.version > 0 {
            entity.version
        } else {
            let floor = self.tombstones.lock().get(&entity.id).copied().unwrap_or(0);
            current.max(floor) + 1
        };
        self.tombstones.lock().remove(&entity.id);
        let mut stored = entity.clone();
        stored.version = version;
        data.insert(stored.id.clone(), stored);
        Ok(version)
    }

    async fn delete(&self, id: &str, _cancel: &CancelToken) -> Result<(), StorageError> {
        let mut data = self.data.write();
        match data.remove(id) {
            Some(removed) => {
                self.tombstones.lock().insert(removed.id, removed.version);
                Ok(())
            }
            None => Err(StorageError::NotFound(id.to_string())),
        }
    }

    fn query<'a>(&'a self, spec: QuerySpec, cancel: &'a CancelToken) -> EntityStream<'a> {
        let start = Cursor {
            after: spec.after_id.clone(),
            yielded: 0,
            done: false,
        };
        stream::unfold(start, move |mut cursor| {
            let prefix = spec.id_prefix.clone();
            let limit = spec.limit;
            async move {
                if cursor.done || limit.is_some_and(|l| cursor.yielded >= l) {
                    return None;
                }
                if cancel.is_cancelled() {
                    cursor.done = true;
                    return Some((Err(StorageError::Cancelled), cursor));
                }
                let next = self.next_after(cursor.after.as_deref(), prefix.as_deref())?;
                cursor.after = Some(next.id.clone());
                cursor.yielded += 1;
                Some((Ok(next), cursor))
            }
        })
        .boxed()
    }
}
