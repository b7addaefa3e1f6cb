// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! [`StoreAdapter`] decorator that reads through the cache and invalidates on write.

use std::sync::Arc;

use async_trait::async_trait;

use super::layer::CacheLayer;
use crate::entity::Entity;
use crate::phase::StoreRole;
use crate::resilience::cancel::CancelToken;
use crate::storage::traits::{EntityStream, QuerySpec, StorageError, StoreAdapter};

/// Cache key for an entity held by `role`
#[must_use]
pub fn cache_key(role: StoreRole, id: &str) -> String {
    format!("{}:{}", role.as_str(), id)
}

pub struct CachedStore {
    role: StoreRole,
    inner: Arc<dyn StoreAdapter>,
    cache: Arc<CacheLayer>,
}

impl CachedStore {
    pub fn new(role: StoreRole, inner: Arc<dyn StoreAdapter>, cache: Arc<CacheLayer>) -> Self {
        Self { role, inner, cache }
    }

    #[must_use]
    pub fn role(&self) -> StoreRole {
        self.role
    }

    /// The uncached store underneath
    #[must_use]
    pub fn inner(&self) -> &Arc<dyn StoreAdapter> {
        &self.inner
    }

    pub async fn invalidate(&self, id: &str) {
        self.cache.invalidate(&cache_key(self.role, id)).await;
    }
}

#[async_trait]
impl StoreAdapter for CachedStore {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn get(&self, id: &str, cancel: &CancelToken) -> Result<Option<Entity>, StorageError> {
        let key = cache_key(self.role, id);
        self.cache
            .get_or_load(&key, cancel, || self.inner.get(id, cancel))
            .await
    }

    /// The key is invalidated whatever the outcome: a failed or timed-out
    /// write may still have committed.
    async fn put(
        &self,
        entity: &Entity,
        expected: Option<i64>,
        cancel: &CancelToken,
    ) -> Result<i64, StorageError> {
        let result = self.inner.put(entity, expected, cancel).await;
        self.invalidate(&entity.id).await;
        result
    }

    async fn delete(&self, id: &str, cancel: &CancelToken) -> Result<(), StorageError> {
        let result = self.inner.delete(id, cancel).await;
        self.invalidate(id).await;
        result
    }

    fn query<'a>(&'a self, spec: QuerySpec, cancel: &'a CancelToken) -> EntityStream<'a> {
        self.inner.query(spec, cancel)
    }
}
