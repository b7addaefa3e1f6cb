// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cache storage contract and the in-process backend.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::clock::SharedClock;
use crate::entity::Entity;
use crate::resilience::retry::Retryable;

/// Cache failures. Never surfaced past the cache layer.
#[derive(Error, Debug, Clone)]
pub enum CacheError {
    #[error("cache connection failed: {0}")]
    Connection(String),
    #[error("cache backend error: {0}")]
    Backend(String),
    #[error("cache entry could not be decoded: {0}")]
    Serialization(String),
    #[error("cache call timed out after {0}ms")]
    Timeout(u64),
    #[error("cache call cancelled")]
    Cancelled,
}

impl Retryable for CacheError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Timeout(_))
    }

    fn cancelled() -> Self {
        Self::Cancelled
    }
}

impl From<redis::RedisError> for CacheError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_connection_refusal() || e.is_connection_dropped() || e.is_io_error() {
            Self::Connection(e.to_string())
        } else {
            Self::Backend(e.to_string())
        }
    }
}

/// A cached entity with its expiry deadlines (epoch millis).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub value: Entity,
    /// Absolute expiry, fixed when the entry is populated
    pub expires_at: i64,
    /// Sliding expiry, pushed forward on access but never past `expires_at`
    pub idle_until: i64,
    pub version: i64,
}

impl CacheEntry {
    #[must_use]
    pub fn new(key: impl Into<String>, value: Entity, expires_at: i64, idle_until: i64) -> Self {
        let version = value.version;
        Self {
            key: key.into(),
            value,
            expires_at,
            idle_until: idle_until.min(expires_at),
            version,
        }
    }

    /// Earliest of the two deadlines
    #[must_use]
    pub fn deadline(&self) -> i64 {
        self.expires_at.min(self.idle_until)
    }

    #[must_use]
    pub fn is_live(&self, now_millis: i64) -> bool {
        now_millis < self.deadline()
    }
}

/// Key/value store behind the cache layer.
///
/// Implementations must not return entries whose deadline has passed.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError>;

    async fn set(&self, entry: CacheEntry) -> Result<(), CacheError>;

    /// Removing a missing key is not an error
    async fn remove(&self, key: &str) -> Result<(), CacheError>;

    /// Move the sliding deadline of an existing entry
    async fn touch(&self, key: &str, idle_until: i64) -> Result<(), CacheError>;
}

/// DashMap-backed cache with a soft entry cap.
pub struct InMemoryCacheBackend {
    entries: DashMap<String, CacheEntry>,
    clock: SharedClock,
    max_entries: usize,
}

impl InMemoryCacheBackend {
    #[must_use]
    pub fn new(clock: SharedClock, max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
            max_entries: max_entries.max(1),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    fn enforce_cap(&self) {
        if self.entries.len() <= self.max_entries {
            return;
        }
        let now = self.clock.now_millis();
        self.entries.retain(|_, entry| entry.is_live(now));

        while self.entries.len() > self.max_entries {
            let victim = self
                .entries
                .iter()
                .min_by_key(|e| e.deadline())
                .map(|e| e.key().clone());
            match victim {
                Some(key) => {
                    self.entries.remove(&key);
                }
                None => break,
            }
        }
    }
}

#[async_trait]
impl CacheBackend for InMemoryCacheBackend {
    fn name(&self) -> &str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let now = self.clock.now_millis();
        let entry = self.entries.get(key).map(|e| e.clone());
        match entry {
            Some(entry) if entry.is_live(now) => Ok(Some(entry)),
            Some(_) => {
                self.entries.remove_if(key, |_, e| !e.is_live(now));
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, entry: CacheEntry) -> Result<(), CacheError> {
        self.entries.insert(entry.key.clone(), entry);
        self.enforce_cap();
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), CacheError> {
        self.entries.remove(key);
        Ok(())
    }

    async fn touch(&self, key: &str, idle_until: i64) -> Result<(), CacheError> {
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.idle_until = idle_until.min(entry.expires_at);
        }
        Ok(())
    }
}
