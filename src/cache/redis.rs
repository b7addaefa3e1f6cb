// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis cache backend.
//!
//! Entries are stored as JSON strings under `<prefix><key>` with a `PX`
//! expiry equal to the entry's earliest deadline, so Redis drops them on its
//! own. Sliding TTL moves the key's expiry with `PEXPIREAT`; the caller
//! caps the new deadline at the entry's absolute expiry.
//!
//! ```text
//! SET dw:legacy:user.1 '{"key":..,"value":{..},"expires_at":..,"idle_until":..,"version":3}' PX 600000
//! ```

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{cmd, AsyncCommands, Client};

use super::backend::{CacheBackend, CacheEntry, CacheError};
use crate::clock::SharedClock;
use crate::resilience::cancel::CancelToken;
use crate::resilience::retry::{retry, RetryConfig};

pub struct RedisCacheBackend {
    connection: ConnectionManager,
    /// Key prefix for namespacing (e.g., "dw:" → "dw:legacy:user.1")
    prefix: String,
    clock: SharedClock,
}

impl RedisCacheBackend {
    /// Connect with the startup retry policy.
    ///
    /// ```rust,no_run
    /// # use dual_write_engine::cache::RedisCacheBackend;
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let cache = RedisCacheBackend::connect(
    ///     "redis://localhost:6379",
    ///     "dw:",
    ///     dual_write_engine::clock::system(),
    /// )
    /// .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn connect(url: &str, prefix: &str, clock: SharedClock) -> Result<Self, CacheError> {
        let client = Client::open(url).map_err(|e| CacheError::Backend(e.to_string()))?;

        let connection = retry("redis_connect", &RetryConfig::startup(), &CancelToken::never(), || {
            let client = client.clone();
            async move { ConnectionManager::new(client).await.map_err(CacheError::from) }
        })
        .await?;

        Ok(Self {
            connection,
            prefix: prefix.to_string(),
            clock,
        })
    }

    #[inline]
    fn prefixed_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    /// Get the configured prefix
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

#[async_trait]
impl CacheBackend for RedisCacheBackend {
    fn name(&self) -> &str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let mut conn = self.connection.clone();
        let raw: Option<Vec<u8>> = conn.get(self.prefixed_key(key)).await?;

        let Some(raw) = raw else {
            return Ok(None);
        };
        let entry: CacheEntry =
            serde_json::from_slice(&raw).map_err(|e| CacheError::Serialization(e.to_string()))?;

        // Redis expiry runs on the server clock; the absolute deadline is ours
        if self.clock.now_millis() >= entry.expires_at {
            return Ok(None);
        }
        Ok(Some(entry))
    }

    async fn set(&self, entry: CacheEntry) -> Result<(), CacheError> {
        let ttl_ms = entry.deadline() - self.clock.now_millis();
        if ttl_ms <= 0 {
            return Ok(());
        }
        let body = serde_json::to_vec(&entry).map_err(|e| CacheError::Serialization(e.to_string()))?;

        let mut conn = self.connection.clone();
        cmd("SET")
            .arg(self.prefixed_key(&entry.key))
            .arg(body)
            .arg("PX")
            .arg(ttl_ms)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.connection.clone();
        let _: () = conn.del(self.prefixed_key(key)).await?;
        Ok(())
    }

    async fn touch(&self, key: &str, idle_until: i64) -> Result<(), CacheError> {
        let mut conn = self.connection.clone();
        // The stored body keeps its original idle_until; Redis owns the sliding deadline
        cmd("PEXPIREAT")
            .arg(self.prefixed_key(key))
            .arg(idle_until)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }
}
