// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cache-aside with single-flight loading.
//!
//! ```text
//! get_or_load(key)
//!   ├─ backend hit (live)      → value (sliding deadline pushed forward)
//!   └─ miss → flight for key   → first caller runs the loader,
//!                                 everyone else awaits the same cell
//!                               → populate unless the flight went stale
//! ```
//!
//! `invalidate` marks the key's in-flight load stale before removing the
//! backend entry, so a load that started before a write can hand its result to
//! the callers already waiting on it but can never write it into the cache.
//! Backend failures and timeouts are logged and counted, never returned.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use super::backend::{CacheBackend, CacheEntry, CacheError};
use crate::clock::{self, SharedClock};
use crate::entity::Entity;
use crate::metrics;
use crate::resilience::cancel::CancelToken;
use crate::storage::traits::StorageError;

#[derive(Debug, Clone)]
pub struct CacheSettings {
    /// Absolute lifetime of a populated entry
    pub ttl: Duration,
    /// Idle lifetime, extended on every hit (never past `ttl`)
    pub sliding_ttl: Option<Duration>,
    /// Deadline for each backend call
    pub call_timeout: Duration,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(10 * 60),
            sliding_ttl: None,
            call_timeout: Duration::from_millis(500),
        }
    }
}

/// Counters since startup
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Upstream loads actually executed
    pub loads: u64,
    /// Swallowed backend failures and timeouts
    pub errors: u64,
}

impl CacheStats {
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            return 0.0;
        }
        self.hits as f64 / lookups as f64
    }
}

type LoadResult = Result<Option<Entity>, StorageError>;

struct Flight {
    cell: OnceCell<LoadResult>,
    stale: AtomicBool,
    settled: AtomicBool,
}

impl Flight {
    fn new() -> Self {
        Self {
            cell: OnceCell::new(),
            stale: AtomicBool::new(false),
            settled: AtomicBool::new(false),
        }
    }
}

pub struct CacheLayer {
    backend: Arc<dyn CacheBackend>,
    settings: CacheSettings,
    clock: SharedClock,
    inflight: DashMap<String, Arc<Flight>>,
    hits: AtomicU64,
    misses: AtomicU64,
    loads: AtomicU64,
    errors: AtomicU64,
}

impl CacheLayer {
    pub fn new(backend: Arc<dyn CacheBackend>, settings: CacheSettings) -> Self {
        Self::with_clock(backend, settings, clock::system())
    }

    pub fn with_clock(backend: Arc<dyn CacheBackend>, settings: CacheSettings, clock: SharedClock) -> Self {
        Self {
            backend,
            settings,
            clock,
            inflight: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            loads: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            loads: self.loads.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }

    /// Cached value for `key`, or the result of `loader` shared with every
    /// concurrent caller of the same key. Only `Ok(Some(_))` is cached.
    pub async fn get_or_load<F, Fut>(&self, key: &str, cancel: &CancelToken, loader: F) -> LoadResult
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = LoadResult>,
    {
        if cancel.is_cancelled() {
            return Err(StorageError::Cancelled);
        }

        if let Some(entry) = self.lookup(key).await {
            self.hits.fetch_add(1, Ordering::Relaxed);
            metrics::record_cache_lookup(true);
            self.slide(&entry).await;
            return Ok(Some(entry.value));
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        metrics::record_cache_lookup(false);

        let flight = self
            .inflight
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Flight::new()))
            .clone();

        let shared = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(StorageError::Cancelled),
            shared = flight.cell.get_or_try_init(|| async move {
                self.loads.fetch_add(1, Ordering::Relaxed);
                metrics::record_cache_load();
                match loader().await {
                    // Not shared: the next waiter runs its own loader
                    Err(StorageError::Cancelled) => Err(()),
                    other => Ok(other),
                }
            }) => shared,
        };

        let result = match shared {
            Ok(result) => result.clone(),
            Err(()) => return Err(StorageError::Cancelled),
        };

        if !flight.settled.swap(true, Ordering::AcqRel) {
            if let Ok(Some(ref value)) = result {
                self.populate(key, &flight, value).await;
            }
            self.inflight.remove_if(key, |_, f| Arc::ptr_eq(f, &flight));
        }
        result
    }

    /// Drop `key` from the cache and poison any load already in flight for it
    pub async fn invalidate(&self, key: &str) {
        if let Some((_, flight)) = self.inflight.remove(key) {
            flight.stale.store(true, Ordering::Release);
        }
        metrics::record_cache_invalidation();
        self.call("remove", self.backend.remove(key)).await;
        debug!(key, "Cache key invalidated");
    }

    async fn lookup(&self, key: &str) -> Option<CacheEntry> {
        let entry = self.call("get", self.backend.get(key)).await.flatten()?;
        entry.is_live(self.clock.now_millis()).then_some(entry)
    }

    async fn slide(&self, entry: &CacheEntry) {
        let Some(sliding) = self.settings.sliding_ttl else {
            return;
        };
        let idle_until = clock::after(self.clock.now_millis(), sliding).min(entry.expires_at);
        if idle_until > entry.idle_until {
            self.call("touch", self.backend.touch(&entry.key, idle_until)).await;
        }
    }

    async fn populate(&self, key: &str, flight: &Flight, value: &Entity) {
        if flight.stale.load(Ordering::Acquire) {
            debug!(key, "Load finished after invalidation, not caching");
            return;
        }

        let now = self.clock.now_millis();
        let expires_at = clock::after(now, self.settings.ttl);
        let idle_until = match self.settings.sliding_ttl {
            Some(sliding) => clock::after(now, sliding),
            None => expires_at,
        };
        let entry = CacheEntry::new(key, value.clone(), expires_at, idle_until);
        self.call("set", self.backend.set(entry)).await;

        // Invalidated while we were writing: undo
        if flight.stale.load(Ordering::Acquire) {
            self.call("remove", self.backend.remove(key)).await;
        }
    }

    /// Run a backend call under the cache deadline, swallowing failures
    async fn call<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = Result<T, CacheError>>,
    ) -> Option<T> {
        let error = match tokio::time::timeout(self.settings.call_timeout, fut).await {
            Ok(Ok(value)) => return Some(value),
            Ok(Err(e)) => e,
            Err(_) => CacheError::Timeout(self.settings.call_timeout.as_millis() as u64),
        };

        self.errors.fetch_add(1, Ordering::Relaxed);
        metrics::record_cache_error(self.backend.name(), operation);
        warn!(
            backend = self.backend.name(),
            operation,
            error = %error,
            "Cache backend call failed, falling back to store"
        );
        None
    }
}
