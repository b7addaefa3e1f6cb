// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Read-through entity cache.
//!
//! - [`CacheLayer`]: cache-aside with TTL, sliding TTL, invalidation and single-flight
//! - [`CachedStore`]: the layer applied to a [`StoreAdapter`](crate::storage::StoreAdapter)
//! - Backends: [`InMemoryCacheBackend`] (DashMap) and [`RedisCacheBackend`]

pub mod backend;
pub mod layer;
pub mod redis;
pub mod store;

pub use backend::{CacheBackend, CacheEntry, CacheError, InMemoryCacheBackend};
pub use layer::{CacheLayer, CacheSettings, CacheStats};
pub use self::redis::RedisCacheBackend;
pub use store::{cache_key, CachedStore};
