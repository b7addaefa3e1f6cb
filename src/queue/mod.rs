// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Durable, per-entity-ordered queue of pending replication work.
//!
//! The queue is the only serialization point between writers and sync
//! workers: at most one active item exists per entity, and a claimed item is
//! owned by exactly one lease at a time. Everything across distinct entities
//! proceeds in parallel.
//!
//! Implementations:
//! - [`InMemorySyncQueue`]: process-local, for tests and embedding
//! - [`SqlSyncQueue`]: sqlx `Any` (SQLite or MySQL), survives restarts

pub mod memory;
pub mod sql;
pub mod types;

use async_trait::async_trait;

pub use memory::InMemorySyncQueue;
pub use sql::SqlSyncQueue;
pub use types::{
    DeadLetterRetry, EnqueueOutcome, NackOutcome, QueueDepth, QueueError, QueueSettings, SyncItem,
    SyncOperation, SyncRequest, SyncStatus,
};

#[async_trait]
pub trait SyncQueue: Send + Sync {
    /// Add a request, coalescing into the entity's active item if there is one
    async fn enqueue(&self, request: SyncRequest) -> Result<EnqueueOutcome, QueueError>;

    /// Claim the oldest eligible item for `worker_id`
    async fn dequeue(&self, worker_id: &str) -> Result<Option<SyncItem>, QueueError>;

    /// The claimed item was applied
    async fn ack(&self, item: &SyncItem) -> Result<(), QueueError>;

    /// The claimed item failed to apply
    async fn nack(&self, item: &SyncItem, error: &str) -> Result<NackOutcome, QueueError>;

    /// Hand a claimed item back untouched (shutdown)
    async fn release(&self, item: &SyncItem) -> Result<(), QueueError>;

    /// The entity's active item, if any
    async fn active(&self, entity_id: &str) -> Result<Option<SyncItem>, QueueError>;

    async fn dead_lettered(&self) -> Result<Vec<SyncItem>, QueueError>;

    /// Requeue the entity's dead-lettered item with a fresh attempt budget
    async fn retry_dead_lettered(&self, entity_id: &str) -> Result<DeadLetterRetry, QueueError>;

    async fn depth(&self) -> Result<QueueDepth, QueueError>;

    /// Drop applied-log records past their retention. Returns how many.
    async fn purge_applied(&self) -> Result<u64, QueueError>;
}
