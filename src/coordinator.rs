// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Phase-driven read/write routing.
//!
//! ```text
//!                 write(entity)
//!                      │
//!        phase.write_targets()
//!                      │
//!    ┌─────────────────┴──────────────────┐
//!    ▼                                    ▼
//! authoritative store                 replica (if any)
//! CachedStore → ResilientStore        SyncQueue.enqueue()
//! (synchronous, invalidates key)      (after the put committed)
//! ```
//!
//! Write latency is bounded by the authoritative store alone. Reads hit
//! exactly one store: the phase's read target.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error};

use crate::cache::CachedStore;
use crate::entity::Entity;
use crate::error::EngineError;
use crate::metrics;
use crate::phase::{MigrationPhaseManager, StoreRole};
use crate::queue::{EnqueueOutcome, SyncOperation, SyncQueue, SyncRequest};
use crate::resilience::cancel::CancelToken;
use crate::storage::traits::{StorageError, StoreAdapter};

/// Both stores, each wrapped as `CachedStore → ResilientStore → adapter`
#[derive(Clone)]
pub struct StorePair {
    pub legacy: Arc<CachedStore>,
    pub target: Arc<CachedStore>,
}

impl StorePair {
    #[must_use]
    pub fn get(&self, role: StoreRole) -> &Arc<CachedStore> {
        match role {
            StoreRole::Legacy => &self.legacy,
            StoreRole::Target => &self.target,
        }
    }
}

/// What happened to the replica side of a write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Replication {
    /// The phase has no replica
    NotRequired,
    Queued(EnqueueOutcome),
    /// The write committed but could not be queued; reconciliation will find it
    EnqueueFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriteReceipt {
    pub id: String,
    /// Version committed on the authoritative store (0 for deletes)
    pub version: i64,
    pub authoritative: StoreRole,
    pub replication: Replication,
}

pub struct DualWriteCoordinator {
    phase: Arc<MigrationPhaseManager>,
    stores: StorePair,
    queue: Arc<dyn SyncQueue>,
}

impl DualWriteCoordinator {
    pub fn new(phase: Arc<MigrationPhaseManager>, stores: StorePair, queue: Arc<dyn SyncQueue>) -> Self {
        Self { phase, stores, queue }
    }

    #[must_use]
    pub fn stores(&self) -> &StorePair {
        &self.stores
    }

    /// Write to the authoritative store, then queue replication.
    ///
    /// `expected` is a compare-and-swap on the authoritative version (`Some(0)`
    /// means create-only). The store assigns the new version. If the put fails
    /// nothing is queued.
    pub async fn write(
        &self,
        entity: &Entity,
        expected: Option<i64>,
        cancel: &CancelToken,
    ) -> Result<WriteReceipt, EngineError> {
        if entity.id.is_empty() {
            return Err(StorageError::Validation("entity id must not be empty".into()).into());
        }

        let targets = self.phase.write_targets();
        let store = self.stores.get(targets.authoritative);

        let mut committed = Entity {
            id: entity.id.clone(),
            payload: entity.payload.clone(),
            version: 0,
        };
        committed.version = store.put(&committed, expected, cancel).await?;

        let operation = if expected == Some(0) || committed.version == 1 {
            SyncOperation::Create
        } else {
            SyncOperation::Update
        };
        debug!(
            entity_id = %committed.id,
            version = committed.version,
            store = %targets.authoritative,
            "Authoritative write committed"
        );

        let replication = match targets.replica {
            Some(replica) => self.replicate(SyncRequest::upsert(&committed, operation, replica)).await,
            None => Replication::NotRequired,
        };

        Ok(WriteReceipt {
            id: committed.id,
            version: committed.version,
            authoritative: targets.authoritative,
            replication,
        })
    }

    /// Delete from the authoritative store, then queue the delete for the replica.
    pub async fn delete(&self, id: &str, cancel: &CancelToken) -> Result<WriteReceipt, EngineError> {
        let targets = self.phase.write_targets();
        let store = self.stores.get(targets.authoritative);

        // The deleted version lets the replica keep a newer write of its own
        let version = store.inner().get(id, cancel).await?.map_or(0, |e| e.version);
        store.delete(id, cancel).await?;
        debug!(entity_id = %id, version, store = %targets.authoritative, "Authoritative delete committed");

        let replication = match targets.replica {
            Some(replica) => self.replicate(SyncRequest::delete(id, version, replica)).await,
            None => Replication::NotRequired,
        };

        Ok(WriteReceipt {
            id: id.to_string(),
            version: 0,
            authoritative: targets.authoritative,
            replication,
        })
    }

    /// Read from the phase's read store through the cache
    pub async fn read(&self, id: &str, cancel: &CancelToken) -> Result<Option<Entity>, EngineError> {
        let store = self.stores.get(self.phase.read_target());
        Ok(store.get(id, cancel).await?)
    }

    async fn replicate(&self, request: SyncRequest) -> Replication {
        let entity_id = request.entity_id.clone();
        let target = request.target;
        match self.queue.enqueue(request).await {
            Ok(outcome) => {
                metrics::record_enqueue(outcome.as_str());
                Replication::Queued(outcome)
            }
            Err(e) => {
                metrics::record_enqueue("failed");
                error!(
                    entity_id = %entity_id,
                    target = %target,
                    error = %e,
                    "Committed write could not be queued for replication"
                );
                Replication::EnqueueFailed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{cache_key, CacheLayer, CacheSettings, InMemoryCacheBackend};
    use crate::clock::ManualClock;
    use crate::phase::{CutoverChecks, CutoverGates, MigrationPhase};
    use crate::queue::{InMemorySyncQueue, QueueDepth, QueueError, SyncItem};
    use crate::storage::memory::InMemoryStore;
    use async_trait::async_trait;

    struct Harness {
        coordinator: DualWriteCoordinator,
        phase: Arc<MigrationPhaseManager>,
        legacy: Arc<InMemoryStore>,
        target: Arc<InMemoryStore>,
        queue: Arc<InMemorySyncQueue>,
        cache: Arc<InMemoryCacheBackend>,
    }

    fn harness_with_queue(phase: MigrationPhase, queue: Arc<dyn SyncQueue>) -> (DualWriteCoordinator, Harness) {
        let clock = Arc::new(ManualClock::default());
        let backend = Arc::new(InMemoryCacheBackend::new(clock.clone(), 100));
        let cache = Arc::new(CacheLayer::with_clock(backend.clone(), CacheSettings::default(), clock.clone()));
        let legacy = Arc::new(InMemoryStore::new("legacy"));
        let target = Arc::new(InMemoryStore::new("target"));
        let stores = StorePair {
            legacy: Arc::new(CachedStore::new(StoreRole::Legacy, legacy.clone(), cache.clone())),
            target: Arc::new(CachedStore::new(StoreRole::Target, target.clone(), cache)),
        };
        let manager = Arc::new(MigrationPhaseManager::new(phase, CutoverGates::default()));
        let memory_queue = Arc::new(InMemorySyncQueue::new(Default::default(), clock));
        let harness = Harness {
            coordinator: DualWriteCoordinator::new(manager.clone(), stores.clone(), memory_queue.clone()),
            phase: manager.clone(),
            legacy,
            target,
            queue: memory_queue,
            cache: backend,
        };
        (DualWriteCoordinator::new(manager, stores, queue), harness)
    }

    fn harness(phase: MigrationPhase) -> Harness {
        harness_with_queue(phase, Arc::new(InMemorySyncQueue::default())).1
    }

    fn json(id: &str, name: &str) -> Entity {
        Entity::from_json(id, &serde_json::json!({ "name": name }))
    }

    #[tokio::test]
    async fn test_primary_only_writes_legacy_without_replication() {
        let h = harness(MigrationPhase::PrimaryOnly);
        let cancel = CancelToken::never();

        let receipt = h.coordinator.write(&json("a", "Ada"), None, &cancel).await.unwrap();
        assert_eq!(receipt.version, 1);
        assert_eq!(receipt.authoritative, StoreRole::Legacy);
        assert_eq!(receipt.replication, Replication::NotRequired);
        assert!(h.legacy.peek("a").is_some());
        assert!(h.target.is_empty());
        assert!(h.queue.active("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dual_write_primary_read_queues_target() {
        let h = harness(MigrationPhase::DualWritePrimaryRead);
        let cancel = CancelToken::never();

        let receipt = h.coordinator.write(&json("a", "Ada"), Some(0), &cancel).await.unwrap();
        assert_eq!(receipt.replication, Replication::Queued(EnqueueOutcome::Inserted));

        let queued = h.queue.active("a").await.unwrap().unwrap();
        assert_eq!(queued.target, StoreRole::Target);
        assert_eq!(queued.operation, SyncOperation::Create);
        assert_eq!(queued.version, 1);
        assert!(h.target.is_empty(), "replica is written asynchronously");
    }

    #[tokio::test]
    async fn test_read_your_writes_on_authoritative_store() {
        let h = harness(MigrationPhase::DualWritePrimaryRead);
        let cancel = CancelToken::never();

        h.coordinator.write(&json("a", "v1"), None, &cancel).await.unwrap();
        assert_eq!(h.coordinator.read("a", &cancel).await.unwrap().unwrap().version, 1);

        h.coordinator.write(&json("a", "v2"), None, &cancel).await.unwrap();
        let read = h.coordinator.read("a", &cancel).await.unwrap().unwrap();
        assert_eq!(read.version, 2);
        assert_eq!(read.payload_json().unwrap()["name"], "v2");
    }

    #[tokio::test]
    async fn test_write_invalidates_cached_value() {
        let h = harness(MigrationPhase::DualWritePrimaryRead);
        let cancel = CancelToken::never();
        h.coordinator.write(&json("a", "v1"), None, &cancel).await.unwrap();
        h.coordinator.read("a", &cancel).await.unwrap();
        assert!(h.cache.contains(&cache_key(StoreRole::Legacy, "a")));

        h.coordinator.write(&json("a", "v2"), None, &cancel).await.unwrap();
        assert!(!h.cache.contains(&cache_key(StoreRole::Legacy, "a")));
    }

    #[tokio::test]
    async fn test_secondary_read_phase_routes_to_target() {
        let h = harness(MigrationPhase::DualWriteSecondaryRead);
        let cancel = CancelToken::never();
        h.legacy.put(&json("a", "legacy-only"), None, &cancel).await.unwrap();

        assert!(h.coordinator.read("a", &cancel).await.unwrap().is_none());

        let receipt = h.coordinator.write(&json("b", "Bo"), None, &cancel).await.unwrap();
        assert_eq!(receipt.authoritative, StoreRole::Target);
        assert!(h.target.peek("b").is_some());
        assert_eq!(h.queue.active("b").await.unwrap().unwrap().target, StoreRole::Legacy);
    }

    #[tokio::test]
    async fn test_failed_write_enqueues_nothing() {
        let h = harness(MigrationPhase::DualWritePrimaryRead);
        let cancel = CancelToken::never();
        h.coordinator.write(&json("a", "v1"), None, &cancel).await.unwrap();

        let err = h.coordinator.write(&json("a", "v2"), Some(7), &cancel).await.unwrap_err();
        assert!(matches!(err, EngineError::Storage(StorageError::Conflict { .. })));
        assert_eq!(h.queue.active("a").await.unwrap().unwrap().version, 1);

        let err = h.coordinator.write(&json("", "x"), None, &cancel).await.unwrap_err();
        assert!(matches!(err, EngineError::Storage(StorageError::Validation(_))));
    }

    #[tokio::test]
    async fn test_delete_queues_versioned_delete() {
        let h = harness(MigrationPhase::DualWritePrimaryRead);
        let cancel = CancelToken::never();
        h.coordinator.write(&json("a", "v1"), None, &cancel).await.unwrap();
        h.coordinator.write(&json("a", "v2"), None, &cancel).await.unwrap();

        h.coordinator.delete("a", &cancel).await.unwrap();
        assert!(h.legacy.peek("a").is_none());
        let queued = h.queue.active("a").await.unwrap().unwrap();
        assert_eq!(queued.operation, SyncOperation::Delete);
        assert_eq!(queued.version, 2);

        assert!(h.coordinator.delete("a", &cancel).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_phase_change_reroutes_next_write() {
        let h = harness(MigrationPhase::PrimaryOnly);
        let cancel = CancelToken::never();

        h.phase
            .set_phase(MigrationPhase::DualWritePrimaryRead, &CutoverChecks::default())
            .unwrap();
        let receipt = h.coordinator.write(&json("a", "x"), None, &cancel).await.unwrap();
        assert!(matches!(receipt.replication, Replication::Queued(_)));
    }

    struct BrokenQueue;

    #[async_trait]
    impl SyncQueue for BrokenQueue {
        async fn enqueue(&self, _: SyncRequest) -> Result<EnqueueOutcome, QueueError> {
            Err(QueueError::Connection("queue database down".into()))
        }
        async fn dequeue(&self, _: &str) -> Result<Option<SyncItem>, QueueError> {
            Ok(None)
        }
        async fn ack(&self, _: &SyncItem) -> Result<(), QueueError> {
            Ok(())
        }
        async fn nack(&self, _: &SyncItem, _: &str) -> Result<crate::queue::NackOutcome, QueueError> {
            Err(QueueError::Cancelled)
        }
        async fn release(&self, _: &SyncItem) -> Result<(), QueueError> {
            Ok(())
        }
        async fn active(&self, _: &str) -> Result<Option<SyncItem>, QueueError> {
            Ok(None)
        }
        async fn dead_lettered(&self) -> Result<Vec<SyncItem>, QueueError> {
            Ok(Vec::new())
        }
        async fn retry_dead_lettered(&self, id: &str) -> Result<crate::queue::DeadLetterRetry, QueueError> {
            Err(QueueError::NotFound(id.to_string()))
        }
        async fn depth(&self) -> Result<QueueDepth, QueueError> {
            Ok(QueueDepth::default())
        }
        async fn purge_applied(&self) -> Result<u64, QueueError> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_enqueue_failure_does_not_fail_committed_write() {
        let (coordinator, h) = harness_with_queue(MigrationPhase::DualWritePrimaryRead, Arc::new(BrokenQueue));
        let cancel = CancelToken::never();

        let receipt = coordinator.write(&json("a", "x"), None, &cancel).await.unwrap();
        assert_eq!(receipt.replication, Replication::EnqueueFailed);
        assert!(h.legacy.peek("a").is_some());
    }
}
