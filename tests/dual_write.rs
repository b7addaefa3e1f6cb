// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! End-to-end scenarios for the dual-write engine.
//!
//! Everything here runs in-process against `InMemoryStore` adapters and the
//! in-memory or SQLite sync queue; no external services are needed.
//!
//! ```bash
//! cargo test --test dual_write
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use dual_write_engine::clock::{self, ManualClock};
use dual_write_engine::queue::{
    InMemorySyncQueue, QueueError, QueueSettings, SqlSyncQueue, SyncOperation, SyncRequest,
};
use dual_write_engine::storage::{EntityStream, InMemoryStore, QuerySpec};
use dual_write_engine::worker::{ApplyOutcome, SyncApplier};
use dual_write_engine::{
    CancelToken, EngineConfig, Entity, MigrationEngine, MigrationPhase, Replication, StorageError, StoreAdapter,
    StoreRole, SyncQueue, SyncStatus,
};

// =============================================================================
// Harness
// =============================================================================

fn config(phase: MigrationPhase) -> EngineConfig {
    let mut config = EngineConfig { phase, ..EngineConfig::default() };
    config.retry.base_delay_ms = 1;
    config.retry.max_delay_ms = 5;
    config.sync.workers = 2;
    config.sync.poll_interval_ms = 5;
    config.sync.retry_backoff_ms = 5;
    config.sync.drain_timeout_sec = 2;
    config.reconciliation.interval_sec = 3_600;
    config
}

/// Log output for failing runs: `RUST_LOG=dual_write_engine=debug cargo test --test dual_write`
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

async fn engine_with(config: EngineConfig, target: Arc<dyn StoreAdapter>) -> (MigrationEngine, Arc<InMemoryStore>) {
    init_tracing();
    let legacy = Arc::new(InMemoryStore::new("legacy"));
    let engine = MigrationEngine::builder(config)
        .legacy(legacy.clone())
        .target(target)
        .build()
        .await
        .expect("engine builds");
    engine.start().await.expect("engine starts");
    (engine, legacy)
}

async fn wait_until<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..600 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn drained(engine: &MigrationEngine) {
    let queue = engine.queue();
    wait_until("queue drain", move || async move {
        queue.depth().await.map(|d| d.active() == 0).unwrap_or(false)
    })
    .await;
}

async fn stored(store: &InMemoryStore, id: &str) -> Option<Entity> {
    store.get(id, &CancelToken::never()).await.unwrap()
}

/// A store whose every call fails as if the network were down
struct Unreachable;

#[async_trait]
impl StoreAdapter for Unreachable {
    fn name(&self) -> &str {
        "unreachable"
    }
    async fn get(&self, _: &str, _: &CancelToken) -> Result<Option<Entity>, StorageError> {
        Err(StorageError::Unavailable("connection refused".into()))
    }
    async fn put(&self, _: &Entity, _: Option<i64>, _: &CancelToken) -> Result<i64, StorageError> {
        Err(StorageError::Unavailable("connection refused".into()))
    }
    async fn delete(&self, _: &str, _: &CancelToken) -> Result<(), StorageError> {
        Err(StorageError::Unavailable("connection refused".into()))
    }
    fn query<'a>(&'a self, _: QuerySpec, _: &'a CancelToken) -> EntityStream<'a> {
        Box::pin(futures::stream::once(async {
            Err(StorageError::Unavailable("connection refused".into()))
        }))
    }
}

// =============================================================================
// Read-your-writes and cache invalidation
// =============================================================================

#[tokio::test]
async fn test_read_your_writes_under_dual_write() {
    let target = Arc::new(InMemoryStore::new("target"));
    let (engine, _legacy) = engine_with(config(MigrationPhase::DualWritePrimaryRead), target).await;

    for n in 0..20 {
        let value = json!({"n": n});
        engine.write(&Entity::from_json("A", &value), None).await.unwrap();
        let read = engine.read("A").await.unwrap().unwrap();
        assert_eq!(read.payload_json(), Some(value));
    }
    engine.shutdown().await;
}

#[tokio::test]
async fn test_write_invalidates_cached_read() {
    let target = Arc::new(InMemoryStore::new("target"));
    let (engine, _legacy) = engine_with(config(MigrationPhase::DualWritePrimaryRead), target).await;

    engine.write(&Entity::new("A", b"v1".to_vec()), None).await.unwrap();
    assert_eq!(engine.read("A").await.unwrap().unwrap().payload, b"v1");
    assert_eq!(engine.read("A").await.unwrap().unwrap().payload, b"v1");
    assert!(engine.health().await.unwrap().cache.hits >= 1);

    engine.write(&Entity::new("A", b"v2".to_vec()), None).await.unwrap();
    assert_eq!(engine.read("A").await.unwrap().unwrap().payload, b"v2");

    engine.delete("A").await.unwrap();
    assert_eq!(engine.read("A").await.unwrap(), None);
    engine.shutdown().await;
}

// =============================================================================
// End-to-end replication
// =============================================================================

#[tokio::test]
async fn test_write_reaches_both_stores_with_zero_discrepancies() {
    let target = Arc::new(InMemoryStore::new("target"));
    let (engine, legacy) = engine_with(config(MigrationPhase::DualWritePrimaryRead), target.clone()).await;
    let since = engine.now_millis();

    let p1 = json!({"name": "Ada", "tier": "gold"});
    let receipt = engine.write(&Entity::from_json("A", &p1), None).await.unwrap();
    assert_eq!(receipt.authoritative, StoreRole::Legacy);
    assert!(matches!(receipt.replication, Replication::Queued(_)));

    drained(&engine).await;
    assert_eq!(stored(&legacy, "A").await.unwrap().payload_json(), Some(p1.clone()));
    let replica = stored(&target, "A").await.unwrap();
    assert_eq!(replica.payload_json(), Some(p1));
    assert_eq!(replica.version, receipt.version);

    let summary = engine.reconcile_now().await.unwrap();
    assert!(summary.completed);
    assert_eq!(summary.entities_checked, 1);
    assert_eq!(summary.discrepancies, 0);

    let report = engine.reconciliation_report(since).await.unwrap();
    assert!(report.is_clean(), "unexpected report: {report:?}");
    engine.shutdown().await;
}

#[tokio::test]
async fn test_unreachable_secondary_dead_letters_and_reports_out_of_sync() {
    let mut cfg = config(MigrationPhase::DualWritePrimaryRead);
    cfg.sync.max_attempts = 3;
    cfg.retry.max_attempts = 1;
    let (engine, legacy) = engine_with(cfg, Arc::new(Unreachable)).await;

    let started = std::time::Instant::now();
    let receipt = engine.write(&Entity::new("A", b"P1".to_vec()), None).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(receipt.version, 1);
    assert!(stored(&legacy, "A").await.is_some());

    let queue = engine.queue();
    wait_until("dead letter", move || async move {
        queue.depth().await.map(|d| d.dead_lettered == 1).unwrap_or(false)
    })
    .await;

    let dead = engine.queue().dead_lettered().await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].entity_id, "A");
    assert_eq!(dead[0].status, SyncStatus::DeadLettered);
    assert_eq!(dead[0].attempts, 3);
    assert!(dead[0].last_error.as_deref().unwrap_or_default().contains("refused"));

    let report = engine.reconciliation_report(0).await.unwrap();
    assert_eq!(report.out_of_sync, vec!["A".to_string()]);
    assert_eq!(report.dead_lettered.len(), 1);

    let err = engine.set_phase(MigrationPhase::DualWriteSecondaryRead).await.unwrap_err();
    assert!(matches!(err, dual_write_engine::EngineError::PhaseTransitionRejected { .. }));
    assert!(err.to_string().contains("dead-lettered"));
    engine.shutdown().await;
}

#[tokio::test]
async fn test_secondary_read_phase_replicates_back_to_legacy() {
    let target = Arc::new(InMemoryStore::new("target"));
    let (engine, legacy) = engine_with(config(MigrationPhase::DualWriteSecondaryRead), target.clone()).await;

    let receipt = engine.write(&Entity::new("B", b"x".to_vec()), None).await.unwrap();
    assert_eq!(receipt.authoritative, StoreRole::Target);
    drained(&engine).await;

    assert_eq!(stored(&legacy, "B").await.unwrap().version, receipt.version);
    assert_eq!(engine.read("B").await.unwrap().unwrap().payload, b"x");
    engine.shutdown().await;
}

#[tokio::test]
async fn test_repair_mode_heals_missing_replica_rows() {
    let target = Arc::new(InMemoryStore::new("target"));
    let mut cfg = config(MigrationPhase::DualWritePrimaryRead);
    cfg.reconciliation.repair = true;
    cfg.reconciliation.batch_size = 2;
    let (engine, legacy) = engine_with(cfg, target.clone()).await;

    // written before dual-write began
    for id in ["a", "b", "c", "d", "e"] {
        legacy.put(&Entity::new(id, id.as_bytes().to_vec()), None, &CancelToken::never()).await.unwrap();
    }

    let summary = engine.reconcile_now().await.unwrap();
    assert_eq!(summary.discrepancies, 5);
    assert_eq!(summary.repairs_enqueued, 5);
    drained(&engine).await;
    assert_eq!(target.len(), 5);

    let summary = engine.reconcile_now().await.unwrap();
    assert_eq!(summary.discrepancies, 0);
    assert_eq!(summary.resolved, 5);
    assert!(engine.reconciliation_report(0).await.unwrap().open().next().is_none());
    engine.shutdown().await;
}

// =============================================================================
// Idempotent replay
// =============================================================================

#[tokio::test]
async fn test_redelivered_item_is_applied_once() {
    let clock = Arc::new(ManualClock::default());
    let settings = QueueSettings {
        lease_timeout: Duration::from_secs(30),
        ..QueueSettings::default()
    };
    let queue = InMemorySyncQueue::new(settings, clock.clone());
    let legacy = Arc::new(InMemoryStore::new("legacy"));
    let target = Arc::new(InMemoryStore::new("target"));
    let applier = SyncApplier::new(legacy, target.clone());

    let entity = Entity::new("A", b"P1".to_vec()).with_version(4);
    queue
        .enqueue(SyncRequest::upsert(&entity, SyncOperation::Update, StoreRole::Target))
        .await
        .unwrap();

    // first worker stalls past its lease
    let first = queue.dequeue("w1").await.unwrap().unwrap();
    clock.advance(Duration::from_secs(31));
    let second = queue.dequeue("w2").await.unwrap().unwrap();
    assert_eq!(first.id, second.id);

    let cancel = CancelToken::never();
    assert_eq!(applier.apply(&first, &cancel).await.unwrap(), ApplyOutcome::Applied);
    let once = stored(&target, "A").await.unwrap();
    assert_eq!(applier.apply(&second, &cancel).await.unwrap(), ApplyOutcome::AlreadyCurrent);
    assert_eq!(stored(&target, "A").await.unwrap(), once);
    assert_eq!(once.version, 4);

    assert!(matches!(queue.ack(&first).await, Err(QueueError::LeaseLost { .. })));
    queue.ack(&second).await.unwrap();
    assert_eq!(queue.depth().await.unwrap().active(), 0);
}

// =============================================================================
// One active item per entity
// =============================================================================

async fn hammer_single_entity(queue: Arc<dyn SyncQueue>) {
    let writes = (1..=40).map(|version| {
        let queue = Arc::clone(&queue);
        tokio::spawn(async move {
            let entity = Entity::new("hot", format!("v{version}").into_bytes()).with_version(version);
            queue
                .enqueue(SyncRequest::upsert(&entity, SyncOperation::Update, StoreRole::Target))
                .await
        })
    });
    for result in futures::future::join_all(writes).await {
        result.unwrap().unwrap();
    }

    let depth = queue.depth().await.unwrap();
    assert_eq!(depth.active(), 1, "depth after concurrent enqueue: {depth:?}");
    let active = queue.active("hot").await.unwrap().unwrap();
    assert_eq!(active.version, 40);

    // writes racing a worker park behind the claimed item
    let claimed = queue.dequeue("w").await.unwrap().unwrap();
    let writes = (41..=60).map(|version| {
        let queue = Arc::clone(&queue);
        tokio::spawn(async move {
            let entity = Entity::new("hot", format!("v{version}").into_bytes()).with_version(version);
            queue
                .enqueue(SyncRequest::upsert(&entity, SyncOperation::Update, StoreRole::Target))
                .await
        })
    });
    for result in futures::future::join_all(writes).await {
        result.unwrap().unwrap();
    }
    let depth = queue.depth().await.unwrap();
    assert_eq!((depth.pending, depth.processing), (0, 1));

    queue.ack(&claimed).await.unwrap();
    let depth = queue.depth().await.unwrap();
    assert_eq!((depth.pending, depth.processing), (1, 0));
    assert_eq!(queue.active("hot").await.unwrap().unwrap().version, 60);
}

#[tokio::test]
async fn test_one_active_item_per_entity_in_memory() {
    let queue = Arc::new(InMemorySyncQueue::new(QueueSettings::default(), clock::system()));
    hammer_single_entity(queue).await;
}

#[tokio::test]
async fn test_one_active_item_per_entity_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite:{}?mode=rwc", dir.path().join("queue.db").display());
    let queue = SqlSyncQueue::connect(&url, QueueSettings::default(), clock::system())
        .await
        .unwrap();
    hammer_single_entity(Arc::new(queue)).await;
}
