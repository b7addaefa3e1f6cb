// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Migration engine: owns every component and their lifecycle.
//!
//! The [`MigrationEngine`] wires together:
//! - the phase manager that routes reads and writes
//! - both stores, each behind `CachedStore → ResilientStore`
//! - the sync queue and the worker pool draining it into the replica
//! - the reconciliation scheduler
//!
//! # Lifecycle
//!
//! ```text
//! Created → Running → ShuttingDown → Stopped
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use dual_write_engine::{EngineConfig, Entity, MigrationEngine, MigrationPhase};
//! use dual_write_engine::storage::InMemoryStore;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), dual_write_engine::EngineError> {
//! let engine = MigrationEngine::builder(EngineConfig::default())
//!     .legacy(Arc::new(InMemoryStore::new("legacy")))
//!     .target(Arc::new(InMemoryStore::new("target")))
//!     .build()
//!     .await?;
//!
//! engine.start().await?;
//! engine.set_phase(MigrationPhase::DualWritePrimaryRead).await?;
//! engine.write(&Entity::new("user.1", b"{}".to_vec()), None).await?;
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod admin;
mod lifecycle;
mod types;

pub use types::{EngineHealth, EngineState};

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::cache::{CacheBackend, CacheLayer, CachedStore, InMemoryCacheBackend, RedisCacheBackend};
use crate::clock::{self, SharedClock};
use crate::config::EngineConfig;
use crate::coordinator::{DualWriteCoordinator, StorePair};
use crate::error::EngineError;
use crate::phase::{MigrationPhaseManager, StoreRole};
use crate::queue::{InMemorySyncQueue, SqlSyncQueue, SyncQueue};
use crate::reconcile::{
    CursorStore, DiscrepancySink, InMemoryCursorStore, InMemoryDiscrepancySink, ReconciliationService,
    SqlCursorStore,
};
use crate::resilience::cancel::CancelSource;
use crate::storage::{ResilientStore, StoreAdapter};
use crate::worker::{SyncApplier, SyncWorkerPool};

/// Cursor row used by the engine's reconciler
const CURSOR_NAME: &str = "default";

/// Top-level handle. `Send + Sync`; share it by `Arc`.
pub struct MigrationEngine {
    pub(super) config: EngineConfig,
    pub(super) state: watch::Sender<EngineState>,
    pub(super) state_rx: watch::Receiver<EngineState>,
    pub(super) phase: Arc<MigrationPhaseManager>,
    /// Uncached stores, also used by the workers and the reconciler
    pub(super) legacy: Arc<ResilientStore>,
    pub(super) target: Arc<ResilientStore>,
    pub(super) cache: Arc<CacheLayer>,
    pub(super) queue: Arc<dyn SyncQueue>,
    pub(super) coordinator: DualWriteCoordinator,
    pub(super) workers: SyncWorkerPool,
    pub(super) reconciler: Arc<ReconciliationService>,
    pub(super) scheduler: Mutex<Option<JoinHandle<()>>>,
    pub(super) shutdown: CancelSource,
    pub(super) clock: SharedClock,
}

impl MigrationEngine {
    #[must_use]
    pub fn builder(config: EngineConfig) -> MigrationEngineBuilder {
        MigrationEngineBuilder::new(config)
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Receiver that observes lifecycle changes
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state() == EngineState::Running
    }

    pub(super) fn set_state(&self, state: EngineState) {
        self.state.send_replace(state);
        crate::metrics::set_engine_state(state.as_str());
    }

    pub(super) fn ensure_running(&self) -> Result<(), EngineError> {
        match self.state() {
            EngineState::Running => Ok(()),
            other => Err(EngineError::NotRunning(other.to_string())),
        }
    }

    /// The sync queue, for inspection
    #[must_use]
    pub fn queue(&self) -> &Arc<dyn SyncQueue> {
        &self.queue
    }

    #[must_use]
    pub fn coordinator(&self) -> &DualWriteCoordinator {
        &self.coordinator
    }
}

/// Collects the collaborators and builds a [`MigrationEngine`].
///
/// Only the two store adapters are required. Everything else defaults from
/// the config: a SQL queue when `sync.queueUrl` is set (in-memory otherwise),
/// a Redis cache when `cache.redisUrl` is set (in-memory otherwise, and as
/// the fallback when Redis cannot be reached).
pub struct MigrationEngineBuilder {
    config: EngineConfig,
    legacy: Option<Arc<dyn StoreAdapter>>,
    target: Option<Arc<dyn StoreAdapter>>,
    queue: Option<Arc<dyn SyncQueue>>,
    cache_backend: Option<Arc<dyn CacheBackend>>,
    sink: Option<Arc<dyn DiscrepancySink>>,
    cursors: Option<Arc<dyn CursorStore>>,
    clock: Option<SharedClock>,
}

impl MigrationEngineBuilder {
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            legacy: None,
            target: None,
            queue: None,
            cache_backend: None,
            sink: None,
            cursors: None,
            clock: None,
        }
    }

    #[must_use]
    pub fn legacy(mut self, store: Arc<dyn StoreAdapter>) -> Self {
        self.legacy = Some(store);
        self
    }

    #[must_use]
    pub fn target(mut self, store: Arc<dyn StoreAdapter>) -> Self {
        self.target = Some(store);
        self
    }

    /// Use this queue instead of the one `sync.queueUrl` describes
    #[must_use]
    pub fn queue(mut self, queue: Arc<dyn SyncQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    #[must_use]
    pub fn cache_backend(mut self, backend: Arc<dyn CacheBackend>) -> Self {
        self.cache_backend = Some(backend);
        self
    }

    #[must_use]
    pub fn discrepancy_sink(mut self, sink: Arc<dyn DiscrepancySink>) -> Self {
        self.sink = Some(sink);
        self
    }

    #[must_use]
    pub fn cursor_store(mut self, cursors: Arc<dyn CursorStore>) -> Self {
        self.cursors = Some(cursors);
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Validate the config, connect the configured backends and wire the engine.
    /// The engine is returned in [`EngineState::Created`].
    #[tracing::instrument(skip(self), fields(phase = %self.config.phase))]
    pub async fn build(self) -> Result<MigrationEngine, EngineError> {
        let config = self.config;
        config.validate()?;

        let legacy = self
            .legacy
            .ok_or_else(|| EngineError::Config("a legacy store adapter is required".into()))?;
        let target = self
            .target
            .ok_or_else(|| EngineError::Config("a target store adapter is required".into()))?;
        let clock = self.clock.unwrap_or_else(clock::system);

        let (queue, cursors): (Arc<dyn SyncQueue>, Arc<dyn CursorStore>) = match (self.queue, &config.sync.queue_url) {
            (Some(queue), _) => {
                let cursors = self.cursors.unwrap_or_else(|| Arc::new(InMemoryCursorStore::new()));
                (queue, cursors)
            }
            (None, Some(url)) => {
                let queue = SqlSyncQueue::connect(url, config.queue_settings(), Arc::clone(&clock)).await?;
                let cursors: Arc<dyn CursorStore> = match self.cursors {
                    Some(cursors) => cursors,
                    None => Arc::new(SqlCursorStore::from_pool(queue.pool(), queue.is_sqlite(), CURSOR_NAME).await?),
                };
                info!(sqlite = queue.is_sqlite(), "Using SQL sync queue");
                (Arc::new(queue), cursors)
            }
            (None, None) => {
                let cursors = self.cursors.unwrap_or_else(|| Arc::new(InMemoryCursorStore::new()));
                let queue = InMemorySyncQueue::new(config.queue_settings(), Arc::clone(&clock));
                (Arc::new(queue), cursors)
            }
        };

        let backend: Arc<dyn CacheBackend> = match (self.cache_backend, &config.cache.redis_url) {
            (Some(backend), _) => backend,
            (None, Some(url)) => match RedisCacheBackend::connect(url, &config.cache.key_prefix, Arc::clone(&clock)).await {
                Ok(redis) => Arc::new(redis),
                Err(e) => {
                    warn!(error = %e, "Redis unavailable, falling back to the in-process cache");
                    Arc::new(InMemoryCacheBackend::new(Arc::clone(&clock), config.cache.max_entries))
                }
            },
            (None, None) => Arc::new(InMemoryCacheBackend::new(Arc::clone(&clock), config.cache.max_entries)),
        };
        let cache = Arc::new(CacheLayer::with_clock(backend, config.cache_settings(), Arc::clone(&clock)));

        let pipeline = config.pipeline_config();
        let legacy = Arc::new(ResilientStore::new(legacy, pipeline.clone(), Arc::clone(&clock)));
        let target = Arc::new(ResilientStore::new(target, pipeline, Arc::clone(&clock)));
        let legacy_dyn: Arc<dyn StoreAdapter> = legacy.clone();
        let target_dyn: Arc<dyn StoreAdapter> = target.clone();

        let phase = Arc::new(MigrationPhaseManager::new(config.phase, config.cutover_gates()));
        let stores = StorePair {
            legacy: Arc::new(CachedStore::new(StoreRole::Legacy, Arc::clone(&legacy_dyn), Arc::clone(&cache))),
            target: Arc::new(CachedStore::new(StoreRole::Target, Arc::clone(&target_dyn), Arc::clone(&cache))),
        };
        let coordinator = DualWriteCoordinator::new(Arc::clone(&phase), stores, Arc::clone(&queue));

        let applier = SyncApplier::new(Arc::clone(&legacy_dyn), Arc::clone(&target_dyn)).with_cache(Arc::clone(&cache));
        let workers = SyncWorkerPool::new(Arc::clone(&queue), Arc::new(applier), config.worker_settings());

        let sink = self.sink.unwrap_or_else(|| Arc::new(InMemoryDiscrepancySink::default()));
        let reconciler = Arc::new(ReconciliationService::new(
            Arc::clone(&phase),
            legacy_dyn,
            target_dyn,
            Arc::clone(&queue),
            sink,
            cursors,
            config.reconcile_settings(),
            Arc::clone(&clock),
        ));

        info!(
            cache = cache.backend_name(),
            workers = config.sync.workers,
            "Migration engine built"
        );

        let (state, state_rx) = watch::channel(EngineState::Created);
        crate::metrics::set_engine_state(EngineState::Created.as_str());

        Ok(MigrationEngine {
            config,
            state,
            state_rx,
            phase,
            legacy,
            target,
            cache,
            queue,
            coordinator,
            workers,
            reconciler,
            scheduler: Mutex::new(None),
            shutdown: CancelSource::new(),
            clock,
        })
    }
}
