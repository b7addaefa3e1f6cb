// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sync workers: background tasks draining the queue into replica stores.
//!
//! # Apply rule (last writer wins by version)
//!
//! | replica holds | upsert item | delete item |
//! |---|---|---|
//! | nothing | put, expecting absence | done |
//! | older version | put, CAS on the observed version | delete |
//! | same version, same payload | done | delete |
//! | newer version | done | done |
//!
//! Replaying an item is therefore harmless: the second apply finds the
//! replica already current. A CAS conflict means someone wrote the replica
//! between our read and our write; the item is nacked and retried later.
//!
//! # Shutdown
//!
//! ```text
//! shutdown() → stop claiming → wait up to drain_timeout → abort stragglers → release their leases
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cache::{cache_key, CacheLayer};
use crate::metrics;
use crate::phase::StoreRole;
use crate::queue::{NackOutcome, QueueError, SyncItem, SyncOperation, SyncQueue};
use crate::resilience::cancel::{CancelSource, CancelToken};
use crate::storage::traits::{StorageError, StoreAdapter};

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Number of worker tasks
    pub workers: usize,
    /// Sleep between polls of an empty queue
    pub poll_interval: Duration,
    /// How long shutdown waits for in-flight items
    pub drain_timeout: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            poll_interval: Duration::from_millis(200),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The replica was changed
    Applied,
    /// The replica already reflected the item (or something newer)
    AlreadyCurrent,
}

impl ApplyOutcome {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::AlreadyCurrent => "already_current",
        }
    }
}

/// Applies sync items to the store named by the item's target.
///
/// Holds the uncached, resilience-wrapped stores. After a change the
/// replica's cache key is invalidated so a later phase flip never reads a
/// stale entry.
pub struct SyncApplier {
    legacy: Arc<dyn StoreAdapter>,
    target: Arc<dyn StoreAdapter>,
    cache: Option<Arc<CacheLayer>>,
}

impl SyncApplier {
    pub fn new(legacy: Arc<dyn StoreAdapter>, target: Arc<dyn StoreAdapter>) -> Self {
        Self {
            legacy,
            target,
            cache: None,
        }
    }

    #[must_use]
    pub fn with_cache(mut self, cache: Arc<CacheLayer>) -> Self {
        self.cache = Some(cache);
        self
    }

    fn store(&self, role: StoreRole) -> &Arc<dyn StoreAdapter> {
        match role {
            StoreRole::Legacy => &self.legacy,
            StoreRole::Target => &self.target,
        }
    }

    pub async fn apply(&self, item: &SyncItem, cancel: &CancelToken) -> Result<ApplyOutcome, StorageError> {
        let store = self.store(item.target);
        let current = store.get(&item.entity_id, cancel).await?;

        let outcome = match item.operation {
            SyncOperation::Create | SyncOperation::Update => {
                let expected = match current {
                    Some(ref c) if c.version > item.version => return Ok(ApplyOutcome::AlreadyCurrent),
                    Some(ref c) if c.version == item.version && c.payload == item.payload => {
                        return Ok(ApplyOutcome::AlreadyCurrent)
                    }
                    Some(ref c) => c.version,
                    None => 0,
                };
                store.put(&item.to_entity(), Some(expected), cancel).await?;
                ApplyOutcome::Applied
            }
            SyncOperation::Delete => match current {
                None => return Ok(ApplyOutcome::AlreadyCurrent),
                // Version 0 is an unversioned delete
                Some(ref c) if item.version > 0 && c.version > item.version => {
                    return Ok(ApplyOutcome::AlreadyCurrent)
                }
                Some(_) => match store.delete(&item.entity_id, cancel).await {
                    Ok(()) | Err(StorageError::NotFound(_)) => ApplyOutcome::Applied,
                    Err(e) => return Err(e),
                },
            },
        };

        if let Some(ref cache) = self.cache {
            cache.invalidate(&cache_key(item.target, &item.entity_id)).await;
        }
        Ok(outcome)
    }
}

/// Pool of independent tokio tasks draining a [`SyncQueue`].
///
/// Per-entity exclusivity comes from the queue lease, so workers never
/// coordinate with each other.
pub struct SyncWorkerPool {
    queue: Arc<dyn SyncQueue>,
    applier: Arc<SyncApplier>,
    settings: WorkerSettings,
    /// Stops claiming; never cancels an in-flight apply
    shutdown: CancelSource,
    /// Claimed items by item id
    in_flight: Arc<DashMap<String, SyncItem>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    instance: String,
}

impl SyncWorkerPool {
    pub fn new(queue: Arc<dyn SyncQueue>, applier: Arc<SyncApplier>, settings: WorkerSettings) -> Self {
        let instance = uuid::Uuid::new_v4().simple().to_string();
        Self {
            queue,
            applier,
            settings,
            shutdown: CancelSource::new(),
            in_flight: Arc::new(DashMap::new()),
            handles: Mutex::new(Vec::new()),
            instance: instance[..8].to_string(),
        }
    }

    #[must_use]
    pub fn settings(&self) -> &WorkerSettings {
        &self.settings
    }

    /// Items currently being applied
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.handles.lock().is_empty() && !self.shutdown.is_cancelled()
    }

    /// Spawn the worker tasks. Calling it again while running is a no-op.
    pub fn start(&self) {
        let mut handles = self.handles.lock();
        if !handles.is_empty() || self.shutdown.is_cancelled() {
            return;
        }

        for n in 0..self.settings.workers.max(1) {
            let worker = Worker {
                id: format!("{}-{}", self.instance, n),
                queue: Arc::clone(&self.queue),
                applier: Arc::clone(&self.applier),
                in_flight: Arc::clone(&self.in_flight),
                poll_interval: self.settings.poll_interval,
                reports_depth: n == 0,
            };
            let shutdown = self.shutdown.token();
            handles.push(tokio::spawn(async move { worker.run(shutdown).await }));
        }
        info!(workers = handles.len(), instance = %self.instance, "Sync workers started");
    }

    /// Claim and process one item as `worker_id`. Returns whether an item was
    /// claimed. Runs on the caller's task, independent of [`start`](Self::start).
    pub async fn run_once(&self, worker_id: &str) -> Result<bool, QueueError> {
        let worker = Worker {
            id: worker_id.to_string(),
            queue: Arc::clone(&self.queue),
            applier: Arc::clone(&self.applier),
            in_flight: Arc::clone(&self.in_flight),
            poll_interval: self.settings.poll_interval,
            reports_depth: false,
        };
        worker.step().await
    }

    /// Stop claiming, wait for in-flight items up to the drain timeout, then
    /// abort what is left and hand its leases back to the queue.
    #[tracing::instrument(skip(self), fields(instance = %self.instance))]
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let mut handles = std::mem::take(&mut *self.handles.lock());
        if handles.is_empty() {
            return;
        }

        let drained = tokio::time::timeout(
            self.settings.drain_timeout,
            futures::future::join_all(handles.iter_mut()),
        )
        .await
        .is_ok();

        if !drained {
            warn!(
                in_flight = self.in_flight.len(),
                timeout_ms = self.settings.drain_timeout.as_millis() as u64,
                "Sync workers did not drain in time, aborting"
            );
            for handle in &handles {
                handle.abort();
            }
            futures::future::join_all(handles.iter_mut()).await;
        }

        let leftovers: Vec<SyncItem> = self.in_flight.iter().map(|e| e.value().clone()).collect();
        for item in leftovers {
            match self.queue.release(&item).await {
                Ok(()) => debug!(entity_id = %item.entity_id, "Released sync item on shutdown"),
                Err(e) => warn!(entity_id = %item.entity_id, error = %e, "Failed to release sync item"),
            }
            self.in_flight.remove(&item.id);
        }
        info!("Sync workers stopped");
    }
}

struct Worker {
    id: String,
    queue: Arc<dyn SyncQueue>,
    applier: Arc<SyncApplier>,
    in_flight: Arc<DashMap<String, SyncItem>>,
    poll_interval: Duration,
    reports_depth: bool,
}

impl Worker {
    async fn run(self, shutdown: CancelToken) {
        debug!(worker_id = %self.id, "Sync worker running");
        while !shutdown.is_cancelled() {
            match self.step().await {
                Ok(true) => continue,
                Ok(false) => {
                    if self.reports_depth {
                        if let Ok(depth) = self.queue.depth().await {
                            metrics::set_queue_depth(&depth);
                        }
                    }
                }
                Err(e) => warn!(worker_id = %self.id, error = %e, "Sync queue unavailable"),
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
        debug!(worker_id = %self.id, "Sync worker exiting");
    }

    async fn step(&self) -> Result<bool, QueueError> {
        let Some(item) = self.queue.dequeue(&self.id).await? else {
            return Ok(false);
        };
        self.in_flight.insert(item.id.clone(), item.clone());
        self.process(&item).await;
        self.in_flight.remove(&item.id);
        Ok(true)
    }

    async fn process(&self, item: &SyncItem) {
        let started = Instant::now();
        let target = item.target.as_str();

        match self.applier.apply(item, &CancelToken::never()).await {
            Ok(outcome) => match self.queue.ack(item).await {
                Ok(()) => {
                    metrics::record_sync_applied(target, item.operation.as_str(), outcome.as_str());
                    debug!(
                        worker_id = %self.id,
                        entity_id = %item.entity_id,
                        version = item.version,
                        outcome = outcome.as_str(),
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Sync item applied"
                    );
                }
                Err(QueueError::LeaseLost { .. }) => {
                    warn!(worker_id = %self.id, entity_id = %item.entity_id, "Lease expired before ack, item will be redelivered");
                }
                Err(e) => error!(worker_id = %self.id, entity_id = %item.entity_id, error = %e, "Failed to ack sync item"),
            },
            Err(apply_err) => {
                metrics::record_sync_failure(target);
                match self.queue.nack(item, &apply_err.to_string()).await {
                    Ok(NackOutcome::Requeued { attempts, retry_at }) => {
                        warn!(
                            worker_id = %self.id,
                            entity_id = %item.entity_id,
                            target,
                            attempts,
                            retry_at,
                            error = %apply_err,
                            "Sync apply failed, will retry"
                        );
                    }
                    Ok(NackOutcome::DeadLettered { attempts }) => {
                        metrics::record_dead_letter(target);
                        error!(
                            entity_id = %item.entity_id,
                            target,
                            attempts,
                            error = %apply_err,
                            "Sync item dead-lettered"
                        );
                    }
                    Err(e) => warn!(worker_id = %self.id, entity_id = %item.entity_id, error = %e, "Failed to nack sync item"),
                }
            }
        }
    }
}
