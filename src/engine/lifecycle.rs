// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Engine lifecycle (start, shutdown) and the data path.

use tracing::{info, warn};

use crate::coordinator::WriteReceipt;
use crate::entity::Entity;
use crate::error::EngineError;
use crate::resilience::cancel::CancelToken;

use super::{EngineState, MigrationEngine};

impl MigrationEngine {
    /// Start the sync workers and the reconciliation scheduler.
    ///
    /// Starting a running engine is a no-op. A stopped engine cannot be
    /// restarted; build a new one.
    #[tracing::instrument(skip(self), fields(phase = %self.phase.current()))]
    pub async fn start(&self) -> Result<(), EngineError> {
        match self.state() {
            EngineState::Running => return Ok(()),
            EngineState::Created => {}
            other => return Err(EngineError::NotRunning(other.to_string())),
        }

        let start = std::time::Instant::now();
        match self.queue.depth().await {
            Ok(depth) => {
                crate::metrics::set_queue_depth(&depth);
                if depth.dead_lettered > 0 {
                    warn!(dead_lettered = depth.dead_lettered, "Sync queue has dead-lettered items");
                }
                info!(pending = depth.active(), "Sync queue ready");
            }
            Err(e) => warn!(error = %e, "Could not read sync queue depth"),
        }

        self.workers.start();
        let handle = self.reconciler.spawn(self.shutdown.token());
        *self.scheduler.lock() = Some(handle);

        self.set_state(EngineState::Running);
        info!(
            elapsed_ms = start.elapsed().as_millis() as u64,
            cache = self.cache.backend_name(),
            "Migration engine running"
        );
        Ok(())
    }

    /// Stop accepting calls, drain the sync workers and stop the scheduler.
    ///
    /// Items still pending stay in the queue for the next engine.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) {
        if matches!(self.state(), EngineState::ShuttingDown | EngineState::Stopped) {
            return;
        }
        let started = std::time::Instant::now();
        info!("Initiating migration engine shutdown...");
        self.set_state(EngineState::ShuttingDown);

        self.shutdown.cancel();
        self.workers.shutdown().await;

        let scheduler = self.scheduler.lock().take();
        if let Some(handle) = scheduler {
            if let Err(e) = handle.await {
                warn!(error = %e, "Reconciliation scheduler ended abnormally");
            }
        }

        if let Ok(depth) = self.queue.depth().await {
            crate::metrics::set_queue_depth(&depth);
            if depth.active() > 0 {
                info!(remaining = depth.active(), "Sync items left for the next start");
            }
        }

        self.set_state(EngineState::Stopped);
        info!(elapsed_ms = started.elapsed().as_millis() as u64, "Migration engine shutdown complete");
    }

    /// Write through the active phase's authoritative store.
    ///
    /// `expected` is a compare-and-swap on the authoritative version;
    /// `Some(0)` means create-only.
    pub async fn write(&self, entity: &Entity, expected: Option<i64>) -> Result<WriteReceipt, EngineError> {
        self.write_with(entity, expected, &CancelToken::never()).await
    }

    pub async fn write_with(
        &self,
        entity: &Entity,
        expected: Option<i64>,
        cancel: &CancelToken,
    ) -> Result<WriteReceipt, EngineError> {
        self.ensure_running()?;
        self.coordinator.write(entity, expected, cancel).await
    }

    /// Read from the active phase's read store, through the cache
    pub async fn read(&self, id: &str) -> Result<Option<Entity>, EngineError> {
        self.read_with(id, &CancelToken::never()).await
    }

    pub async fn read_with(&self, id: &str, cancel: &CancelToken) -> Result<Option<Entity>, EngineError> {
        self.ensure_running()?;
        self.coordinator.read(id, cancel).await
    }

    pub async fn delete(&self, id: &str) -> Result<WriteReceipt, EngineError> {
        self.delete_with(id, &CancelToken::never()).await
    }

    pub async fn delete_with(&self, id: &str, cancel: &CancelToken) -> Result<WriteReceipt, EngineError> {
        self.ensure_running()?;
        self.coordinator.delete(id, cancel).await
    }
}
