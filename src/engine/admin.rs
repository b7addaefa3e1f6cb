// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Administrative interface: phase changes, reconciliation and dead letters.

use tokio::sync::watch;
use tracing::info;

use crate::error::EngineError;
use crate::phase::{CutoverChecks, MigrationPhase};
use crate::queue::DeadLetterRetry;
use crate::reconcile::{PassSummary, ReconciliationReport};

use super::{EngineHealth, MigrationEngine};

impl MigrationEngine {
    #[must_use]
    pub fn phase(&self) -> MigrationPhase {
        self.phase.current()
    }

    /// Receiver that observes every accepted phase change
    #[must_use]
    pub fn subscribe_phase(&self) -> watch::Receiver<MigrationPhase> {
        self.phase.subscribe()
    }

    /// Dead letters, unresolved discrepancies and reconciliation coverage right now
    pub async fn cutover_checks(&self) -> Result<CutoverChecks, EngineError> {
        let depth = self.queue.depth().await?;
        let unresolved = self.reconciler.sink().unresolved_count().await?;
        Ok(CutoverChecks {
            dead_lettered: depth.dead_lettered,
            unresolved_discrepancies: unresolved,
            reconciled_generation: self.reconciler.reconciled_generation(),
        })
    }

    /// Move to `to`, one step forward at a time.
    ///
    /// Returns `Ok(false)` when `to` is already active. The read cutovers are
    /// refused while dead letters or unresolved discrepancies exceed the
    /// configured gates, or until a full reconciliation pass has completed in
    /// the current phase; the previous phase stays active.
    #[tracing::instrument(skip(self), fields(from = %self.phase.current()))]
    pub async fn set_phase(&self, to: MigrationPhase) -> Result<bool, EngineError> {
        let checks = self.cutover_checks().await?;
        self.phase.set_phase(to, &checks)
    }

    /// Discrepancies detected since `since` (epoch millis), dead-lettered
    /// items and the entities that are out of sync
    pub async fn reconciliation_report(&self, since: i64) -> Result<ReconciliationReport, EngineError> {
        Ok(self.reconciler.report(since).await?)
    }

    /// Give a dead-lettered entity a fresh attempt budget
    pub async fn retry_dead_lettered(&self, entity_id: &str) -> Result<DeadLetterRetry, EngineError> {
        let outcome = self.queue.retry_dead_lettered(entity_id).await?;
        info!(entity_id, outcome = ?outcome, "Dead-lettered item retried");
        Ok(outcome)
    }

    /// Run a reconciliation pass now instead of waiting for the scheduler
    pub async fn reconcile_now(&self) -> Result<PassSummary, EngineError> {
        Ok(self.reconciler.run_pass(&self.shutdown.token()).await?)
    }

    /// Close open discrepancies by hand (all of the entity's when `field` is `None`)
    pub async fn resolve_discrepancy(&self, entity_id: &str, field: Option<&str>) -> Result<usize, EngineError> {
        let resolved = self.reconciler.resolve(entity_id, field).await?;
        info!(entity_id, field, resolved, "Discrepancies resolved manually");
        Ok(resolved)
    }

    pub async fn health(&self) -> Result<EngineHealth, EngineError> {
        let queue = self.queue.depth().await?;
        let unresolved_discrepancies = self.reconciler.sink().unresolved_count().await?;
        let circuits = self
            .legacy
            .circuits()
            .into_iter()
            .chain(self.target.circuits())
            .collect();

        Ok(EngineHealth {
            state: self.state(),
            phase: self.phase.current(),
            queue,
            circuits,
            cache: self.cache.stats(),
            cache_backend: self.cache.backend_name().to_string(),
            in_flight: self.workers.in_flight(),
            unresolved_discrepancies,
        })
    }

    /// Current time on the engine's clock, for building report windows
    #[must_use]
    pub fn now_millis(&self) -> i64 {
        self.clock.now_millis()
    }
}
