// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Scheduled comparison of the two stores, off the write path.
//!
//! A pass walks both stores in ID order, one page at a time, merge-joining
//! the pages so an entity missing on either side still shows up:
//!
//! ```text
//! legacy page:  a b c d e      (full page, last = e)
//! target page:  a c d f g      (full page, last = g)
//! compared:     a b c d e      (up to min(last) = e; f, g come next page)
//! ```
//!
//! The cursor is saved after every page, so a pass interrupted by a crash or
//! shutdown picks up after the last finished page.
//!
//! A completed pass is remembered with the phase generation it ran in; the
//! read cutovers only accept a pass that began and finished in the current
//! phase. A pass resumed from a cursor this process did not start does not
//! count, since its early pages may predate the phase.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::TryStreamExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::cursor::CursorStore;
use super::diff;
use super::sink::DiscrepancySink;
use super::types::{PassSummary, ReconcileCursor, ReconcileError, ReconciliationReport};
use crate::clock::SharedClock;
use crate::entity::Entity;
use crate::metrics;
use crate::phase::{MigrationPhaseManager, StoreRole};
use crate::queue::{SyncOperation, SyncQueue, SyncRequest};
use crate::resilience::cancel::CancelToken;
use crate::storage::traits::{QuerySpec, StorageError, StoreAdapter};

#[derive(Debug, Clone)]
pub struct ReconcileSettings {
    /// Entities per page and store
    pub batch_size: usize,
    /// Pause between scheduled passes
    pub interval: Duration,
    /// Enqueue a sync item for every discrepant entity
    pub repair: bool,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            batch_size: 500,
            interval: Duration::from_secs(300),
            repair: false,
        }
    }
}

type Row = (String, Option<Entity>, Option<Entity>);

/// Merge two ID-ordered pages, keeping only IDs both pages fully cover
fn merge_pages(batch_size: usize, legacy: Vec<Entity>, target: Vec<Entity>) -> Vec<Row> {
    let last = |page: &[Entity]| (page.len() >= batch_size).then(|| page.last().map(|e| e.id.clone())).flatten();
    let bound = match (last(legacy.as_slice()), last(target.as_slice())) {
        (Some(l), Some(t)) => Some(l.min(t)),
        (l, t) => l.or(t),
    };
    let within = |id: &str| bound.as_deref().map_or(true, |b| id <= b);

    let mut rows: BTreeMap<String, (Option<Entity>, Option<Entity>)> = BTreeMap::new();
    for entity in legacy.into_iter().filter(|e| within(&e.id)) {
        let id = entity.id.clone();
        rows.entry(id).or_default().0 = Some(entity);
    }
    for entity in target.into_iter().filter(|e| within(&e.id)) {
        let id = entity.id.clone();
        rows.entry(id).or_default().1 = Some(entity);
    }
    rows.into_iter().map(|(id, (l, t))| (id, l, t)).collect()
}

pub struct ReconciliationService {
    phase: Arc<MigrationPhaseManager>,
    legacy: Arc<dyn StoreAdapter>,
    target: Arc<dyn StoreAdapter>,
    queue: Arc<dyn SyncQueue>,
    sink: Arc<dyn DiscrepancySink>,
    cursors: Arc<dyn CursorStore>,
    settings: ReconcileSettings,
    clock: SharedClock,
    /// One pass at a time
    running: Mutex<()>,
    evidence: parking_lot::Mutex<PassEvidence>,
}

#[derive(Debug, Default)]
struct PassEvidence {
    /// Generation in which the cursor's pass began, if this process began it
    started_in: Option<u64>,
    /// Generation of the last pass that ran start to finish within it
    completed_in: Option<u64>,
}

impl ReconciliationService {
    /// `legacy` and `target` should be the uncached stores so every pass sees
    /// what is actually persisted.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        phase: Arc<MigrationPhaseManager>,
        legacy: Arc<dyn StoreAdapter>,
        target: Arc<dyn StoreAdapter>,
        queue: Arc<dyn SyncQueue>,
        sink: Arc<dyn DiscrepancySink>,
        cursors: Arc<dyn CursorStore>,
        settings: ReconcileSettings,
        clock: SharedClock,
    ) -> Self {
        Self {
            phase,
            legacy,
            target,
            queue,
            sink,
            cursors,
            settings,
            clock,
            running: Mutex::new(()),
            evidence: parking_lot::Mutex::new(PassEvidence::default()),
        }
    }

    #[must_use]
    pub fn settings(&self) -> &ReconcileSettings {
        &self.settings
    }

    #[must_use]
    pub fn sink(&self) -> &Arc<dyn DiscrepancySink> {
        &self.sink
    }

    /// Phase generation of the last pass that covered both stores entirely
    /// within one phase
    #[must_use]
    pub fn reconciled_generation(&self) -> Option<u64> {
        self.evidence.lock().completed_in
    }

    async fn page(
        &self,
        store: &Arc<dyn StoreAdapter>,
        after: Option<String>,
        cancel: &CancelToken,
    ) -> Result<Vec<Entity>, StorageError> {
        store
            .query(QuerySpec::page(after, self.settings.batch_size.max(1)), cancel)
            .try_collect()
            .await
    }

    /// Run (or resume) one full pass. Stops early, with the cursor saved, when
    /// `cancel` fires.
    #[tracing::instrument(skip(self, cancel), fields(phase = %self.phase.current()))]
    pub async fn run_pass(&self, cancel: &CancelToken) -> Result<PassSummary, ReconcileError> {
        let _running = self.running.lock().await;
        let started = Instant::now();
        let mut summary = PassSummary::default();

        let generation = self.phase.generation();
        let targets = self.phase.write_targets();
        let Some(replica) = targets.replica else {
            debug!("No replica in this phase, skipping reconciliation");
            summary.skipped = true;
            return Ok(summary);
        };

        let mut cursor = match self.cursors.load().await? {
            Some(saved) => {
                info!(after_id = ?saved.after_id, checked = saved.checked, "Resuming reconciliation pass");
                summary.resumed = true;
                saved
            }
            None => {
                self.evidence.lock().started_in = Some(generation);
                ReconcileCursor {
                    pass_started_at: self.clock.now_millis(),
                    ..ReconcileCursor::default()
                }
            }
        };

        loop {
            if cancel.is_cancelled() {
                break;
            }
            let (legacy, target) = tokio::try_join!(
                self.page(&self.legacy, cursor.after_id.clone(), cancel),
                self.page(&self.target, cursor.after_id.clone(), cancel),
            )?;
            let rows = merge_pages(self.settings.batch_size.max(1), legacy, target);
            let Some(last_id) = rows.last().map(|(id, _, _)| id.clone()) else {
                summary.completed = true;
                break;
            };

            for (id, legacy, target) in &rows {
                let (primary, secondary) = match targets.authoritative {
                    StoreRole::Legacy => (legacy.as_ref(), target.as_ref()),
                    StoreRole::Target => (target.as_ref(), legacy.as_ref()),
                };
                self.check(id, primary, secondary, replica, &mut summary).await?;
            }

            summary.pages += 1;
            cursor.after_id = Some(last_id);
            cursor.checked += rows.len() as u64;
            self.cursors.save(&cursor).await?;
        }

        if summary.completed {
            self.cursors.clear().await?;
            let mut evidence = self.evidence.lock();
            let started_in = evidence.started_in.take();
            if started_in == Some(generation) && self.phase.generation() == generation {
                evidence.completed_in = Some(generation);
            } else {
                debug!(?started_in, generation, "Pass spanned a phase change, not counted for cutover");
            }
        }
        summary.duration = started.elapsed();
        metrics::record_reconciliation_pass(summary.duration, summary.entities_checked, summary.discrepancies);
        info!(
            checked = summary.entities_checked,
            discrepancies = summary.discrepancies,
            in_flight = summary.in_flight,
            resolved = summary.resolved,
            repairs = summary.repairs_enqueued,
            completed = summary.completed,
            elapsed_ms = summary.duration.as_millis() as u64,
            "Reconciliation pass finished"
        );
        Ok(summary)
    }

    async fn check(
        &self,
        entity_id: &str,
        primary: Option<&Entity>,
        secondary: Option<&Entity>,
        replica: StoreRole,
        summary: &mut PassSummary,
    ) -> Result<(), ReconcileError> {
        summary.entities_checked += 1;
        let now = self.clock.now_millis();
        let found = diff::compare(entity_id, primary, secondary, now);

        if found.is_empty() {
            summary.resolved += self.sink.resolve_except(entity_id, &[], now).await?;
            return Ok(());
        }

        // Replication is still on its way
        if self.queue.active(entity_id).await?.is_some() {
            summary.in_flight += 1;
            return Ok(());
        }

        let fields: Vec<String> = found.iter().map(|d| d.field.clone()).collect();
        summary.resolved += self.sink.resolve_except(entity_id, &fields, now).await?;
        summary.discrepancies += found.len();
        metrics::record_discrepancies(found.len());
        warn!(entity_id, fields = ?fields, "Replica differs from authoritative store");
        for discrepancy in found {
            self.sink.record(discrepancy).await?;
        }

        if self.settings.repair {
            let request = match primary {
                Some(entity) => SyncRequest::upsert(entity, SyncOperation::Update, replica),
                None => SyncRequest::delete(entity_id, 0, replica),
            };
            self.queue.enqueue(request).await?;
            metrics::record_repair_enqueued();
            summary.repairs_enqueued += 1;
        }
        Ok(())
    }

    /// Discrepancies detected since `since`, dead letters, and the union of
    /// their entity IDs
    pub async fn report(&self, since: i64) -> Result<ReconciliationReport, ReconcileError> {
        let discrepancies = self.sink.detected_since(since).await?;
        let dead_lettered = self.queue.dead_lettered().await?;

        let mut out_of_sync: BTreeSet<String> = self
            .sink
            .unresolved()
            .await?
            .into_iter()
            .map(|d| d.entity_id)
            .collect();
        out_of_sync.extend(dead_lettered.iter().map(|item| item.entity_id.clone()));

        Ok(ReconciliationReport {
            since,
            discrepancies,
            dead_lettered,
            out_of_sync: out_of_sync.into_iter().collect(),
        })
    }

    /// Manually close a discrepancy (all of the entity's when `field` is `None`)
    pub async fn resolve(&self, entity_id: &str, field: Option<&str>) -> Result<usize, ReconcileError> {
        self.sink.resolve(entity_id, field, self.clock.now_millis()).await
    }

    /// Run passes every `interval` until `shutdown` fires
    pub fn spawn(self: &Arc<Self>, shutdown: CancelToken) -> JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            info!(interval_secs = service.settings.interval.as_secs(), "Reconciliation scheduler started");
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(service.settings.interval) => {}
                }
                if let Err(e) = service.run_pass(&shutdown).await {
                    warn!(error = %e, "Reconciliation pass failed");
                }
            }
            info!("Reconciliation scheduler stopped");
        })
    }
}
