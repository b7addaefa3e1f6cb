// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for the dual-write engine.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The host application is responsible for choosing the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `dual_write_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `store`: store name plus operation class, e.g. `legacy.read`
//! - `operation`: get, put, delete, query
//! - `status`: success, error, rejected, timeout
//! - `target`: legacy, target (replica receiving a sync item)

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

use crate::phase::MigrationPhase;
use crate::queue::QueueDepth;
use crate::resilience::circuit_breaker::CircuitState;

/// Record the final outcome of a store call through the resilience pipeline
pub fn record_store_call(store: &str, operation: &str, status: &str) {
    counter!(
        "dual_write_store_calls_total",
        "store" => store.to_string(),
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record store call latency (including retries)
pub fn record_store_latency(store: &str, operation: &str, duration: Duration) {
    histogram!(
        "dual_write_store_call_seconds",
        "store" => store.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a store error by kind (not_found, conflict, unavailable...)
pub fn record_store_error(store: &str, operation: &str, kind: &str) {
    counter!(
        "dual_write_store_errors_total",
        "store" => store.to_string(),
        "operation" => operation.to_string(),
        "kind" => kind.to_string()
    )
    .increment(1);
}

/// Record one retry attempt after a transient failure
pub fn record_retry(operation: &str) {
    counter!(
        "dual_write_retries_total",
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Record an operation that gave up after its last attempt
pub fn record_retry_exhausted(operation: &str) {
    counter!(
        "dual_write_retries_exhausted_total",
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Record a call that hit its hard deadline
pub fn record_timeout(store: &str, operation: &str) {
    counter!(
        "dual_write_timeouts_total",
        "store" => store.to_string(),
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Record a call passing through a circuit breaker
pub fn record_circuit_call(circuit: &str, outcome: &str) {
    counter!(
        "dual_write_circuit_breaker_calls_total",
        "circuit" => circuit.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a circuit opening (from Closed or from a failed trial)
pub fn record_circuit_trip(circuit: &str) {
    counter!(
        "dual_write_circuit_breaker_trips_total",
        "circuit" => circuit.to_string()
    )
    .increment(1);
}

/// Record circuit breaker state change (0 = closed, 1 = half-open, 2 = open)
pub fn set_circuit_state(circuit: &str, state: CircuitState) {
    gauge!(
        "dual_write_circuit_breaker_state",
        "circuit" => circuit.to_string()
    )
    .set(state as u8 as f64);
}

/// Record a cache lookup
pub fn record_cache_lookup(hit: bool) {
    let result = if hit { "hit" } else { "miss" };
    counter!(
        "dual_write_cache_lookups_total",
        "result" => result
    )
    .increment(1);
}

/// Record an upstream load performed on behalf of a cache miss
pub fn record_cache_load() {
    counter!("dual_write_cache_loads_total").increment(1);
}

/// Record a swallowed cache backend failure
pub fn record_cache_error(backend: &str, operation: &str) {
    counter!(
        "dual_write_cache_errors_total",
        "backend" => backend.to_string(),
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Record an explicit cache invalidation
pub fn record_cache_invalidation() {
    counter!("dual_write_cache_invalidations_total").increment(1);
}

/// Set sync queue depth per status
pub fn set_queue_depth(depth: &QueueDepth) {
    gauge!("dual_write_sync_queue_depth", "status" => "pending").set(depth.pending as f64);
    gauge!("dual_write_sync_queue_depth", "status" => "processing").set(depth.processing as f64);
    gauge!("dual_write_sync_queue_depth", "status" => "failed").set(depth.failed as f64);
    gauge!("dual_write_sync_queue_depth", "status" => "dead_lettered")
        .set(depth.dead_lettered as f64);
}

/// Record an enqueue (inserted, coalesced, deferred, error)
pub fn record_enqueue(outcome: &str) {
    counter!(
        "dual_write_sync_enqueued_total",
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a sync item applied to (or skipped on) the replica
pub fn record_sync_applied(target: &str, operation: &str, status: &str) {
    counter!(
        "dual_write_sync_applied_total",
        "target" => target.to_string(),
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record a failed sync attempt that went back to the queue
pub fn record_sync_failure(target: &str) {
    counter!(
        "dual_write_sync_failures_total",
        "target" => target.to_string()
    )
    .increment(1);
}

/// Record a sync item moving to DeadLettered
pub fn record_dead_letter(target: &str) {
    counter!(
        "dual_write_dead_letters_total",
        "target" => target.to_string()
    )
    .increment(1);
}

/// Record discrepancies found by a reconciliation page
pub fn record_discrepancies(count: usize) {
    counter!("dual_write_reconciliation_discrepancies_total").increment(count as u64);
}

/// Record a finished reconciliation pass
pub fn record_reconciliation_pass(duration: Duration, entities: usize, discrepancies: usize) {
    counter!("dual_write_reconciliation_passes_total").increment(1);
    histogram!("dual_write_reconciliation_pass_seconds").record(duration.as_secs_f64());
    gauge!("dual_write_reconciliation_last_entities").set(entities as f64);
    gauge!("dual_write_reconciliation_last_discrepancies").set(discrepancies as f64);
}

/// Record a repair sync item enqueued by reconciliation
pub fn record_repair_enqueued() {
    counter!("dual_write_reconciliation_repairs_total").increment(1);
}

/// Record an administrative phase change attempt
pub fn record_phase_transition(from: MigrationPhase, to: MigrationPhase, accepted: bool) {
    let status = if accepted { "accepted" } else { "rejected" };
    counter!(
        "dual_write_phase_transitions_total",
        "from" => from.to_string(),
        "to" => to.to_string(),
        "status" => status
    )
    .increment(1);
}

/// Set the active phase (0 = PrimaryOnly .. 3 = SecondaryOnly)
pub fn set_migration_phase(phase: MigrationPhase) {
    gauge!("dual_write_migration_phase").set(phase.ordinal() as f64);
}

/// Record engine lifecycle state
pub fn set_engine_state(state: &str) {
    counter!(
        "dual_write_engine_state_transitions_total",
        "state" => state.to_string()
    )
    .increment(1);
}

/// Timer guard for measuring store call latency
pub struct LatencyTimer {
    store: String,
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    #[must_use]
    pub fn new(store: impl Into<String>, operation: &'static str) -> Self {
        Self {
            store: store.into(),
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_store_latency(&self.store, self.operation, self.start.elapsed());
    }
}
