// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Where reconciliation reports what it finds.

use std::collections::{BTreeMap, VecDeque};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::types::{Discrepancy, ReconcileError};

#[async_trait]
pub trait DiscrepancySink: Send + Sync {
    /// Record a discrepancy. An open one for the same entity and field is
    /// updated in place and keeps its first detection time.
    async fn record(&self, discrepancy: Discrepancy) -> Result<(), ReconcileError>;

    /// Resolve the entity's open discrepancies except those in `still_open`.
    /// Returns how many were resolved.
    async fn resolve_except(
        &self,
        entity_id: &str,
        still_open: &[String],
        now_millis: i64,
    ) -> Result<usize, ReconcileError>;

    /// Resolve one field, or every open field of the entity when `field` is `None`
    async fn resolve(&self, entity_id: &str, field: Option<&str>, now_millis: i64) -> Result<usize, ReconcileError>;

    async fn unresolved(&self) -> Result<Vec<Discrepancy>, ReconcileError>;

    /// Open and resolved discrepancies first detected at or after `since`
    async fn detected_since(&self, since: i64) -> Result<Vec<Discrepancy>, ReconcileError>;

    async fn unresolved_count(&self) -> Result<usize, ReconcileError> {
        Ok(self.unresolved().await?.len())
    }
}

#[derive(Default)]
struct SinkState {
    open: BTreeMap<(String, String), Discrepancy>,
    resolved: VecDeque<Discrepancy>,
}

/// Keeps open discrepancies plus a bounded history of resolved ones
pub struct InMemoryDiscrepancySink {
    state: Mutex<SinkState>,
    history_limit: usize,
}

impl InMemoryDiscrepancySink {
    #[must_use]
    pub fn new(history_limit: usize) -> Self {
        Self {
            state: Mutex::new(SinkState::default()),
            history_limit,
        }
    }

    fn close(state: &mut SinkState, mut discrepancy: Discrepancy, now_millis: i64, limit: usize) {
        discrepancy.resolved_at = Some(now_millis);
        state.resolved.push_back(discrepancy);
        while state.resolved.len() > limit {
            state.resolved.pop_front();
        }
    }
}

impl Default for InMemoryDiscrepancySink {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait]
impl DiscrepancySink for InMemoryDiscrepancySink {
    async fn record(&self, discrepancy: Discrepancy) -> Result<(), ReconcileError> {
        let mut state = self.state.lock();
        let key = (discrepancy.entity_id.clone(), discrepancy.field.clone());
        match state.open.get_mut(&key) {
            Some(open) => {
                open.primary_value = discrepancy.primary_value;
                open.secondary_value = discrepancy.secondary_value;
            }
            None => {
                state.open.insert(key, discrepancy);
            }
        }
        Ok(())
    }

    async fn resolve_except(
        &self,
        entity_id: &str,
        still_open: &[String],
        now_millis: i64,
    ) -> Result<usize, ReconcileError> {
        let mut state = self.state.lock();
        let closing: Vec<(String, String)> = state
            .open
            .range((entity_id.to_string(), String::new())..)
            .take_while(|((id, _), _)| id == entity_id)
            .filter(|((_, field), _)| !still_open.contains(field))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &closing {
            if let Some(d) = state.open.remove(key) {
                Self::close(&mut state, d, now_millis, self.history_limit);
            }
        }
        Ok(closing.len())
    }

    async fn resolve(&self, entity_id: &str, field: Option<&str>, now_millis: i64) -> Result<usize, ReconcileError> {
        match field {
            Some(field) => {
                let mut state = self.state.lock();
                match state.open.remove(&(entity_id.to_string(), field.to_string())) {
                    Some(d) => {
                        Self::close(&mut state, d, now_millis, self.history_limit);
                        Ok(1)
                    }
                    None => Ok(0),
                }
            }
            None => self.resolve_except(entity_id, &[], now_millis).await,
        }
    }

    async fn unresolved(&self) -> Result<Vec<Discrepancy>, ReconcileError> {
        Ok(self.state.lock().open.values().cloned().collect())
    }

    async fn detected_since(&self, since: i64) -> Result<Vec<Discrepancy>, ReconcileError> {
        let state = self.state.lock();
        let mut found: Vec<Discrepancy> = state
            .open
            .values()
            .chain(state.resolved.iter())
            .filter(|d| d.detected_at >= since)
            .cloned()
            .collect();
        found.sort_by(|a, b| (a.detected_at, &a.entity_id, &a.field).cmp(&(b.detected_at, &b.entity_id, &b.field)));
        Ok(found)
    }

    async fn unresolved_count(&self) -> Result<usize, ReconcileError> {
        Ok(self.state.lock().open.len())
    }
}
