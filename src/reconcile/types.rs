// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::queue::{QueueError, SyncItem};
use crate::storage::traits::StorageError;

/// One field that differs between the authoritative store and the replica
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Discrepancy {
    pub entity_id: String,
    /// Top-level JSON key, or `@entity`, `@payload`, `@version`
    pub field: String,
    /// Value on the store that was authoritative when detected (`None` = absent)
    pub primary_value: Option<String>,
    /// Value on the replica (`None` = absent)
    pub secondary_value: Option<String>,
    /// Epoch millis of first detection
    pub detected_at: i64,
    pub resolved_at: Option<i64>,
}

impl Discrepancy {
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.resolved_at.is_none()
    }
}

/// Administrative view of replication health
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconciliationReport {
    /// Epoch millis the report covers from
    pub since: i64,
    /// Discrepancies detected at or after `since`, open and resolved
    pub discrepancies: Vec<Discrepancy>,
    pub dead_lettered: Vec<SyncItem>,
    /// Entity IDs with an open discrepancy or a dead-lettered sync item, sorted
    pub out_of_sync: Vec<String>,
}

impl ReconciliationReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.out_of_sync.is_empty()
    }

    #[must_use]
    pub fn open(&self) -> impl Iterator<Item = &Discrepancy> {
        self.discrepancies.iter().filter(|d| d.is_open())
    }
}

/// Outcome of one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassSummary {
    pub pages: usize,
    pub entities_checked: usize,
    /// Discrepancies recorded (new or still open)
    pub discrepancies: usize,
    /// Differing entities skipped because a sync item for them was pending
    pub in_flight: usize,
    pub resolved: usize,
    pub repairs_enqueued: usize,
    /// Continued from a persisted cursor
    pub resumed: bool,
    /// Ran to the end of both stores
    pub completed: bool,
    /// The phase had no replica, so nothing was compared
    pub skipped: bool,
    #[serde(skip)]
    pub duration: Duration,
}

/// Where an interrupted pass resumes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileCursor {
    pub pass_started_at: i64,
    /// Last entity ID fully processed
    pub after_id: Option<String>,
    pub checked: u64,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error("discrepancy sink error: {0}")]
    Sink(String),
    #[error("cursor store error: {0}")]
    Cursor(String),
    #[error("reconciliation cancelled")]
    Cancelled,
}

impl From<sqlx::Error> for ReconcileError {
    fn from(e: sqlx::Error) -> Self {
        Self::Cursor(e.to_string())
    }
}
