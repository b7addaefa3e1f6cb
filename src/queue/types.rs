// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sync queue data types and the per-item state machine.
//!
//! ```text
//!             enqueue
//!                │
//!                ▼          dequeue (lease)
//!  ┌──────▶  Pending ───────────────────────▶ Processing ──ack──▶ (removed, or
//!  │            ▲  ▲                            │    │            follow-up → Pending)
//!  │ release    │  └────── lease expired ───────┘    │
//!  │            │                                    │ nack
//!  │         Failed ◀──── attempts < max ────────────┤
//!  │      (retry_at)                                 │
//!  │                                                 ▼
//!  └──────── retry_dead_lettered ──────────── DeadLettered
//! ```
//!
//! Each entity has at most one active (Pending, Processing or Failed) item.
//! Writes that arrive while it is Pending or Failed replace its payload; writes
//! that arrive while a worker holds it are parked as a follow-up and take
//! effect when the worker acks or nacks.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::clock;
use crate::entity::Entity;
use crate::phase::StoreRole;
use crate::resilience::retry::Retryable;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncOperation {
    Create,
    Update,
    Delete,
}

impl SyncOperation {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    /// Net effect of `self` followed by `later`
    #[must_use]
    pub fn then(self, later: Self) -> Self {
        match (self, later) {
            (Self::Create, Self::Update) => Self::Create,
            (_, later) => later,
        }
    }
}

impl fmt::Display for SyncOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncOperation {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            other => Err(QueueError::Backend(format!("unknown sync operation '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncStatus {
    Pending,
    Processing,
    Failed,
    DeadLettered,
}

impl SyncStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Processing => "Processing",
            Self::Failed => "Failed",
            Self::DeadLettered => "DeadLettered",
        }
    }

    /// Counts against the one-item-per-entity rule
    #[must_use]
    pub fn is_active(self) -> bool {
        !matches!(self, Self::DeadLettered)
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(Self::Pending),
            "Processing" => Ok(Self::Processing),
            "Failed" => Ok(Self::Failed),
            "DeadLettered" => Ok(Self::DeadLettered),
            other => Err(QueueError::Backend(format!("unknown sync status '{}'", other))),
        }
    }
}

/// A replication request produced by a committed write
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequest {
    pub entity_id: String,
    pub operation: SyncOperation,
    #[serde(default)]
    pub payload: Vec<u8>,
    /// Version committed on the authoritative store
    pub version: i64,
    /// Replica that must receive the change
    pub target: StoreRole,
}

impl SyncRequest {
    #[must_use]
    pub fn upsert(entity: &Entity, operation: SyncOperation, target: StoreRole) -> Self {
        Self {
            entity_id: entity.id.clone(),
            operation,
            payload: entity.payload.clone(),
            version: entity.version,
            target,
        }
    }

    #[must_use]
    pub fn delete(entity_id: impl Into<String>, version: i64, target: StoreRole) -> Self {
        Self {
            entity_id: entity_id.into(),
            operation: SyncOperation::Delete,
            payload: Vec::new(),
            version,
            target,
        }
    }

    /// Fold a later request in. A versioned request older than the one held
    /// is stale and dropped; version `0` marks an unversioned delete.
    fn merge(&mut self, later: SyncRequest) {
        if later.version > 0 && later.version < self.version {
            return;
        }
        self.operation = self.operation.then(later.operation);
        self.payload = later.payload;
        self.version = self.version.max(later.version);
        self.target = later.target;
    }
}

/// One unit of pending replication for a single entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncItem {
    pub id: String,
    pub entity_id: String,
    pub operation: SyncOperation,
    pub payload: Vec<u8>,
    pub version: i64,
    pub target: StoreRole,
    /// Epoch millis
    pub enqueued_at: i64,
    pub attempts: u32,
    pub status: SyncStatus,
    /// Token of the claim currently holding the item
    pub owner_lease: Option<String>,
    /// Worker holding the claim
    pub worker_id: Option<String>,
    pub lease_expires_at: Option<i64>,
    /// Earliest time a Failed item may be claimed again
    pub retry_at: Option<i64>,
    pub last_error: Option<String>,
    /// Write that arrived while the item was being processed
    pub follow_up: Option<SyncRequest>,
}

impl SyncItem {
    #[must_use]
    pub fn new(request: SyncRequest, now_millis: i64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            entity_id: request.entity_id,
            operation: request.operation,
            payload: request.payload,
            version: request.version,
            target: request.target,
            enqueued_at: now_millis,
            attempts: 0,
            status: SyncStatus::Pending,
            owner_lease: None,
            worker_id: None,
            lease_expires_at: None,
            retry_at: None,
            last_error: None,
            follow_up: None,
        }
    }

    /// The change this item carries
    #[must_use]
    pub fn request(&self) -> SyncRequest {
        SyncRequest {
            entity_id: self.entity_id.clone(),
            operation: self.operation,
            payload: self.payload.clone(),
            version: self.version,
            target: self.target,
        }
    }

    /// The entity to write on the replica (upserts only)
    #[must_use]
    pub fn to_entity(&self) -> Entity {
        Entity {
            id: self.entity_id.clone(),
            payload: self.payload.clone(),
            version: self.version,
        }
    }

    fn apply(&mut self, request: SyncRequest) {
        let mut current = self.request();
        current.merge(request);
        self.operation = current.operation;
        self.payload = current.payload;
        self.version = current.version;
        self.target = current.target;
    }

    fn clear_lease(&mut self) {
        self.owner_lease = None;
        self.worker_id = None;
        self.lease_expires_at = None;
    }

    fn absorb_follow_up(&mut self) {
        if let Some(later) = self.follow_up.take() {
            self.apply(later);
        }
    }

    /// Fold a newer write for the same entity into this active item
    pub fn coalesce(&mut self, request: SyncRequest) -> EnqueueOutcome {
        match self.status {
            SyncStatus::Processing => {
                match self.follow_up {
                    Some(ref mut parked) => parked.merge(request),
                    None => self.follow_up = Some(request),
                }
                EnqueueOutcome::Deferred
            }
            _ => {
                self.apply(request);
                EnqueueOutcome::Coalesced
            }
        }
    }

    #[must_use]
    pub fn is_claimable(&self, now_millis: i64) -> bool {
        match self.status {
            SyncStatus::Pending => true,
            SyncStatus::Failed => self.retry_at.map_or(true, |at| at <= now_millis),
            SyncStatus::Processing => self.lease_expires_at.map_or(true, |at| at <= now_millis),
            SyncStatus::DeadLettered => false,
        }
    }

    /// True when `other` (the caller's copy) still holds the current claim
    #[must_use]
    pub fn is_leased_by(&self, other: &SyncItem) -> bool {
        self.status == SyncStatus::Processing
            && self.owner_lease.is_some()
            && self.owner_lease == other.owner_lease
    }

    pub fn claim(&mut self, worker_id: &str, now_millis: i64, lease_timeout: Duration) {
        self.status = SyncStatus::Processing;
        self.owner_lease = Some(uuid::Uuid::new_v4().to_string());
        self.worker_id = Some(worker_id.to_string());
        self.lease_expires_at = Some(clock::after(now_millis, lease_timeout));
    }

    /// Successful apply. Returns the follow-up as a fresh Pending item, if any.
    #[must_use]
    pub fn complete(&mut self, now_millis: i64) -> Option<SyncItem> {
        self.clear_lease();
        self.follow_up.take().map(|later| SyncItem::new(later, now_millis))
    }

    /// Failed apply: back off, or dead-letter once `max_attempts` is reached
    pub fn fail(&mut self, error: &str, now_millis: i64, settings: &QueueSettings) -> NackOutcome {
        self.attempts += 1;
        self.last_error = Some(error.to_string());
        self.clear_lease();
        self.absorb_follow_up();

        if self.attempts >= settings.max_attempts {
            self.status = SyncStatus::DeadLettered;
            self.retry_at = None;
            return NackOutcome::DeadLettered {
                attempts: self.attempts,
            };
        }

        let backoff = settings.retry_backoff.saturating_mul(self.attempts);
        let retry_at = clock::after(now_millis, backoff);
        self.status = SyncStatus::Failed;
        self.retry_at = Some(retry_at);
        NackOutcome::Requeued {
            attempts: self.attempts,
            retry_at,
        }
    }

    /// Give a claimed item back without counting an attempt
    pub fn release(&mut self) {
        self.clear_lease();
        self.absorb_follow_up();
        self.status = if self.attempts > 0 {
            SyncStatus::Failed
        } else {
            SyncStatus::Pending
        };
    }

    /// Put a dead-lettered item back in line with a fresh attempt budget
    pub fn revive(&mut self, now_millis: i64) {
        self.status = SyncStatus::Pending;
        self.attempts = 0;
        self.retry_at = None;
        self.clear_lease();
        self.enqueued_at = now_millis;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EnqueueOutcome {
    /// New active item for the entity
    Inserted,
    /// Replaced the payload of the waiting item
    Coalesced,
    /// Parked behind the item a worker is processing
    Deferred,
}

impl EnqueueOutcome {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Inserted => "inserted",
            Self::Coalesced => "coalesced",
            Self::Deferred => "deferred",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackOutcome {
    Requeued { attempts: u32, retry_at: i64 },
    DeadLettered { attempts: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadLetterRetry {
    /// Back to Pending with a fresh attempt budget
    Requeued,
    /// A newer write for the entity is already queued; the dead item was dropped
    Superseded,
}

/// Item counts per status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepth {
    pub pending: usize,
    pub processing: usize,
    pub failed: usize,
    pub dead_lettered: usize,
}

impl QueueDepth {
    /// Items still expected to be applied
    #[must_use]
    pub fn active(&self) -> usize {
        self.pending + self.processing + self.failed
    }

    pub(crate) fn count(&mut self, status: SyncStatus) {
        match status {
            SyncStatus::Pending => self.pending += 1,
            SyncStatus::Processing => self.processing += 1,
            SyncStatus::Failed => self.failed += 1,
            SyncStatus::DeadLettered => self.dead_lettered += 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueSettings {
    pub max_attempts: u32,
    pub lease_timeout: Duration,
    /// Multiplied by the attempt count for the Failed backoff
    pub retry_backoff: Duration,
    /// How long ack receipts stay in the applied log before purge
    pub applied_retention: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            lease_timeout: Duration::from_secs(30),
            retry_backoff: Duration::from_secs(1),
            applied_retention: Duration::from_secs(24 * 60 * 60),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("sync item not found: {0}")]
    NotFound(String),
    /// The claim expired and the item was handed to someone else
    #[error("lease lost on sync item {item_id} for entity '{entity_id}'")]
    LeaseLost { item_id: String, entity_id: String },
    #[error("sync queue connection failed: {0}")]
    Connection(String),
    #[error("sync queue backend error: {0}")]
    Backend(String),
    #[error("sync queue operation cancelled")]
    Cancelled,
}

impl Retryable for QueueError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::Connection(_))
    }

    fn cancelled() -> Self {
        Self::Cancelled
    }
}

impl From<sqlx::Error> for QueueError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                Self::Connection(e.to_string())
            }
            other => Self::Backend(other.to_string()),
        }
    }
}
