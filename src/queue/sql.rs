// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL-backed [`SyncQueue`] (SQLite or MySQL through the sqlx `Any` driver).
//!
//! Two tables:
//!
//! ```sql
//! -- The queue. `active` is 1 while the item is Pending/Processing/Failed and
//! -- NULL once dead-lettered, so UNIQUE (entity_id, active) allows exactly one
//! -- active row per entity next to any number of dead letters.
//! CREATE TABLE sync_outgoing (
//!   id TEXT PRIMARY KEY, entity_id TEXT, active INTEGER, status TEXT,
//!   message_type TEXT,            -- create | update | delete
//!   target TEXT, version INTEGER,
//!   body BLOB,                    -- entity payload
//!   follow_up TEXT,               -- JSON SyncRequest parked while Processing
//!   attempts INTEGER, owner_lease TEXT, worker_id TEXT, lease_expires_at INTEGER,
//!   retry_at INTEGER, enqueued_at INTEGER, keep_until INTEGER, last_error TEXT,
//!   revision INTEGER              -- bumped by every write to the row
//! );
//!
//! -- Applied log, purged once keep_until passes.
//! CREATE TABLE sync_incoming (
//!   id TEXT PRIMARY KEY, entity_id TEXT, message_type TEXT, version INTEGER,
//!   body BLOB, applied_at INTEGER, keep_until INTEGER
//! );
//! ```
//!
//! Every state change is a compare-and-swap on the row revision:
//! `UPDATE ... SET revision = revision + 1 WHERE id = ? AND revision = ?`
//! (acks delete under the same guard). A writer that read the row before
//! someone else changed it matches no rows, re-reads and tries again, so two
//! engine instances sharing one database neither both claim an item nor
//! overwrite each other's coalesced requests or parked follow-ups.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Once;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::types::{
    DeadLetterRetry, EnqueueOutcome, NackOutcome, QueueDepth, QueueError, QueueSettings, SyncItem,
    SyncRequest, SyncStatus,
};
use super::SyncQueue;
use crate::clock::{self, SharedClock};
use crate::resilience::cancel::CancelToken;
use crate::resilience::retry::{retry, RetryConfig};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

pub(crate) fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

/// Candidates fetched per dequeue round
const CLAIM_CANDIDATES: i64 = 8;
/// Attempts at a row change when other writers keep bumping its revision
const RACE_RETRIES: usize = 32;
/// Upper bound of the random pause between race retries
const RACE_JITTER_MS: u64 = 3;
/// Per-entity enqueue lock stripes
const ENQUEUE_STRIPES: usize = 64;
/// Applied-log purge runs every this many acks
const PURGE_EVERY_ACKS: u64 = 100;

const COLUMNS: &str = "id, entity_id, status, message_type, target, version, body, follow_up, \
                       attempts, owner_lease, worker_id, lease_expires_at, retry_at, enqueued_at, last_error, revision";

/// Open a pool the way both SQL components expect
pub(crate) async fn connect_pool(url: &str) -> Result<(AnyPool, bool), QueueError> {
    install_drivers();
    let is_sqlite = url.starts_with("sqlite:");
    let in_memory = url.contains(":memory:");

    // Startup config: fail fast on a bad URL, ride out a database that is still booting
    let pool = retry("sql_connect", &RetryConfig::startup(), &CancelToken::never(), || async {
        let mut options = AnyPoolOptions::new().acquire_timeout(Duration::from_secs(10));
        options = if in_memory {
            // Each connection to :memory: is its own database
            options.max_connections(1).idle_timeout(None).max_lifetime(None)
        } else {
            options.max_connections(10).idle_timeout(Duration::from_secs(300))
        };
        options.connect(url).await.map_err(QueueError::from)
    })
    .await?;

    if is_sqlite && !in_memory {
        sqlx::query("PRAGMA journal_mode = WAL").execute(&pool).await?;
        sqlx::query("PRAGMA synchronous = NORMAL").execute(&pool).await?;
    }
    Ok((pool, is_sqlite))
}

/// TEXT columns come back as BLOB through the `Any` driver on MySQL
fn text(row: &AnyRow, column: &str) -> Option<String> {
    row.try_get::<Option<String>, _>(column)
        .ok()
        .flatten()
        .or_else(|| {
            row.try_get::<Option<Vec<u8>>, _>(column)
                .ok()
                .flatten()
                .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        })
}

fn int(row: &AnyRow, column: &str) -> Option<i64> {
    row.try_get::<Option<i64>, _>(column).ok().flatten()
}

fn blob(row: &AnyRow, column: &str) -> Vec<u8> {
    row.try_get::<Option<Vec<u8>>, _>(column)
        .ok()
        .flatten()
        .or_else(|| text(row, column).map(String::into_bytes))
        .unwrap_or_default()
}

fn row_to_item(row: &AnyRow) -> Result<SyncItem, QueueError> {
    let required = |column: &str| {
        text(row, column).ok_or_else(|| QueueError::Backend(format!("sync_outgoing.{} is NULL", column)))
    };

    let follow_up = match text(row, "follow_up") {
        Some(json) => Some(
            serde_json::from_str::<SyncRequest>(&json)
                .map_err(|e| QueueError::Backend(format!("corrupt follow_up: {}", e)))?,
        ),
        None => None,
    };

    Ok(SyncItem {
        id: required("id")?,
        entity_id: required("entity_id")?,
        operation: required("message_type")?.parse()?,
        payload: blob(row, "body"),
        version: int(row, "version").unwrap_or(0),
        target: required("target")?.parse().map_err(QueueError::Backend)?,
        enqueued_at: int(row, "enqueued_at").unwrap_or(0),
        attempts: int(row, "attempts").unwrap_or(0).max(0) as u32,
        status: required("status")?.parse()?,
        owner_lease: text(row, "owner_lease"),
        worker_id: text(row, "worker_id"),
        lease_expires_at: int(row, "lease_expires_at"),
        retry_at: int(row, "retry_at"),
        last_error: text(row, "last_error"),
        follow_up,
    })
}

/// A queue row together with the revision it was read at
struct StoredItem {
    item: SyncItem,
    revision: i64,
}

fn row_to_stored(row: &AnyRow) -> Result<StoredItem, QueueError> {
    Ok(StoredItem {
        item: row_to_item(row)?,
        revision: int(row, "revision").unwrap_or(0),
    })
}

fn follow_up_json(item: &SyncItem) -> Result<Option<String>, QueueError> {
    item.follow_up
        .as_ref()
        .map(|f| serde_json::to_string(f).map_err(|e| QueueError::Backend(e.to_string())))
        .transpose()
}

fn active_flag(item: &SyncItem) -> Option<i64> {
    item.status.is_active().then_some(1)
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

pub struct SqlSyncQueue {
    pool: AnyPool,
    is_sqlite: bool,
    settings: QueueSettings,
    clock: SharedClock,
    /// Enqueues for one entity queue up here instead of burning race
    /// retries against each other; other processes are handled by the
    /// revision guard
    enqueue_stripes: Vec<Mutex<()>>,
    acks: AtomicU64,
}

impl SqlSyncQueue {
    /// Connect and create the tables if needed.
    ///
    /// ```rust,no_run
    /// # use dual_write_engine::queue::{QueueSettings, SqlSyncQueue};
    /// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
    /// let queue = SqlSyncQueue::connect(
    ///     "sqlite:sync-queue.db?mode=rwc",
    ///     QueueSettings::default(),
    ///     dual_write_engine::clock::system(),
    /// )
    /// .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn connect(url: &str, settings: QueueSettings, clock: SharedClock) -> Result<Self, QueueError> {
        let (pool, is_sqlite) = connect_pool(url).await?;
        let queue = Self {
            pool,
            is_sqlite,
            settings,
            clock,
            enqueue_stripes: (0..ENQUEUE_STRIPES).map(|_| Mutex::new(())).collect(),
            acks: AtomicU64::new(0),
        };
        queue.init_schema().await?;
        info!(sqlite = is_sqlite, "SQL sync queue ready");
        Ok(queue)
    }

    /// Connection pool, for sharing with the reconciliation cursor store
    #[must_use]
    pub fn pool(&self) -> AnyPool {
        self.pool.clone()
    }

    #[must_use]
    pub fn is_sqlite(&self) -> bool {
        self.is_sqlite
    }

    async fn init_schema(&self) -> Result<(), QueueError> {
        let statements: &[&str] = if self.is_sqlite {
            &[
                r#"
                CREATE TABLE IF NOT EXISTS sync_outgoing (
                    id TEXT PRIMARY KEY,
                    entity_id TEXT NOT NULL,
                    active INTEGER,
                    status TEXT NOT NULL,
                    message_type TEXT NOT NULL,
                    target TEXT NOT NULL,
                    version INTEGER NOT NULL,
                    body BLOB,
                    follow_up TEXT,
                    attempts INTEGER NOT NULL DEFAULT 0,
                    owner_lease TEXT,
                    worker_id TEXT,
                    lease_expires_at INTEGER,
                    retry_at INTEGER,
                    enqueued_at INTEGER NOT NULL,
                    keep_until INTEGER,
                    last_error TEXT,
                    revision INTEGER NOT NULL DEFAULT 0
                )
                "#,
                "CREATE UNIQUE INDEX IF NOT EXISTS idx_sync_outgoing_entity_active ON sync_outgoing (entity_id, active)",
                "CREATE INDEX IF NOT EXISTS idx_sync_outgoing_claim ON sync_outgoing (active, status, enqueued_at)",
                r#"
                CREATE TABLE IF NOT EXISTS sync_incoming (
                    id TEXT PRIMARY KEY,
                    entity_id TEXT NOT NULL,
                    message_type TEXT NOT NULL,
                    version INTEGER NOT NULL,
                    body BLOB,
                    applied_at INTEGER NOT NULL,
                    keep_until INTEGER NOT NULL
                )
                "#,
                "CREATE INDEX IF NOT EXISTS idx_sync_incoming_keep_until ON sync_incoming (keep_until)",
            ]
        } else {
            &[
                r#"
                CREATE TABLE IF NOT EXISTS sync_outgoing (
                    id VARCHAR(64) PRIMARY KEY,
                    entity_id VARCHAR(255) NOT NULL,
                    active TINYINT NULL,
                    status VARCHAR(16) NOT NULL,
                    message_type VARCHAR(16) NOT NULL,
                    target VARCHAR(16) NOT NULL,
                    version BIGINT NOT NULL,
                    body LONGBLOB,
                    follow_up LONGTEXT,
                    attempts INT NOT NULL DEFAULT 0,
                    owner_lease VARCHAR(64),
                    worker_id VARCHAR(255),
                    lease_expires_at BIGINT,
                    retry_at BIGINT,
                    enqueued_at BIGINT NOT NULL,
                    keep_until BIGINT,
                    last_error TEXT,
                    revision BIGINT NOT NULL DEFAULT 0,
                    UNIQUE KEY idx_sync_outgoing_entity_active (entity_id, active),
                    INDEX idx_sync_outgoing_claim (active, status, enqueued_at)
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS sync_incoming (
                    id VARCHAR(64) PRIMARY KEY,
                    entity_id VARCHAR(255) NOT NULL,
                    message_type VARCHAR(16) NOT NULL,
                    version BIGINT NOT NULL,
                    body LONGBLOB,
                    applied_at BIGINT NOT NULL,
                    keep_until BIGINT NOT NULL,
                    INDEX idx_sync_incoming_keep_until (keep_until)
                )
                "#,
            ]
        };

        for sql in statements {
            retry("sql_init_schema", &RetryConfig::startup(), &CancelToken::never(), || async {
                sqlx::query(sql)
                    .execute(&self.pool)
                    .await
                    .map_err(QueueError::from)
            })
            .await?;
        }
        Ok(())
    }

    async fn fetch_by_id(&self, id: &str) -> Result<Option<StoredItem>, QueueError> {
        let sql = format!("SELECT {} FROM sync_outgoing WHERE id = ?", COLUMNS);
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(row_to_stored).transpose()
    }

    async fn fetch_active(&self, entity_id: &str) -> Result<Option<StoredItem>, QueueError> {
        let sql = format!(
            "SELECT {} FROM sync_outgoing WHERE entity_id = ? AND active = 1",
            COLUMNS
        );
        let row = sqlx::query(&sql).bind(entity_id).fetch_optional(&self.pool).await?;
        row.as_ref().map(row_to_stored).transpose()
    }

    async fn fetch_dead(&self, entity_id: &str) -> Result<Option<StoredItem>, QueueError> {
        let sql = format!(
            "SELECT {} FROM sync_outgoing WHERE entity_id = ? AND active IS NULL ORDER BY enqueued_at DESC LIMIT 1",
            COLUMNS
        );
        let row = sqlx::query(&sql).bind(entity_id).fetch_optional(&self.pool).await?;
        row.as_ref().map(row_to_stored).transpose()
    }

    /// Current copy of the caller's claimed item, if the claim still holds
    async fn fetch_leased(&self, item: &SyncItem) -> Result<StoredItem, QueueError> {
        match self.fetch_by_id(&item.id).await? {
            Some(current) if current.item.is_leased_by(item) => Ok(current),
            _ => Err(Self::lease_lost(item)),
        }
    }

    fn stripe(&self, entity_id: &str) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        entity_id.hash(&mut hasher);
        &self.enqueue_stripes[(hasher.finish() as usize) % self.enqueue_stripes.len()]
    }

    /// Short random pause so racing writers stop colliding in lockstep
    async fn race_pause() {
        let millis = rand::rng().random_range(0..=RACE_JITTER_MS);
        tokio::time::sleep(Duration::from_millis(millis)).await;
    }

    fn race_exhausted(action: &str, entity_id: &str) -> QueueError {
        warn!(action, entity_id, attempts = RACE_RETRIES, "Queue row kept changing underneath us");
        QueueError::Backend(format!(
            "could not {} '{}' after {} attempts",
            action, entity_id, RACE_RETRIES
        ))
    }

    async fn insert<'e, E>(&self, executor: E, item: &SyncItem) -> Result<(), sqlx::Error>
    where
        E: sqlx::Executor<'e, Database = sqlx::Any>,
    {
        let follow_up = follow_up_json(item).map_err(|e| sqlx::Error::Protocol(e.to_string()))?;
        sqlx::query(
            "INSERT INTO sync_outgoing (id, entity_id, active, status, message_type, target, version, body, \
             follow_up, attempts, owner_lease, worker_id, lease_expires_at, retry_at, enqueued_at, keep_until, last_error) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL, ?)",
        )
        .bind(&item.id)
        .bind(&item.entity_id)
        .bind(active_flag(item))
        .bind(item.status.as_str())
        .bind(item.operation.as_str())
        .bind(item.target.as_str())
        .bind(item.version)
        .bind(&item.payload)
        .bind(follow_up)
        .bind(i64::from(item.attempts))
        .bind(&item.owner_lease)
        .bind(&item.worker_id)
        .bind(item.lease_expires_at)
        .bind(item.retry_at)
        .bind(item.enqueued_at)
        .bind(&item.last_error)
        .execute(executor)
        .await?;
        Ok(())
    }

    /// Write `item` back if the row is still at `expected_revision`.
    /// Returns false when someone else changed it first.
    async fn update_guarded<'e, E>(
        &self,
        executor: E,
        item: &SyncItem,
        expected_revision: i64,
    ) -> Result<bool, QueueError>
    where
        E: sqlx::Executor<'e, Database = sqlx::Any>,
    {
        let result = sqlx::query(
            "UPDATE sync_outgoing SET active = ?, status = ?, message_type = ?, target = ?, version = ?, \
             body = ?, follow_up = ?, attempts = ?, owner_lease = ?, worker_id = ?, lease_expires_at = ?, \
             retry_at = ?, enqueued_at = ?, last_error = ?, revision = revision + 1 \
             WHERE id = ? AND revision = ?",
        )
        .bind(active_flag(item))
        .bind(item.status.as_str())
        .bind(item.operation.as_str())
        .bind(item.target.as_str())
        .bind(item.version)
        .bind(&item.payload)
        .bind(follow_up_json(item)?)
        .bind(i64::from(item.attempts))
        .bind(&item.owner_lease)
        .bind(&item.worker_id)
        .bind(item.lease_expires_at)
        .bind(item.retry_at)
        .bind(item.enqueued_at)
        .bind(&item.last_error)
        .bind(&item.id)
        .bind(expected_revision)
        .execute(executor)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    fn lease_lost(item: &SyncItem) -> QueueError {
        QueueError::LeaseLost {
            item_id: item.id.clone(),
            entity_id: item.entity_id.clone(),
        }
    }

    /// Rows in the applied log
    pub async fn applied_len(&self) -> Result<u64, QueueError> {
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM sync_incoming")
            .fetch_one(&self.pool)
            .await?;
        Ok(int(&row, "cnt").unwrap_or(0).max(0) as u64)
    }
}

#[async_trait]
impl SyncQueue for SqlSyncQueue {
    async fn enqueue(&self, request: SyncRequest) -> Result<EnqueueOutcome, QueueError> {
        let _stripe = self.stripe(&request.entity_id).lock().await;

        for attempt in 0..RACE_RETRIES {
            if attempt > 0 {
                debug!(entity_id = %request.entity_id, attempt, "Enqueue raced another writer, retrying");
                Self::race_pause().await;
            }
            match self.fetch_active(&request.entity_id).await? {
                Some(StoredItem { item: mut current, revision }) => {
                    let outcome = current.coalesce(request.clone());
                    if self.update_guarded(&self.pool, &current, revision).await? {
                        return Ok(outcome);
                    }
                }
                None => {
                    let item = SyncItem::new(request.clone(), self.clock.now_millis());
                    match self.insert(&self.pool, &item).await {
                        Ok(()) => return Ok(EnqueueOutcome::Inserted),
                        Err(e) if is_unique_violation(&e) => {}
                        Err(e) => return Err(e.into()),
                    }
                }
            }
        }

        Err(Self::race_exhausted("enqueue", &request.entity_id))
    }

    async fn dequeue(&self, worker_id: &str) -> Result<Option<SyncItem>, QueueError> {
        let now = self.clock.now_millis();

        let sql = format!(
            "SELECT {} FROM sync_outgoing WHERE active = 1 AND (status = 'Pending' \
             OR (status = 'Failed' AND (retry_at IS NULL OR retry_at <= ?)) \
             OR (status = 'Processing' AND (lease_expires_at IS NULL OR lease_expires_at <= ?))) \
             ORDER BY enqueued_at, id LIMIT ?",
            COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(now)
            .bind(now)
            .bind(CLAIM_CANDIDATES)
            .fetch_all(&self.pool)
            .await?;

        // A candidate that changed since the SELECT is skipped; the next poll sees it again
        for row in &rows {
            let StoredItem { mut item, revision } = row_to_stored(row)?;
            item.claim(worker_id, now, self.settings.lease_timeout);
            if self.update_guarded(&self.pool, &item, revision).await? {
                return Ok(Some(item));
            }
        }
        Ok(None)
    }

    async fn ack(&self, item: &SyncItem) -> Result<(), QueueError> {
        let now = self.clock.now_millis();

        for attempt in 0..RACE_RETRIES {
            if attempt > 0 {
                Self::race_pause().await;
            }
            let StoredItem { item: mut current, revision } = self.fetch_leased(item).await?;
            let follow_up = current.complete(now);

            let mut tx = self.pool.begin().await?;
            let deleted = sqlx::query("DELETE FROM sync_outgoing WHERE id = ? AND revision = ?")
                .bind(&item.id)
                .bind(revision)
                .execute(&mut *tx)
                .await?;
            if deleted.rows_affected() != 1 {
                // Lease expired, or a follow-up was parked since we read the row
                tx.rollback().await?;
                continue;
            }
            if let Some(ref next) = follow_up {
                self.insert(&mut *tx, next).await?;
            }
            sqlx::query("DELETE FROM sync_outgoing WHERE entity_id = ? AND active IS NULL AND version <= ?")
                .bind(&current.entity_id)
                .bind(current.version)
                .execute(&mut *tx)
                .await?;
            sqlx::query(
                "INSERT INTO sync_incoming (id, entity_id, message_type, version, body, applied_at, keep_until) \
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&current.id)
            .bind(&current.entity_id)
            .bind(current.operation.as_str())
            .bind(current.version)
            .bind(&current.payload)
            .bind(now)
            .bind(clock::after(now, self.settings.applied_retention))
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;

            if self.acks.fetch_add(1, Ordering::Relaxed) % PURGE_EVERY_ACKS == PURGE_EVERY_ACKS - 1 {
                let purged = self.purge_applied().await?;
                debug!(purged, "Purged applied sync log");
            }
            return Ok(());
        }

        Err(Self::race_exhausted("ack", &item.entity_id))
    }

    async fn nack(&self, item: &SyncItem, error: &str) -> Result<NackOutcome, QueueError> {
        let now = self.clock.now_millis();

        for attempt in 0..RACE_RETRIES {
            if attempt > 0 {
                Self::race_pause().await;
            }
            let StoredItem { item: mut current, revision } = self.fetch_leased(item).await?;
            let outcome = current.fail(error, now, &self.settings);

            let mut tx = self.pool.begin().await?;
            if !self.update_guarded(&mut *tx, &current, revision).await? {
                tx.rollback().await?;
                continue;
            }
            if let NackOutcome::DeadLettered { .. } = outcome {
                // Keep one dead letter per entity: the newest
                sqlx::query("DELETE FROM sync_outgoing WHERE entity_id = ? AND active IS NULL AND id <> ?")
                    .bind(&current.entity_id)
                    .bind(&current.id)
                    .execute(&mut *tx)
                    .await?;
            }
            tx.commit().await?;
            return Ok(outcome);
        }

        Err(Self::race_exhausted("nack", &item.entity_id))
    }

    async fn release(&self, item: &SyncItem) -> Result<(), QueueError> {
        for attempt in 0..RACE_RETRIES {
            if attempt > 0 {
                Self::race_pause().await;
            }
            let StoredItem { item: mut current, revision } = self.fetch_leased(item).await?;
            current.release();
            if self.update_guarded(&self.pool, &current, revision).await? {
                return Ok(());
            }
        }

        Err(Self::race_exhausted("release", &item.entity_id))
    }

    async fn active(&self, entity_id: &str) -> Result<Option<SyncItem>, QueueError> {
        Ok(self.fetch_active(entity_id).await?.map(|stored| stored.item))
    }

    async fn dead_lettered(&self) -> Result<Vec<SyncItem>, QueueError> {
        let sql = format!(
            "SELECT {} FROM sync_outgoing WHERE active IS NULL ORDER BY entity_id",
            COLUMNS
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(row_to_item).collect()
    }

    async fn retry_dead_lettered(&self, entity_id: &str) -> Result<DeadLetterRetry, QueueError> {
        let now = self.clock.now_millis();

        let StoredItem { item: mut dead, revision } = self
            .fetch_dead(entity_id)
            .await?
            .ok_or_else(|| QueueError::NotFound(entity_id.to_string()))?;

        if self.fetch_active(entity_id).await?.is_some() {
            sqlx::query("DELETE FROM sync_outgoing WHERE id = ? AND revision = ?")
                .bind(&dead.id)
                .bind(revision)
                .execute(&self.pool)
                .await?;
            return Ok(DeadLetterRetry::Superseded);
        }

        dead.revive(now);
        match self.update_guarded(&self.pool, &dead, revision).await {
            Ok(true) => Ok(DeadLetterRetry::Requeued),
            // Revived or dropped by someone else first
            Ok(false) => Err(QueueError::NotFound(entity_id.to_string())),
            // A write for the entity got its own active row in between
            Err(e) => match self.fetch_active(entity_id).await? {
                Some(_) => Ok(DeadLetterRetry::Superseded),
                None => Err(e),
            },
        }
    }

    async fn depth(&self) -> Result<QueueDepth, QueueError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS cnt FROM sync_outgoing GROUP BY status")
            .fetch_all(&self.pool)
            .await?;

        let mut depth = QueueDepth::default();
        for row in &rows {
            let Some(status) = text(row, "status") else {
                continue;
            };
            let count = int(row, "cnt").unwrap_or(0).max(0) as usize;
            match status.parse::<SyncStatus>()? {
                SyncStatus::Pending => depth.pending += count,
                SyncStatus::Processing => depth.processing += count,
                SyncStatus::Failed => depth.failed += count,
                SyncStatus::DeadLettered => depth.dead_lettered += count,
            }
        }
        Ok(depth)
    }

    async fn purge_applied(&self) -> Result<u64, QueueError> {
        let result = sqlx::query("DELETE FROM sync_incoming WHERE keep_until <= ?")
            .bind(self.clock.now_millis())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
