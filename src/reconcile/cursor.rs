// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Persisted progress of the running reconciliation pass.

use async_trait::async_trait;
use parking_lot::Mutex;
use sqlx::{AnyPool, Row};

use super::types::{ReconcileCursor, ReconcileError};
use crate::queue::sql::connect_pool;

#[async_trait]
pub trait CursorStore: Send + Sync {
    async fn load(&self) -> Result<Option<ReconcileCursor>, ReconcileError>;
    async fn save(&self, cursor: &ReconcileCursor) -> Result<(), ReconcileError>;
    /// Forget the cursor once a pass completes
    async fn clear(&self) -> Result<(), ReconcileError>;
}

#[derive(Default)]
pub struct InMemoryCursorStore {
    cursor: Mutex<Option<ReconcileCursor>>,
}

impl InMemoryCursorStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CursorStore for InMemoryCursorStore {
    async fn load(&self) -> Result<Option<ReconcileCursor>, ReconcileError> {
        Ok(self.cursor.lock().clone())
    }

    async fn save(&self, cursor: &ReconcileCursor) -> Result<(), ReconcileError> {
        *self.cursor.lock() = Some(cursor.clone());
        Ok(())
    }

    async fn clear(&self) -> Result<(), ReconcileError> {
        *self.cursor.lock() = None;
        Ok(())
    }
}

/// Cursor kept in a single-row-per-name `reconciliation_cursor` table
pub struct SqlCursorStore {
    pool: AnyPool,
    name: String,
}

impl SqlCursorStore {
    pub async fn connect(url: &str, name: &str) -> Result<Self, ReconcileError> {
        let (pool, is_sqlite) = connect_pool(url)
            .await
            .map_err(|e| ReconcileError::Cursor(e.to_string()))?;
        Self::from_pool(pool, is_sqlite, name).await
    }

    /// Share an existing pool (typically the sync queue's)
    pub async fn from_pool(pool: AnyPool, is_sqlite: bool, name: &str) -> Result<Self, ReconcileError> {
        let ddl = if is_sqlite {
            r#"
            CREATE TABLE IF NOT EXISTS reconciliation_cursor (
                name TEXT PRIMARY KEY,
                pass_started_at INTEGER NOT NULL,
                after_id TEXT,
                checked INTEGER NOT NULL
            )
            "#
        } else {
            r#"
            CREATE TABLE IF NOT EXISTS reconciliation_cursor (
                name VARCHAR(64) PRIMARY KEY,
                pass_started_at BIGINT NOT NULL,
                after_id VARCHAR(255),
                checked BIGINT NOT NULL
            )
            "#
        };
        sqlx::query(ddl).execute(&pool).await?;
        Ok(Self {
            pool,
            name: name.to_string(),
        })
    }
}

#[async_trait]
impl CursorStore for SqlCursorStore {
    async fn load(&self) -> Result<Option<ReconcileCursor>, ReconcileError> {
        let row = sqlx::query(
            "SELECT pass_started_at, after_id, checked FROM reconciliation_cursor WHERE name = ?",
        )
        .bind(&self.name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| ReconcileCursor {
            pass_started_at: row.try_get::<i64, _>("pass_started_at").unwrap_or(0),
            after_id: row
                .try_get::<Option<String>, _>("after_id")
                .ok()
                .flatten()
                .or_else(|| {
                    row.try_get::<Option<Vec<u8>>, _>("after_id")
                        .ok()
                        .flatten()
                        .map(|b| String::from_utf8_lossy(&b).into_owned())
                }),
            checked: row.try_get::<i64, _>("checked").unwrap_or(0).max(0) as u64,
        }))
    }

    async fn save(&self, cursor: &ReconcileCursor) -> Result<(), ReconcileError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM reconciliation_cursor WHERE name = ?")
            .bind(&self.name)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO reconciliation_cursor (name, pass_started_at, after_id, checked) VALUES (?, ?, ?, ?)",
        )
        .bind(&self.name)
        .bind(cursor.pass_started_at)
        .bind(&cursor.after_id)
        .bind(cursor.checked as i64)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn clear(&self) -> Result<(), ReconcileError> {
        sqlx::query("DELETE FROM reconciliation_cursor WHERE name = ?")
            .bind(&self.name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
