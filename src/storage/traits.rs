// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

use crate::entity::Entity;
use crate::resilience::cancel::CancelToken;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("Entity not found: {0}")]
    NotFound(String),
    #[error("Version conflict for '{id}': expected {expected}, found {actual}")]
    Conflict { id: String, expected: i64, actual: i64 },
    #[error("Validation failed: {0}")]
    Validation(String),
    /// Network failure, connection refused, store restarting
    #[error("Store unavailable: {0}")]
    Unavailable(String),
    /// The store asked us to slow down
    #[error("Store throttled: {0}")]
    Throttled(String),
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("{operation} timed out after {after_ms}ms")]
    Timeout { operation: String, after_ms: u64 },
    #[error("circuit breaker '{circuit}' open, request rejected")]
    CircuitOpen { circuit: String },
    #[error("operation cancelled")]
    Cancelled,
}

impl StorageError {
    /// Transient errors are worth retrying locally.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Unavailable(_) | Self::Throttled(_) | Self::Timeout { .. }
        )
    }

    /// Errors that say something about the health of the store.
    ///
    /// Not-found, conflicts and validation failures mean the store answered,
    /// so they never count against the circuit breaker.
    #[must_use]
    pub fn is_infrastructure_failure(&self) -> bool {
        self.is_transient() || matches!(self, Self::Backend(_))
    }

    /// Short label for metrics
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::Conflict { .. } => "conflict",
            Self::Validation(_) => "validation",
            Self::Unavailable(_) => "unavailable",
            Self::Throttled(_) => "throttled",
            Self::Backend(_) => "backend",
            Self::Timeout { .. } => "timeout",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Which entities a [`StoreAdapter::query`] yields.
///
/// Results are always ordered by ID, which makes `after_id` a resumable cursor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuerySpec {
    /// Only IDs strictly greater than this one
    pub after_id: Option<String>,
    /// Only IDs starting with this prefix
    pub id_prefix: Option<String>,
    /// Stop after this many entities
    pub limit: Option<usize>,
}

impl QuerySpec {
    /// Every entity in the store
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// One ID-ordered page starting after `after_id`
    #[must_use]
    pub fn page(after_id: Option<String>, limit: usize) -> Self {
        Self {
            after_id,
            id_prefix: None,
            limit: Some(limit),
        }
    }

    #[must_use]
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.id_prefix = Some(prefix.into());
        self
    }

    /// Whether an ID passes the `after_id` and prefix filters
    #[must_use]
    pub fn matches(&self, id: &str) -> bool {
        if let Some(ref after) = self.after_id {
            if id <= after.as_str() {
                return false;
            }
        }
        match self.id_prefix {
            Some(ref prefix) => id.starts_with(prefix.as_str()),
            None => true,
        }
    }
}

/// Lazy, finite stream of entities
pub type EntityStream<'a> = BoxStream<'a, Result<Entity, StorageError>>;

/// Uniform CRUD + query contract implemented once per backing store.
///
/// # Versions
///
/// `put` stores `entity.version` as given when it is positive and assigns
/// `current + 1` when it is `0`. When `expected` is `Some(v)` the write is a
/// compare-and-swap on the stored version (`0` means "must not exist yet") and
/// fails with [`StorageError::Conflict`] on mismatch; `None` is a blind overwrite.
///
/// # Cancellation and timeouts
///
/// Implementations should return promptly once `cancel` fires. They do not
/// enforce their own deadline; the resilience pipeline does.
#[async_trait]
pub trait StoreAdapter: Send + Sync {
    /// Stable name used for circuit breakers, metrics and logs
    fn name(&self) -> &str;

    async fn get(&self, id: &str, cancel: &CancelToken) -> Result<Option<Entity>, StorageError>;

    /// Returns the version now stored
    async fn put(
        &self,
        entity: &Entity,
        expected: Option<i64>,
        cancel: &CancelToken,
    ) -> Result<i64, StorageError>;

    /// Fails with [`StorageError::NotFound`] when the entity does not exist
    async fn delete(&self, id: &str, cancel: &CancelToken) -> Result<(), StorageError>;

    /// ID-ordered entities matching `spec`. Nothing is read until the stream is
    /// polled, and calling `query` again with the same spec starts over.
    fn query<'a>(&'a self, spec: QuerySpec, cancel: &'a CancelToken) -> EntityStream<'a>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(StorageError::Unavailable("down".into()).is_transient());
        assert!(StorageError::Throttled("slow down".into()).is_transient());
        assert!(StorageError::Timeout { operation: "get".into(), after_ms: 10 }.is_transient());

        assert!(!StorageError::NotFound("x".into()).is_transient());
        assert!(!StorageError::Validation("bad".into()).is_transient());
        assert!(!StorageError::Conflict { id: "x".into(), expected: 1, actual: 2 }.is_transient());
        assert!(!StorageError::CircuitOpen { circuit: "c".into() }.is_transient());
        assert!(!StorageError::Cancelled.is_transient());
    }

    #[test]
    fn test_infrastructure_failures() {
        assert!(StorageError::Backend("corrupt page".into()).is_infrastructure_failure());
        assert!(StorageError::Unavailable("down".into()).is_infrastructure_failure());
        assert!(!StorageError::NotFound("x".into()).is_infrastructure_failure());
        assert!(!StorageError::Cancelled.is_infrastructure_failure());
    }

    #[test]
    fn test_query_spec_matching() {
        let spec = QuerySpec::page(Some("user.2".into()), 10).with_prefix("user.");

        assert!(!spec.matches("user.1"));
        assert!(!spec.matches("user.2"));
        assert!(spec.matches("user.3"));
        assert!(!spec.matches("order.9"));
        assert!(QuerySpec::all().matches("anything"));
    }
}
