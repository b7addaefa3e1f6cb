// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Crate-level error type.
//!
//! Each layer owns its own error enum ([`StorageError`], [`QueueError`],
//! [`ReconcileError`]); [`EngineError`] is what the coordinator and the
//! administrative surface return.

use thiserror::Error;

use crate::phase::MigrationPhase;
use crate::queue::QueueError;
use crate::reconcile::ReconcileError;
use crate::storage::traits::StorageError;

#[derive(Error, Debug, Clone)]
pub enum EngineError {
    /// A store call failed (transient errors only after retries were exhausted)
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// The sync queue backend failed
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Reconciliation(#[from] ReconcileError),

    /// An administrative phase change was refused; the previous phase stays active
    #[error("phase transition {from} -> {to} rejected: {reason}")]
    PhaseTransitionRejected {
        from: MigrationPhase,
        to: MigrationPhase,
        reason: String,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("engine is not running (state: {0})")]
    NotRunning(String),
}

impl EngineError {
    /// True when the error came from the circuit breaker short-circuiting the call
    #[must_use]
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::Storage(StorageError::CircuitOpen { .. }))
    }

    /// True when the underlying store reported the entity missing
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Storage(StorageError::NotFound(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_rejection_message() {
        let err = EngineError::PhaseTransitionRejected {
            from: MigrationPhase::PrimaryOnly,
            to: MigrationPhase::SecondaryOnly,
            reason: "must advance one phase at a time".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("PrimaryOnly -> SecondaryOnly"));
        assert!(msg.contains("one phase at a time"));
    }

    #[test]
    fn test_storage_error_is_transparent() {
        let err: EngineError = StorageError::NotFound("user.1".into()).into();
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), StorageError::NotFound("user.1".into()).to_string());
    }

    #[test]
    fn test_circuit_open_detection() {
        let err: EngineError = StorageError::CircuitOpen { circuit: "legacy.read".into() }.into();
        assert!(err.is_circuit_open());
        assert!(!err.is_not_found());
    }
}
