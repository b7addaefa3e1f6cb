// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Public types for the migration engine.

use serde::Serialize;

use crate::cache::CacheStats;
use crate::phase::MigrationPhase;
use crate::queue::QueueDepth;
use crate::resilience::CircuitSnapshot;

/// Engine lifecycle state.
///
/// Use [`super::MigrationEngine::state()`] to check the current state or
/// [`super::MigrationEngine::state_receiver()`] to watch for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EngineState {
    /// Built, workers and scheduler not started
    Created,
    /// Accepting reads and writes
    Running,
    /// Draining sync workers
    ShuttingDown,
    Stopped,
}

impl EngineState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "Created",
            Self::Running => "Running",
            Self::ShuttingDown => "ShuttingDown",
            Self::Stopped => "Stopped",
        }
    }
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of the engine for health endpoints
#[derive(Debug, Clone, Serialize)]
pub struct EngineHealth {
    pub state: EngineState,
    pub phase: MigrationPhase,
    pub queue: QueueDepth,
    /// Read and write circuits of the legacy store, then the target store
    pub circuits: Vec<CircuitSnapshot>,
    pub cache: CacheStats,
    pub cache_backend: String,
    /// Items a sync worker is applying right now
    pub in_flight: usize,
    pub unresolved_discrepancies: usize,
}

impl EngineHealth {
    /// Running with every circuit closed and nothing dead-lettered
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.state == EngineState::Running
            && self.queue.dead_lettered == 0
            && self
                .circuits
                .iter()
                .all(|c| c.state == crate::resilience::CircuitState::Closed)
    }
}
