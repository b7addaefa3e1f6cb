// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! # Dual-Write Engine
//!
//! A phase-aware dual-write persistence engine for migrating entities from a
//! legacy store to a target store without downtime.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    DualWriteCoordinator                     │
//! │  • Routes by the active MigrationPhase                      │
//! │  • Synchronous write to the authoritative store             │
//! │  • Enqueues replication for the replica store               │
//! └─────────────────────────────────────────────────────────────┘
//!             │                                   │
//!             ▼                                   ▼
//! ┌───────────────────────────┐     ┌───────────────────────────┐
//! │  CachedStore (per role)   │     │         SyncQueue         │
//! │  • Cache-aside, TTL       │     │  • One active item per    │
//! │  • Single-flight loads    │     │    entity, coalescing     │
//! │  • Invalidate on write    │     │  • Leases, dead letters   │
//! └───────────────────────────┘     └───────────────────────────┘
//!             │                                   │
//!             ▼                          (SyncWorkerPool)
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 ResilientStore (per role)                   │
//! │  • Timeout → circuit breaker → retry with backoff           │
//! │  • Separate read/write circuits                             │
//! └─────────────────────────────────────────────────────────────┘
//!             │                                   │
//!             ▼                                   ▼
//!      legacy StoreAdapter                target StoreAdapter
//!             ▲                                   ▲
//!             └──────── ReconciliationService ────┘
//!                 (paged diff, optional repair)
//! ```
//!
//! ## Phases
//!
//! | Phase                    | Writes go to          | Reads from |
//! |--------------------------|-----------------------|------------|
//! | `PrimaryOnly`            | legacy                | legacy     |
//! | `DualWritePrimaryRead`   | legacy, then target   | legacy     |
//! | `DualWriteSecondaryRead` | target, then legacy   | target     |
//! | `SecondaryOnly`          | target                | target     |
//!
//! Phases only move forward, one step at a time. The read cutovers are gated
//! on dead letters and unresolved reconciliation discrepancies.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use dual_write_engine::{EngineConfig, Entity, MigrationEngine, MigrationPhase};
//! use dual_write_engine::storage::InMemoryStore;
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), dual_write_engine::EngineError> {
//!     let config = EngineConfig::from_json(r#"{
//!         "phase": "DualWritePrimaryRead",
//!         "sync": { "queueUrl": "sqlite:sync-queue.db?mode=rwc" }
//!     }"#)?;
//!
//!     let engine = MigrationEngine::builder(config)
//!         .legacy(Arc::new(InMemoryStore::new("legacy")))
//!         .target(Arc::new(InMemoryStore::new("target")))
//!         .build()
//!         .await?;
//!     engine.start().await?;
//!
//!     let receipt = engine
//!         .write(&Entity::from_json("customer.42", &json!({"name": "Ada"})), None)
//!         .await?;
//!     println!("committed v{} on {}", receipt.version, receipt.authoritative);
//!
//!     let pass = engine.reconcile_now().await?;
//!     let report = engine.reconciliation_report(0).await?;
//!     if pass.completed && report.is_clean() {
//!         engine.set_phase(MigrationPhase::DualWriteSecondaryRead).await?;
//!     }
//!
//!     engine.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`engine`]: [`MigrationEngine`] lifecycle and administrative interface
//! - [`coordinator`]: phase-driven read/write routing
//! - [`phase`]: [`MigrationPhase`] and the transition rules
//! - [`storage`]: the [`StoreAdapter`] contract, in-memory and resilient stores
//! - [`resilience`]: timeout, circuit breaker, retry, cancellation
//! - [`cache`]: cache-aside layer with in-memory and Redis backends
//! - [`queue`]: durable sync queue (in-memory, SQLite/MySQL)
//! - [`worker`]: sync workers applying queued items to the replica
//! - [`reconcile`]: store diffing, discrepancy tracking and repair

pub mod cache;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod entity;
pub mod error;
pub mod metrics;
pub mod phase;
pub mod queue;
pub mod reconcile;
pub mod resilience;
pub mod storage;
pub mod worker;

// Note: We don't expose a `tracing` module to avoid conflict with the tracing crate

pub use config::EngineConfig;
pub use coordinator::{Replication, WriteReceipt};
pub use engine::{EngineHealth, EngineState, MigrationEngine, MigrationEngineBuilder};
pub use entity::Entity;
pub use error::EngineError;
pub use phase::{CutoverGates, MigrationPhase, StoreRole};
pub use queue::{DeadLetterRetry, SyncItem, SyncQueue, SyncStatus};
pub use reconcile::{Discrepancy, ReconciliationReport};
pub use resilience::{CancelSource, CancelToken, CircuitConfig, CircuitState, RetryConfig};
pub use storage::{StorageError, StoreAdapter};
pub use metrics::LatencyTimer;
