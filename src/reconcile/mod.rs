// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Reconciliation: find (and optionally repair) differences between the
//! authoritative store and its replica.
//!
//! - [`ReconciliationService`]: resumable, paged passes on a schedule
//! - [`DiscrepancySink`]: where findings go ([`InMemoryDiscrepancySink`])
//! - [`CursorStore`]: pass progress ([`InMemoryCursorStore`], [`SqlCursorStore`])

pub mod cursor;
pub mod diff;
pub mod service;
pub mod sink;
pub mod types;

pub use cursor::{CursorStore, InMemoryCursorStore, SqlCursorStore};
pub use service::{ReconcileSettings, ReconciliationService};
pub use sink::{DiscrepancySink, InMemoryDiscrepancySink};
pub use types::{Discrepancy, PassSummary, ReconcileCursor, ReconcileError, ReconciliationReport};
