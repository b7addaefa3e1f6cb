// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Store adapters and the decorators that wrap them.
//!
//! ```text
//! CachedStore ──▶ ResilientStore ──▶ StoreAdapter (legacy | target)
//! ```

pub mod memory;
pub mod resilient;
pub mod traits;

pub use memory::InMemoryStore;
pub use resilient::ResilientStore;
pub use traits::{EntityStream, QuerySpec, StorageError, StoreAdapter};
