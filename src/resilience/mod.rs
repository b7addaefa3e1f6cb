// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Resilience policies wrapped around every store call: cancellation,
//! retry with backoff, circuit breaking and hard deadlines.

pub mod cancel;
pub mod circuit_breaker;
pub mod pipeline;
pub mod retry;

pub use cancel::{CancelSource, CancelToken};
pub use circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError, CircuitSnapshot, CircuitState};
pub use pipeline::{PipelineConfig, ResiliencePipeline};
pub use retry::{retry, RetryConfig, Retryable};
