// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Timeout → CircuitBreaker → Retry, composed around a single store call.
//!
//! ```text
//! ┌ timeout (hard deadline) ───────────────────────────────┐
//! │ ┌ circuit breaker (shared per store + op class) ─────┐ │
//! │ │ ┌ retry (transient errors only) ───────────────┐   │ │
//! │ │ │  store call                                  │   │ │
//! │ │ └──────────────────────────────────────────────┘   │ │
//! │ └────────────────────────────────────────────────────┘ │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! The breaker sees one outcome per pipeline call (after retries). Permanent
//! errors mean the store answered and count as successes; a deadline that
//! drops the call counts as a failure.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use super::cancel::CancelToken;
use super::circuit_breaker::{CallOutcome, CircuitBreaker, CircuitConfig, CircuitError, CircuitSnapshot};
use super::retry::{retry, RetryConfig};
use crate::clock::SharedClock;
use crate::metrics::{self, LatencyTimer};
use crate::storage::traits::StorageError;

/// Policy settings for one pipeline
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub retry: RetryConfig,
    pub circuit: CircuitConfig,
    pub timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            circuit: CircuitConfig::default(),
            timeout: Duration::from_secs(10),
        }
    }
}

pub struct ResiliencePipeline {
    name: String,
    retry: RetryConfig,
    timeout: Duration,
    breaker: Arc<CircuitBreaker>,
}

impl ResiliencePipeline {
    /// `name` identifies the protected resource, e.g. `legacy.read`
    pub fn new(name: impl Into<String>, config: PipelineConfig, clock: SharedClock) -> Self {
        let name = name.into();
        Self {
            breaker: Arc::new(CircuitBreaker::with_clock(name.clone(), config.circuit, clock)),
            name,
            retry: config.retry,
            timeout: config.timeout,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    #[must_use]
    pub fn snapshot(&self) -> CircuitSnapshot {
        self.breaker.snapshot()
    }

    /// Run `call` under all three policies. `call` is invoked once per attempt.
    pub async fn execute<F, Fut, T>(
        &self,
        operation: &'static str,
        cancel: &CancelToken,
        call: F,
    ) -> Result<T, StorageError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        let _timer = LatencyTimer::new(self.name.as_str(), operation);
        let label = format!("{}.{}", self.name, operation);

        let guarded = self
            .breaker
            .call_with(|| retry(&label, &self.retry, cancel, call), classify);

        let result = match tokio::time::timeout(self.timeout, guarded).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(CircuitError::Rejected)) => Err(StorageError::CircuitOpen {
                circuit: self.name.clone(),
            }),
            Ok(Err(CircuitError::Inner(e))) => Err(e),
            Err(_elapsed) => {
                self.breaker.record_timeout();
                metrics::record_timeout(&self.name, operation);
                warn!(
                    store = %self.name,
                    operation,
                    timeout_ms = self.timeout.as_millis() as u64,
                    "Store call timed out"
                );
                Err(StorageError::Timeout {
                    operation: label,
                    after_ms: self.timeout.as_millis() as u64,
                })
            }
        };

        match &result {
            Ok(_) => metrics::record_store_call(&self.name, operation, "success"),
            Err(e) => {
                let status = match e {
                    StorageError::CircuitOpen { .. } => "rejected",
                    StorageError::Timeout { .. } => "timeout",
                    StorageError::Cancelled => "cancelled",
                    _ => "error",
                };
                metrics::record_store_call(&self.name, operation, status);
                metrics::record_store_error(&self.name, operation, e.kind());
            }
        }
        result
    }
}

fn classify(err: &StorageError) -> CallOutcome {
    match err {
        StorageError::Cancelled => CallOutcome::Ignored,
        e if e.is_infrastructure_failure() => CallOutcome::Failure,
        _ => CallOutcome::Success,
    }
}
