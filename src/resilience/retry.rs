// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry logic with exponential backoff.
//!
//! Only errors that classify themselves as transient are retried. The loop
//! races every attempt and every backoff sleep against the caller's
//! [`CancelToken`], and never starts another attempt once cancellation has
//! been observed.
//!
//! ```text
//! attempt 1 ──✗──▶ sleep base·2⁰ ±jitter ──▶ attempt 2 ──✗──▶ sleep base·2¹ ±jitter ──▶ attempt 3
//! ```
//!
//! # Example
//!
//! ```
//! use dual_write_engine::RetryConfig;
//! use std::time::Duration;
//!
//! // Store calls: 3 attempts, 200ms base
//! let store = RetryConfig::default();
//! assert_eq!(store.max_attempts, 3);
//!
//! // Startup: a few more attempts while backends come up
//! let startup = RetryConfig::startup();
//! assert_eq!(startup.max_attempts, 5);
//!
//! assert_eq!(store.backoff(0), Duration::from_millis(200));
//! assert_eq!(store.backoff(1), Duration::from_millis(400));
//! ```

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tracing::{info, warn};

use super::cancel::CancelToken;
use crate::storage::traits::StorageError;

/// An error the retry loop knows how to classify.
pub trait Retryable: std::fmt::Display {
    /// Worth another attempt (network blip, throttling, timeout)
    fn is_transient(&self) -> bool;

    /// The value returned when the caller cancels mid-retry
    fn cancelled() -> Self;
}

impl Retryable for StorageError {
    fn is_transient(&self) -> bool {
        StorageError::is_transient(self)
    }

    fn cancelled() -> Self {
        StorageError::Cancelled
    }
}

/// Configuration for operation retry behavior.
///
/// Use the preset constructors for common patterns:
/// - [`RetryConfig::default()`] - Store calls inside the resilience pipeline
/// - [`RetryConfig::startup()`] - Initial backend connections
/// - [`RetryConfig::query()`] - Quick retry for cache/queue maintenance queries
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Relative jitter applied to each delay (0.2 = ±20%)
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            jitter: 0.2,
        }
    }
}

impl RetryConfig {
    /// Retry for initial startup connections.
    /// 5 attempts, failing after roughly 5 seconds, so a bad URL surfaces quickly.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            jitter: 0.2,
        }
    }

    /// Quick retry for individual queries (don't block forever).
    #[must_use]
    pub fn query() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            jitter: 0.2,
        }
    }

    /// Fast retry for tests (minimal delays, no jitter)
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            jitter: 0.0,
        }
    }

    /// Un-jittered delay after the `failed`-th failure (0-based): `base × 2^failed`,
    /// capped at `max_delay`.
    #[must_use]
    pub fn backoff(&self, failed: u32) -> Duration {
        let factor = 2f64.powi(failed.min(30) as i32);
        self.base_delay.mul_f64(factor).min(self.max_delay)
    }

    /// Backoff with jitter applied
    #[must_use]
    pub fn jittered_backoff(&self, failed: u32) -> Duration {
        apply_jitter(self.backoff(failed), self.jitter)
    }
}

fn apply_jitter(delay: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 || delay.is_zero() {
        return delay;
    }
    let spread = jitter.min(1.0);
    let factor = 1.0 + rand::rng().random_range(-spread..=spread);
    delay.mul_f64(factor.max(0.0))
}

/// Run `operation` until it succeeds, fails permanently, runs out of attempts,
/// or `cancel` fires.
pub async fn retry<F, Fut, T, E>(
    operation_name: &str,
    config: &RetryConfig,
    cancel: &CancelToken,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempts: u32 = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(E::cancelled());
        }

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(E::cancelled()),
            result = operation() => result,
        };

        match result {
            Ok(val) => {
                if attempts > 0 {
                    info!(operation = %operation_name, retries = attempts, "Operation succeeded after retries");
                }
                return Ok(val);
            }
            Err(err) => {
                attempts += 1;

                if !err.is_transient() {
                    return Err(err);
                }
                if attempts >= max_attempts {
                    warn!(
                        operation = %operation_name,
                        attempts,
                        error = %err,
                        "Retries exhausted"
                    );
                    crate::metrics::record_retry_exhausted(operation_name);
                    return Err(err);
                }

                let delay = config.jittered_backoff(attempts - 1);
                warn!(
                    operation = %operation_name,
                    attempt = attempts,
                    max_attempts,
                    error = %err,
                    delay_ms = delay.as_millis() as u64,
                    "Transient failure, retrying"
                );
                crate::metrics::record_retry(operation_name);

                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(E::cancelled()),
                    _ = sleep(delay) => {}
                }
            }
        }
    }
}
