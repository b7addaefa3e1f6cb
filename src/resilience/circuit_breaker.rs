// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Sliding-window circuit breaker.
//!
//! Protects the engine from hammering a store that is already failing. Each
//! breaker samples call outcomes over a time window and trips once enough calls
//! were seen and enough of them failed.
//!
//! ```text
//!            ratio ≥ failure_ratio
//!            (≥ minimum_throughput calls)
//!   Closed ───────────────────────────▶ Open
//!     ▲                                  │ break_duration elapsed
//!     │ trial succeeds                   ▼
//!     └─────────────────────────────── HalfOpen ──trial fails──▶ Open
//!                                     (one trial call only)
//! ```
//!
//! State is shared by every caller and guarded by a single lock, so concurrent
//! failures are never undercounted. Callers classify their own errors through
//! [`CallOutcome`]: a store that answered "not found" is healthy, and a call
//! the caller cancelled says nothing either way.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::clock::{self, SharedClock};

/// Circuit breaker state for metrics/monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum CircuitState {
    Closed = 0,
    HalfOpen = 1,
    Open = 2,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::HalfOpen => write!(f, "half_open"),
            Self::Open => write!(f, "open"),
        }
    }
}

/// Error type for circuit-protected operations
#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    /// The circuit breaker rejected the call (circuit is open)
    #[error("circuit breaker open, request rejected")]
    Rejected,

    /// The underlying operation failed
    #[error("operation failed: {0}")]
    Inner(#[source] E),
}

/// How a finished call should count towards the failure ratio
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Success,
    Failure,
    /// Neither (cancelled by the caller)
    Ignored,
}

/// Configuration for a circuit breaker
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Failure ratio (0.0 - 1.0) at or above which the circuit opens
    pub failure_ratio: f64,
    /// Only outcomes newer than this count
    pub sampling_window: Duration,
    /// Calls required in the window before the ratio is evaluated
    pub minimum_throughput: u32,
    /// How long the circuit stays open before admitting a trial call
    pub break_duration: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_ratio: 0.5,
            sampling_window: Duration::from_secs(30),
            minimum_throughput: 10,
            break_duration: Duration::from_secs(30),
        }
    }
}

impl CircuitConfig {
    /// Trips on less evidence and waits longer before probing
    #[must_use]
    pub fn aggressive() -> Self {
        Self {
            failure_ratio: 0.3,
            sampling_window: Duration::from_secs(30),
            minimum_throughput: 5,
            break_duration: Duration::from_secs(60),
        }
    }

    /// Tolerates more failures and probes sooner
    #[must_use]
    pub fn lenient() -> Self {
        Self {
            failure_ratio: 0.8,
            sampling_window: Duration::from_secs(30),
            minimum_throughput: 20,
            break_duration: Duration::from_secs(15),
        }
    }

    /// Fast recovery for testing
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            failure_ratio: 0.5,
            sampling_window: Duration::from_secs(30),
            minimum_throughput: 2,
            break_duration: Duration::from_millis(50),
        }
    }
}

#[derive(Debug)]
struct Window {
    state: CircuitState,
    /// (timestamp millis, failed)
    samples: VecDeque<(i64, bool)>,
    failure_count: usize,
    opened_at: Option<i64>,
    trial_in_flight: bool,
}

impl Window {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            samples: VecDeque::new(),
            failure_count: 0,
            opened_at: None,
            trial_in_flight: false,
        }
    }

    fn prune(&mut self, now: i64, window: Duration) {
        let cutoff = now - window.as_millis() as i64;
        while let Some(&(at, failed)) = self.samples.front() {
            if at > cutoff {
                break;
            }
            self.samples.pop_front();
            if failed {
                self.failure_count -= 1;
            }
        }
    }

    fn push(&mut self, now: i64, failed: bool) {
        self.samples.push_back((now, failed));
        if failed {
            self.failure_count += 1;
        }
    }

    fn reset_to(&mut self, state: CircuitState, now: i64) {
        self.state = state;
        self.samples.clear();
        self.failure_count = 0;
        self.trial_in_flight = false;
        self.opened_at = (state == CircuitState::Open).then_some(now);
    }
}

/// Point-in-time view of a breaker, for the admin surface
#[derive(Debug, Clone, serde::Serialize)]
pub struct CircuitSnapshot {
    pub name: String,
    pub state: CircuitState,
    /// Failures inside the current sampling window
    pub failure_count: usize,
    pub window_calls: usize,
    pub opened_at: Option<i64>,
    pub calls_total: u64,
    pub successes: u64,
    pub failures: u64,
    pub rejections: u64,
}

/// A named circuit breaker with metrics tracking
pub struct CircuitBreaker {
    name: String,
    config: CircuitConfig,
    clock: SharedClock,
    window: Mutex<Window>,

    // Metrics
    calls_total: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
}

/// Admission ticket for one call. Dropped unrecorded, it gives back the
/// half-open trial slot without counting either way.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    recorded: bool,
}

impl Permit<'_> {
    fn record(mut self, outcome: CallOutcome) {
        self.recorded = true;
        self.breaker.on_result(outcome, self.trial);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.recorded && self.trial {
            self.breaker.window.lock().trial_in_flight = false;
        }
    }
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given name and config
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        Self::with_clock(name, config, clock::system())
    }

    pub fn with_clock(name: impl Into<String>, config: CircuitConfig, clock: SharedClock) -> Self {
        Self {
            name: name.into(),
            config,
            clock,
            window: Mutex::new(Window::new()),
            calls_total: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    /// Get the circuit breaker name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn config(&self) -> &CircuitConfig {
        &self.config
    }

    /// Get current circuit state
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.window.lock().state
    }

    /// Execute an async operation, counting every error as a failure
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.call_with(f, |_| CallOutcome::Failure).await
    }

    /// Execute an async operation, letting `classify` decide how an error counts
    pub async fn call_with<F, Fut, T, E, C>(&self, f: F, classify: C) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: FnOnce(&E) -> CallOutcome,
    {
        self.calls_total.fetch_add(1, Ordering::Relaxed);

        let Some(permit) = self.try_acquire() else {
            self.rejections.fetch_add(1, Ordering::Relaxed);
            debug!(circuit = %self.name, "Circuit breaker rejected call (open)");
            crate::metrics::record_circuit_call(&self.name, "rejected");
            return Err(CircuitError::Rejected);
        };

        match f().await {
            Ok(result) => {
                self.successes.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_circuit_call(&self.name, "success");
                permit.record(CallOutcome::Success);
                Ok(result)
            }
            Err(e) => {
                let outcome = classify(&e);
                match outcome {
                    CallOutcome::Failure => {
                        self.failures.fetch_add(1, Ordering::Relaxed);
                        crate::metrics::record_circuit_call(&self.name, "failure");
                    }
                    CallOutcome::Success => {
                        self.successes.fetch_add(1, Ordering::Relaxed);
                        crate::metrics::record_circuit_call(&self.name, "success");
                    }
                    CallOutcome::Ignored => {}
                }
                permit.record(outcome);
                Err(CircuitError::Inner(e))
            }
        }
    }

    /// Count a failure for a call that never returned (its future was dropped
    /// by an outer deadline).
    pub fn record_timeout(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_circuit_call(&self.name, "timeout");
        self.on_result(CallOutcome::Failure, false);
    }

    fn try_acquire(&self) -> Option<Permit<'_>> {
        let now = self.clock.now_millis();
        let mut window = self.window.lock();

        let trial = match window.state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                let opened_at = window.opened_at.unwrap_or(now);
                if now - opened_at < self.config.break_duration.as_millis() as i64 {
                    return None;
                }
                window.state = CircuitState::HalfOpen;
                window.trial_in_flight = true;
                info!(circuit = %self.name, "Circuit half-open, admitting trial call");
                crate::metrics::set_circuit_state(&self.name, CircuitState::HalfOpen);
                true
            }
            CircuitState::HalfOpen => {
                if window.trial_in_flight {
                    return None;
                }
                window.trial_in_flight = true;
                true
            }
        };

        Some(Permit {
            breaker: self,
            trial,
            recorded: false,
        })
    }

    fn on_result(&self, outcome: CallOutcome, trial: bool) {
        let now = self.clock.now_millis();
        let mut window = self.window.lock();

        match (window.state, outcome) {
            (_, CallOutcome::Ignored) => {
                if trial {
                    window.trial_in_flight = false;
                }
            }
            (CircuitState::Closed, _) => {
                window.prune(now, self.config.sampling_window);
                window.push(now, outcome == CallOutcome::Failure);

                let calls = window.samples.len();
                let ratio = window.failure_count as f64 / calls as f64;
                if calls >= self.config.minimum_throughput as usize
                    && ratio >= self.config.failure_ratio
                {
                    warn!(
                        circuit = %self.name,
                        calls,
                        failures = window.failure_count,
                        ratio,
                        "Circuit breaker tripped"
                    );
                    window.reset_to(CircuitState::Open, now);
                    crate::metrics::record_circuit_trip(&self.name);
                    crate::metrics::set_circuit_state(&self.name, CircuitState::Open);
                }
            }
            (CircuitState::HalfOpen, CallOutcome::Success) => {
                // Also reached by a slow call admitted before the trip; its
                // success is as good as the trial's.
                info!(circuit = %self.name, "Trial call succeeded, circuit closed");
                window.reset_to(CircuitState::Closed, now);
                crate::metrics::set_circuit_state(&self.name, CircuitState::Closed);
            }
            (CircuitState::HalfOpen, CallOutcome::Failure) => {
                if trial || !window.trial_in_flight {
                    warn!(circuit = %self.name, "Trial call failed, circuit reopened");
                    window.reset_to(CircuitState::Open, now);
                    crate::metrics::record_circuit_trip(&self.name);
                    crate::metrics::set_circuit_state(&self.name, CircuitState::Open);
                }
            }
            (CircuitState::Open, _) => {}
        }
    }

    /// Get total number of calls (including rejected ones)
    #[must_use]
    pub fn calls_total(&self) -> u64 {
        self.calls_total.load(Ordering::Relaxed)
    }

    /// Get number of successful calls
    #[must_use]
    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    /// Get number of failed calls
    #[must_use]
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Get number of rejected calls (circuit open)
    #[must_use]
    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn snapshot(&self) -> CircuitSnapshot {
        let window = self.window.lock();
        CircuitSnapshot {
            name: self.name.clone(),
            state: window.state,
            failure_count: window.failure_count,
            window_calls: window.samples.len(),
            opened_at: window.opened_at,
            calls_total: self.calls_total(),
            successes: self.successes(),
            failures: self.failures(),
            rejections: self.rejections(),
        }
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}
