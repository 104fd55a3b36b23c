//! Per-dependency circuit breaker.
//!
//! A breaker starts `closed` and lets every call through. After `fail_max`
//! consecutive failures it opens and rejects calls without invoking them
//! until `reset_timeout` has elapsed. The first call after that becomes a
//! single trial in `half_open`; `success_threshold` successful trials close
//! the breaker again, one failed trial reopens it.
//!
//! All transitions happen under one short mutex section, so two callers
//! racing on the threshold cannot trip the breaker twice.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::metrics::MetricsCollector;

/// Returned instead of invoking the guarded operation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("circuit '{dependency}' is open, retry after {}ms", retry_after.as_millis())]
pub struct CircuitOpenError {
    /// Name of the dependency whose breaker rejected the call.
    pub dependency: String,
    /// How long until the breaker will admit a trial call.
    pub retry_after: Duration,
}

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Thresholds for a single breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerConfig {
    /// Consecutive failures in `closed` that open the breaker.
    pub fail_max: u32,
    /// Time spent `open` before a trial call is admitted.
    pub reset_timeout: Duration,
    /// Successful trials in `half_open` needed to close the breaker.
    pub success_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            fail_max: 5,
            reset_timeout: Duration::from_secs(60),
            success_threshold: 1,
        }
    }
}

impl BreakerConfig {
    pub fn new(fail_max: u32, reset_timeout: Duration) -> Self {
        Self {
            fail_max,
            reset_timeout,
            ..Default::default()
        }
    }

    pub fn with_fail_max(mut self, fail_max: u32) -> Self {
        self.fail_max = fail_max;
        self
    }

    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }

    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold;
        self
    }
}

/// Point-in-time view of a breaker for health reporting.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub opened_at: Option<DateTime<Utc>>,
    /// Milliseconds until a trial is admitted, only while `open`.
    pub retry_after_ms: Option<u64>,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    opened_at: Option<Instant>,
    opened_at_utc: Option<DateTime<Utc>>,
    trial_in_flight: bool,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            opened_at: None,
            opened_at_utc: None,
            trial_in_flight: false,
        }
    }
}

/// A failure-detecting gate for one named dependency.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
    metrics: MetricsCollector,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        let breaker = Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner::new()),
            metrics: MetricsCollector::new(),
        };
        breaker
            .metrics
            .update_breaker_state(&breaker.name, CircuitState::Closed);
        breaker
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Current state, without invoking anything.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Runs `operation` through the breaker, counting every `Err` as a failure.
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<CircuitOpenError>,
    {
        self.call_filtered(operation, |_| true).await
    }

    /// Runs `operation` through the breaker.
    ///
    /// Errors for which `is_failure` returns false are passed back to the
    /// caller without counting against the dependency (a malformed request
    /// or a shutdown signal says nothing about the dependency's health).
    /// Such an outcome on a trial call leaves the breaker `half_open`.
    pub async fn call_filtered<F, Fut, T, E, P>(&self, operation: F, is_failure: P) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<CircuitOpenError>,
        P: FnOnce(&E) -> bool,
    {
        let mut permit = self.acquire().map_err(E::from)?;

        let result = operation().await;
        match &result {
            Ok(_) => permit.settle(Outcome::Success),
            Err(e) if is_failure(e) => permit.settle(Outcome::Failure),
            Err(_) => permit.settle(Outcome::Ignored),
        }
        result
    }

    /// Forces the breaker closed and clears both counters.
    pub fn reset(&self) {
        let mut inner = self.lock();
        let from = inner.state;
        *inner = BreakerInner::new();
        drop(inner);
        if from != CircuitState::Closed {
            self.transitioned(from, CircuitState::Closed);
        }
    }

    /// Forces the breaker open, as if it had just tripped.
    pub fn trip(&self) {
        let mut inner = self.lock();
        let from = inner.state;
        self.open(&mut inner);
        drop(inner);
        self.transitioned(from, CircuitState::Open);
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        let retry_after_ms = match (inner.state, inner.opened_at) {
            (CircuitState::Open, Some(opened_at)) => Some(
                self.config
                    .reset_timeout
                    .saturating_sub(opened_at.elapsed())
                    .as_millis() as u64,
            ),
            _ => None,
        };

        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            opened_at: inner.opened_at_utc,
            retry_after_ms,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        self.inner.lock().expect("circuit breaker lock poisoned")
    }

    fn acquire(&self) -> Result<Permit<'_>, CircuitOpenError> {
        let mut inner = self.lock();

        match inner.state {
            CircuitState::Closed => Ok(Permit::new(self, false)),
            CircuitState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.config.reset_timeout {
                    inner.state = CircuitState::HalfOpen;
                    inner.success_count = 0;
                    inner.trial_in_flight = true;
                    drop(inner);
                    self.transitioned(CircuitState::Open, CircuitState::HalfOpen);
                    Ok(Permit::new(self, true))
                } else {
                    drop(inner);
                    self.metrics.record_breaker_rejection(&self.name);
                    Err(CircuitOpenError {
                        dependency: self.name.clone(),
                        retry_after: self.config.reset_timeout - elapsed,
                    })
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    drop(inner);
                    self.metrics.record_breaker_rejection(&self.name);
                    Err(CircuitOpenError {
                        dependency: self.name.clone(),
                        retry_after: Duration::ZERO,
                    })
                } else {
                    inner.trial_in_flight = true;
                    Ok(Permit::new(self, true))
                }
            }
        }
    }

    fn record(&self, trial: bool, outcome: Outcome) {
        let mut inner = self.lock();
        let from = inner.state;

        if trial {
            inner.trial_in_flight = false;
        }

        let to = match (from, trial, outcome) {
            (CircuitState::Closed, false, Outcome::Success) => {
                inner.failure_count = 0;
                None
            }
            (CircuitState::Closed, false, Outcome::Failure) => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.fail_max {
                    self.open(&mut inner);
                    Some(CircuitState::Open)
                } else {
                    None
                }
            }
            (CircuitState::HalfOpen, true, Outcome::Success) => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    inner.opened_at = None;
                    inner.opened_at_utc = None;
                    Some(CircuitState::Closed)
                } else {
                    None
                }
            }
            (CircuitState::HalfOpen, true, Outcome::Failure) => {
                self.open(&mut inner);
                Some(CircuitState::Open)
            }
            // Ignored outcomes, and late results of calls admitted under a
            // state that has since changed.
            _ => None,
        };

        if matches!(outcome, Outcome::Failure) && to.is_none() {
            tracing::debug!(
                dependency = %self.name,
                state = %inner.state,
                failure_count = inner.failure_count,
                "Guarded call failed"
            );
        }

        drop(inner);
        if let Some(to) = to {
            self.transitioned(from, to);
        }
    }

    fn release_trial(&self) {
        self.lock().trial_in_flight = false;
    }

    fn open(&self, inner: &mut BreakerInner) {
        inner.state = CircuitState::Open;
        inner.success_count = 0;
        inner.trial_in_flight = false;
        inner.opened_at = Some(Instant::now());
        inner.opened_at_utc = Some(Utc::now());
    }

    fn transitioned(&self, from: CircuitState, to: CircuitState) {
        match to {
            CircuitState::Open => warn!(
                dependency = %self.name,
                from = %from,
                reset_timeout_ms = self.config.reset_timeout.as_millis() as u64,
                "Circuit opened"
            ),
            _ => info!(dependency = %self.name, from = %from, to = %to, "Circuit state changed"),
        }
        self.metrics.update_breaker_state(&self.name, to);
    }
}

#[derive(Debug, Clone, Copy)]
enum Outcome {
    Success,
    Failure,
    Ignored,
}

/// Admission for one call. Dropping an unsettled trial permit (the caller's
/// future was cancelled) frees the trial slot without recording an outcome.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl<'a> Permit<'a> {
    fn new(breaker: &'a CircuitBreaker, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            settled: false,
        }
    }

    fn settle(&mut self, outcome: Outcome) {
        self.settled = true;
        self.breaker.record(self.trial, outcome);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            self.breaker.release_trial();
        }
    }
}
