//! Per-endpoint circuit breaker.
//!
//! Each endpoint (a printer id or a service id) gets its own lazily
//! created circuit, so one misbehaving printer never degrades the rest
//! of the fleet.
//!
//! ```text
//!   CLOSED ──(failure_threshold consecutive failures)──▶ OPEN
//!     ▲                                                   │
//!     │ success_threshold                   now ≥ next_attempt,
//!     │ consecutive successes               next call passes
//!     │                                                   ▼
//!     └──────────────────────────────────────────── HALF_OPEN
//!                     any failure ──▶ OPEN
//! ```
//!
//! Callers either wrap an operation with [`CircuitBreaker::execute`], or
//! drive the breaker by hand with [`acquire`](CircuitBreaker::acquire)
//! followed by exactly one of [`record_success`](CircuitBreaker::record_success)
//! / [`record_failure`](CircuitBreaker::record_failure).

mod classify;

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use strum::Display;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::clock::{SharedClock, chrono_duration, remaining, saturating_after};
use crate::error::CoreError;

pub use classify::{ErrorClass, classify};

const TRANSITION_CHANNEL_SIZE: usize = 256;

// ── Configuration ────────────────────────────────────────────────────

/// Thresholds for one circuit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitConfig {
    /// Consecutive failures that open the circuit. Default: 5.
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close it again. Default: 2.
    pub success_threshold: u32,
    /// How long an open circuit rejects calls. Default: 30s.
    pub open_timeout: Duration,
    /// A failure arriving after this much quiet restarts the count. Default: 60s.
    pub monitoring_window: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout: Duration::from_secs(30),
            monitoring_window: Duration::from_secs(60),
        }
    }
}

impl CircuitConfig {
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.failure_threshold == 0 {
            return Err(CoreError::Validation {
                field: "failure_threshold".into(),
                reason: "must be at least 1".into(),
            });
        }
        if self.success_threshold == 0 {
            return Err(CoreError::Validation {
                field: "success_threshold".into(),
                reason: "must be at least 1".into(),
            });
        }
        if self.open_timeout.is_zero() {
            return Err(CoreError::Validation {
                field: "open_timeout".into(),
                reason: "must be greater than zero".into(),
            });
        }
        Ok(())
    }
}

// ── State & records ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Display)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    #[default]
    Closed,
    Open,
    HalfOpen,
}

/// State-machine fields of one circuit.
///
/// Invariant: `state == Open` implies `next_attempt.is_some()`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitRecord {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub next_attempt: Option<DateTime<Utc>>,
    pub last_state_change: Option<DateTime<Utc>>,
}

/// Lifetime counters of one circuit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitMetrics {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub rejected_requests: u64,
    pub transient_errors: u64,
    pub permanent_errors: u64,
    pub unknown_errors: u64,
    pub times_opened: u64,
}

/// Point-in-time copy of one circuit, for aggregate reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitSnapshot {
    pub endpoint: String,
    pub record: CircuitRecord,
    pub metrics: CircuitMetrics,
}

/// Published on every state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitTransition {
    pub endpoint: String,
    pub from: CircuitState,
    pub to: CircuitState,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct CircuitEntry {
    record: CircuitRecord,
    metrics: CircuitMetrics,
}

// ── Errors ───────────────────────────────────────────────────────────

/// Synthesized when a call is rejected by an open circuit.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Service unavailable for {endpoint}: circuit open, retry in {:.1}s", .retry_in.as_secs_f64())]
pub struct CircuitOpenError {
    pub endpoint: String,
    pub retry_in: Duration,
}

impl From<CircuitOpenError> for CoreError {
    fn from(err: CircuitOpenError) -> Self {
        CoreError::CircuitOpen {
            endpoint: err.endpoint,
            retry_in: err.retry_in,
        }
    }
}

/// Outcome of [`CircuitBreaker::execute`] when the call did not succeed.
///
/// The wrapped operation's own error is handed back untouched.
#[derive(Debug)]
pub enum ExecuteError<E> {
    /// Rejected without running the operation.
    Open(CircuitOpenError),
    /// The operation ran and failed.
    Operation { class: ErrorClass, error: E },
}

impl<E> ExecuteError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open(_))
    }

    /// The operation's error, if it ran.
    pub fn into_operation(self) -> Option<E> {
        match self {
            Self::Open(_) => None,
            Self::Operation { error, .. } => Some(error),
        }
    }
}

impl<E: fmt::Display> fmt::Display for ExecuteError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open(open) => open.fmt(f),
            Self::Operation { error, .. } => error.fmt(f),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for ExecuteError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Open(open) => Some(open),
            Self::Operation { error, .. } => Some(error),
        }
    }
}

impl From<ExecuteError<CoreError>> for CoreError {
    fn from(err: ExecuteError<CoreError>) -> Self {
        match err {
            ExecuteError::Open(open) => open.into(),
            ExecuteError::Operation { error, .. } => error,
        }
    }
}

// ── CircuitBreaker ───────────────────────────────────────────────────

/// Registry of per-endpoint circuits.
///
/// Thread-safe; each endpoint's state is updated under its own map
/// shard, and aggregate reads copy snapshots.
pub struct CircuitBreaker {
    circuits: DashMap<String, CircuitEntry>,
    overrides: DashMap<String, CircuitConfig>,
    default_config: ArcSwap<CircuitConfig>,
    clock: SharedClock,
    transitions: broadcast::Sender<CircuitTransition>,
}

impl CircuitBreaker {
    pub fn new(default_config: CircuitConfig, clock: SharedClock) -> Self {
        let (transitions, _) = broadcast::channel(TRANSITION_CHANNEL_SIZE);
        Self {
            circuits: DashMap::new(),
            overrides: DashMap::new(),
            default_config: ArcSwap::from_pointee(default_config),
            clock,
            transitions,
        }
    }

    // ── Configuration ────────────────────────────────────────────────

    /// Override thresholds for one endpoint.
    pub fn configure(&self, endpoint: &str, config: CircuitConfig) -> Result<(), CoreError> {
        config.validate()?;
        debug!(endpoint, ?config, "circuit configured");
        self.overrides.insert(endpoint.to_owned(), config);
        Ok(())
    }

    /// Replace the thresholds used by endpoints without an override.
    pub fn set_default_config(&self, config: CircuitConfig) -> Result<(), CoreError> {
        config.validate()?;
        self.default_config.store(Arc::new(config));
        Ok(())
    }

    pub fn config_for(&self, endpoint: &str) -> CircuitConfig {
        self.overrides
            .get(endpoint)
            .map_or_else(|| (**self.default_config.load()).clone(), |c| c.clone())
    }

    // ── Manual protocol ──────────────────────────────────────────────

    /// Ask permission to call `endpoint`.
    ///
    /// An open circuit whose cool-down has elapsed moves to half-open
    /// and lets this call through.
    pub fn acquire(&self, endpoint: &str) -> Result<(), CircuitOpenError> {
        let now = self.clock.now();
        let mut transition = None;

        let verdict = {
            let mut entry = self.circuits.entry(endpoint.to_owned()).or_default();
            entry.metrics.total_requests += 1;

            match entry.record.state {
                CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
                CircuitState::Open => {
                    let next_attempt = entry.record.next_attempt.unwrap_or(now);
                    if now >= next_attempt {
                        entry.record.state = CircuitState::HalfOpen;
                        entry.record.success_count = 0;
                        entry.record.last_state_change = Some(now);
                        transition = Some((CircuitState::Open, CircuitState::HalfOpen));
                        Ok(())
                    } else {
                        entry.metrics.rejected_requests += 1;
                        Err(CircuitOpenError {
                            endpoint: endpoint.to_owned(),
                            retry_in: remaining(now, next_attempt),
                        })
                    }
                }
            }
        };

        if let Some((from, to)) = transition {
            self.publish(endpoint, from, to, now);
        }
        if let Err(ref rejected) = verdict {
            debug!(endpoint, retry_in = ?rejected.retry_in, "call rejected by open circuit");
        }
        verdict
    }

    /// Report a successful call admitted by [`acquire`](Self::acquire).
    pub fn record_success(&self, endpoint: &str) {
        let now = self.clock.now();
        let success_threshold = self.config_for(endpoint).success_threshold;
        let mut transition = None;

        {
            let mut entry = self.circuits.entry(endpoint.to_owned()).or_default();
            entry.metrics.successful_requests += 1;
            entry.record.last_success = Some(now);

            match entry.record.state {
                CircuitState::Closed => entry.record.failure_count = 0,
                CircuitState::HalfOpen => {
                    entry.record.success_count += 1;
                    if entry.record.success_count >= success_threshold {
                        entry.record.state = CircuitState::Closed;
                        entry.record.failure_count = 0;
                        entry.record.success_count = 0;
                        entry.record.next_attempt = None;
                        entry.record.last_state_change = Some(now);
                        transition = Some((CircuitState::HalfOpen, CircuitState::Closed));
                    }
                }
                // A straggler admitted before the circuit opened.
                CircuitState::Open => {}
            }
        }

        if let Some((from, to)) = transition {
            self.publish(endpoint, from, to, now);
        }
    }

    /// Report a failed call admitted by [`acquire`](Self::acquire).
    ///
    /// Returns the message's classification.
    pub fn record_failure(&self, endpoint: &str, message: &str) -> ErrorClass {
        let now = self.clock.now();
        let config = self.config_for(endpoint);
        let class = classify(message);
        let mut transition = None;

        {
            let mut entry = self.circuits.entry(endpoint.to_owned()).or_default();
            entry.metrics.failed_requests += 1;
            match class {
                ErrorClass::Transient => entry.metrics.transient_errors += 1,
                ErrorClass::Permanent => entry.metrics.permanent_errors += 1,
                ErrorClass::Unknown => entry.metrics.unknown_errors += 1,
            }

            let previous_failure = entry.record.last_failure.replace(now);

            match entry.record.state {
                CircuitState::Closed => {
                    let stale = previous_failure
                        .is_some_and(|t| now - t > chrono_duration(config.monitoring_window));
                    if stale {
                        entry.record.failure_count = 0;
                    }
                    entry.record.failure_count += 1;
                    if entry.record.failure_count >= config.failure_threshold {
                        Self::trip(&mut entry, now, &config);
                        transition = Some((CircuitState::Closed, CircuitState::Open));
                    }
                }
                CircuitState::HalfOpen => {
                    entry.record.success_count = 0;
                    Self::trip(&mut entry, now, &config);
                    transition = Some((CircuitState::HalfOpen, CircuitState::Open));
                }
                CircuitState::Open => {}
            }
        }

        if let Some((from, to)) = transition {
            self.publish(endpoint, from, to, now);
        }
        class
    }

    fn trip(entry: &mut CircuitEntry, now: DateTime<Utc>, config: &CircuitConfig) {
        entry.record.state = CircuitState::Open;
        entry.record.next_attempt = Some(saturating_after(now, config.open_timeout));
        entry.record.last_state_change = Some(now);
        entry.metrics.times_opened += 1;
    }

    fn publish(&self, endpoint: &str, from: CircuitState, to: CircuitState, at: DateTime<Utc>) {
        match to {
            CircuitState::Open => warn!(endpoint, %from, "circuit opened"),
            CircuitState::HalfOpen => info!(endpoint, "circuit half-open, probing"),
            CircuitState::Closed => info!(endpoint, "circuit closed"),
        }
        let _ = self.transitions.send(CircuitTransition {
            endpoint: endpoint.to_owned(),
            from,
            to,
            at,
        });
    }

    // ── Wrapped execution ────────────────────────────────────────────

    /// Run `operation` under the endpoint's circuit.
    ///
    /// Rejected calls never invoke `operation`. The operation's error is
    /// returned unchanged inside [`ExecuteError::Operation`].
    pub async fn execute<T, E, F, Fut>(
        &self,
        endpoint: &str,
        label: &str,
        operation: F,
    ) -> Result<T, ExecuteError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        self.acquire(endpoint).map_err(ExecuteError::Open)?;

        match operation().await {
            Ok(value) => {
                self.record_success(endpoint);
                Ok(value)
            }
            Err(error) => {
                let message = error.to_string();
                let class = self.record_failure(endpoint, &message);
                debug!(endpoint, label, %class, error = %message, "guarded operation failed");
                Err(ExecuteError::Operation { class, error })
            }
        }
    }

    // ── Observation & control ────────────────────────────────────────

    /// Current state; endpoints never seen are closed.
    pub fn state(&self, endpoint: &str) -> CircuitState {
        self.circuits
            .get(endpoint)
            .map_or(CircuitState::Closed, |e| e.record.state)
    }

    pub fn record(&self, endpoint: &str) -> Option<CircuitRecord> {
        self.circuits.get(endpoint).map(|e| e.record.clone())
    }

    pub fn metrics(&self, endpoint: &str) -> Option<CircuitMetrics> {
        self.circuits.get(endpoint).map(|e| e.metrics.clone())
    }

    /// Copy of every circuit, sorted by endpoint.
    pub fn all_metrics(&self) -> Vec<CircuitSnapshot> {
        let mut all: Vec<CircuitSnapshot> = self
            .circuits
            .iter()
            .map(|e| CircuitSnapshot {
                endpoint: e.key().clone(),
                record: e.record.clone(),
                metrics: e.metrics.clone(),
            })
            .collect();
        all.sort_by(|a, b| a.endpoint.cmp(&b.endpoint));
        all
    }

    pub fn open_count(&self) -> usize {
        self.circuits
            .iter()
            .filter(|e| e.record.state == CircuitState::Open)
            .count()
    }

    /// Forget an endpoint's circuit. Returns `true` if one existed.
    pub fn reset(&self, endpoint: &str) -> bool {
        let existed = self.circuits.remove(endpoint).is_some();
        if existed {
            info!(endpoint, "circuit reset");
        }
        existed
    }

    pub fn reset_all(&self) {
        self.circuits.clear();
        info!("all circuits reset");
    }

    /// Subscribe to state transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<CircuitTransition> {
        self.transitions.subscribe()
    }
}

// ── Tests ────────────────────────────────────────────────────────────
