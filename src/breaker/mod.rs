//! Per-service circuit breaker.
//!
//! Tracks the health of each downstream service and short-circuits calls
//! to one that keeps failing, giving it a cooldown before a single trial
//! call probes for recovery.
//!
//! # State machine
//!
//! ```text
//!            failures >= threshold
//!   Closed ───────────────────────────► Open
//!     ▲                                  │  ▲
//!     │ trial ok      reset timeout      │  │ trial failed
//!     │               elapsed            ▼  │
//!     └──────────────────────────────── HalfOpen
//! ```
//!
//! Only one trial call is admitted while half-open; concurrent callers are
//! short-circuited. A trial that never reports back (its caller was
//! cancelled) is abandoned after `half_open_timeout` and another caller
//! may claim the trial.
//!
//! # Backends
//!
//! Records live in process memory, or in a [`CoordinationStore`] shared by
//! all processes. On store failure the breaker keeps working from its local
//! copy of the record and counts a
//! [`STORE_FALLBACKS_TOTAL`](crate::telemetry::STORE_FALLBACKS_TOTAL).

mod backend;

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::store::CoordinationStore;
use crate::sync::KeyedLocks;
use crate::{GovernanceError, telemetry};

use backend::{CircuitBackend, LocalCircuits, SharedCircuits};

/// Configuration for the circuit breaker.
///
/// ```rust
/// # use warden::breaker::CircuitBreakerConfig;
/// # use std::time::Duration;
/// let config = CircuitBreakerConfig::new()
///     .failure_threshold(3)
///     .reset_timeout(Duration::from_secs(30));
/// ```
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit. Default: 5.
    pub failure_threshold: u32,
    /// Cooldown after the last failure before a trial call. Default: 60s.
    pub reset_timeout: Duration,
    /// How long a claimed trial call may stay unresolved. Default: 30s.
    pub half_open_timeout: Duration,
    /// Namespace for shared records. Default: `"circuit"`.
    pub prefix: String,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
            half_open_timeout: Duration::from_secs(30),
            prefix: "circuit".to_string(),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new config with sensible defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of consecutive failures that open the circuit.
    pub fn failure_threshold(mut self, n: u32) -> Self {
        self.failure_threshold = n;
        self
    }

    /// Set the cooldown before a trial call.
    pub fn reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }

    /// Set how long a trial claim stays valid.
    pub fn half_open_timeout(mut self, timeout: Duration) -> Self {
        self.half_open_timeout = timeout;
        self
    }

    /// Set the namespace for shared records.
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }
}

/// Circuit state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls pass through.
    Closed,
    /// Calls are short-circuited.
    Open,
    /// A single trial call tests recovery.
    HalfOpen,
}

impl CircuitState {
    fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }

    fn gauge_value(self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::HalfOpen => 1.0,
            CircuitState::Open => 2.0,
        }
    }
}

/// Persisted health of one service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitRecord {
    pub service: String,
    pub state: CircuitState,
    /// Consecutive failures; meaningful while closed or half-open.
    pub failures: u32,
    /// Set on every failure; gates the open → half-open transition.
    pub last_failure_at: Option<SystemTime>,
    pub updated_at: SystemTime,
}

/// Error from [`CircuitBreaker::call`].
#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    /// The circuit is open; the operation was not invoked.
    #[error("circuit open for service '{service}'")]
    Open { service: String },

    /// The operation ran and failed.
    #[error(transparent)]
    Inner(E),
}

impl<E> CircuitError<E> {
    /// Whether the call was short-circuited.
    pub fn is_open(&self) -> bool {
        matches!(self, CircuitError::Open { .. })
    }

    /// The operation's own error, if it ran.
    pub fn into_inner(self) -> Option<E> {
        match self {
            CircuitError::Inner(e) => Some(e),
            CircuitError::Open { .. } => None,
        }
    }
}

impl From<CircuitError<GovernanceError>> for GovernanceError {
    fn from(err: CircuitError<GovernanceError>) -> Self {
        match err {
            CircuitError::Open { service } => GovernanceError::CircuitOpen {
                service,
                fallback_used: false,
            },
            CircuitError::Inner(e) => e,
        }
    }
}

/// Why a fallback ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackReason {
    /// The circuit was open; the operation was skipped.
    CircuitOpen,
    /// The operation ran and failed.
    OperationFailed,
}

/// Result of [`CircuitBreaker::call_with_fallback`].
#[derive(Debug, Clone, PartialEq)]
pub struct CallOutcome<T> {
    pub value: T,
    /// `Some` when the value came from the fallback.
    pub fallback: Option<FallbackReason>,
}

impl<T> CallOutcome<T> {
    /// Whether the value came from the fallback.
    pub fn used_fallback(&self) -> bool {
        self.fallback.is_some()
    }
}

enum Admission {
    Proceed,
    Reject,
}

/// Circuit breaker keyed by service name.
pub struct CircuitBreaker {
    backend: Box<dyn CircuitBackend>,
    locks: KeyedLocks,
    config: CircuitBreakerConfig,
    clock: Clock,
}

impl CircuitBreaker {
    /// Create a breaker, shared through `store` when one is given.
    pub fn new(config: CircuitBreakerConfig, store: Option<Arc<dyn CoordinationStore>>) -> Self {
        let backend: Box<dyn CircuitBackend> = match store {
            Some(store) => Box::new(SharedCircuits::new(
                store,
                config.prefix.clone(),
                config.reset_timeout,
            )),
            None => Box::new(LocalCircuits::new()),
        };
        Self {
            backend,
            locks: KeyedLocks::new(),
            config,
            clock: Clock::new(),
        }
    }

    /// Create a single-process breaker.
    pub fn local(config: CircuitBreakerConfig) -> Self {
        Self::new(config, None)
    }

    /// Replace the time source.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Get the configuration.
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Run `operation` through the circuit for `service`.
    ///
    /// Returns [`CircuitError::Open`] without invoking the operation while
    /// the circuit is open; otherwise the operation's result, recording its
    /// success or failure.
    pub async fn call<T, E, F, Fut>(&self, service: &str, operation: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Admission::Reject = self.admit(service).await {
            metrics::counter!(telemetry::CIRCUIT_CALLS_TOTAL,
                "service" => service.to_owned(), "status" => "rejected")
            .increment(1);
            return Err(CircuitError::Open {
                service: service.to_owned(),
            });
        }

        match operation().await {
            Ok(value) => {
                self.on_success(service).await;
                Ok(value)
            }
            Err(e) => {
                self.on_failure(service).await;
                Err(CircuitError::Inner(e))
            }
        }
    }

    /// Run `operation` through the circuit, substituting `fallback` when the
    /// circuit is open or the operation fails.
    ///
    /// The fallback's own error is returned as-is.
    pub async fn call_with_fallback<T, E, F, Fut, G, GFut>(
        &self,
        service: &str,
        operation: F,
        fallback: G,
    ) -> Result<CallOutcome<T>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        G: FnOnce(FallbackReason) -> GFut,
        GFut: Future<Output = Result<T, E>>,
    {
        let reason = match self.call(service, operation).await {
            Ok(value) => {
                return Ok(CallOutcome {
                    value,
                    fallback: None,
                });
            }
            Err(CircuitError::Open { .. }) => FallbackReason::CircuitOpen,
            Err(CircuitError::Inner(_)) => FallbackReason::OperationFailed,
        };
        debug!(service, ?reason, "using fallback");
        let value = fallback(reason).await?;
        Ok(CallOutcome {
            value,
            fallback: Some(reason),
        })
    }

    /// Current state of `service` (closed when never seen).
    pub async fn state(&self, service: &str) -> CircuitState {
        self.backend.load(service).await.state
    }

    /// Full record for `service`.
    pub async fn record(&self, service: &str) -> CircuitRecord {
        self.backend.load(service).await
    }

    /// Manually close the circuit and clear its failure count.
    pub async fn reset(&self, service: &str) {
        let _guard = self.locks.lock(service).await;
        let mut record = self.backend.load(service).await;
        record.failures = 0;
        self.backend.clear_failures(service).await;
        self.transition(&mut record, CircuitState::Closed).await;
    }

    /// Manually trip the circuit open.
    pub async fn force_open(&self, service: &str) {
        let _guard = self.locks.lock(service).await;
        let mut record = self.backend.load(service).await;
        record.last_failure_at = Some(self.clock.now());
        self.transition(&mut record, CircuitState::Open).await;
    }

    async fn admit(&self, service: &str) -> Admission {
        let _guard = self.locks.lock(service).await;
        let mut record = self.backend.load(service).await;
        let now = self.clock.now();

        match record.state {
            CircuitState::Closed => Admission::Proceed,
            CircuitState::Open => {
                let cooled = record
                    .last_failure_at
                    .is_none_or(|at| elapsed(now, at) >= self.config.reset_timeout);
                if cooled {
                    self.transition(&mut record, CircuitState::HalfOpen).await;
                    Admission::Proceed
                } else {
                    Admission::Reject
                }
            }
            CircuitState::HalfOpen => {
                if elapsed(now, record.updated_at) >= self.config.half_open_timeout {
                    warn!(service, "abandoned half-open trial, claiming a new one");
                    record.updated_at = now;
                    self.backend.save(&record).await;
                    Admission::Proceed
                } else {
                    Admission::Reject
                }
            }
        }
    }

    async fn on_success(&self, service: &str) {
        metrics::counter!(telemetry::CIRCUIT_CALLS_TOTAL,
            "service" => service.to_owned(), "status" => "ok")
        .increment(1);

        let _guard = self.locks.lock(service).await;
        let mut record = self.backend.load(service).await;
        match record.state {
            CircuitState::HalfOpen => {
                record.failures = 0;
                self.backend.clear_failures(service).await;
                self.transition(&mut record, CircuitState::Closed).await;
            }
            CircuitState::Closed if record.failures > 0 => {
                record.failures = 0;
                record.updated_at = self.clock.now();
                self.backend.clear_failures(service).await;
                self.backend.save(&record).await;
            }
            // Reopened by another caller while this call was in flight.
            _ => {}
        }
    }

    async fn on_failure(&self, service: &str) {
        metrics::counter!(telemetry::CIRCUIT_CALLS_TOTAL,
            "service" => service.to_owned(), "status" => "error")
        .increment(1);

        let _guard = self.locks.lock(service).await;
        let mut record = self.backend.load(service).await;
        let now = self.clock.now();
        record.last_failure_at = Some(now);

        match record.state {
            CircuitState::Closed => {
                record.failures = self.backend.increment_failures(service).await;
                if record.failures >= self.config.failure_threshold {
                    warn!(service, failures = record.failures, "circuit opened");
                    self.transition(&mut record, CircuitState::Open).await;
                } else {
                    record.updated_at = now;
                    self.backend.save(&record).await;
                }
            }
            CircuitState::HalfOpen => {
                warn!(service, "trial call failed, circuit reopened");
                self.transition(&mut record, CircuitState::Open).await;
            }
            CircuitState::Open => {
                record.updated_at = now;
                self.backend.save(&record).await;
            }
        }
    }

    async fn transition(&self, record: &mut CircuitRecord, to: CircuitState) {
        let from = record.state;
        record.state = to;
        record.updated_at = self.clock.now();
        self.backend.save(record).await;

        metrics::gauge!(telemetry::CIRCUIT_STATE, "service" => record.service.clone())
            .set(to.gauge_value());
        if from != to {
            debug!(service = %record.service, from = from.as_str(), to = to.as_str(), "circuit transition");
            metrics::counter!(telemetry::CIRCUIT_TRANSITIONS_TOTAL,
                "service" => record.service.clone(), "to" => to.as_str())
            .increment(1);
        }
    }
}

fn elapsed(now: SystemTime, since: SystemTime) -> Duration {
    now.duration_since(since).unwrap_or_default()
}
