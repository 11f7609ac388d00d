//! Telemetry metric name constants.
//!
//! Centralised metric names for warden components. Consumers install
//! their own `metrics` recorder (e.g. prometheus, statsd); without a
//! recorder installed, all metric calls are no-ops.
//!
//! # Metric naming conventions
//!
//! All metrics are prefixed with `warden_`. Counters end in `_total`,
//! histograms use meaningful units (e.g. `_seconds`).
//!
//! # Common labels
//!
//! - `component`: "rate_limiter" or "circuit_breaker"
//! - `service`: circuit breaker service name
//! - `status`: outcome: "ok", "error" or "rejected"
//! - `model`: model id

/// Rate-limited requests admitted.
pub const RATE_LIMIT_ALLOWED_TOTAL: &str = "warden_rate_limit_allowed_total";

/// Rate-limited requests rejected.
pub const RATE_LIMIT_BLOCKED_TOTAL: &str = "warden_rate_limit_blocked_total";

/// Usage of the most recently checked rate-limit window.
pub const RATE_LIMIT_ACTIVE: &str = "warden_rate_limit_active";

/// Rate-limit check duration in seconds.
pub const RATE_LIMIT_CHECK_SECONDS: &str = "warden_rate_limit_check_seconds";

/// Calls through the circuit breaker.
///
/// Labels: `service`, `status` ("ok" | "error" | "rejected").
pub const CIRCUIT_CALLS_TOTAL: &str = "warden_circuit_calls_total";

/// Circuit state transitions.
///
/// Labels: `service`, `to` ("open" | "half_open" | "closed").
pub const CIRCUIT_TRANSITIONS_TOTAL: &str = "warden_circuit_transitions_total";

/// Current circuit state: 0 = closed, 1 = half-open, 2 = open.
///
/// Labels: `service`.
pub const CIRCUIT_STATE: &str = "warden_circuit_state";

/// Total cache hits.
pub const CACHE_HITS_TOTAL: &str = "warden_cache_hits_total";

/// Total cache misses.
pub const CACHE_MISSES_TOTAL: &str = "warden_cache_misses_total";

/// Entries removed by the cache policy.
pub const CACHE_EVICTIONS_TOTAL: &str = "warden_cache_evictions_total";

/// Cache operation duration in seconds.
///
/// Labels: `operation` ("get" | "set").
pub const CACHE_OPERATION_SECONDS: &str = "warden_cache_operation_seconds";

/// Model load duration in seconds.
pub const MODEL_LOAD_SECONDS: &str = "warden_model_load_seconds";

/// Failed model loads.
///
/// Labels: `model`.
pub const MODEL_LOAD_FAILURES_TOTAL: &str = "warden_model_load_failures_total";

/// Models evicted from the pool to make room.
pub const MODEL_EVICTIONS_TOTAL: &str = "warden_model_evictions_total";

/// Number of models currently held in the pool.
pub const MODEL_POOL_SIZE: &str = "warden_model_pool_size";

/// Inference requests served.
///
/// Labels: `model`, `status` ("ok" | "error").
pub const INFERENCE_REQUESTS_TOTAL: &str = "warden_inference_requests_total";

/// Inference duration in seconds.
///
/// Labels: `model`.
pub const INFERENCE_SECONDS: &str = "warden_inference_seconds";

/// Coordination store failures that were absorbed by a local fallback.
///
/// Labels: `component`.
pub const STORE_FALLBACKS_TOTAL: &str = "warden_store_fallbacks_total";
