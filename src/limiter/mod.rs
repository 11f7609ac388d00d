//! Sliding-window rate limiter.
//!
//! Bounds the request rate per logical key (typically a user) over a
//! rolling time window. Every check purges events older than the window,
//! counts what remains and, when the request fits, records it, all as one
//! atomic step per key.
//!
//! # Backends
//!
//! The backend is chosen once, at construction:
//!
//! - no store: per-key event queues in process memory;
//! - with a [`CoordinationStore`]: sorted sets visible to every process
//!   sharing the store.
//!
//! Both backends have the same observable behaviour. When the store fails
//! (error or timeout) the shared backend falls back to local window state
//! for that check, logs a warning and counts a
//! [`STORE_FALLBACKS_TOTAL`](crate::telemetry::STORE_FALLBACKS_TOTAL). The
//! limiter never fails open: a degraded process still enforces limits on
//! the traffic it sees.
//!
//! ```rust
//! # use warden::limiter::{RateLimiter, RateLimitConfig};
//! # use std::time::Duration;
//! # tokio_test::block_on(async {
//! let limiter = RateLimiter::local(RateLimitConfig::default());
//! let decision = limiter.check("user:42", 5, Duration::from_secs(60), 1).await;
//! assert!(decision.allowed);
//! assert_eq!(decision.remaining, 4);
//! # });
//! ```

mod backend;

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use tracing::debug;

use crate::clock::{self, Clock};
use crate::store::CoordinationStore;
use crate::{GovernanceError, Result, telemetry};

use backend::{LocalWindows, SharedWindows, WindowBackend, WindowQuery};

/// Configuration for the rate limiter.
///
/// ```rust
/// # use warden::limiter::RateLimitConfig;
/// # use std::time::Duration;
/// let config = RateLimitConfig::new()
///     .default_limit(100)
///     .window(Duration::from_secs(3600));
/// ```
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Requests allowed per window by [`RateLimiter::check_default`]. Default: 10.
    pub default_limit: u64,
    /// Window length used by [`RateLimiter::check_default`]. Default: 60s.
    pub window: Duration,
    /// Namespace prepended to every key. Default: `"ratelimit"`.
    pub prefix: String,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            default_limit: 10,
            window: Duration::from_secs(60),
            prefix: "ratelimit".to_string(),
        }
    }
}

impl RateLimitConfig {
    /// Create a new config with sensible defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the default request limit.
    pub fn default_limit(mut self, limit: u64) -> Self {
        self.default_limit = limit;
        self
    }

    /// Set the default window length.
    pub fn window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Set the key namespace.
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }
}

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitDecision {
    /// Whether the request was admitted (and recorded).
    pub allowed: bool,
    /// The limit the request was checked against.
    pub limit: u64,
    /// Usage in the window, including this request when admitted.
    pub current: u64,
    /// Requests still available in the window.
    pub remaining: u64,
    /// When all usage currently in the window will have expired.
    pub reset_at: SystemTime,
}

impl RateLimitDecision {
    /// Time until [`reset_at`](Self::reset_at), measured from `now`.
    pub fn retry_after(&self, now: SystemTime) -> Duration {
        self.reset_at.duration_since(now).unwrap_or_default()
    }
}

/// Sliding-window rate limiter.
pub struct RateLimiter {
    backend: Box<dyn WindowBackend>,
    config: RateLimitConfig,
    clock: Clock,
}

impl RateLimiter {
    /// Create a limiter, shared through `store` when one is given.
    pub fn new(config: RateLimitConfig, store: Option<Arc<dyn CoordinationStore>>) -> Self {
        let backend: Box<dyn WindowBackend> = match store {
            Some(store) => Box::new(SharedWindows::new(store)),
            None => Box::new(LocalWindows::new()),
        };
        Self {
            backend,
            config,
            clock: Clock::new(),
        }
    }

    /// Create a single-process limiter.
    pub fn local(config: RateLimitConfig) -> Self {
        Self::new(config, None)
    }

    /// Replace the time source.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    /// Get the configuration.
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Check `key` against `limit` requests per `window`, recording the
    /// request (with weight `cost`) if it fits.
    ///
    /// A denied request is not recorded and does not extend the window.
    /// Windows longer than [`clock::MAX_DURATION`] are clamped to it.
    pub async fn check(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
        cost: u64,
    ) -> RateLimitDecision {
        let started = Instant::now();
        let decision = self.run(key, limit, window, cost, true).await;
        metrics::histogram!(telemetry::RATE_LIMIT_CHECK_SECONDS)
            .record(started.elapsed().as_secs_f64());

        if decision.allowed {
            metrics::counter!(telemetry::RATE_LIMIT_ALLOWED_TOTAL).increment(1);
        } else {
            metrics::counter!(telemetry::RATE_LIMIT_BLOCKED_TOTAL).increment(1);
            debug!(key, limit, current = decision.current, "rate limit exceeded");
        }
        decision
    }

    /// [`check`](Self::check) with the configured default limit and window
    /// and a cost of one.
    pub async fn check_default(&self, key: &str) -> RateLimitDecision {
        self.check(key, self.config.default_limit, self.config.window, 1)
            .await
    }

    /// Like [`check`](Self::check), but a denial is returned as
    /// [`GovernanceError::RateLimitExceeded`].
    pub async fn consume(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
        cost: u64,
    ) -> Result<RateLimitDecision> {
        let decision = self.check(key, limit, window, cost).await;
        if decision.allowed {
            Ok(decision)
        } else {
            Err(GovernanceError::RateLimitExceeded {
                key: key.to_owned(),
                limit: decision.limit,
                remaining: decision.remaining,
                reset_at: decision.reset_at,
            })
        }
    }

    /// Current window usage for `key` without recording anything.
    ///
    /// `allowed` reports whether one more request would be admitted.
    pub async fn status(&self, key: &str, limit: u64, window: Duration) -> RateLimitDecision {
        self.run(key, limit, window, 1, false).await
    }

    /// Forget all usage recorded for `key`.
    pub async fn reset(&self, key: &str) {
        self.backend.reset(&self.full_key(key)).await;
    }

    async fn run(
        &self,
        key: &str,
        limit: u64,
        window: Duration,
        cost: u64,
        record: bool,
    ) -> RateLimitDecision {
        let window = window.min(clock::MAX_DURATION);
        let now = self.clock.now_secs();
        let query = WindowQuery {
            limit,
            window,
            cost,
            now,
            record,
        };
        let snapshot = self.backend.apply(&self.full_key(key), query).await;

        let current = if snapshot.recorded {
            snapshot.current + cost
        } else {
            snapshot.current
        };
        metrics::gauge!(telemetry::RATE_LIMIT_ACTIVE).set(current as f64);

        let allowed = if record {
            snapshot.recorded
        } else {
            snapshot.current + cost <= limit
        };
        let oldest = snapshot.oldest.unwrap_or(now);

        RateLimitDecision {
            allowed,
            limit,
            current,
            remaining: limit.saturating_sub(current),
            reset_at: clock::from_secs(oldest + window.as_secs_f64()),
        }
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}:{key}", self.config.prefix)
    }
}
