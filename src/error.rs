//! Warden error types

use std::time::SystemTime;

/// Warden error types
#[derive(Debug, thiserror::Error)]
pub enum GovernanceError {
    // Infrastructure errors (recovered locally, never fatal)
    #[error("coordination store unavailable: {0}")]
    StoreUnavailable(String),

    // Business errors (surfaced to the caller)
    #[error("rate limit exceeded for '{key}': {remaining}/{limit} remaining")]
    RateLimitExceeded {
        key: String,
        limit: u64,
        remaining: u64,
        reset_at: SystemTime,
    },

    /// The circuit for `service` is open and the call was short-circuited.
    ///
    /// `fallback_used` reports whether a fallback ran in place of the call.
    #[error("circuit open for service '{service}'")]
    CircuitOpen {
        service: String,
        fallback_used: bool,
    },

    #[error("failed to load model '{model_id}': {reason}")]
    ModelLoadFailed { model_id: String, reason: String },

    #[error("model not loaded: {0}")]
    ModelNotLoaded(String),

    #[error("generation failed for model '{model_id}': {reason}")]
    Generation { model_id: String, reason: String },

    // Data errors
    #[error("cache serialization error: {0}")]
    CacheSerialization(#[from] serde_json::Error),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    // Configuration errors
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GovernanceError {
    /// Whether retrying the same call later could succeed.
    ///
    /// Store outages and generation failures are transient. Rejections
    /// (rate limit, open circuit) are transient in principle but carry
    /// their own timing, so callers should honour
    /// [`retry_at()`](Self::retry_at) rather than retry blindly.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GovernanceError::StoreUnavailable(_)
                | GovernanceError::Generation { .. }
                | GovernanceError::RateLimitExceeded { .. }
                | GovernanceError::CircuitOpen { .. }
        )
    }

    /// Earliest instant at which a rejected request may be admitted.
    pub fn retry_at(&self) -> Option<SystemTime> {
        match self {
            GovernanceError::RateLimitExceeded { reset_at, .. } => Some(*reset_at),
            _ => None,
        }
    }
}

/// Result type alias for Warden operations
pub type Result<T> = std::result::Result<T, GovernanceError>;
