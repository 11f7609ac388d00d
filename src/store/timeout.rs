//! Deadline decorator for coordination stores.
//!
//! Wraps any [`CoordinationStore`] so that every call either completes
//! within the configured timeout or fails with
//! [`GovernanceError::StoreUnavailable`]. Components never block on a slow
//! store; the timeout is the store's own, not the caller's.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::CoordinationStore;
use crate::{GovernanceError, Result};

/// Default deadline for a single store call.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_millis(500);

/// Decorator that bounds every call on the inner store with a deadline.
pub struct TimeoutStore {
    inner: Arc<dyn CoordinationStore>,
    timeout: Duration,
}

impl TimeoutStore {
    /// Wrap a store with the given per-call deadline.
    pub fn new(inner: Arc<dyn CoordinationStore>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    /// The per-call deadline.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// Run a store operation under a deadline.
async fn bounded<T>(
    timeout: Duration,
    operation: &'static str,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(GovernanceError::StoreUnavailable(format!(
            "{operation} timed out after {}ms",
            timeout.as_millis()
        ))),
    }
}

#[async_trait]
impl CoordinationStore for TimeoutStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        bounded(self.timeout, "get", self.inner.get(key)).await
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()> {
        bounded(self.timeout, "set", self.inner.set(key, value, ttl)).await
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        bounded(self.timeout, "incr", self.inner.incr(key)).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        bounded(self.timeout, "expire", self.inner.expire(key, ttl)).await
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        bounded(self.timeout, "delete", self.inner.delete(keys)).await
    }

    async fn add_scored(&self, key: &str, members: &[(String, f64)]) -> Result<()> {
        bounded(self.timeout, "add_scored", self.inner.add_scored(key, members)).await
    }

    async fn score_range(&self, key: &str, min: f64, max: f64) -> Result<Vec<(String, f64)>> {
        bounded(
            self.timeout,
            "score_range",
            self.inner.score_range(key, min, max),
        )
        .await
    }

    async fn remove_score_range(&self, key: &str, min: f64, max: f64) -> Result<u64> {
        bounded(
            self.timeout,
            "remove_score_range",
            self.inner.remove_score_range(key, min, max),
        )
        .await
    }

    async fn set_add(&self, key: &str, members: &[String]) -> Result<()> {
        bounded(self.timeout, "set_add", self.inner.set_add(key, members)).await
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        bounded(self.timeout, "set_members", self.inner.set_members(key)).await
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        bounded(self.timeout, "keys", self.inner.keys(pattern)).await
    }
}
