//! Coordination store adapter.
//!
//! Components share state across processes through a [`CoordinationStore`]:
//! an atomic key-value store with TTLs, counters, sorted sets and plain
//! sets (the shape of a Redis deployment). The store is always optional;
//! every component takes `Option<Arc<dyn CoordinationStore>>` and runs on
//! local state when it is `None`.
//!
//! - [`MemoryStore`]: in-process implementation, useful for sharing state
//!   between component instances of one process and as a test double.
//! - [`TimeoutStore`]: decorator that bounds every call with a deadline,
//!   turning a slow store into a [`StoreUnavailable`](crate::GovernanceError::StoreUnavailable)
//!   error instead of a hung caller.

pub mod memory;
pub mod timeout;

pub use memory::MemoryStore;
pub use timeout::TimeoutStore;

use std::time::Duration;

use async_trait::async_trait;

use crate::Result;

/// Atomic key-value store used for cross-process coordination.
///
/// All methods may suspend. Implementations report transport and protocol
/// problems as [`GovernanceError::StoreUnavailable`](crate::GovernanceError::StoreUnavailable);
/// callers treat that error as a signal to degrade, never as fatal.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Get the bytes stored at `key`.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store `value` at `key`, replacing any previous value and TTL.
    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()>;

    /// Atomically increment the integer at `key` (missing = 0) and return
    /// the new value. An existing TTL is preserved.
    async fn incr(&self, key: &str) -> Result<i64>;

    /// Set a TTL on an existing key. Returns false if the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    /// Delete keys of any type. Returns the number of keys removed.
    async fn delete(&self, keys: &[String]) -> Result<u64>;

    /// Add members with scores to the sorted set at `key`.
    async fn add_scored(&self, key: &str, members: &[(String, f64)]) -> Result<()>;

    /// Members of the sorted set at `key` with `min <= score <= max`,
    /// ascending by score.
    async fn score_range(&self, key: &str, min: f64, max: f64) -> Result<Vec<(String, f64)>>;

    /// Remove members with `min <= score <= max`. Returns the number removed.
    async fn remove_score_range(&self, key: &str, min: f64, max: f64) -> Result<u64>;

    /// Add members to the set at `key`.
    async fn set_add(&self, key: &str, members: &[String]) -> Result<()>;

    /// All members of the set at `key` (empty when missing).
    async fn set_members(&self, key: &str) -> Result<Vec<String>>;

    /// Keys matching a glob pattern (`*`, `?`, `[...]`).
    async fn keys(&self, pattern: &str) -> Result<Vec<String>>;
}
