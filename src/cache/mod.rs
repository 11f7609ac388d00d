//! Caching subsystem.
//!
//! [`CacheManager`] is a generic get/set/delete cache with per-entry TTL,
//! tag-based bulk invalidation and a pluggable [`CachePolicy`] deciding
//! admission and eviction. Values of any `serde` type are encoded to
//! opaque bytes (JSON), so the same entries can be read by any process
//! sharing the backend.
//!
//! # Backends
//!
//! - no store: an in-process moka cache bounded by
//!   [`CacheConfig::max_entries`];
//! - with a [`CoordinationStore`]: entries and tag sets on the store.
//!
//! Backend failures degrade to a miss (reads) or a no-op (writes) and are
//! logged; a cache outage never fails the caller. An entry that cannot be
//! decoded is deleted and reported as a miss.
//!
//! # Memoization
//!
//! [`CacheManager::memoize`] returns a cached result or computes, stores
//! and returns it. [`Memoizer`] packages a function with a key-derivation
//! function for repeated use; [`derive_key`] produces stable keys from
//! serialized arguments.

mod backend;
pub mod memo;
pub mod policy;

pub use memo::Memoizer;
pub use policy::{CachePolicy, CachePolicyConfig, CacheStrategy};

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::clock::MAX_DURATION;
use crate::store::CoordinationStore;
use crate::{Result, telemetry};

use backend::{CacheBackend, LocalCache, SharedCache};

/// Configuration for the cache manager.
///
/// ```rust
/// # use warden::cache::{CacheConfig, CacheStrategy};
/// # use std::time::Duration;
/// let config = CacheConfig::new()
///     .default_ttl(Duration::from_secs(600))
///     .strategy(CacheStrategy::Lru);
/// ```
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// TTL used when a `set` does not give one. Default: 1 hour.
    pub default_ttl: Duration,
    /// Capacity of the in-process backend. Default: 10,000.
    pub max_entries: u64,
    /// Namespace for shared entries. Default: `"cache"`.
    pub prefix: String,
    /// Admission and eviction policy. Default: [`CacheStrategy::Simple`].
    pub policy: CachePolicyConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(3600),
            max_entries: 10_000,
            prefix: "cache".to_string(),
            policy: CachePolicyConfig::default().strategy(CacheStrategy::Simple),
        }
    }
}

impl CacheConfig {
    /// Create a new config with sensible defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the default TTL.
    pub fn default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Set the in-process capacity.
    pub fn max_entries(mut self, n: u64) -> Self {
        self.max_entries = n;
        self
    }

    /// Set the namespace for shared entries.
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Set the policy strategy.
    pub fn strategy(mut self, strategy: CacheStrategy) -> Self {
        self.policy.strategy = strategy;
        self
    }

    /// Replace the whole policy configuration.
    pub fn policy(mut self, policy: CachePolicyConfig) -> Self {
        self.policy = policy;
        self
    }
}

/// TTL and tags for [`CacheManager::memoize`].
#[derive(Debug, Clone, Default)]
pub struct MemoOptions {
    pub ttl: Option<Duration>,
    pub tags: Vec<String>,
}

impl MemoOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }
}

/// Generic TTL cache with tags and a pluggable policy.
pub struct CacheManager {
    backend: Box<dyn CacheBackend>,
    policy: Mutex<CachePolicy>,
    config: CacheConfig,
}

impl CacheManager {
    /// Create a cache, shared through `store` when one is given.
    pub fn new(config: CacheConfig, store: Option<Arc<dyn CoordinationStore>>) -> Self {
        let backend: Box<dyn CacheBackend> = match store {
            Some(store) => Box::new(SharedCache::new(store, config.prefix.clone())),
            None => Box::new(LocalCache::new(config.max_entries)),
        };
        Self {
            backend,
            policy: Mutex::new(CachePolicy::new(config.policy.clone())),
            config,
        }
    }

    /// Create a single-process cache.
    pub fn local(config: CacheConfig) -> Self {
        Self::new(config, None)
    }

    /// Get the configuration.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Look up `key`.
    ///
    /// Returns `None` on a miss, on a backend failure, and when the stored
    /// bytes do not decode as `T`. Emits cache hit/miss metrics.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let started = Instant::now();
        let value = self.lookup(key).await;
        metrics::histogram!(telemetry::CACHE_OPERATION_SECONDS, "operation" => "get")
            .record(started.elapsed().as_secs_f64());

        if value.is_some() {
            metrics::counter!(telemetry::CACHE_HITS_TOTAL).increment(1);
            self.policy().update_access(key);
        } else {
            metrics::counter!(telemetry::CACHE_MISSES_TOTAL).increment(1);
            self.policy().record_miss(key);
        }
        value
    }

    async fn lookup<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let bytes = match self.backend.get(key).await {
            Ok(bytes) => bytes?,
            Err(e) => {
                warn!(key, error = %e, "cache get failed, treating as miss");
                return None;
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key, error = %e, "cached value failed to decode, dropping entry");
                self.delete(key).await;
                None
            }
        }
    }

    /// Store `value` at `key` for `ttl` (default TTL when `None`), indexed
    /// under `tags`. TTLs beyond [`MAX_DURATION`] are clamped to it.
    ///
    /// Returns whether the entry was stored: the policy may decline it, and
    /// encoding or backend failures are logged and reported as `false`.
    pub async fn set<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
        tags: &[&str],
    ) -> bool {
        let started = Instant::now();
        let stored = self.store(key, value, ttl, tags).await;
        metrics::histogram!(telemetry::CACHE_OPERATION_SECONDS, "operation" => "set")
            .record(started.elapsed().as_secs_f64());
        stored
    }

    async fn store<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
        tags: &[&str],
    ) -> bool {
        let bytes = match serde_json::to_vec(value) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(key, error = %e, "value failed to encode, not caching");
                return false;
            }
        };

        let (admitted, evicted) = {
            let mut policy = self.policy();
            let evicted = policy.make_room(key);
            let admitted = policy.should_cache(key);
            if admitted {
                policy.record_store(key);
            }
            (admitted, evicted)
        };
        self.evict(&evicted).await;
        if !admitted {
            debug!(key, "cache policy declined entry");
            return false;
        }

        let ttl = ttl.unwrap_or(self.config.default_ttl).min(MAX_DURATION);
        let tags: Vec<String> = tags.iter().map(|t| (*t).to_owned()).collect();
        match self.backend.set(key, bytes, ttl, &tags).await {
            Ok(()) => true,
            Err(e) => {
                warn!(key, error = %e, "cache set failed");
                self.policy().remove(key);
                false
            }
        }
    }

    /// Remove `key`. Returns whether an entry was removed.
    pub async fn delete(&self, key: &str) -> bool {
        self.policy().remove(key);
        match self.backend.delete(&[key.to_owned()]).await {
            Ok(removed) => removed > 0,
            Err(e) => {
                warn!(key, error = %e, "cache delete failed");
                false
            }
        }
    }

    /// Remove every entry tagged `tag`. Returns the number removed; a tag
    /// with no entries is a no-op.
    pub async fn delete_by_tag(&self, tag: &str) -> usize {
        match self.backend.delete_by_tag(tag).await {
            Ok(keys) => {
                let mut policy = self.policy();
                for key in &keys {
                    policy.remove(key);
                }
                keys.len()
            }
            Err(e) => {
                warn!(tag, error = %e, "cache delete by tag failed");
                0
            }
        }
    }

    /// Remove every entry whose key matches the glob `pattern` (`"*"` for
    /// all). Returns the number removed.
    pub async fn clear(&self, pattern: &str) -> usize {
        match self.backend.clear(pattern).await {
            Ok(keys) => {
                let mut policy = self.policy();
                if pattern == "*" {
                    policy.clear();
                } else {
                    for key in &keys {
                        policy.remove(key);
                    }
                }
                keys.len()
            }
            Err(e) => {
                warn!(pattern, error = %e, "cache clear failed");
                0
            }
        }
    }

    /// Evict every key the policy considers idle. Returns the number of
    /// keys evicted.
    pub async fn sweep(&self) -> usize {
        let evicted = self.policy().refresh();
        self.evict(&evicted).await;
        evicted.len()
    }

    /// Return the cached value for `key`, or compute, store and return it.
    ///
    /// Errors from `compute` are returned and nothing is stored.
    pub async fn memoize<T, E, F, Fut>(
        &self,
        key: &str,
        options: &MemoOptions,
        compute: F,
    ) -> std::result::Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        if let Some(value) = self.get(key).await {
            return Ok(value);
        }
        let value = compute().await?;
        let tags: Vec<&str> = options.tags.iter().map(String::as_str).collect();
        self.set(key, &value, options.ttl, &tags).await;
        Ok(value)
    }

    async fn evict(&self, keys: &[String]) {
        if keys.is_empty() {
            return;
        }
        metrics::counter!(telemetry::CACHE_EVICTIONS_TOTAL).increment(keys.len() as u64);
        if let Err(e) = self.backend.delete(keys).await {
            warn!(count = keys.len(), error = %e, "cache eviction failed");
        }
    }

    fn policy(&self) -> MutexGuard<'_, CachePolicy> {
        self.policy.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Derive a cache key from a function name and its serialized arguments.
///
/// The key is `[prefix:]name:hash`, where `hash` is the first 16 hex
/// characters of the SHA-256 of the JSON-encoded arguments. Stable across
/// processes and builds, so it is safe for shared backends.
pub fn derive_key<A: Serialize + ?Sized>(prefix: Option<&str>, name: &str, args: &A) -> Result<String> {
    let encoded = serde_json::to_vec(args)?;
    let digest = hex::encode(Sha256::digest(&encoded));
    let hash = &digest[..16];
    Ok(match prefix {
        Some(prefix) => format!("{prefix}:{name}:{hash}"),
        None => format!("{name}:{hash}"),
    })
}
