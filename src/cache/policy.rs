//! Admission and eviction strategy for the cache manager.
//!
//! [`CachePolicy`] is pure bookkeeping: it never touches the cache backend.
//! The manager reports accesses to it and asks it which keys to admit and
//! which to evict, then performs the I/O itself.
//!
//! # Strategies
//!
//! - [`CacheStrategy::None`]: never cache.
//! - [`CacheStrategy::Simple`]: always cache.
//! - [`CacheStrategy::Lru`]: admit while under `max_size`; when full, make
//!   room by evicting the least-recently-accessed key. Keys idle longer
//!   than `ttl` are evicted on the periodic refresh.
//! - [`CacheStrategy::Adaptive`]: admit a key only when its request count
//!   relative to the number of tracked keys exceeds
//!   [`ADAPTIVE_ADMIT_THRESHOLD`]. Counts decay by [`HIT_DECAY`] every
//!   `update_interval`, so the statistics favour recent demand and stay
//!   bounded.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Projected hit rate a key must exceed to be admitted by the adaptive strategy.
pub const ADAPTIVE_ADMIT_THRESHOLD: f64 = 0.1;

/// Multiplicative decay applied to request counts on every refresh.
pub const HIT_DECAY: f64 = 0.95;

/// Caching strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheStrategy {
    None,
    Simple,
    Lru,
    #[default]
    Adaptive,
}

/// Configuration for [`CachePolicy`].
#[derive(Debug, Clone)]
pub struct CachePolicyConfig {
    /// Default: [`CacheStrategy::Adaptive`].
    pub strategy: CacheStrategy,
    /// Keys tracked (and, for LRU, admitted) at once. Default: 1,000.
    pub max_size: usize,
    /// Idle time after which a key is evicted. Default: 1 hour.
    pub ttl: Duration,
    /// Interval between statistics refreshes. Default: 5 minutes.
    pub update_interval: Duration,
}

impl Default for CachePolicyConfig {
    fn default() -> Self {
        Self {
            strategy: CacheStrategy::default(),
            max_size: 1_000,
            ttl: Duration::from_secs(3600),
            update_interval: Duration::from_secs(300),
        }
    }
}

impl CachePolicyConfig {
    /// Create a new config with sensible defaults.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn strategy(mut self, strategy: CacheStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn max_size(mut self, n: usize) -> Self {
        self.max_size = n;
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn update_interval(mut self, interval: Duration) -> Self {
        self.update_interval = interval;
        self
    }
}

#[derive(Debug, Clone, Copy)]
struct UsageStat {
    last_access: Instant,
    hits: f64,
}

/// Strategy object deciding admission and eviction.
#[derive(Debug)]
pub struct CachePolicy {
    config: CachePolicyConfig,
    stats: HashMap<String, UsageStat>,
    last_update: Instant,
}

impl CachePolicy {
    pub fn new(config: CachePolicyConfig) -> Self {
        Self {
            config,
            stats: HashMap::new(),
            last_update: Instant::now(),
        }
    }

    pub fn strategy(&self) -> CacheStrategy {
        self.config.strategy
    }

    /// Number of keys with usage statistics.
    pub fn tracked(&self) -> usize {
        self.stats.len()
    }

    /// Whether `key` should be stored now.
    pub fn should_cache(&mut self, key: &str) -> bool {
        match self.config.strategy {
            CacheStrategy::None => false,
            CacheStrategy::Simple => true,
            CacheStrategy::Lru => {
                self.stats.len() < self.config.max_size || self.stats.contains_key(key)
            }
            CacheStrategy::Adaptive => self.hit_rate(key) > ADAPTIVE_ADMIT_THRESHOLD,
        }
    }

    /// Whether `key` is due for eviction: idle longer than the TTL, or the
    /// least-recently-accessed key of a full LRU cache.
    pub fn should_evict(&self, key: &str) -> bool {
        let Some(stat) = self.stats.get(key) else {
            return false;
        };
        if stat.last_access.elapsed() > self.config.ttl {
            return true;
        }
        self.config.strategy == CacheStrategy::Lru
            && self.stats.len() >= self.config.max_size
            && self.oldest().as_deref() == Some(key)
    }

    /// Record a hit on `key`.
    pub fn update_access(&mut self, key: &str) {
        if self.config.strategy == CacheStrategy::None {
            return;
        }
        let now = Instant::now();
        let stat = self.stats.entry(key.to_owned()).or_insert(UsageStat {
            last_access: now,
            hits: 0.0,
        });
        stat.last_access = now;
        stat.hits += 1.0;
    }

    /// Record a miss on `key`. Only the adaptive strategy counts misses, as
    /// demand that may earn the key admission later.
    pub fn record_miss(&mut self, key: &str) {
        if self.config.strategy != CacheStrategy::Adaptive {
            return;
        }
        if !self.stats.contains_key(key) && self.stats.len() >= self.config.max_size {
            if let Some(oldest) = self.oldest() {
                self.stats.remove(&oldest);
            }
        }
        self.update_access(key);
    }

    /// Record that `key` was stored.
    pub fn record_store(&mut self, key: &str) {
        if self.config.strategy == CacheStrategy::None {
            return;
        }
        let now = Instant::now();
        self.stats
            .entry(key.to_owned())
            .and_modify(|stat| stat.last_access = now)
            .or_insert(UsageStat {
                last_access: now,
                hits: 0.0,
            });
    }

    /// Forget `key` (it was deleted from the cache).
    pub fn remove(&mut self, key: &str) {
        self.stats.remove(key);
    }

    /// Forget every key.
    pub fn clear(&mut self) {
        self.stats.clear();
    }

    /// Keys to evict before storing `incoming`.
    ///
    /// Runs the periodic refresh when it is due, then, for LRU, evicts the
    /// least-recently-accessed keys until `incoming` fits.
    pub fn make_room(&mut self, incoming: &str) -> Vec<String> {
        let mut evicted = if self.last_update.elapsed() >= self.config.update_interval {
            self.refresh()
        } else {
            Vec::new()
        };

        if self.config.strategy == CacheStrategy::Lru && !self.stats.contains_key(incoming) {
            while self.config.max_size > 0 && self.stats.len() >= self.config.max_size {
                let Some(oldest) = self.oldest() else { break };
                self.stats.remove(&oldest);
                evicted.push(oldest);
            }
        }
        evicted
    }

    /// Drop idle keys and decay request counts. Returns the dropped keys.
    pub fn refresh(&mut self) -> Vec<String> {
        self.last_update = Instant::now();
        let ttl = self.config.ttl;
        let expired: Vec<String> = self
            .stats
            .iter()
            .filter(|(_, stat)| stat.last_access.elapsed() > ttl)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            self.stats.remove(key);
        }
        for stat in self.stats.values_mut() {
            stat.hits *= HIT_DECAY;
        }
        expired
    }

    fn hit_rate(&self, key: &str) -> f64 {
        let hits = self.stats.get(key).map_or(0.0, |stat| stat.hits);
        hits / self.stats.len().max(1) as f64
    }

    fn oldest(&self) -> Option<String> {
        self.stats
            .iter()
            .min_by_key(|(_, stat)| stat.last_access)
            .map(|(key, _)| key.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(strategy: CacheStrategy) -> CachePolicy {
        CachePolicy::new(
            CachePolicyConfig::new()
                .strategy(strategy)
                .max_size(2)
                .ttl(Duration::from_secs(60))
                .update_interval(Duration::from_secs(10)),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn none_and_simple_are_fixed() {
        assert!(!policy(CacheStrategy::None).should_cache("k"));
        assert!(policy(CacheStrategy::Simple).should_cache("k"));
    }

    #[tokio::test(start_paused = true)]
    async fn lru_evicts_least_recently_accessed() {
        let mut p = policy(CacheStrategy::Lru);
        p.record_store("a");
        tokio::time::advance(Duration::from_secs(1)).await;
        p.record_store("b");
        tokio::time::advance(Duration::from_secs(1)).await;
        p.update_access("a");

        assert!(!p.should_cache("c"));
        assert!(p.should_evict("b"));
        assert!(!p.should_evict("a"));

        let evicted = p.make_room("c");
        assert_eq!(evicted, vec!["b".to_string()]);
        assert!(p.should_cache("c"));
    }

    #[tokio::test(start_paused = true)]
    async fn lru_admits_tracked_key_when_full() {
        let mut p = policy(CacheStrategy::Lru);
        p.record_store("a");
        p.record_store("b");
        assert!(p.make_room("a").is_empty());
        assert!(p.should_cache("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_keys_expire_on_refresh() {
        let mut p = policy(CacheStrategy::Simple);
        p.record_store("a");
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(p.should_evict("a"));
        assert_eq!(p.make_room("b"), vec!["a".to_string()]);
        assert_eq!(p.tracked(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn adaptive_prefers_repeatedly_requested_keys() {
        let mut p = CachePolicy::new(CachePolicyConfig::new().max_size(100));
        for i in 0..20 {
            p.record_miss(&format!("cold-{i}"));
        }
        p.record_miss("hot");
        assert!(!p.should_cache("hot"));

        for _ in 0..5 {
            p.record_miss("hot");
        }
        assert!(p.should_cache("hot"));
        assert!(!p.should_cache("cold-0"));
    }

    #[tokio::test(start_paused = true)]
    async fn decay_lowers_hit_rate() {
        let mut p = CachePolicy::new(CachePolicyConfig::new());
        p.update_access("k");
        let before = p.hit_rate("k");
        p.refresh();
        assert!(p.hit_rate("k") < before);
    }
}
