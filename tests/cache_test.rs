//! Tests for [`CacheManager`]: TTL, tags, policies, memoization.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use warden::cache::{
    CacheConfig, CacheManager, CachePolicyConfig, CacheStrategy, MemoOptions, Memoizer,
    derive_key,
};
use warden::store::{CoordinationStore, MemoryStore, TimeoutStore};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Agent {
    id: u64,
    name: String,
    tools: Vec<String>,
}

fn agent(id: u64) -> Agent {
    Agent {
        id,
        name: format!("agent-{id}"),
        tools: vec!["search".into(), "balance".into()],
    }
}

fn local() -> CacheManager {
    CacheManager::local(CacheConfig::default())
}

fn shared(store: &Arc<MemoryStore>) -> CacheManager {
    CacheManager::new(CacheConfig::default(), Some(store.clone()))
}

// =========================================================================
// CacheConfig
// =========================================================================

#[test]
fn cache_config_defaults() {
    let config = CacheConfig::default();
    assert_eq!(config.max_entries, 10_000);
    assert_eq!(config.default_ttl, Duration::from_secs(3600));
    assert_eq!(config.prefix, "cache");
    assert_eq!(config.policy.strategy, CacheStrategy::Simple);
}

#[test]
fn cache_config_builder() {
    let config = CacheConfig::new()
        .max_entries(500)
        .default_ttl(Duration::from_secs(60))
        .prefix("agents")
        .strategy(CacheStrategy::Lru);
    assert_eq!(config.max_entries, 500);
    assert_eq!(config.default_ttl, Duration::from_secs(60));
    assert_eq!(config.prefix, "agents");
    assert_eq!(config.policy.strategy, CacheStrategy::Lru);
}

// =========================================================================
// get / set / TTL
// =========================================================================

#[tokio::test(start_paused = true)]
async fn set_then_get_returns_value() {
    for cache in [local(), shared(&Arc::new(MemoryStore::new()))] {
        assert!(cache.set("agent:1", &agent(1), None, &[]).await);
        assert_eq!(cache.get::<Agent>("agent:1").await, Some(agent(1)));
    }
}

#[tokio::test(start_paused = true)]
async fn miss_returns_none() {
    let cache = local();
    assert_eq!(cache.get::<Agent>("agent:404").await, None);
}

#[tokio::test(start_paused = true)]
async fn entry_expires_after_ttl() {
    let store = Arc::new(MemoryStore::new());
    for cache in [local(), shared(&store)] {
        cache
            .set("k", &"v", Some(Duration::from_secs(10)), &[])
            .await;
        tokio::time::advance(Duration::from_secs(9)).await;
        assert_eq!(cache.get::<String>("k").await.as_deref(), Some("v"));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cache.get::<String>("k").await, None);
    }
}

#[tokio::test(start_paused = true)]
async fn default_ttl_applies_when_none_given() {
    let cache = CacheManager::local(CacheConfig::new().default_ttl(Duration::from_secs(5)));
    cache.set("k", &1u32, None, &[]).await;

    tokio::time::advance(Duration::from_secs(5)).await;
    assert_eq!(cache.get::<u32>("k").await, None);
}

#[tokio::test(start_paused = true)]
async fn oversized_ttl_keeps_entry() {
    let store = Arc::new(MemoryStore::new());
    for cache in [local(), shared(&store)] {
        assert!(cache.set("k", &1u32, Some(Duration::MAX), &["t"]).await);
        tokio::time::advance(Duration::from_secs(86_400)).await;
        assert_eq!(cache.get::<u32>("k").await, Some(1));
    }
}

#[tokio::test(start_paused = true)]
async fn set_replaces_value_and_ttl() {
    let cache = local();
    cache.set("k", &1u32, Some(Duration::from_secs(5)), &[]).await;
    cache.set("k", &2u32, Some(Duration::from_secs(60)), &[]).await;

    tokio::time::advance(Duration::from_secs(10)).await;
    assert_eq!(cache.get::<u32>("k").await, Some(2));
}

#[tokio::test(start_paused = true)]
async fn undecodable_entry_is_a_miss_and_dropped() {
    let cache = local();
    cache.set("k", &"not a number", None, &[]).await;

    assert_eq!(cache.get::<u64>("k").await, None);
    // The broken entry was removed, not just skipped.
    assert_eq!(cache.get::<String>("k").await, None);
}

#[tokio::test(start_paused = true)]
async fn delete_removes_entry() {
    let cache = local();
    cache.set("k", &1u32, None, &[]).await;
    assert!(cache.delete("k").await);
    assert!(!cache.delete("k").await);
    assert_eq!(cache.get::<u32>("k").await, None);
}

// =========================================================================
// Tags
// =========================================================================

#[tokio::test(start_paused = true)]
async fn delete_by_tag_removes_only_tagged_keys() {
    let store = Arc::new(MemoryStore::new());
    for cache in [local(), shared(&store)] {
        cache.set("a", &1u32, None, &["user:1"]).await;
        cache.set("b", &2u32, None, &["user:1", "agents"]).await;
        cache.set("c", &3u32, None, &["agents"]).await;
        cache.set("d", &4u32, None, &[]).await;

        assert_eq!(cache.delete_by_tag("user:1").await, 2);

        assert_eq!(cache.get::<u32>("a").await, None);
        assert_eq!(cache.get::<u32>("b").await, None);
        assert_eq!(cache.get::<u32>("c").await, Some(3));
        assert_eq!(cache.get::<u32>("d").await, Some(4));

        cache.clear("*").await;
    }
}

#[tokio::test(start_paused = true)]
async fn delete_by_tag_on_empty_tag_is_noop() {
    let cache = local();
    assert_eq!(cache.delete_by_tag("nothing").await, 0);
    cache.set("a", &1u32, None, &["t"]).await;
    assert_eq!(cache.delete_by_tag("t").await, 1);
    assert_eq!(cache.delete_by_tag("t").await, 0);
}

#[tokio::test(start_paused = true)]
async fn retagged_entry_leaves_old_tag() {
    let store = Arc::new(MemoryStore::new());
    for cache in [local(), shared(&store)] {
        cache.set("a", &1u32, None, &["old", "kept"]).await;
        cache.set("a", &2u32, None, &["new", "kept"]).await;

        assert_eq!(cache.delete_by_tag("old").await, 0);
        assert_eq!(cache.get::<u32>("a").await, Some(2));

        assert_eq!(cache.delete_by_tag("kept").await, 1);
        assert_eq!(cache.get::<u32>("a").await, None);
    }
}

#[tokio::test(start_paused = true)]
async fn retagged_entry_is_not_removed_by_another_manager() {
    let store = Arc::new(MemoryStore::new());
    let a = shared(&store);
    let b = shared(&store);

    a.set("k", &1u32, None, &["old"]).await;
    b.set("k", &2u32, None, &["new"]).await;

    assert_eq!(a.delete_by_tag("old").await, 0);
    assert_eq!(a.get::<u32>("k").await, Some(2));
    assert_eq!(b.delete_by_tag("new").await, 1);
}

#[tokio::test(start_paused = true)]
async fn shared_tag_set_expires_with_entry() {
    let store = Arc::new(MemoryStore::new());
    let cache = shared(&store);
    cache
        .set("a", &1u32, Some(Duration::from_secs(10)), &["t"])
        .await;
    assert_eq!(store.keys("cache:*").await.unwrap().len(), 2);

    tokio::time::advance(Duration::from_secs(10)).await;
    assert!(store.is_empty());
}

// =========================================================================
// clear
// =========================================================================

#[tokio::test(start_paused = true)]
async fn clear_by_pattern() {
    let store = Arc::new(MemoryStore::new());
    for cache in [local(), shared(&store)] {
        cache.set("agent:1", &1u32, None, &["t"]).await;
        cache.set("agent:2", &2u32, None, &[]).await;
        cache.set("user:1", &3u32, None, &[]).await;

        assert_eq!(cache.clear("agent:*").await, 2);
        assert_eq!(cache.get::<u32>("agent:1").await, None);
        assert_eq!(cache.get::<u32>("user:1").await, Some(3));

        assert_eq!(cache.clear("*").await, 1);
        assert_eq!(cache.get::<u32>("user:1").await, None);
    }
}

// =========================================================================
// Sharing and degraded mode
// =========================================================================

#[tokio::test(start_paused = true)]
async fn managers_sharing_a_store_see_each_others_entries() {
    let store = Arc::new(MemoryStore::new());
    let a = shared(&store);
    let b = shared(&store);

    a.set("agent:1", &agent(1), None, &["agents"]).await;
    assert_eq!(b.get::<Agent>("agent:1").await, Some(agent(1)));

    assert_eq!(b.delete_by_tag("agents").await, 1);
    assert_eq!(a.get::<Agent>("agent:1").await, None);
}

#[tokio::test(start_paused = true)]
async fn store_outage_is_a_miss_not_an_error() {
    struct Unreachable;

    #[async_trait::async_trait]
    impl CoordinationStore for Unreachable {
        async fn get(&self, _key: &str) -> warden::Result<Option<Vec<u8>>> {
            std::future::pending().await
        }
        async fn set(&self, _k: &str, _v: &[u8], _t: Option<Duration>) -> warden::Result<()> {
            std::future::pending().await
        }
        async fn incr(&self, _key: &str) -> warden::Result<i64> {
            std::future::pending().await
        }
        async fn expire(&self, _key: &str, _ttl: Duration) -> warden::Result<bool> {
            std::future::pending().await
        }
        async fn delete(&self, _keys: &[String]) -> warden::Result<u64> {
            std::future::pending().await
        }
        async fn add_scored(&self, _k: &str, _m: &[(String, f64)]) -> warden::Result<()> {
            std::future::pending().await
        }
        async fn score_range(&self, _k: &str, _a: f64, _b: f64) -> warden::Result<Vec<(String, f64)>> {
            std::future::pending().await
        }
        async fn remove_score_range(&self, _k: &str, _a: f64, _b: f64) -> warden::Result<u64> {
            std::future::pending().await
        }
        async fn set_add(&self, _key: &str, _members: &[String]) -> warden::Result<()> {
            std::future::pending().await
        }
        async fn set_members(&self, _key: &str) -> warden::Result<Vec<String>> {
            std::future::pending().await
        }
        async fn keys(&self, _pattern: &str) -> warden::Result<Vec<String>> {
            std::future::pending().await
        }
    }

    let store = TimeoutStore::new(Arc::new(Unreachable), Duration::from_millis(50));
    let cache = CacheManager::new(CacheConfig::default(), Some(Arc::new(store)));

    assert!(!cache.set("k", &1u32, None, &["t"]).await);
    assert_eq!(cache.get::<u32>("k").await, None);
    assert!(!cache.delete("k").await);
    assert_eq!(cache.delete_by_tag("t").await, 0);
    assert_eq!(cache.clear("*").await, 0);
}

// =========================================================================
// Policies
// =========================================================================

#[tokio::test(start_paused = true)]
async fn none_strategy_never_caches() {
    let cache = CacheManager::local(CacheConfig::new().strategy(CacheStrategy::None));
    assert!(!cache.set("k", &1u32, None, &[]).await);
    assert_eq!(cache.get::<u32>("k").await, None);
}

#[tokio::test(start_paused = true)]
async fn lru_strategy_evicts_least_recently_used() {
    let cache = CacheManager::local(
        CacheConfig::new().policy(
            CachePolicyConfig::new()
                .strategy(CacheStrategy::Lru)
                .max_size(2),
        ),
    );
    cache.set("a", &1u32, None, &[]).await;
    tokio::time::advance(Duration::from_secs(1)).await;
    cache.set("b", &2u32, None, &[]).await;
    tokio::time::advance(Duration::from_secs(1)).await;
    assert_eq!(cache.get::<u32>("a").await, Some(1));

    assert!(cache.set("c", &3u32, None, &[]).await);

    assert_eq!(cache.get::<u32>("b").await, None);
    assert_eq!(cache.get::<u32>("a").await, Some(1));
    assert_eq!(cache.get::<u32>("c").await, Some(3));
}

#[tokio::test(start_paused = true)]
async fn adaptive_strategy_admits_frequently_requested_keys() {
    let cache = CacheManager::local(
        CacheConfig::new().policy(
            CachePolicyConfig::new()
                .strategy(CacheStrategy::Adaptive)
                .max_size(100),
        ),
    );
    for i in 0..20 {
        assert_eq!(cache.get::<u32>(&format!("cold:{i}")).await, None);
    }

    // Requested once among many: not worth caching yet.
    assert_eq!(cache.get::<u32>("hot").await, None);
    assert!(!cache.set("hot", &1u32, None, &[]).await);

    // Repeated demand earns admission; a cold key still does not.
    assert_eq!(cache.get::<u32>("hot").await, None);
    assert_eq!(cache.get::<u32>("hot").await, None);
    assert!(cache.set("hot", &1u32, None, &[]).await);
    assert!(!cache.set("cold:0", &1u32, None, &[]).await);

    assert_eq!(cache.get::<u32>("hot").await, Some(1));
}

#[tokio::test(start_paused = true)]
async fn sweep_evicts_idle_keys() {
    let cache = CacheManager::local(
        CacheConfig::new().policy(
            CachePolicyConfig::new()
                .strategy(CacheStrategy::Simple)
                .ttl(Duration::from_secs(60)),
        ),
    );
    cache.set("idle", &1u32, Some(Duration::from_secs(3600)), &[]).await;
    tokio::time::advance(Duration::from_secs(30)).await;
    cache.set("busy", &2u32, Some(Duration::from_secs(3600)), &[]).await;
    tokio::time::advance(Duration::from_secs(31)).await;

    assert_eq!(cache.sweep().await, 1);
    assert_eq!(cache.get::<u32>("idle").await, None);
    assert_eq!(cache.get::<u32>("busy").await, Some(2));
}

// =========================================================================
// Memoization
// =========================================================================

#[tokio::test(start_paused = true)]
async fn memoize_computes_once() {
    let cache = local();
    let counter = AtomicU32::new(0);
    let calls = &counter;

    for _ in 0..3 {
        let value = cache
            .memoize("answer", &MemoOptions::new(), || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, std::io::Error>(42u32)
            })
            .await
            .unwrap();
        assert_eq!(value, 42);
    }
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn memoize_does_not_cache_errors() {
    let cache = local();
    let result = cache
        .memoize("flaky", &MemoOptions::new(), || async {
            Err::<u32, _>("upstream down")
        })
        .await;
    assert_eq!(result, Err("upstream down"));

    let value = cache
        .memoize("flaky", &MemoOptions::new(), || async { Ok::<_, &str>(7u32) })
        .await;
    assert_eq!(value, Ok(7));
}

#[tokio::test(start_paused = true)]
async fn memoize_honours_ttl_and_tags() {
    let cache = local();
    let options = MemoOptions::new()
        .ttl(Duration::from_secs(5))
        .tag("user:1");

    cache
        .memoize("k", &options, || async { Ok::<_, &str>(1u32) })
        .await
        .unwrap();
    assert_eq!(cache.delete_by_tag("user:1").await, 1);

    cache
        .memoize("k", &options, || async { Ok::<_, &str>(2u32) })
        .await
        .unwrap();
    tokio::time::advance(Duration::from_secs(5)).await;
    assert_eq!(cache.get::<u32>("k").await, None);
}

#[tokio::test(start_paused = true)]
async fn memoizer_wraps_a_function() {
    let cache = Arc::new(local());
    let counter = Arc::new(AtomicU32::new(0));

    let history = {
        let counter = Arc::clone(&counter);
        Memoizer::new(
            Arc::clone(&cache),
            |agent_id: &u64| derive_key(Some("agents"), "history", agent_id).unwrap(),
            move |agent_id: u64| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, std::io::Error>(vec![format!("hello from {agent_id}")])
                }
            },
        )
        .tag("history")
    };

    assert_eq!(history.call(1).await.unwrap(), vec!["hello from 1"]);
    assert_eq!(history.call(1).await.unwrap(), vec!["hello from 1"]);
    assert_eq!(history.call(2).await.unwrap(), vec!["hello from 2"]);
    assert_eq!(counter.load(Ordering::SeqCst), 2);

    assert!(history.invalidate(&1).await);
    history.call(1).await.unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 3);

    assert_eq!(cache.delete_by_tag("history").await, 2);
}
