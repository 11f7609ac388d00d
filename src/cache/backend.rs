//! Storage backends for the cache manager.
//!
//! Both backends store opaque bytes with a TTL and maintain a
//! `tag → keys` index used only for bulk invalidation. Keys passed in and
//! returned are the caller's keys, without the namespace prefix.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use globset::{Glob, GlobMatcher};
use moka::Expiry;
use moka::notification::RemovalCause;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use tokio::time::Instant;
use tracing::warn;

use crate::clock::MAX_DURATION;
use crate::store::CoordinationStore;
use crate::{GovernanceError, Result};

/// Byte-level cache storage.
#[async_trait]
pub(crate) trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration, tags: &[String]) -> Result<()>;
    async fn delete(&self, keys: &[String]) -> Result<u64>;
    /// Remove every key tagged `tag` and the tag itself. Returns the keys removed.
    async fn delete_by_tag(&self, tag: &str) -> Result<Vec<String>>;
    /// Remove every key matching a glob pattern. Returns the keys removed.
    async fn clear(&self, pattern: &str) -> Result<Vec<String>>;
}

fn matcher(pattern: &str) -> Result<GlobMatcher> {
    Glob::new(pattern)
        .map(|glob| glob.compile_matcher())
        .map_err(|e| GovernanceError::InvalidInput(format!("invalid key pattern: {e}")))
}

#[derive(Clone)]
struct LocalEntry {
    value: Arc<[u8]>,
    expires_at: Instant,
    ttl: Duration,
    tags: Arc<[String]>,
}

/// Lets moka reclaim entries at their own TTL.
struct EntryExpiry;

impl Expiry<String, LocalEntry> for EntryExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &LocalEntry,
        _created_at: std::time::Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &LocalEntry,
        _updated_at: std::time::Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

type TagIndex = HashMap<String, HashSet<String>>;

fn lock_index(index: &Mutex<TagIndex>) -> std::sync::MutexGuard<'_, TagIndex> {
    index.lock().unwrap_or_else(|e| e.into_inner())
}

/// Drop `key` from each of `tags`, pruning tags left empty.
fn unindex<'a>(index: &mut TagIndex, key: &str, tags: impl IntoIterator<Item = &'a String>) {
    for tag in tags {
        if let Some(members) = index.get_mut(tag) {
            members.remove(key);
            if members.is_empty() {
                index.remove(tag);
            }
        }
    }
}

/// In-process cache backed by moka.
///
/// moka bounds memory and reclaims expired entries in the background;
/// visibility is decided separately against tokio's clock, so an entry is
/// never served at or after its expiry even if moka has not reclaimed it.
/// Every removal moka reports (expiry, capacity, explicit) unindexes the
/// entry's tags; a replaced entry is reindexed by `set` instead.
pub(crate) struct LocalCache {
    entries: moka::sync::Cache<String, LocalEntry>,
    tags: Arc<Mutex<TagIndex>>,
}

impl LocalCache {
    pub(crate) fn new(max_entries: u64) -> Self {
        let tags: Arc<Mutex<TagIndex>> = Arc::default();
        let index = Arc::clone(&tags);
        Self {
            entries: moka::sync::Cache::builder()
                .max_capacity(max_entries)
                .expire_after(EntryExpiry)
                .eviction_listener(move |key: Arc<String>, entry: LocalEntry, cause| {
                    if cause != RemovalCause::Replaced {
                        unindex(&mut lock_index(&index), &key, entry.tags.iter());
                    }
                })
                .build(),
            tags,
        }
    }

    fn tags(&self) -> std::sync::MutexGuard<'_, TagIndex> {
        lock_index(&self.tags)
    }

    #[cfg(test)]
    fn indexed(&self, tag: &str) -> usize {
        self.tags().get(tag).map_or(0, HashSet::len)
    }
}

#[async_trait]
impl CacheBackend for LocalCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match self.entries.get(key) {
            Some(entry) if Instant::now() < entry.expires_at => Ok(Some(entry.value.to_vec())),
            Some(_) => {
                self.entries.invalidate(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration, tags: &[String]) -> Result<()> {
        let ttl = ttl.min(MAX_DURATION);
        let entry = LocalEntry {
            value: value.into(),
            expires_at: Instant::now() + ttl,
            ttl,
            tags: tags.to_vec().into(),
        };
        let previous = self.entries.get(key);
        {
            let mut index = self.tags();
            if let Some(previous) = &previous {
                unindex(
                    &mut index,
                    key,
                    previous.tags.iter().filter(|t| !tags.contains(t)),
                );
            }
            for tag in tags {
                index.entry(tag.clone()).or_default().insert(key.to_owned());
            }
        }
        self.entries.insert(key.to_owned(), entry);
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        let mut removed = 0;
        for key in keys {
            if self.entries.remove(key).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn delete_by_tag(&self, tag: &str) -> Result<Vec<String>> {
        let members = self.tags().remove(tag).unwrap_or_default();
        let mut removed = Vec::new();
        for key in members {
            // A member may already be gone if moka has not yet reported
            // its eviction.
            let tagged = self
                .entries
                .get(&key)
                .is_some_and(|entry| entry.tags.iter().any(|t| t == tag));
            if tagged && self.entries.remove(&key).is_some() {
                removed.push(key);
            }
        }
        removed.sort();
        Ok(removed)
    }

    async fn clear(&self, pattern: &str) -> Result<Vec<String>> {
        let matcher = matcher(pattern)?;
        let keys: Vec<String> = self
            .entries
            .iter()
            .filter(|(key, _)| matcher.is_match(key.as_str()))
            .map(|(key, _)| key.as_ref().clone())
            .collect();
        for key in &keys {
            self.entries.invalidate(key);
        }

        let mut index = self.tags();
        for members in index.values_mut() {
            members.retain(|key| !matcher.is_match(key.as_str()));
        }
        index.retain(|_, members| !members.is_empty());

        let mut keys = keys;
        keys.sort();
        Ok(keys)
    }
}

/// Value stored on the coordination store: the entry with the tags it was
/// set with, so a tag set can be checked against the entry it points to.
#[derive(Serialize, Deserialize)]
struct SharedEntry {
    tags: Vec<String>,
    value: Box<RawValue>,
}

impl SharedEntry {
    fn encode(value: Vec<u8>, tags: &[String]) -> Result<Vec<u8>> {
        let json = String::from_utf8(value)
            .map_err(|e| GovernanceError::InvalidInput(format!("cache value is not UTF-8: {e}")))?;
        let entry = SharedEntry {
            tags: tags.to_vec(),
            value: RawValue::from_string(json)?,
        };
        Ok(serde_json::to_vec(&entry)?)
    }
}

/// Cache stored on a coordination store.
///
/// Entries live at `{prefix}:{key}` with the entry TTL; each tag is a set
/// at `{prefix}:tag:{tag}` whose TTL is reset to that of the most recent
/// entry added. A tag set may still list keys that were since re-set
/// without the tag, so `delete_by_tag` checks each entry's own tags before
/// removing it. After a partial failure an entry may outlive its tag set,
/// but never its own TTL.
pub(crate) struct SharedCache {
    store: Arc<dyn CoordinationStore>,
    prefix: String,
}

impl SharedCache {
    pub(crate) fn new(store: Arc<dyn CoordinationStore>, prefix: String) -> Self {
        Self { store, prefix }
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}:{key}", self.prefix)
    }

    fn tag_key(&self, tag: &str) -> String {
        format!("{}:tag:{tag}", self.prefix)
    }

    fn strip<'a>(&self, full: &'a str) -> &'a str {
        full.strip_prefix(&self.prefix)
            .and_then(|rest| rest.strip_prefix(':'))
            .unwrap_or(full)
    }

    /// Read the entry at `full_key`. An entry that does not decode is
    /// deleted and reported as absent.
    async fn entry(&self, full_key: &str) -> Result<Option<SharedEntry>> {
        let Some(bytes) = self.store.get(full_key).await? else {
            return Ok(None);
        };
        match serde_json::from_slice(&bytes) {
            Ok(entry) => Ok(Some(entry)),
            Err(e) => {
                warn!(key = full_key, error = %e, "malformed shared cache entry, dropping");
                self.store.delete(&[full_key.to_owned()]).await?;
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl CacheBackend for SharedCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let entry = self.entry(&self.full_key(key)).await?;
        Ok(entry.map(|entry| entry.value.get().as_bytes().to_vec()))
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration, tags: &[String]) -> Result<()> {
        let full_key = self.full_key(key);
        let encoded = SharedEntry::encode(value, tags)?;
        self.store.set(&full_key, &encoded, Some(ttl)).await?;
        for tag in tags {
            let tag_key = self.tag_key(tag);
            self.store
                .set_add(&tag_key, std::slice::from_ref(&full_key))
                .await?;
            self.store.expire(&tag_key, ttl).await?;
        }
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        let full: Vec<String> = keys.iter().map(|k| self.full_key(k)).collect();
        self.store.delete(&full).await
    }

    async fn delete_by_tag(&self, tag: &str) -> Result<Vec<String>> {
        let tag_key = self.tag_key(tag);
        let members = self.store.set_members(&tag_key).await?;
        let mut removed = Vec::new();
        for member in &members {
            // Re-set without this tag since it was indexed.
            let tagged = self
                .entry(member)
                .await?
                .is_some_and(|entry| entry.tags.iter().any(|t| t == tag));
            if tagged && self.store.delete(std::slice::from_ref(member)).await? > 0 {
                removed.push(self.strip(member).to_owned());
            }
        }
        self.store.delete(&[tag_key]).await?;
        removed.sort();
        Ok(removed)
    }

    async fn clear(&self, pattern: &str) -> Result<Vec<String>> {
        let keys = self.store.keys(&self.full_key(pattern)).await?;
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        self.store.delete(&keys).await?;
        let tag_prefix = self.tag_key("");
        let mut removed: Vec<String> = keys
            .iter()
            .filter(|k| !k.starts_with(&tag_prefix))
            .map(|k| self.strip(k).to_owned())
            .collect();
        removed.sort();
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tagged(tags: &[&str]) -> Vec<String> {
        tags.iter().map(|t| (*t).to_owned()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entries_leave_the_tag_index() {
        let cache = LocalCache::new(10_000);
        for i in 0..500 {
            cache
                .set(&format!("k{i}"), b"1".to_vec(), Duration::from_secs(1), &tagged(&["t"]))
                .await
                .unwrap();
        }
        assert_eq!(cache.indexed("t"), 500);

        tokio::time::advance(Duration::from_secs(10)).await;
        for i in 0..500 {
            assert!(cache.get(&format!("k{i}")).await.unwrap().is_none());
        }
        cache.entries.run_pending_tasks();
        assert_eq!(cache.indexed("t"), 0);
        assert!(cache.tags().is_empty());
    }

    #[tokio::test]
    async fn entries_reclaimed_by_moka_leave_the_tag_index() {
        let cache = LocalCache::new(10_000);
        cache
            .set("a", b"1".to_vec(), Duration::from_millis(10), &tagged(&["t", "u"]))
            .await
            .unwrap();

        // moka's expiry wheel has roughly one-second buckets.
        std::thread::sleep(Duration::from_millis(2500));
        cache.entries.run_pending_tasks();

        assert_eq!(cache.entries.entry_count(), 0);
        assert!(cache.tags().is_empty());
    }

    #[tokio::test]
    async fn delete_unindexes_tags() {
        let cache = LocalCache::new(100);
        cache
            .set("a", b"1".to_vec(), Duration::from_secs(60), &tagged(&["t"]))
            .await
            .unwrap();
        cache
            .set("b", b"2".to_vec(), Duration::from_secs(60), &tagged(&["t"]))
            .await
            .unwrap();

        assert_eq!(cache.delete(&["a".to_owned()]).await.unwrap(), 1);
        cache.entries.run_pending_tasks();
        assert_eq!(cache.indexed("t"), 1);
    }

    #[tokio::test]
    async fn replacing_an_entry_keeps_shared_tags() {
        let cache = LocalCache::new(100);
        let ttl = Duration::from_secs(60);
        cache.set("a", b"1".to_vec(), ttl, &tagged(&["t", "old"])).await.unwrap();
        cache.set("a", b"2".to_vec(), ttl, &tagged(&["t"])).await.unwrap();
        cache.entries.run_pending_tasks();

        assert_eq!(cache.indexed("t"), 1);
        assert_eq!(cache.indexed("old"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shared_entries_carry_their_tags() {
        let store: Arc<dyn CoordinationStore> = Arc::new(crate::store::MemoryStore::new());
        let cache = SharedCache::new(Arc::clone(&store), "cache".into());
        cache
            .set("a", b"{\"n\":1}".to_vec(), Duration::from_secs(60), &tagged(&["t"]))
            .await
            .unwrap();

        let entry = cache.entry("cache:a").await.unwrap().unwrap();
        assert_eq!(entry.tags, vec!["t"]);
        assert_eq!(cache.get("a").await.unwrap(), Some(b"{\"n\":1}".to_vec()));
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_shared_entry_is_dropped() {
        let store: Arc<dyn CoordinationStore> = Arc::new(crate::store::MemoryStore::new());
        store.set("cache:a", b"not json", None).await.unwrap();
        let cache = SharedCache::new(Arc::clone(&store), "cache".into());

        assert_eq!(cache.get("a").await.unwrap(), None);
        assert_eq!(store.get("cache:a").await.unwrap(), None);
    }
}
