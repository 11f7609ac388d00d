//! Reusable memoized functions.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;

use super::{CacheManager, MemoOptions};

/// An async function whose results are cached by a derived key.
///
/// ```rust
/// # use std::sync::Arc;
/// # use warden::cache::{CacheConfig, CacheManager, Memoizer};
/// # tokio_test::block_on(async {
/// let cache = Arc::new(CacheManager::local(CacheConfig::default()));
/// let square = Memoizer::new(
///     cache,
///     |n: &u64| format!("square:{n}"),
///     |n: u64| async move { Ok::<_, std::io::Error>(n * n) },
/// );
/// assert_eq!(square.call(7).await.unwrap(), 49);
/// # });
/// ```
pub struct Memoizer<A, T, K, F> {
    cache: Arc<CacheManager>,
    key_fn: K,
    func: F,
    options: MemoOptions,
    _marker: PhantomData<fn(A) -> T>,
}

impl<A, T, E, K, F, Fut> Memoizer<A, T, K, F>
where
    T: Serialize + DeserializeOwned,
    K: Fn(&A) -> String,
    F: Fn(A) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    pub fn new(cache: Arc<CacheManager>, key_fn: K, func: F) -> Self {
        Self {
            cache,
            key_fn,
            func,
            options: MemoOptions::default(),
            _marker: PhantomData,
        }
    }

    /// Cache results for `ttl` instead of the cache's default TTL.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.options.ttl = Some(ttl);
        self
    }

    /// Tag every cached result with `tag`.
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.options.tags.push(tag.into());
        self
    }

    /// Return the cached result for `args`, or call the function and cache
    /// its successful result.
    pub async fn call(&self, args: A) -> Result<T, E> {
        let key = (self.key_fn)(&args);
        self.cache
            .memoize(&key, &self.options, || (self.func)(args))
            .await
    }

    /// Drop the cached result for `args`.
    pub async fn invalidate(&self, args: &A) -> bool {
        self.cache.delete(&(self.key_fn)(args)).await
    }
}
