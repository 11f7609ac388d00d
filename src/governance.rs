//! Wiring the components together.
//!
//! [`Governance`] owns one instance of each component, all sharing the
//! same (optional) coordination store, and runs an inference request
//! through them in order: rate limit, circuit breaker, model pool.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::cache::{CacheConfig, CacheManager};
use crate::config::Config;
use crate::limiter::{RateLimitConfig, RateLimiter};
use crate::model::{self, GenerateRequest, ModelBackend, ModelManager, ModelManagerConfig};
use crate::Result;
use crate::store::timeout::DEFAULT_STORE_TIMEOUT;
use crate::store::{CoordinationStore, TimeoutStore};

/// The governed components, sharing one coordination store.
pub struct Governance<B: ModelBackend> {
    limiter: RateLimiter,
    breaker: CircuitBreaker,
    cache: CacheManager,
    models: ModelManager<B>,
    store: Option<Arc<dyn CoordinationStore>>,
}

/// Main entry point for assembling the components.
pub struct Warden;

impl Warden {
    /// Create a new builder.
    pub fn builder() -> GovernanceBuilder {
        GovernanceBuilder::new()
    }
}

impl<B: ModelBackend> Governance<B> {
    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn cache(&self) -> &CacheManager {
        &self.cache
    }

    pub fn models(&self) -> &ModelManager<B> {
        &self.models
    }

    /// Whether state is shared through a coordination store.
    pub fn is_shared(&self) -> bool {
        self.store.is_some()
    }

    /// Run one inference request for `user_key`.
    ///
    /// The request is charged against the user's default rate limit, then
    /// sent to the model through the circuit for service `model:<model_id>`.
    /// Rejections surface as
    /// [`RateLimitExceeded`](crate::GovernanceError::RateLimitExceeded) and
    /// [`CircuitOpen`](crate::GovernanceError::CircuitOpen). A malformed
    /// model id is rejected up front, before it costs the user a request or
    /// counts against the model's circuit.
    pub async fn generate(
        &self,
        user_key: &str,
        model_id: &str,
        request: &GenerateRequest,
    ) -> Result<String> {
        model::validate_model_id(model_id)?;
        let config = self.limiter.config();
        let decision = self
            .limiter
            .consume(user_key, config.default_limit, config.window, 1)
            .await?;
        debug!(user = user_key, model = model_id, remaining = decision.remaining, "request admitted");

        let service = format!("model:{model_id}");
        let text = self
            .breaker
            .call(&service, || self.models.generate(model_id, request))
            .await?;
        Ok(text)
    }
}

/// Builder for [`Governance`].
///
/// ```rust
/// # use std::sync::Arc;
/// # use std::time::Duration;
/// # use warden::Warden;
/// # use warden::limiter::RateLimitConfig;
/// # use warden::store::MemoryStore;
/// let builder = Warden::builder()
///     .store(Arc::new(MemoryStore::new()))
///     .store_timeout(Duration::from_millis(200))
///     .rate_limit(RateLimitConfig::new().default_limit(30));
/// ```
pub struct GovernanceBuilder {
    store: Option<Arc<dyn CoordinationStore>>,
    store_timeout: Duration,
    rate_limit: RateLimitConfig,
    circuit_breaker: CircuitBreakerConfig,
    cache: CacheConfig,
    models: ModelManagerConfig,
}

impl Default for GovernanceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl GovernanceBuilder {
    pub fn new() -> Self {
        Self {
            store: None,
            store_timeout: DEFAULT_STORE_TIMEOUT,
            rate_limit: RateLimitConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            cache: CacheConfig::default(),
            models: ModelManagerConfig::default(),
        }
    }

    /// Share state through `store`. Without one, every component runs on
    /// process-local state.
    pub fn store(mut self, store: Arc<dyn CoordinationStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Deadline for each store call (default: 500ms).
    pub fn store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    pub fn rate_limit(mut self, config: RateLimitConfig) -> Self {
        self.rate_limit = config;
        self
    }

    pub fn circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = config;
        self
    }

    pub fn cache(mut self, config: CacheConfig) -> Self {
        self.cache = config;
        self
    }

    pub fn models(mut self, config: ModelManagerConfig) -> Self {
        self.models = config;
        self
    }

    /// Take every component configuration and the store timeout from a
    /// loaded [`Config`].
    pub fn config(mut self, config: &Config) -> Self {
        self.store_timeout = config.store.timeout();
        self.rate_limit = config.rate_limit.to_config();
        self.circuit_breaker = config.circuit_breaker.to_config();
        self.cache = config.cache.to_config();
        self.models = config.models.to_config();
        self
    }

    /// Build the components around `backend`.
    pub fn build<B: ModelBackend>(self, backend: B) -> Governance<B> {
        let store = self.store.map(|inner| {
            Arc::new(TimeoutStore::new(inner, self.store_timeout)) as Arc<dyn CoordinationStore>
        });
        Governance {
            limiter: RateLimiter::new(self.rate_limit, store.clone()),
            breaker: CircuitBreaker::new(self.circuit_breaker, store.clone()),
            cache: CacheManager::new(self.cache, store.clone()),
            models: ModelManager::new(backend, self.models),
            store,
        }
    }
}
