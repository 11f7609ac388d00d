//! File configuration.
//!
//! Every component has a typed config with defaults; [`Config`] gathers
//! them into one serde document so deployments can tune warden without
//! code changes. With the `config` feature, it is loaded from TOML with
//! the following resolution order:
//! 1. explicit path (e.g. `--config <path>`)
//! 2. `~/.warden/config.toml` (user)
//! 3. `/etc/warden/config.toml` (system)
//! 4. built-in defaults
//!
//! ```toml
//! [store]
//! timeout_ms = 250
//!
//! [rate_limit]
//! default_limit = 30
//! window_secs = 60
//!
//! [circuit_breaker]
//! failure_threshold = 3
//!
//! [cache]
//! strategy = "lru"
//! policy_max_size = 500
//!
//! [models]
//! max_cache_size = 2
//! models_dir = "/srv/models"
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::breaker::CircuitBreakerConfig;
use crate::cache::{CacheConfig, CachePolicyConfig, CacheStrategy};
use crate::limiter::RateLimitConfig;
use crate::model::ModelManagerConfig;
use crate::store::timeout::DEFAULT_STORE_TIMEOUT;
use crate::{GovernanceError, Result};

/// Warden configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub store: StoreSection,
    pub rate_limit: RateLimitSection,
    pub circuit_breaker: CircuitBreakerSection,
    pub cache: CacheSection,
    pub models: ModelsSection,
}

/// Coordination store settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSection {
    /// Deadline for each store call in milliseconds (default: 500).
    pub timeout_ms: u64,
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_STORE_TIMEOUT.as_millis() as u64,
        }
    }
}

impl StoreSection {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Rate limiter settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSection {
    /// Requests per window (default: 10).
    pub default_limit: u64,
    /// Window length in seconds (default: 60).
    pub window_secs: u64,
    pub prefix: String,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        let defaults = RateLimitConfig::default();
        Self {
            default_limit: defaults.default_limit,
            window_secs: defaults.window.as_secs(),
            prefix: defaults.prefix,
        }
    }
}

impl RateLimitSection {
    pub fn to_config(&self) -> RateLimitConfig {
        RateLimitConfig::new()
            .default_limit(self.default_limit)
            .window(Duration::from_secs(self.window_secs))
            .prefix(self.prefix.clone())
    }
}

/// Circuit breaker settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerSection {
    /// Consecutive failures that open a circuit (default: 5).
    pub failure_threshold: u32,
    /// Cooldown before a trial call, in seconds (default: 60).
    pub reset_timeout_secs: u64,
    /// Lifetime of a trial claim, in seconds (default: 30).
    pub half_open_timeout_secs: u64,
    pub prefix: String,
}

impl Default for CircuitBreakerSection {
    fn default() -> Self {
        let defaults = CircuitBreakerConfig::default();
        Self {
            failure_threshold: defaults.failure_threshold,
            reset_timeout_secs: defaults.reset_timeout.as_secs(),
            half_open_timeout_secs: defaults.half_open_timeout.as_secs(),
            prefix: defaults.prefix,
        }
    }
}

impl CircuitBreakerSection {
    pub fn to_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig::new()
            .failure_threshold(self.failure_threshold)
            .reset_timeout(Duration::from_secs(self.reset_timeout_secs))
            .half_open_timeout(Duration::from_secs(self.half_open_timeout_secs))
            .prefix(self.prefix.clone())
    }
}

/// Cache settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    /// Entry TTL when none is given, in seconds (default: 3600).
    pub default_ttl_secs: u64,
    /// Capacity of the in-process cache (default: 10,000).
    pub max_entries: u64,
    pub prefix: String,
    /// `none`, `simple`, `lru` or `adaptive` (default: `simple`).
    pub strategy: CacheStrategy,
    /// Keys tracked by the policy (default: 1,000).
    pub policy_max_size: usize,
    /// Idle time before the policy evicts a key, in seconds (default: 3600).
    pub policy_ttl_secs: u64,
    /// Statistics refresh interval, in seconds (default: 300).
    pub update_interval_secs: u64,
}

impl Default for CacheSection {
    fn default() -> Self {
        let defaults = CacheConfig::default();
        Self {
            default_ttl_secs: defaults.default_ttl.as_secs(),
            max_entries: defaults.max_entries,
            prefix: defaults.prefix,
            strategy: defaults.policy.strategy,
            policy_max_size: defaults.policy.max_size,
            policy_ttl_secs: defaults.policy.ttl.as_secs(),
            update_interval_secs: defaults.policy.update_interval.as_secs(),
        }
    }
}

impl CacheSection {
    pub fn to_config(&self) -> CacheConfig {
        CacheConfig::new()
            .default_ttl(Duration::from_secs(self.default_ttl_secs))
            .max_entries(self.max_entries)
            .prefix(self.prefix.clone())
            .policy(
                CachePolicyConfig::new()
                    .strategy(self.strategy)
                    .max_size(self.policy_max_size)
                    .ttl(Duration::from_secs(self.policy_ttl_secs))
                    .update_interval(Duration::from_secs(self.update_interval_secs)),
            )
    }
}

/// Model pool settings. Unset fields fall back to the environment
/// (`WARDEN_MODEL_CACHE_SIZE`, `WARDEN_MODELS_DIR`), then to the defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelsSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_cache_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub models_dir: Option<PathBuf>,
    /// Per-model path overrides.
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub paths: HashMap<String, PathBuf>,
}

impl ModelsSection {
    pub fn to_config(&self) -> ModelManagerConfig {
        let mut config = ModelManagerConfig::default();
        if let Some(n) = self.max_cache_size {
            config.max_cache_size = n;
        }
        if let Some(dir) = &self.models_dir {
            config.models_dir = dir.clone();
        }
        config
            .model_paths
            .extend(self.paths.iter().map(|(id, path)| (id.clone(), path.clone())));
        config
    }
}

impl Config {
    /// Reject settings no component can run with.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(GovernanceError::Configuration(msg.to_string()));
        if self.store.timeout_ms == 0 {
            return invalid("store.timeout_ms must be positive");
        }
        if self.rate_limit.window_secs == 0 {
            return invalid("rate_limit.window_secs must be positive");
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return invalid("circuit_breaker.failure_threshold must be positive");
        }
        if self.cache.default_ttl_secs == 0 {
            return invalid("cache.default_ttl_secs must be positive");
        }
        if self.models.max_cache_size == Some(0) {
            return invalid("models.max_cache_size must be positive");
        }
        Ok(())
    }
}

#[cfg(feature = "config")]
mod file {
    use std::fs;
    use std::path::{Path, PathBuf};

    use tracing::debug;

    use super::Config;
    use crate::{GovernanceError, Result};

    impl Config {
        /// Load configuration from the standard locations, falling back to
        /// the defaults when no file exists.
        ///
        /// An explicit path that does not exist is an error.
        pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
            match Self::resolve_path(explicit_path)? {
                Some(path) => Self::load_from_file(&path),
                None => {
                    debug!("no config file found, using defaults");
                    Ok(Self::default())
                }
            }
        }

        /// Parse and validate a TOML document.
        pub fn from_toml(content: &str) -> Result<Self> {
            let config: Self = toml::from_str(content)
                .map_err(|e| GovernanceError::Configuration(format!("invalid config: {e}")))?;
            config.validate()?;
            Ok(config)
        }

        /// Render as a TOML document.
        pub fn to_toml(&self) -> Result<String> {
            toml::to_string_pretty(self)
                .map_err(|e| GovernanceError::Configuration(format!("failed to render config: {e}")))
        }

        fn load_from_file(path: &Path) -> Result<Self> {
            let content = fs::read_to_string(path).map_err(|e| {
                GovernanceError::Configuration(format!("failed to read config file {path:?}: {e}"))
            })?;
            debug!(path = %path.display(), "loading config");
            Self::from_toml(&content).map_err(|e| match e {
                GovernanceError::Configuration(msg) => {
                    GovernanceError::Configuration(format!("{path:?}: {msg}"))
                }
                other => other,
            })
        }

        fn resolve_path(explicit: Option<&Path>) -> Result<Option<PathBuf>> {
            if let Some(path) = explicit {
                if path.exists() {
                    return Ok(Some(path.to_path_buf()));
                }
                return Err(GovernanceError::Configuration(format!(
                    "config file not found: {path:?}"
                )));
            }

            if let Some(home) = dirs::home_dir() {
                let user_config = home.join(".warden").join("config.toml");
                if user_config.exists() {
                    return Ok(Some(user_config));
                }
            }

            let system_config = PathBuf::from("/etc/warden/config.toml");
            if system_config.exists() {
                return Ok(Some(system_config));
            }

            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_component_defaults() {
        let config = Config::default();
        assert_eq!(config.store.timeout_ms, 500);
        assert_eq!(config.rate_limit.default_limit, 10);
        assert_eq!(config.rate_limit.window_secs, 60);
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.circuit_breaker.reset_timeout_secs, 60);
        assert_eq!(config.circuit_breaker.half_open_timeout_secs, 30);
        assert_eq!(config.cache.default_ttl_secs, 3600);
        assert_eq!(config.cache.strategy, CacheStrategy::Simple);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn section_converts_to_component_config() {
        let section = CircuitBreakerSection {
            failure_threshold: 2,
            reset_timeout_secs: 10,
            ..Default::default()
        };
        let config = section.to_config();
        assert_eq!(config.failure_threshold, 2);
        assert_eq!(config.reset_timeout, Duration::from_secs(10));
        assert_eq!(config.half_open_timeout, Duration::from_secs(30));
    }

    #[test]
    fn models_section_overrides() {
        let section = ModelsSection {
            max_cache_size: Some(4),
            models_dir: Some(PathBuf::from("/srv/models")),
            paths: HashMap::from([("chat".to_string(), PathBuf::from("/mnt/chat.bin"))]),
        };
        let config = section.to_config();
        assert_eq!(config.max_cache_size, 4);
        assert_eq!(config.models_dir, PathBuf::from("/srv/models"));
        assert_eq!(config.resolve_path("chat"), PathBuf::from("/mnt/chat.bin"));
    }

    #[test]
    fn zero_window_is_rejected() {
        let mut config = Config::default();
        config.rate_limit.window_secs = 0;
        assert!(matches!(
            config.validate(),
            Err(GovernanceError::Configuration(_))
        ));
    }
}
