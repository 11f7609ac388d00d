//! Warden - resource governance for multi-tenant inference APIs
//!
//! This crate guards access to scarce, expensive and partially unreliable
//! resources behind four components:
//!
//! - [`RateLimiter`]: sliding-window request budget per key;
//! - [`CircuitBreaker`]: per-service health tracking that short-circuits
//!   calls to a failing dependency;
//! - [`CacheManager`]: TTL cache with tag invalidation and a pluggable
//!   admission/eviction [`CachePolicy`](cache::CachePolicy);
//! - [`ModelManager`]: bounded pool of loaded model instances with
//!   single-flight loading and LRU eviction.
//!
//! Each component runs on process-local state, or shares its state through
//! an optional [`CoordinationStore`] so that several processes enforce the
//! same limits. When the store is unreachable, components degrade instead
//! of failing: the limiter and breaker continue on local state, the cache
//! reports misses.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use warden::model::{GenerateRequest, ModelBackend};
//! use warden::store::MemoryStore;
//! use warden::Warden;
//!
//! struct MyEngine;
//!
//! #[async_trait]
//! impl ModelBackend for MyEngine {
//!     type Handle = ();
//!     async fn load(&self, _id: &str, _path: &Path) -> warden::Result<()> { Ok(()) }
//!     async fn unload(&self, _handle: ()) -> warden::Result<()> { Ok(()) }
//!     async fn generate(&self, _h: &(), req: &GenerateRequest) -> warden::Result<String> {
//!         Ok(req.full_prompt())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> warden::Result<()> {
//!     let governance = Warden::builder()
//!         .store(Arc::new(MemoryStore::new()))
//!         .build(MyEngine);
//!
//!     let reply = governance
//!         .generate("user:42", "chat-7b", &GenerateRequest::new("Hello"))
//!         .await?;
//!     println!("{reply}");
//!     Ok(())
//! }
//! ```

pub mod breaker;
pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod governance;
pub mod limiter;
pub mod model;
pub mod store;
mod sync;
pub mod telemetry;

// Re-export main types at crate root
pub use breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitError, CircuitState};
pub use cache::{CacheConfig, CacheManager, Memoizer};
pub use config::Config;
pub use error::{GovernanceError, Result};
pub use governance::{Governance, GovernanceBuilder, Warden};
pub use limiter::{RateLimitConfig, RateLimitDecision, RateLimiter};
pub use model::{GenerateRequest, ModelBackend, ModelManager, ModelManagerConfig};
pub use store::{CoordinationStore, MemoryStore};
