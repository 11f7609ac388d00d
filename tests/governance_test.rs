//! End-to-end tests for [`Governance`]: the components wired together.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use warden::breaker::CircuitBreakerConfig;
use warden::limiter::RateLimitConfig;
use warden::model::{GenerateRequest, ModelBackend, ModelManagerConfig};
use warden::store::MemoryStore;
use warden::{CircuitState, Config, GovernanceError, Result, Warden};

/// Backend whose generations can be switched to fail.
#[derive(Clone, Default)]
struct FlakyBackend {
    broken: Arc<AtomicBool>,
    generations: Arc<AtomicUsize>,
}

#[async_trait]
impl ModelBackend for FlakyBackend {
    type Handle = String;

    async fn load(&self, model_id: &str, _path: &Path) -> Result<String> {
        Ok(model_id.to_string())
    }

    async fn unload(&self, _handle: String) -> Result<()> {
        Ok(())
    }

    async fn generate(&self, handle: &String, request: &GenerateRequest) -> Result<String> {
        self.generations.fetch_add(1, Ordering::SeqCst);
        if self.broken.load(Ordering::SeqCst) {
            return Err(GovernanceError::Generation {
                model_id: handle.clone(),
                reason: "device lost".into(),
            });
        }
        Ok(format!("{handle}: {}", request.prompt))
    }
}

fn models() -> ModelManagerConfig {
    ModelManagerConfig::new()
        .max_cache_size(2)
        .models_dir("/nonexistent/models")
}

#[tokio::test(start_paused = true)]
async fn request_flows_through_every_component() {
    let governance = Warden::builder().models(models()).build(FlakyBackend::default());

    let reply = governance
        .generate("user:1", "chat", &GenerateRequest::new("hello"))
        .await
        .unwrap();

    assert_eq!(reply, "chat: hello");
    assert!(!governance.is_shared());
    assert_eq!(governance.models().loaded_models(), vec!["chat"]);
    assert_eq!(
        governance.breaker().state("model:chat").await,
        CircuitState::Closed
    );
    let status = governance.limiter().status("user:1", 60, Duration::from_secs(60)).await;
    assert_eq!(status.current, 1);
}

#[tokio::test(start_paused = true)]
async fn requests_beyond_the_limit_are_rejected() {
    let backend = FlakyBackend::default();
    let governance = Warden::builder()
        .rate_limit(RateLimitConfig::new().default_limit(2))
        .models(models())
        .build(backend.clone());

    let request = GenerateRequest::new("hi");
    governance.generate("user:1", "chat", &request).await.unwrap();
    governance.generate("user:1", "chat", &request).await.unwrap();

    let err = governance
        .generate("user:1", "chat", &request)
        .await
        .unwrap_err();
    assert!(matches!(err, GovernanceError::RateLimitExceeded { ref key, limit: 2, .. } if key == "user:1"));
    assert!(err.retry_at().is_some());
    assert_eq!(backend.generations.load(Ordering::SeqCst), 2);

    // Another user has their own budget.
    governance.generate("user:2", "chat", &request).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn failing_model_opens_its_circuit() {
    let backend = FlakyBackend::default();
    let governance = Warden::builder()
        .circuit_breaker(
            CircuitBreakerConfig::new()
                .failure_threshold(2)
                .reset_timeout(Duration::from_secs(30)),
        )
        .models(models())
        .build(backend.clone());
    let request = GenerateRequest::new("hi");

    backend.broken.store(true, Ordering::SeqCst);
    for _ in 0..2 {
        let err = governance.generate("user:1", "chat", &request).await.unwrap_err();
        assert!(matches!(err, GovernanceError::Generation { .. }));
    }

    let err = governance.generate("user:1", "chat", &request).await.unwrap_err();
    assert!(matches!(err, GovernanceError::CircuitOpen { ref service, .. } if service == "model:chat"));
    assert_eq!(backend.generations.load(Ordering::SeqCst), 2);

    // Other models keep working.
    backend.broken.store(false, Ordering::SeqCst);
    governance.generate("user:1", "code", &request).await.unwrap();

    // After the cooldown a trial request closes the circuit again.
    tokio::time::advance(Duration::from_secs(30)).await;
    assert_eq!(
        governance.generate("user:1", "chat", &request).await.unwrap(),
        "chat: hi"
    );
    assert_eq!(
        governance.breaker().state("model:chat").await,
        CircuitState::Closed
    );
}

#[tokio::test(start_paused = true)]
async fn invalid_model_id_charges_nothing() {
    let governance = Warden::builder()
        .rate_limit(RateLimitConfig::new().default_limit(2))
        .circuit_breaker(CircuitBreakerConfig::new().failure_threshold(1))
        .models(models())
        .build(FlakyBackend::default());
    let request = GenerateRequest::new("hi");

    for _ in 0..3 {
        let err = governance.generate("user:1", "../chat", &request).await.unwrap_err();
        assert!(matches!(err, GovernanceError::InvalidInput(_)));
    }

    assert_eq!(
        governance.breaker().state("model:../chat").await,
        CircuitState::Closed
    );
    let status = governance.limiter().status("user:1", 2, Duration::from_secs(60)).await;
    assert_eq!(status.current, 0);
    governance.generate("user:1", "chat", &request).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn instances_sharing_a_store_share_limits() {
    let store = Arc::new(MemoryStore::new());
    let build = || {
        Warden::builder()
            .store(store.clone())
            .rate_limit(RateLimitConfig::new().default_limit(3))
            .models(models())
            .build(FlakyBackend::default())
    };
    let a = build();
    let b = build();
    assert!(a.is_shared());

    let request = GenerateRequest::new("hi");
    a.generate("user:1", "chat", &request).await.unwrap();
    b.generate("user:1", "chat", &request).await.unwrap();
    a.generate("user:1", "chat", &request).await.unwrap();

    let err = b.generate("user:1", "chat", &request).await.unwrap_err();
    assert!(matches!(err, GovernanceError::RateLimitExceeded { .. }));

    // The cache is shared too.
    a.cache().set("greeting", &"hello", None, &[]).await;
    assert_eq!(b.cache().get::<String>("greeting").await.as_deref(), Some("hello"));
}

#[tokio::test(start_paused = true)]
async fn builder_takes_configuration() {
    let mut config = Config::default();
    config.rate_limit.default_limit = 7;
    config.rate_limit.window_secs = 10;
    config.circuit_breaker.failure_threshold = 9;
    config.cache.default_ttl_secs = 42;
    config.models.max_cache_size = Some(4);
    config.models.models_dir = Some("/srv/models".into());

    let governance = Warden::builder().config(&config).build(FlakyBackend::default());

    assert_eq!(governance.limiter().config().default_limit, 7);
    assert_eq!(governance.limiter().config().window, Duration::from_secs(10));
    assert_eq!(governance.breaker().config().failure_threshold, 9);
    assert_eq!(governance.cache().config().default_ttl, Duration::from_secs(42));
    assert_eq!(governance.models().config().max_cache_size, 4);
    assert_eq!(
        governance.models().config().models_dir,
        Path::new("/srv/models")
    );
}
