//! Bounded pool of loaded models.
//!
//! Loads are serialized by a manager-wide lock with double-checked
//! lookup, so concurrent requests for a model that is not yet loaded
//! result in exactly one load. Eviction and insertion happen under the
//! same lock, so the pool never exceeds its capacity and an evicted
//! model's resources are released before it leaves the pool.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, RwLock as AsyncRwLock};
use tokio::time::Instant;
use tracing::{info, warn};

use super::{GenerateRequest, ModelBackend};
use crate::{GovernanceError, Result, telemetry};

/// Configuration for the model manager.
#[derive(Debug, Clone)]
pub struct ModelManagerConfig {
    /// Models held loaded at once. Default: 2, or `WARDEN_MODEL_CACHE_SIZE`.
    pub max_cache_size: usize,

    /// Directory holding model files. Default: `./models`, or
    /// `WARDEN_MODELS_DIR`.
    pub models_dir: PathBuf,

    /// Per-model path overrides.
    pub model_paths: HashMap<String, PathBuf>,
}

impl Default for ModelManagerConfig {
    fn default() -> Self {
        Self {
            max_cache_size: std::env::var("WARDEN_MODEL_CACHE_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(2),
            models_dir: std::env::var("WARDEN_MODELS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./models")),
            model_paths: HashMap::new(),
        }
    }
}

impl ModelManagerConfig {
    /// Create a new config with sensible defaults.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_cache_size(mut self, n: usize) -> Self {
        self.max_cache_size = n;
        self
    }

    pub fn models_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.models_dir = dir.into();
        self
    }

    /// Load `model_id` from `path` instead of `models_dir/<model_id>`.
    pub fn model_path(mut self, model_id: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.model_paths.insert(model_id.into(), path.into());
        self
    }

    /// Where `model_id` is loaded from: an explicit override, then
    /// `WARDEN_MODEL_PATH_<model_id>`, then `models_dir/<model_id>`.
    pub fn resolve_path(&self, model_id: &str) -> PathBuf {
        if let Some(path) = self.model_paths.get(model_id) {
            return path.clone();
        }
        if let Ok(path) = std::env::var(format!("WARDEN_MODEL_PATH_{model_id}")) {
            return PathBuf::from(path);
        }
        self.models_dir.join(model_id)
    }

    /// Model ids with a `.bin` file in the models directory, sorted. A
    /// missing directory has no models.
    pub fn available_models(&self) -> Result<Vec<String>> {
        let entries = match std::fs::read_dir(&self.models_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut models = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if !path.is_file() || path.extension().is_none_or(|ext| ext != "bin") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                models.push(stem.to_owned());
            }
        }
        models.sort();
        Ok(models)
    }
}

/// A model registered in the pool.
///
/// The backend instance sits behind an async lock: generations share it,
/// and releasing it waits for them to finish.
#[derive(Debug)]
pub struct ModelHandle<H> {
    model_id: String,
    path: PathBuf,
    instance: AsyncRwLock<Option<H>>,
    loaded: AtomicBool,
    last_used: Mutex<Instant>,
}

impl<H> ModelHandle<H> {
    fn new(model_id: &str, path: PathBuf, instance: H) -> Self {
        Self {
            model_id: model_id.to_owned(),
            path,
            instance: AsyncRwLock::new(Some(instance)),
            loaded: AtomicBool::new(true),
            last_used: Mutex::new(Instant::now()),
        }
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the backend instance is still held.
    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    /// Time since the model was last requested.
    pub fn idle(&self) -> Duration {
        self.last_used().elapsed()
    }

    fn last_used(&self) -> Instant {
        *self.last_used.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn touch(&self) {
        *self.last_used.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    /// Release the instance. Returns `false` when it was already released.
    async fn release<B>(&self, backend: &B) -> bool
    where
        B: ModelBackend<Handle = H>,
    {
        let mut instance = self.instance.write().await;
        let Some(instance) = instance.take() else {
            return false;
        };
        self.loaded.store(false, Ordering::Release);
        if let Err(e) = backend.unload(instance).await {
            warn!(model = %self.model_id, error = %e, "model unload reported an error");
        }
        true
    }
}

/// Snapshot of a pooled model.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelInfo {
    pub model_id: String,
    pub path: PathBuf,
    pub loaded: bool,
    pub idle: Duration,
}

type Pool<H> = HashMap<String, Arc<ModelHandle<H>>>;

/// Bounded pool of models loaded through a [`ModelBackend`].
///
/// ```rust
/// # use std::path::Path;
/// # use async_trait::async_trait;
/// # use warden::model::{GenerateRequest, ModelBackend, ModelManager, ModelManagerConfig};
/// struct Echo;
///
/// #[async_trait]
/// impl ModelBackend for Echo {
///     type Handle = String;
///
///     async fn load(&self, model_id: &str, _path: &Path) -> warden::Result<String> {
///         Ok(model_id.to_string())
///     }
///
///     async fn unload(&self, _handle: String) -> warden::Result<()> {
///         Ok(())
///     }
///
///     async fn generate(&self, handle: &String, request: &GenerateRequest) -> warden::Result<String> {
///         Ok(format!("{handle}: {}", request.prompt))
///     }
/// }
///
/// # tokio_test::block_on(async {
/// let manager = ModelManager::new(Echo, ModelManagerConfig::new().max_cache_size(1));
/// let reply = manager.generate("echo-1", &GenerateRequest::new("hi")).await.unwrap();
/// assert_eq!(reply, "echo-1: hi");
/// # });
/// ```
pub struct ModelManager<B: ModelBackend> {
    backend: B,
    pool: RwLock<Pool<B::Handle>>,
    load_lock: AsyncMutex<()>,
    config: ModelManagerConfig,
}

impl<B: ModelBackend> ModelManager<B> {
    pub fn new(backend: B, config: ModelManagerConfig) -> Self {
        Self {
            backend,
            pool: RwLock::new(HashMap::new()),
            load_lock: AsyncMutex::new(()),
            config,
        }
    }

    /// Create a model manager with default configuration.
    pub fn with_defaults(backend: B) -> Self {
        Self::new(backend, ModelManagerConfig::default())
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn config(&self) -> &ModelManagerConfig {
        &self.config
    }

    /// Get `model_id`, loading it on first use.
    ///
    /// Every call refreshes the model's recency. When the pool is full the
    /// least recently used model is unloaded before the new one loads, so
    /// live instances never exceed capacity. If that load then fails the
    /// evicted model stays unloaded: the pool ends one model smaller, the
    /// failed id is not registered and may be retried.
    pub async fn get_model(&self, model_id: &str) -> Result<Arc<ModelHandle<B::Handle>>> {
        validate_model_id(model_id)?;

        if let Some(handle) = self.lookup(model_id) {
            handle.touch();
            return Ok(handle);
        }

        let _guard = self.load_lock.lock().await;
        // Another caller may have loaded it while we waited.
        if let Some(handle) = self.lookup(model_id) {
            handle.touch();
            return Ok(handle);
        }

        self.make_room().await;

        let path = self.config.resolve_path(model_id);
        let started = std::time::Instant::now();
        let instance = match self.backend.load(model_id, &path).await {
            Ok(instance) => instance,
            Err(e) => {
                metrics::counter!(telemetry::MODEL_LOAD_FAILURES_TOTAL, "model" => model_id.to_owned())
                    .increment(1);
                warn!(model = model_id, path = %path.display(), error = %e, "model load failed");
                return Err(load_failed(model_id, e));
            }
        };
        let elapsed = started.elapsed();
        metrics::histogram!(telemetry::MODEL_LOAD_SECONDS, "model" => model_id.to_owned())
            .record(elapsed.as_secs_f64());

        let handle = Arc::new(ModelHandle::new(model_id, path, instance));
        let size = {
            let mut pool = self.pool_mut();
            pool.insert(model_id.to_owned(), Arc::clone(&handle));
            pool.len()
        };
        metrics::gauge!(telemetry::MODEL_POOL_SIZE).set(size as f64);
        info!(model = model_id, ?elapsed, pool_size = size, "model loaded");
        Ok(handle)
    }

    /// Generate text with `model_id`, loading it if needed.
    pub async fn generate(&self, model_id: &str, request: &GenerateRequest) -> Result<String> {
        let started = std::time::Instant::now();
        let result = self.run(model_id, request).await;

        let status = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!(telemetry::INFERENCE_REQUESTS_TOTAL,
            "model" => model_id.to_owned(), "status" => status)
        .increment(1);
        metrics::histogram!(telemetry::INFERENCE_SECONDS, "model" => model_id.to_owned())
            .record(started.elapsed().as_secs_f64());
        result
    }

    async fn run(&self, model_id: &str, request: &GenerateRequest) -> Result<String> {
        // A model evicted between lookup and use is loaded again once.
        for _ in 0..2 {
            let handle = self.get_model(model_id).await?;
            let instance = handle.instance.read().await;
            if let Some(instance) = instance.as_ref() {
                return self
                    .backend
                    .generate(instance, request)
                    .await
                    .map_err(|e| generation_failed(model_id, e));
            }
        }
        Err(GovernanceError::ModelNotLoaded(model_id.to_owned()))
    }

    /// Unload `model_id` and remove it from the pool.
    ///
    /// Waits for in-flight generations on the model. Returns `false` when
    /// the model was not loaded; unloading twice is harmless.
    pub async fn unload(&self, model_id: &str) -> bool {
        let _guard = self.load_lock.lock().await;
        let Some(handle) = self.lookup(model_id) else {
            return false;
        };
        let released = handle.release(&self.backend).await;
        let size = {
            let mut pool = self.pool_mut();
            pool.remove(model_id);
            pool.len()
        };
        metrics::gauge!(telemetry::MODEL_POOL_SIZE).set(size as f64);
        if released {
            info!(model = model_id, "model unloaded");
        }
        released
    }

    /// Unload every pooled model.
    pub async fn unload_all(&self) -> usize {
        let mut unloaded = 0;
        for model_id in self.loaded_models() {
            if self.unload(&model_id).await {
                unloaded += 1;
            }
        }
        unloaded
    }

    /// Model ids available to load; see
    /// [`ModelManagerConfig::available_models`].
    pub fn list_available(&self) -> Result<Vec<String>> {
        self.config.available_models()
    }

    /// Ids of pooled models, sorted.
    pub fn loaded_models(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.pool().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Details of a pooled model.
    pub fn model_info(&self, model_id: &str) -> Option<ModelInfo> {
        self.lookup(model_id).map(|handle| ModelInfo {
            model_id: handle.model_id.clone(),
            path: handle.path.clone(),
            loaded: handle.is_loaded(),
            idle: handle.idle(),
        })
    }

    /// Number of pooled models.
    pub fn pool_size(&self) -> usize {
        self.pool().len()
    }

    /// Unload least recently used models until one more fits.
    async fn make_room(&self) {
        let capacity = self.config.max_cache_size.max(1);
        loop {
            let victim = {
                let pool = self.pool();
                if pool.len() < capacity {
                    return;
                }
                pool.values().min_by_key(|h| h.last_used()).map(Arc::clone)
            };
            let Some(victim) = victim else {
                return;
            };

            info!(model = %victim.model_id, idle = ?victim.idle(), "evicting least recently used model");
            victim.release(&self.backend).await;
            let size = {
                let mut pool = self.pool_mut();
                pool.remove(&victim.model_id);
                pool.len()
            };
            metrics::gauge!(telemetry::MODEL_POOL_SIZE).set(size as f64);
            metrics::counter!(telemetry::MODEL_EVICTIONS_TOTAL).increment(1);
        }
    }

    fn lookup(&self, model_id: &str) -> Option<Arc<ModelHandle<B::Handle>>> {
        self.pool().get(model_id).map(Arc::clone)
    }

    fn pool(&self) -> std::sync::RwLockReadGuard<'_, Pool<B::Handle>> {
        self.pool.read().unwrap_or_else(|e| e.into_inner())
    }

    fn pool_mut(&self) -> std::sync::RwLockWriteGuard<'_, Pool<B::Handle>> {
        self.pool.write().unwrap_or_else(|e| e.into_inner())
    }
}

/// Reject ids that could escape the models directory.
pub(crate) fn validate_model_id(model_id: &str) -> Result<()> {
    if model_id.is_empty()
        || model_id.contains(['/', '\\'])
        || model_id == "."
        || model_id == ".."
    {
        return Err(GovernanceError::InvalidInput(format!(
            "invalid model id '{model_id}'"
        )));
    }
    Ok(())
}

fn load_failed(model_id: &str, err: GovernanceError) -> GovernanceError {
    match err {
        err @ GovernanceError::ModelLoadFailed { .. } => err,
        other => GovernanceError::ModelLoadFailed {
            model_id: model_id.to_owned(),
            reason: other.to_string(),
        },
    }
}

fn generation_failed(model_id: &str, err: GovernanceError) -> GovernanceError {
    match err {
        err @ GovernanceError::Generation { .. } => err,
        other => GovernanceError::Generation {
            model_id: model_id.to_owned(),
            reason: other.to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_resolves_override_before_models_dir() {
        let config = ModelManagerConfig::new()
            .models_dir("/srv/models")
            .model_path("chat-7b", "/mnt/fast/chat.bin");
        assert_eq!(config.resolve_path("chat-7b"), PathBuf::from("/mnt/fast/chat.bin"));
        assert_eq!(config.resolve_path("other"), PathBuf::from("/srv/models/other"));
    }

    #[test]
    fn rejects_path_like_model_ids() {
        assert!(validate_model_id("chat-7b").is_ok());
        assert!(validate_model_id("").is_err());
        assert!(validate_model_id("../etc/passwd").is_err());
        assert!(validate_model_id("..").is_err());
    }

    #[test]
    fn load_errors_are_wrapped_once() {
        let err = load_failed("m", GovernanceError::InvalidInput("bad header".into()));
        assert!(matches!(
            err,
            GovernanceError::ModelLoadFailed { ref model_id, ref reason }
                if model_id == "m" && reason.contains("bad header")
        ));
        let again = load_failed("m", err);
        assert!(matches!(again, GovernanceError::ModelLoadFailed { ref reason, .. } if !reason.contains("failed to load")));
    }
}
