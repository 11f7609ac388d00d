//! Circuit record backends.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tracing::warn;

use super::{CircuitRecord, CircuitState};
use crate::store::CoordinationStore;
use crate::{Result, telemetry};

/// Storage for per-service circuit records.
///
/// Callers serialize read-modify-write sequences per service; backends only
/// need each individual operation to be atomic.
#[async_trait]
pub(crate) trait CircuitBackend: Send + Sync {
    /// The record for `service`, or a fresh closed record when absent.
    async fn load(&self, service: &str) -> CircuitRecord;
    async fn save(&self, record: &CircuitRecord);
    /// Count one more failure and return the consecutive total.
    async fn increment_failures(&self, service: &str) -> u32;
    async fn clear_failures(&self, service: &str);
}

fn closed(service: &str) -> CircuitRecord {
    CircuitRecord {
        service: service.to_owned(),
        state: CircuitState::Closed,
        failures: 0,
        last_failure_at: None,
        updated_at: SystemTime::UNIX_EPOCH,
    }
}

/// In-process circuit records.
#[derive(Default)]
pub(crate) struct LocalCircuits {
    records: Mutex<HashMap<String, CircuitRecord>>,
}

impl LocalCircuits {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn with_records<T>(&self, f: impl FnOnce(&mut HashMap<String, CircuitRecord>) -> T) -> T {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut records)
    }
}

#[async_trait]
impl CircuitBackend for LocalCircuits {
    async fn load(&self, service: &str) -> CircuitRecord {
        self.with_records(|records| records.get(service).cloned())
            .unwrap_or_else(|| closed(service))
    }

    async fn save(&self, record: &CircuitRecord) {
        self.with_records(|records| records.insert(record.service.clone(), record.clone()));
    }

    async fn increment_failures(&self, service: &str) -> u32 {
        self.with_records(|records| {
            let record = records
                .entry(service.to_owned())
                .or_insert_with(|| closed(service));
            record.failures += 1;
            record.failures
        })
    }

    async fn clear_failures(&self, service: &str) {
        self.with_records(|records| {
            if let Some(record) = records.get_mut(service) {
                record.failures = 0;
            }
        });
    }
}

/// Circuit records shared through a coordination store.
///
/// The record lives at `{prefix}:{service}` as JSON. The failure count is a
/// separate counter at `{prefix}:failures:{service}` whose TTL equals the
/// reset timeout, so stale counts clear themselves. Store failures fall
/// back to a local record for the affected service.
pub(crate) struct SharedCircuits {
    store: Arc<dyn CoordinationStore>,
    prefix: String,
    failure_ttl: Duration,
    fallback: LocalCircuits,
}

impl SharedCircuits {
    pub(crate) fn new(store: Arc<dyn CoordinationStore>, prefix: String, failure_ttl: Duration) -> Self {
        Self {
            store,
            prefix,
            failure_ttl,
            fallback: LocalCircuits::new(),
        }
    }

    fn record_key(&self, service: &str) -> String {
        format!("{}:{service}", self.prefix)
    }

    fn failures_key(&self, service: &str) -> String {
        format!("{}:failures:{service}", self.prefix)
    }

    async fn load_store(&self, service: &str) -> Result<CircuitRecord> {
        match self.store.get(&self.record_key(service)).await? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(closed(service)),
        }
    }

    async fn save_store(&self, record: &CircuitRecord) -> Result<()> {
        let bytes = serde_json::to_vec(record)?;
        self.store
            .set(&self.record_key(&record.service), &bytes, None)
            .await
    }

    async fn increment_store(&self, service: &str) -> Result<u32> {
        let key = self.failures_key(service);
        let count = self.store.incr(&key).await?;
        self.store.expire(&key, self.failure_ttl).await?;
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    fn degraded(&self, service: &str, operation: &str, error: &crate::GovernanceError) {
        warn!(service, operation, error = %error, "circuit store failed, using local record");
        metrics::counter!(telemetry::STORE_FALLBACKS_TOTAL, "component" => "circuit_breaker")
            .increment(1);
    }
}

#[async_trait]
impl CircuitBackend for SharedCircuits {
    async fn load(&self, service: &str) -> CircuitRecord {
        match self.load_store(service).await {
            Ok(record) => record,
            Err(e) => {
                self.degraded(service, "load", &e);
                self.fallback.load(service).await
            }
        }
    }

    async fn save(&self, record: &CircuitRecord) {
        // Keep the local copy current so a later outage degrades to the
        // most recent known state.
        self.fallback.save(record).await;
        if let Err(e) = self.save_store(record).await {
            self.degraded(&record.service, "save", &e);
        }
    }

    async fn increment_failures(&self, service: &str) -> u32 {
        match self.increment_store(service).await {
            Ok(count) => count,
            Err(e) => {
                self.degraded(service, "increment_failures", &e);
                self.fallback.increment_failures(service).await
            }
        }
    }

    async fn clear_failures(&self, service: &str) {
        self.fallback.clear_failures(service).await;
        if let Err(e) = self.store.delete(&[self.failures_key(service)]).await {
            self.degraded(service, "clear_failures", &e);
        }
    }
}
