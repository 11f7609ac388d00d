//! Window state backends for the rate limiter.
//!
//! [`LocalWindows`] keeps per-key event queues in process memory;
//! [`SharedWindows`] keeps them in sorted sets on a coordination store and
//! falls back to its own [`LocalWindows`] whenever the store fails.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::store::CoordinationStore;
use crate::sync::KeyedLocks;
use crate::{Result, telemetry};

/// Local tables larger than this are swept of idle keys on the next check.
const SWEEP_THRESHOLD: usize = 10_000;

/// One atomic purge-count-record step over a key's window.
#[derive(Debug, Clone, Copy)]
pub(crate) struct WindowQuery {
    pub limit: u64,
    pub window: Duration,
    pub cost: u64,
    pub now: f64,
    /// Record `cost` events at `now` when they fit under `limit`.
    pub record: bool,
}

/// Window state observed by a [`WindowQuery`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct WindowSnapshot {
    /// Events in the window before this query recorded anything.
    pub current: u64,
    /// Timestamp of the oldest retained event after recording.
    pub oldest: Option<f64>,
    /// Whether events were recorded.
    pub recorded: bool,
}

/// Storage for sliding windows.
///
/// Implementations must purge, count and record atomically with respect to
/// other callers on the same key within this process.
#[async_trait]
pub(crate) trait WindowBackend: Send + Sync {
    async fn apply(&self, key: &str, query: WindowQuery) -> WindowSnapshot;
    async fn reset(&self, key: &str);
}

struct Window {
    /// `(timestamp, cost)` in arrival order.
    events: VecDeque<(f64, u64)>,
    span: f64,
}

impl Window {
    fn purge(&mut self, now: f64) {
        let cutoff = now - self.span;
        while self.events.front().is_some_and(|(ts, _)| *ts <= cutoff) {
            self.events.pop_front();
        }
    }

    fn current(&self) -> u64 {
        self.events.iter().map(|(_, cost)| cost).sum()
    }
}

/// In-process sliding windows guarded by one mutex.
#[derive(Default)]
pub(crate) struct LocalWindows {
    windows: Mutex<HashMap<String, Window>>,
}

impl LocalWindows {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn apply_sync(&self, key: &str, query: WindowQuery) -> WindowSnapshot {
        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        if windows.len() > SWEEP_THRESHOLD {
            windows.retain(|_, w| {
                w.purge(query.now);
                !w.events.is_empty()
            });
        }

        let window = windows.entry(key.to_owned()).or_insert_with(|| Window {
            events: VecDeque::new(),
            span: query.window.as_secs_f64(),
        });
        window.span = query.window.as_secs_f64();
        window.purge(query.now);

        let current = window.current();
        let recorded = query.record && current + query.cost <= query.limit;
        if recorded {
            window.events.push_back((query.now, query.cost));
        }
        let oldest = window.events.front().map(|(ts, _)| *ts);
        if window.events.is_empty() {
            windows.remove(key);
        }

        WindowSnapshot {
            current,
            oldest,
            recorded,
        }
    }
}

#[async_trait]
impl WindowBackend for LocalWindows {
    async fn apply(&self, key: &str, query: WindowQuery) -> WindowSnapshot {
        self.apply_sync(key, query)
    }

    async fn reset(&self, key: &str) {
        self.windows
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }
}

/// Sliding windows stored as sorted sets on a coordination store.
///
/// Each unit of cost is one member scored by its timestamp. Members carry
/// the process id and a sequence number so that concurrent writers never
/// collapse two events into one.
pub(crate) struct SharedWindows {
    store: Arc<dyn CoordinationStore>,
    locks: KeyedLocks,
    seq: AtomicU64,
    fallback: LocalWindows,
}

impl SharedWindows {
    pub(crate) fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self {
            store,
            locks: KeyedLocks::new(),
            seq: AtomicU64::new(0),
            fallback: LocalWindows::new(),
        }
    }

    async fn apply_store(&self, key: &str, query: WindowQuery) -> Result<WindowSnapshot> {
        let cutoff = query.now - query.window.as_secs_f64();
        self.store
            .remove_score_range(key, f64::NEG_INFINITY, cutoff)
            .await?;
        let members = self
            .store
            .score_range(key, f64::NEG_INFINITY, f64::INFINITY)
            .await?;

        let current = members.len() as u64;
        let mut oldest = members.first().map(|(_, score)| *score);
        let recorded = query.record && current + query.cost <= query.limit;
        if recorded {
            let pid = std::process::id();
            let entries: Vec<(String, f64)> = (0..query.cost)
                .map(|_| {
                    let seq = self.seq.fetch_add(1, Ordering::Relaxed);
                    (format!("{:.6}-{pid}-{seq}", query.now), query.now)
                })
                .collect();
            self.store.add_scored(key, &entries).await?;
            self.store.expire(key, query.window).await?;
            oldest = oldest.or(Some(query.now));
        }

        Ok(WindowSnapshot {
            current,
            oldest,
            recorded,
        })
    }
}

#[async_trait]
impl WindowBackend for SharedWindows {
    async fn apply(&self, key: &str, query: WindowQuery) -> WindowSnapshot {
        let _guard = self.locks.lock(key).await;
        match self.apply_store(key, query).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(key, error = %e, "rate limit store failed, using local window");
                metrics::counter!(telemetry::STORE_FALLBACKS_TOTAL, "component" => "rate_limiter")
                    .increment(1);
                self.fallback.apply_sync(key, query)
            }
        }
    }

    async fn reset(&self, key: &str) {
        let _guard = self.locks.lock(key).await;
        if let Err(e) = self.store.delete(&[key.to_owned()]).await {
            warn!(key, error = %e, "failed to reset shared rate limit");
        }
        self.fallback.reset(key).await;
    }
}
