//! In-process coordination store.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use globset::Glob;
use tokio::time::Instant;

use super::CoordinationStore;
use crate::{GovernanceError, Result};

enum Value {
    Bytes(Vec<u8>),
    Scored(HashMap<String, f64>),
    Set(BTreeSet<String>),
}

struct Slot {
    value: Value,
    expires_at: Option<Instant>,
}

impl Slot {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| now < at)
    }
}

/// Thread-safe in-memory [`CoordinationStore`] with per-key TTLs.
///
/// Expired keys are invisible to every operation and removed lazily the
/// next time they are touched. Time follows tokio's clock, so paused test
/// runtimes control expiry.
#[derive(Default)]
pub struct MemoryStore {
    slots: Mutex<HashMap<String, Slot>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.slots
            .lock()
            .map(|slots| slots.values().filter(|s| s.is_live(now)).count())
            .unwrap_or(0)
    }

    /// Whether the store holds no live keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, Slot>>> {
        self.slots
            .lock()
            .map_err(|e| GovernanceError::StoreUnavailable(format!("lock poisoned: {e}")))
    }
}

/// Drop `key` if it has expired, then return its live slot.
fn live<'a>(slots: &'a mut HashMap<String, Slot>, key: &str) -> Option<&'a mut Slot> {
    let now = Instant::now();
    if slots.get(key).is_some_and(|s| !s.is_live(now)) {
        slots.remove(key);
    }
    slots.get_mut(key)
}

/// Expiry instant for `ttl` from now; a TTL past the clock's range never
/// expires.
fn deadline(ttl: Duration) -> Option<Instant> {
    Instant::now().checked_add(ttl)
}

fn wrong_type(key: &str) -> GovernanceError {
    GovernanceError::StoreUnavailable(format!(
        "WRONGTYPE operation against key '{key}' holding the wrong kind of value"
    ))
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut slots = self.lock()?;
        match live(&mut slots, key) {
            None => Ok(None),
            Some(Slot {
                value: Value::Bytes(bytes),
                ..
            }) => Ok(Some(bytes.clone())),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<()> {
        let mut slots = self.lock()?;
        slots.insert(
            key.to_owned(),
            Slot {
                value: Value::Bytes(value.to_vec()),
                expires_at: ttl.and_then(deadline),
            },
        );
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let mut slots = self.lock()?;
        match live(&mut slots, key) {
            None => {
                slots.insert(
                    key.to_owned(),
                    Slot {
                        value: Value::Bytes(b"1".to_vec()),
                        expires_at: None,
                    },
                );
                Ok(1)
            }
            Some(Slot {
                value: Value::Bytes(bytes),
                ..
            }) => {
                let current: i64 = std::str::from_utf8(bytes)
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| {
                        GovernanceError::StoreUnavailable(format!(
                            "value at '{key}' is not an integer"
                        ))
                    })?;
                let next = current + 1;
                *bytes = next.to_string().into_bytes();
                Ok(next)
            }
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut slots = self.lock()?;
        match live(&mut slots, key) {
            Some(slot) => {
                slot.expires_at = deadline(ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        let mut slots = self.lock()?;
        let mut removed = 0;
        for key in keys {
            if live(&mut slots, key).is_some() {
                slots.remove(key);
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn add_scored(&self, key: &str, members: &[(String, f64)]) -> Result<()> {
        let mut slots = self.lock()?;
        if live(&mut slots, key).is_none() {
            slots.insert(
                key.to_owned(),
                Slot {
                    value: Value::Scored(HashMap::new()),
                    expires_at: None,
                },
            );
        }
        match slots.get_mut(key) {
            Some(Slot {
                value: Value::Scored(set),
                ..
            }) => {
                for (member, score) in members {
                    set.insert(member.clone(), *score);
                }
                Ok(())
            }
            _ => Err(wrong_type(key)),
        }
    }

    async fn score_range(&self, key: &str, min: f64, max: f64) -> Result<Vec<(String, f64)>> {
        let mut slots = self.lock()?;
        match live(&mut slots, key) {
            None => Ok(Vec::new()),
            Some(Slot {
                value: Value::Scored(set),
                ..
            }) => {
                let mut members: Vec<(String, f64)> = set
                    .iter()
                    .filter(|(_, score)| **score >= min && **score <= max)
                    .map(|(member, score)| (member.clone(), *score))
                    .collect();
                members.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
                Ok(members)
            }
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn remove_score_range(&self, key: &str, min: f64, max: f64) -> Result<u64> {
        let mut slots = self.lock()?;
        let (removed, now_empty) = match live(&mut slots, key) {
            None => return Ok(0),
            Some(Slot {
                value: Value::Scored(set),
                ..
            }) => {
                let before = set.len();
                set.retain(|_, score| *score < min || *score > max);
                ((before - set.len()) as u64, set.is_empty())
            }
            Some(_) => return Err(wrong_type(key)),
        };
        // Redis drops empty sorted sets.
        if now_empty {
            slots.remove(key);
        }
        Ok(removed)
    }

    async fn set_add(&self, key: &str, members: &[String]) -> Result<()> {
        let mut slots = self.lock()?;
        if live(&mut slots, key).is_none() {
            slots.insert(
                key.to_owned(),
                Slot {
                    value: Value::Set(BTreeSet::new()),
                    expires_at: None,
                },
            );
        }
        match slots.get_mut(key) {
            Some(Slot {
                value: Value::Set(set),
                ..
            }) => {
                set.extend(members.iter().cloned());
                Ok(())
            }
            _ => Err(wrong_type(key)),
        }
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        let mut slots = self.lock()?;
        match live(&mut slots, key) {
            None => Ok(Vec::new()),
            Some(Slot {
                value: Value::Set(set),
                ..
            }) => Ok(set.iter().cloned().collect()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let matcher = Glob::new(pattern)
            .map_err(|e| GovernanceError::InvalidInput(format!("invalid key pattern: {e}")))?
            .compile_matcher();
        let now = Instant::now();
        let slots = self.lock()?;
        let mut keys: Vec<String> = slots
            .iter()
            .filter(|(key, slot)| slot.is_live(now) && matcher.is_match(key.as_str()))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}
