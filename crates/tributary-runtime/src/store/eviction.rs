//! Store-level eviction for keys that would otherwise grow without bound
//!
//! Sliding sequences that never fill, percentile samples and mode frequency
//! tables all accumulate per group key forever. Rather than teaching each
//! operator about TTLs, an [`EvictingStore`] bounds the key space of whatever
//! store it wraps. Evictions are ordinary deletes on the inner store, so a
//! changelog-backed store replicates them like any other write.
//!
//! Reserved metadata keys (see [`is_reserved_key`]) pass straight through
//! and are never evicted.
//!
//! Eviction trades replay determinism for bounded state: a key evicted by age
//! depends on wall-clock time, so keep it off for pipelines that must replay
//! bit-identically.

use std::sync::{Arc, Mutex};

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{is_reserved_key, StateStore};
use crate::error::{StoreError, StoreResult};

/// Source of "now" in milliseconds since epoch
pub type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

/// Bounds applied to a store's key space
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvictionPolicy {
    /// Keep at most this many keys; least recently written go first
    pub max_entries: Option<usize>,
    /// Drop keys not written for longer than this many milliseconds
    pub max_age_ms: Option<i64>,
}

impl EvictionPolicy {
    pub fn max_entries(max_entries: usize) -> Self {
        Self {
            max_entries: Some(max_entries),
            max_age_ms: None,
        }
    }

    pub fn max_age_ms(max_age_ms: i64) -> Self {
        Self {
            max_entries: None,
            max_age_ms: Some(max_age_ms),
        }
    }

    pub fn is_unbounded(&self) -> bool {
        self.max_entries.is_none() && self.max_age_ms.is_none()
    }
}

/// Wraps a store and evicts keys according to an [`EvictionPolicy`]
pub struct EvictingStore {
    inner: Arc<dyn StateStore>,
    policy: EvictionPolicy,
    clock: Clock,
    /// key -> last write time, ordered from least to most recently written
    last_written: Mutex<IndexMap<String, i64>>,
}

impl EvictingStore {
    pub fn new(inner: Arc<dyn StateStore>, policy: EvictionPolicy) -> StoreResult<Self> {
        Self::with_clock(
            inner,
            policy,
            Arc::new(|| chrono::Utc::now().timestamp_millis()),
        )
    }

    /// Use a custom clock. Keys already present in `inner` are treated as
    /// written at construction time.
    pub fn with_clock(
        inner: Arc<dyn StateStore>,
        policy: EvictionPolicy,
        clock: Clock,
    ) -> StoreResult<Self> {
        let now = clock();
        let mut keys = inner.keys()?;
        keys.retain(|k| !is_reserved_key(k));
        keys.sort();
        let last_written = keys.into_iter().map(|k| (k, now)).collect();
        let store = Self {
            inner,
            policy,
            clock,
            last_written: Mutex::new(last_written),
        };
        store.evict()?;
        Ok(store)
    }

    pub fn policy(&self) -> &EvictionPolicy {
        &self.policy
    }

    /// Apply the policy now. Returns the number of evicted keys.
    pub fn evict(&self) -> StoreResult<usize> {
        let mut tracked = self
            .last_written
            .lock()
            .map_err(|e| StoreError::Io(e.to_string()))?;
        self.evict_locked(&mut tracked)
    }

    fn evict_locked(&self, tracked: &mut IndexMap<String, i64>) -> StoreResult<usize> {
        let mut evicted = 0;

        if let Some(max_age) = self.policy.max_age_ms {
            let cutoff = (self.clock)() - max_age;
            while let Some((key, written)) = tracked.first() {
                if *written >= cutoff {
                    break;
                }
                let key = key.clone();
                self.inner.delete(&key)?;
                tracked.shift_remove(&key);
                evicted += 1;
            }
        }

        if let Some(max_entries) = self.policy.max_entries {
            while tracked.len() > max_entries {
                let Some((key, _)) = tracked.shift_remove_index(0) else {
                    break;
                };
                self.inner.delete(&key)?;
                evicted += 1;
            }
        }

        if evicted > 0 {
            debug!("Evicted {} keys ({} remain)", evicted, tracked.len());
        }
        Ok(evicted)
    }
}

impl StateStore for EvictingStore {
    fn put(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        if is_reserved_key(key) {
            return self.inner.put(key, value);
        }
        let mut tracked = self
            .last_written
            .lock()
            .map_err(|e| StoreError::Io(e.to_string()))?;
        self.inner.put(key, value)?;
        // Re-insert so the key moves to the most-recent end
        tracked.shift_remove(key);
        tracked.insert(key.to_string(), (self.clock)());
        self.evict_locked(&mut tracked)?;
        Ok(())
    }

    fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        self.inner.get(key)
    }

    fn delete(&self, key: &str) -> StoreResult<()> {
        let mut tracked = self
            .last_written
            .lock()
            .map_err(|e| StoreError::Io(e.to_string()))?;
        self.inner.delete(key)?;
        tracked.shift_remove(key);
        Ok(())
    }

    fn keys(&self) -> StoreResult<Vec<String>> {
        self.inner.keys()
    }

    fn flush(&self) -> StoreResult<()> {
        self.inner.flush()
    }
}
