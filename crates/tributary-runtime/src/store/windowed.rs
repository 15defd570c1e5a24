//! Time-indexed keyed store with bounded retention
//!
//! Each group key maps to its entries sorted by timestamp, stored as one value
//! through the ordinary [`StateStore`] contract so any backend (and its
//! changelog) can hold it. Stream time, the highest timestamp observed, is
//! persisted alongside so retention survives a restart.

use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::trace;

use super::{encode_key, is_reserved_key, StateStore};
use crate::error::StoreResult;

/// Reserved key, so it cannot collide with an encoded key or be evicted.
const STREAM_TIME_KEY: &str = "#stream-time";

/// A value retained at a timestamp
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowEntry<V> {
    pub timestamp_ms: i64,
    pub value: V,
}

/// Keyed store additionally indexed by time
pub struct WindowedStore<K, V> {
    store: Arc<dyn StateStore>,
    retain_ms: i64,
    stream_time: Option<i64>,
    _marker: PhantomData<fn(K) -> V>,
}

impl<K, V> WindowedStore<K, V>
where
    K: Serialize,
    V: Serialize + DeserializeOwned + Clone,
{
    /// Wrap `store`, keeping entries for `retain_ms` behind stream time.
    pub fn new(store: Arc<dyn StateStore>, retain_ms: i64) -> StoreResult<Self> {
        let stream_time = match store.get(STREAM_TIME_KEY)? {
            Some(bytes) => Some(serde_json::from_slice(&bytes)?),
            None => None,
        };
        Ok(Self {
            store,
            retain_ms,
            stream_time,
            _marker: PhantomData,
        })
    }

    pub fn retain_ms(&self) -> i64 {
        self.retain_ms
    }

    pub fn stream_time(&self) -> Option<i64> {
        self.stream_time
    }

    /// Advance stream time to `timestamp_ms` if it is newer.
    pub fn observe(&mut self, timestamp_ms: i64) -> StoreResult<()> {
        if self.stream_time.map_or(true, |t| timestamp_ms > t) {
            self.stream_time = Some(timestamp_ms);
            self.store
                .put(STREAM_TIME_KEY, &serde_json::to_vec(&timestamp_ms)?)?;
        }
        Ok(())
    }

    /// Entries strictly older than this are no longer retained.
    pub fn retention_bound(&self) -> Option<i64> {
        self.stream_time.map(|t| t.saturating_sub(self.retain_ms))
    }

    pub fn is_expired(&self, timestamp_ms: i64) -> bool {
        self.retention_bound().is_some_and(|bound| timestamp_ms < bound)
    }

    /// Retain `value` for `key` at `timestamp_ms`, dropping that key's
    /// expired entries.
    pub fn put(&mut self, key: &K, value: V, timestamp_ms: i64) -> StoreResult<()> {
        let store_key = encode_key(key)?;
        let mut entries = self.load(&store_key)?;
        self.drop_expired(&mut entries);

        let idx = entries.partition_point(|e| e.timestamp_ms <= timestamp_ms);
        entries.insert(
            idx,
            WindowEntry {
                timestamp_ms,
                value,
            },
        );
        self.save(&store_key, &entries)
    }

    /// Retained entries for `key` with timestamps in `[from_ms, to_ms]`, in
    /// timestamp order.
    pub fn fetch(&self, key: &K, from_ms: i64, to_ms: i64) -> StoreResult<Vec<WindowEntry<V>>> {
        let store_key = encode_key(key)?;
        let lower = match self.retention_bound() {
            Some(bound) => from_ms.max(bound),
            None => from_ms,
        };
        if lower > to_ms {
            return Ok(Vec::new());
        }
        let entries = self.load(&store_key)?;
        let start = entries.partition_point(|e| e.timestamp_ms < lower);
        let end = entries.partition_point(|e| e.timestamp_ms <= to_ms);
        Ok(entries
            .get(start..end)
            .map(<[WindowEntry<V>]>::to_vec)
            .unwrap_or_default())
    }

    /// Drop expired entries for every key. Returns how many were removed.
    pub fn purge_expired(&mut self) -> StoreResult<usize> {
        let mut removed = 0;
        for store_key in self.store.keys()? {
            if is_reserved_key(&store_key) {
                continue;
            }
            let mut entries = self.load(&store_key)?;
            let before = entries.len();
            self.drop_expired(&mut entries);
            if entries.len() != before {
                removed += before - entries.len();
                self.save(&store_key, &entries)?;
            }
        }
        if removed > 0 {
            trace!("Purged {} expired window entries", removed);
        }
        Ok(removed)
    }

    fn drop_expired(&self, entries: &mut Vec<WindowEntry<V>>) {
        if let Some(bound) = self.retention_bound() {
            let cut = entries.partition_point(|e| e.timestamp_ms < bound);
            if cut > 0 {
                entries.drain(..cut);
            }
        }
    }

    fn load(&self, store_key: &str) -> StoreResult<Vec<WindowEntry<V>>> {
        match self.store.get(store_key)? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(Vec::new()),
        }
    }

    fn save(&self, store_key: &str, entries: &[WindowEntry<V>]) -> StoreResult<()> {
        if entries.is_empty() {
            self.store.delete(store_key)
        } else {
            self.store.put(store_key, &serde_json::to_vec(entries)?)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn windowed(retain_ms: i64) -> (Arc<MemoryStore>, WindowedStore<String, i64>) {
        let raw = Arc::new(MemoryStore::new());
        let store = WindowedStore::new(raw.clone() as Arc<dyn StateStore>, retain_ms).unwrap();
        (raw, store)
    }

    #[test]
    fn test_fetch_range_is_inclusive_and_ordered() {
        let (_, mut store) = windowed(1_000);
        let key = "k".to_string();
        for (ts, v) in [(30, 3), (10, 1), (20, 2), (40, 4)] {
            store.observe(ts).unwrap();
            store.put(&key, v, ts).unwrap();
        }

        let hits: Vec<i64> = store
            .fetch(&key, 10, 30)
            .unwrap()
            .into_iter()
            .map(|e| e.value)
            .collect();
        assert_eq!(hits, vec![1, 2, 3]);
        assert!(store.fetch(&"other".to_string(), 0, 100).unwrap().is_empty());
    }

    #[test]
    fn test_entries_expire_behind_stream_time() {
        let (_, mut store) = windowed(100);
        let key = "k".to_string();
        store.observe(0).unwrap();
        store.put(&key, 1, 0).unwrap();

        store.observe(100).unwrap();
        assert_eq!(store.fetch(&key, 0, 200).unwrap().len(), 1);

        store.observe(101).unwrap();
        assert!(store.is_expired(0));
        assert!(store.fetch(&key, 0, 200).unwrap().is_empty());
    }

    #[test]
    fn test_purge_removes_expired_keys() {
        let (raw, mut store) = windowed(10);
        store.observe(0).unwrap();
        store.put(&"a".to_string(), 1, 0).unwrap();
        store.put(&"b".to_string(), 2, 0).unwrap();
        store.observe(50).unwrap();
        store.put(&"c".to_string(), 3, 50).unwrap();

        assert_eq!(store.purge_expired().unwrap(), 2);
        // Only "c" and the stream time marker remain
        assert_eq!(raw.len().unwrap(), 2);
    }

    #[test]
    fn test_stream_time_survives_reopen() {
        let raw: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        {
            let mut store: WindowedStore<String, i64> =
                WindowedStore::new(Arc::clone(&raw), 10).unwrap();
            store.observe(500).unwrap();
            store.observe(200).unwrap(); // older, ignored
        }
        let store: WindowedStore<String, i64> = WindowedStore::new(raw, 10).unwrap();
        assert_eq!(store.stream_time(), Some(500));
        assert_eq!(store.retention_bound(), Some(490));
    }
}
