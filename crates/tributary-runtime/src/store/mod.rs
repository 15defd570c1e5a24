//! Keyed state stores backing every operator
//!
//! Operators talk to state only through the [`StateStore`] contract:
//! `get`, `put` and `delete` of opaque bytes under a string key. Backends:
//!
//! - [`MemoryStore`]: in-process map, for tests and ephemeral pipelines
//! - [`FileStore`]: one file per key, atomic temp-file + rename writes
//! - [`ChangelogStore`]: in-memory table replicated to an append-only
//!   [`Changelog`] and fully replayed on open
//!
//! [`EvictingStore`] adds an optional size/age bound on top of any backend and
//! [`WindowedStore`] layers a time index over the same contract.
//!
//! # Example
//! ```rust
//! use tributary_runtime::store::{ChangelogStore, MemoryChangelog, StateStore};
//!
//! let log = MemoryChangelog::new();
//! let store = ChangelogStore::open("orders-dedup", Box::new(log.clone())).unwrap();
//! store.put("k", b"v1").unwrap();
//! drop(store);
//!
//! // A restarted shard sees the replayed state before processing anything.
//! let restored = ChangelogStore::open("orders-dedup", Box::new(log)).unwrap();
//! assert_eq!(restored.get("k").unwrap(), Some(b"v1".to_vec()));
//! ```

mod changelog;
mod eviction;
mod file;
mod memory;
mod registry;
mod windowed;

pub use changelog::{
    Changelog, ChangelogEntry, ChangelogStore, FileChangelog, MemoryChangelog,
};
pub use eviction::{Clock, EvictingStore, EvictionPolicy};
pub use file::FileStore;
pub use memory::MemoryStore;
pub use registry::{StoreBackend, StoreConfig, StoreRegistry};
pub use windowed::{WindowEntry, WindowedStore};

use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::StoreResult;

/// Trait for state storage backends
pub trait StateStore: Send + Sync {
    /// Store a value, replacing any previous one
    fn put(&self, key: &str, value: &[u8]) -> StoreResult<()>;

    /// Retrieve a value
    fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;

    /// Delete a key. Deleting a missing key is not an error.
    fn delete(&self, key: &str) -> StoreResult<()>;

    /// All keys currently held, in no particular order
    fn keys(&self) -> StoreResult<Vec<String>>;

    /// Flush pending writes to durable storage
    fn flush(&self) -> StoreResult<()>;

    fn len(&self) -> StoreResult<usize> {
        Ok(self.keys()?.len())
    }

    fn is_empty(&self) -> StoreResult<bool> {
        Ok(self.len()? == 0)
    }
}

/// Keys starting with this character hold store metadata. [`encode_key`]
/// output never does, and [`EvictingStore`] never evicts them.
pub const RESERVED_KEY_PREFIX: char = '#';

pub fn is_reserved_key(key: &str) -> bool {
    key.starts_with(RESERVED_KEY_PREFIX)
}

/// Derive a store name from a pipeline base name and an operator suffix,
/// e.g. `store_name("orders", "dedup") == "orders-dedup"`.
pub fn store_name(base: &str, suffix: &str) -> String {
    format!("{}-{}", base, suffix)
}

/// Canonical store key for a group key: its JSON encoding.
pub fn encode_key<G: Serialize + ?Sized>(key: &G) -> StoreResult<String> {
    Ok(serde_json::to_string(key)?)
}

/// Typed view over a byte store using a JSON codec.
pub struct TypedStore<T> {
    inner: Arc<dyn StateStore>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for TypedStore<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            _marker: PhantomData,
        }
    }
}

impl<T: Serialize + DeserializeOwned> TypedStore<T> {
    pub fn new(inner: Arc<dyn StateStore>) -> Self {
        Self {
            inner,
            _marker: PhantomData,
        }
    }

    pub fn get<G: Serialize + ?Sized>(&self, key: &G) -> StoreResult<Option<T>> {
        let key = encode_key(key)?;
        match self.inner.get(&key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put<G: Serialize + ?Sized>(&self, key: &G, value: &T) -> StoreResult<()> {
        let key = encode_key(key)?;
        let bytes = serde_json::to_vec(value)?;
        self.inner.put(&key, &bytes)
    }

    pub fn delete<G: Serialize + ?Sized>(&self, key: &G) -> StoreResult<()> {
        let key = encode_key(key)?;
        self.inner.delete(&key)
    }

    pub fn inner(&self) -> &Arc<dyn StateStore> {
        &self.inner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Position {
        symbol: String,
        qty: i64,
    }

    #[test]
    fn test_store_name() {
        assert_eq!(store_name("orders", "dedup"), "orders-dedup");
        assert_eq!(store_name("trades", "join-left"), "trades-join-left");
    }

    #[test]
    fn test_typed_store_round_trip() {
        let store: TypedStore<Position> = TypedStore::new(Arc::new(MemoryStore::new()));
        let pos = Position {
            symbol: "BTC".into(),
            qty: 3,
        };

        assert_eq!(store.get("acct-1").unwrap(), None);
        store.put("acct-1", &pos).unwrap();
        assert_eq!(store.get("acct-1").unwrap(), Some(pos));

        store.delete("acct-1").unwrap();
        assert_eq!(store.get("acct-1").unwrap(), None);
    }

    #[test]
    fn test_typed_store_structured_keys_do_not_collide() {
        let store: TypedStore<i64> = TypedStore::new(Arc::new(MemoryStore::new()));
        store.put(&(1, "a"), &1).unwrap();
        store.put(&(1, "b"), &2).unwrap();
        store.put("1a", &3).unwrap();

        assert_eq!(store.get(&(1, "a")).unwrap(), Some(1));
        assert_eq!(store.get(&(1, "b")).unwrap(), Some(2));
        assert_eq!(store.get("1a").unwrap(), Some(3));
        assert_eq!(store.inner().len().unwrap(), 3);
    }

    #[test]
    fn test_typed_store_reports_corrupt_values() {
        let raw = Arc::new(MemoryStore::new());
        raw.put(&encode_key("k").unwrap(), b"not json").unwrap();
        let store: TypedStore<Position> = TypedStore::new(raw);
        assert!(matches!(
            store.get("k"),
            Err(crate::error::StoreError::Serialization(_))
        ));
    }
}
