use std::sync::RwLock;

use rustc_hash::FxHashMap;

use super::StateStore;
use crate::error::{StoreError, StoreResult};

/// In-memory state store for tests and ephemeral pipelines
#[derive(Default)]
pub struct MemoryStore {
    data: RwLock<FxHashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StateStore for MemoryStore {
    fn put(&self, key: &str, value: &[u8]) -> StoreResult<()> {
        let mut data = self
            .data
            .write()
            .map_err(|e| StoreError::Io(e.to_string()))?;
        data.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let data = self
            .data
            .read()
            .map_err(|e| StoreError::Io(e.to_string()))?;
        Ok(data.get(key).cloned())
    }

    fn delete(&self, key: &str) -> StoreResult<()> {
        let mut data = self
            .data
            .write()
            .map_err(|e| StoreError::Io(e.to_string()))?;
        data.remove(key);
        Ok(())
    }

    fn keys(&self) -> StoreResult<Vec<String>> {
        let data = self
            .data
            .read()
            .map_err(|e| StoreError::Io(e.to_string()))?;
        Ok(data.keys().cloned().collect())
    }

    fn flush(&self) -> StoreResult<()> {
        Ok(()) // No-op for memory store
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_put_get_delete() {
        let store = MemoryStore::new();

        store.put("a", b"one").unwrap();
        assert_eq!(store.get("a").unwrap(), Some(b"one".to_vec()));

        store.put("a", b"two").unwrap();
        assert_eq!(store.get("a").unwrap(), Some(b"two".to_vec()));
        assert_eq!(store.len().unwrap(), 1);

        store.delete("a").unwrap();
        assert!(store.get("a").unwrap().is_none());
        assert!(store.is_empty().unwrap());

        // Deleting a missing key is fine
        store.delete("missing").unwrap();
    }
}
