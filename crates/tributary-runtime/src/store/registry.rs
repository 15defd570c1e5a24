use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::info;

use super::{
    ChangelogStore, EvictingStore, EvictionPolicy, FileChangelog, FileStore, MemoryStore,
    StateStore,
};
use crate::error::{ConfigError, StoreError};

/// Which backend newly created stores use
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreBackend {
    /// Process memory; state is lost on restart
    #[default]
    Memory,
    /// One directory per store, one file per key
    File { dir: PathBuf },
    /// One changelog file per store under `dir`, replayed on open
    Changelog {
        dir: PathBuf,
        #[serde(default)]
        sync_writes: bool,
    },
}

/// Store settings shared by every store a registry creates
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub eviction: Option<EvictionPolicy>,
}

/// Named stores of one shard.
///
/// A store name can be claimed by exactly one operator; a second claim is a
/// setup error. Stores registered up front (for example over a shared
/// changelog) are handed out on first claim instead of being created.
pub struct StoreRegistry {
    config: StoreConfig,
    stores: Mutex<HashMap<String, Arc<dyn StateStore>>>,
    claimed: Mutex<HashSet<String>>,
}

impl StoreRegistry {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            stores: Mutex::new(HashMap::new()),
            claimed: Mutex::new(HashSet::new()),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(StoreConfig::default())
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Make a pre-built store available under `name`.
    pub fn register(&self, name: &str, store: Arc<dyn StateStore>) -> Result<(), ConfigError> {
        let mut stores = self
            .stores
            .lock()
            .map_err(|e| StoreError::Io(e.to_string()))?;
        if stores.contains_key(name) {
            return Err(ConfigError::DuplicateStoreName(name.to_string()));
        }
        stores.insert(name.to_string(), store);
        Ok(())
    }

    /// Claim `name` for one operator, creating the store if needed.
    ///
    /// Changelog-backed stores are fully restored before this returns. A
    /// claim whose store fails to open leaves the name free for a retry.
    pub fn claim(&self, name: &str) -> Result<Arc<dyn StateStore>, ConfigError> {
        let mut claimed = self
            .claimed
            .lock()
            .map_err(|e| StoreError::Io(e.to_string()))?;
        if claimed.contains(name) {
            return Err(ConfigError::DuplicateStoreName(name.to_string()));
        }

        let mut stores = self
            .stores
            .lock()
            .map_err(|e| StoreError::Io(e.to_string()))?;
        let store = match stores.get(name) {
            Some(store) => Arc::clone(store),
            None => {
                let store = self.open_store(name)?;
                stores.insert(name.to_string(), Arc::clone(&store));
                store
            }
        };

        claimed.insert(name.to_string());
        Ok(store)
    }

    /// Look up an already created or registered store.
    pub fn get(&self, name: &str) -> Result<Arc<dyn StateStore>, StoreError> {
        let stores = self
            .stores
            .lock()
            .map_err(|e| StoreError::Io(e.to_string()))?;
        stores
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::UnknownStore(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .stores
            .lock()
            .map(|s| s.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Flush every store
    pub fn flush_all(&self) -> Result<(), StoreError> {
        let stores = self
            .stores
            .lock()
            .map_err(|e| StoreError::Io(e.to_string()))?;
        for store in stores.values() {
            store.flush()?;
        }
        Ok(())
    }

    fn open_store(&self, name: &str) -> Result<Arc<dyn StateStore>, StoreError> {
        let base: Arc<dyn StateStore> = match &self.config.backend {
            StoreBackend::Memory => Arc::new(MemoryStore::new()),
            StoreBackend::File { dir } => Arc::new(FileStore::open(dir.join(name))?),
            StoreBackend::Changelog { dir, sync_writes } => {
                let log = FileChangelog::open(dir.join(format!("{}.changelog", name)))?
                    .with_sync_writes(*sync_writes);
                Arc::new(ChangelogStore::open(name, Box::new(log))?)
            }
        };

        let store: Arc<dyn StateStore> = match &self.config.eviction {
            Some(policy) if !policy.is_unbounded() => {
                Arc::new(EvictingStore::new(base, policy.clone())?)
            }
            _ => base,
        };

        info!("Opened store '{}' ({:?})", name, self.config.backend);
        Ok(store)
    }
}
