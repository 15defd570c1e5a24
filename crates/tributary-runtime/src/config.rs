//! Runtime configuration
//!
//! Supports both YAML and TOML files.
//!
//! # Example YAML configuration
//! ```yaml
//! # Where operator state lives
//! store:
//!   backend:
//!     type: changelog
//!     dir: /var/lib/tributary
//!     sync_writes: true
//!   eviction:
//!     max_entries: 100000
//!
//! metrics_enabled: true
//!
//! statistics:
//!   - name: trades
//!     group_by: [symbol]
//!     expressions:
//!       - kind: median
//!         field: price
//!       - kind: percentile
//!         field: latency_ms
//!         p: 99
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::aggregation::StatisticsSpec;
use crate::error::ConfigError;
use crate::store::StoreConfig;

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Store backend and eviction shared by every operator of a shard
    pub store: StoreConfig,

    /// Register per-operator Prometheus counters
    pub metrics_enabled: bool,

    /// Statistics operators defined declaratively
    pub statistics: Vec<StatisticsSpec>,
}

impl RuntimeConfig {
    /// Load configuration from a file (YAML or TOML, auto-detected by extension)
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e.to_string()))?;

        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();

        match extension.as_str() {
            "yaml" | "yml" => Self::from_yaml(&content),
            "toml" => Self::from_toml(&content),
            _ => Self::from_yaml(&content).or_else(|_| Self::from_toml(&content)),
        }
    }

    /// Parse configuration from YAML string
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Parse configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }
}
