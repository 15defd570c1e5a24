//! Operator lifecycle shared by the single-input operators

use std::sync::Arc;

use crate::config::RuntimeConfig;
use crate::error::{ConfigError, OperatorResult};
use crate::metrics::{Metrics, OperatorMetrics};
use crate::store::{StateStore, StoreRegistry};

/// Derives a value (usually a group key) from a keyed record
pub type KeyFn<K, V, T> = Arc<dyn Fn(&K, &V) -> T + Send + Sync>;

/// Boolean test over a keyed record
pub type Predicate<K, V> = Arc<dyn Fn(&K, &V) -> bool + Send + Sync>;

/// Shard-level handles an operator acquires during `init`
#[derive(Clone)]
pub struct ProcessorContext {
    registry: Arc<StoreRegistry>,
    metrics: Option<Metrics>,
}

impl ProcessorContext {
    pub fn new(registry: Arc<StoreRegistry>) -> Self {
        Self {
            registry,
            metrics: None,
        }
    }

    /// Memory-backed stores and no metrics
    pub fn in_memory() -> Self {
        Self::new(Arc::new(StoreRegistry::in_memory()))
    }

    /// Build a context from runtime configuration.
    pub fn from_config(config: &RuntimeConfig) -> Self {
        let ctx = Self::new(Arc::new(StoreRegistry::new(config.store.clone())));
        if config.metrics_enabled {
            ctx.with_metrics(Metrics::new())
        } else {
            ctx
        }
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn registry(&self) -> &Arc<StoreRegistry> {
        &self.registry
    }

    pub fn metrics(&self) -> Option<&Metrics> {
        self.metrics.as_ref()
    }

    /// Claim the named store for the calling operator.
    pub fn state_store(&self, name: &str) -> Result<Arc<dyn StateStore>, ConfigError> {
        self.registry.claim(name)
    }

    pub(crate) fn operator_metrics(&self, name: &str) -> Option<OperatorMetrics> {
        self.metrics.as_ref().map(|m| m.operator(name))
    }
}

/// A stateful keyed operator with one input stream.
///
/// `transform` is called once per record, in arrival order for a shard.
/// Returning `Ok(None)` consumes the record without output.
pub trait Transformer<K, V> {
    type Output;

    /// Operator name; also the name of its state store.
    fn name(&self) -> &str;

    /// Acquire state stores. Must be called before `transform`.
    fn init(&mut self, ctx: &ProcessorContext) -> Result<(), ConfigError>;

    fn transform(&mut self, key: &K, value: &V) -> OperatorResult<Option<Self::Output>>;

    fn close(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{StoreBackend, StoreConfig};

    #[test]
    fn test_context_claims_each_store_once() {
        let ctx = ProcessorContext::in_memory();
        ctx.state_store("orders-dedup").unwrap();
        assert!(ctx.state_store("orders-dedup").is_err());
        assert!(ctx.state_store("orders-sequence").is_ok());
    }

    #[test]
    fn test_context_from_config() {
        let config = RuntimeConfig {
            metrics_enabled: true,
            store: StoreConfig {
                backend: StoreBackend::Memory,
                eviction: None,
            },
            ..Default::default()
        };
        let ctx = ProcessorContext::from_config(&config);
        assert!(ctx.metrics().is_some());
        assert!(ctx.operator_metrics("x").is_some());

        let ctx = ProcessorContext::from_config(&RuntimeConfig::default());
        assert!(ctx.metrics().is_none());
    }
}
