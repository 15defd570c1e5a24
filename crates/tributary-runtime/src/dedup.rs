//! Last-seen deduplication per group key

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::trace;

use crate::error::{ConfigError, OperatorError, OperatorResult};
use crate::metrics::{observe, OperatorMetrics};
use crate::processor::{KeyFn, ProcessorContext, Transformer};
use crate::store::{store_name, TypedStore};

/// Compares the stored and current value of a group
pub type ValueEq<K, V> = Arc<dyn Fn(&K, &V, &V) -> bool + Send + Sync>;

/// Configuration for [`DedupOperator`]
pub struct DedupConfig<K, V, GK> {
    group_key: Option<KeyFn<K, V, GK>>,
    dedup_value: Option<ValueEq<K, V>>,
}

impl<K, V, GK> Default for DedupConfig<K, V, GK> {
    fn default() -> Self {
        Self {
            group_key: None,
            dedup_value: None,
        }
    }
}

impl<K: 'static, V: 'static, GK> DedupConfig<K, V, GK> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn group_key<F>(mut self, f: F) -> Self
    where
        F: Fn(&K, &V) -> GK + Send + Sync + 'static,
    {
        self.group_key = Some(Arc::new(f));
        self
    }

    /// Only suppress a record whose projection equals that of the last
    /// record seen for its group. Without this, every record after the first
    /// in a group is suppressed.
    pub fn dedup_value<DV, F>(mut self, f: F) -> Self
    where
        DV: PartialEq + 'static,
        F: Fn(&K, &V) -> DV + Send + Sync + 'static,
    {
        self.dedup_value = Some(Arc::new(move |k: &K, stored: &V, current: &V| {
            f(k, stored) == f(k, current)
        }));
        self
    }
}

/// Suppresses records that duplicate the last-seen record of their group.
///
/// The store is overwritten on every call, suppressed or not, so "last seen"
/// always reflects the newest record.
pub struct DedupOperator<K, V, GK> {
    name: String,
    group_key: KeyFn<K, V, GK>,
    dedup_value: Option<ValueEq<K, V>>,
    store: Option<TypedStore<V>>,
    metrics: Option<OperatorMetrics>,
}

impl<K, V, GK> DedupOperator<K, V, GK>
where
    V: Serialize + DeserializeOwned + Clone,
    GK: Serialize,
{
    pub fn new(base_name: &str, config: DedupConfig<K, V, GK>) -> Result<Self, ConfigError> {
        let group_key = config.group_key.ok_or(ConfigError::MissingParameter {
            operator: "dedup",
            parameter: "group_key",
        })?;
        Ok(Self {
            name: store_name(base_name, "dedup"),
            group_key,
            dedup_value: config.dedup_value,
            store: None,
            metrics: None,
        })
    }
}

impl<K, V, GK> Transformer<K, V> for DedupOperator<K, V, GK>
where
    V: Serialize + DeserializeOwned + Clone,
    GK: Serialize,
{
    type Output = V;

    fn name(&self) -> &str {
        &self.name
    }

    fn init(&mut self, ctx: &ProcessorContext) -> Result<(), ConfigError> {
        self.store = Some(TypedStore::new(ctx.state_store(&self.name)?));
        self.metrics = ctx.operator_metrics(&self.name);
        Ok(())
    }

    fn transform(&mut self, key: &K, value: &V) -> OperatorResult<Option<V>> {
        let store = self
            .store
            .as_ref()
            .ok_or_else(|| OperatorError::NotInitialized(self.name.clone()))?;

        let group = (self.group_key)(key, value);
        let previous = store.get(&group)?;
        store.put(&group, value)?;

        let output = match (previous, &self.dedup_value) {
            (None, _) => Some(value.clone()),
            (Some(_), None) => None,
            (Some(stored), Some(same)) => {
                if same(key, &stored, value) {
                    None
                } else {
                    Some(value.clone())
                }
            }
        };

        if output.is_none() {
            trace!("{}: suppressed duplicate", self.name);
        }
        observe(self.metrics.as_ref(), &output);
        Ok(output)
    }
}
