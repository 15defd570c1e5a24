//! Fixed-size sliding window per group key
//!
//! A single rolling buffer per group holds the most recent `size` values.
//! Once full, every arrival produces one aggregate over exactly the trailing
//! `size` values, then the oldest value is dropped.
//!
//! Groups that never reach `size` keep their partial buffer indefinitely;
//! bound them with an [`EvictionPolicy`](crate::store::EvictionPolicy) on the
//! store.

use std::collections::VecDeque;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::trace;

use crate::error::{ConfigError, OperatorError, OperatorResult};
use crate::metrics::{observe, OperatorMetrics};
use crate::processor::{KeyFn, ProcessorContext, Transformer};
use crate::store::{store_name, TypedStore};

/// Aggregate over a full window. May mutate the buffered values; mutations
/// are persisted.
pub type SequenceAggregate<GK, V, VR> = Arc<dyn Fn(&GK, &mut [V]) -> VR + Send + Sync>;

/// Configuration for [`SequenceOperator`]
pub struct SequenceConfig<K, V, GK, VR> {
    group_key: Option<KeyFn<K, V, GK>>,
    size: Option<usize>,
    aggregate: Option<SequenceAggregate<GK, V, VR>>,
}

impl<K, V, GK, VR> Default for SequenceConfig<K, V, GK, VR> {
    fn default() -> Self {
        Self {
            group_key: None,
            size: None,
            aggregate: None,
        }
    }
}

impl<K, V, GK, VR> SequenceConfig<K, V, GK, VR> {
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

    pub fn size(mut self, size: usize) -> Self {
        self.size = Some(size);
        self
    }

    pub fn aggregate<F>(mut self, f: F) -> Self
    where
        F: Fn(&GK, &mut [V]) -> VR + Send + Sync + 'static,
    {
        self.aggregate = Some(Arc::new(f));
        self
    }
}

/// Emits a rolling aggregate over the last `size` values of each group.
pub struct SequenceOperator<K, V, GK, VR> {
    name: String,
    group_key: KeyFn<K, V, GK>,
    size: usize,
    aggregate: SequenceAggregate<GK, V, VR>,
    store: Option<TypedStore<VecDeque<V>>>,
    metrics: Option<OperatorMetrics>,
}

impl<K, V, GK, VR> SequenceOperator<K, V, GK, VR>
where
    V: Serialize + DeserializeOwned,
    GK: Serialize,
{
    pub fn new(base_name: &str, config: SequenceConfig<K, V, GK, VR>) -> Result<Self, ConfigError> {
        const OPERATOR: &str = "sequence";
        let group_key = config.group_key.ok_or(ConfigError::MissingParameter {
            operator: OPERATOR,
            parameter: "group_key",
        })?;
        let size = config.size.ok_or(ConfigError::MissingParameter {
            operator: OPERATOR,
            parameter: "size",
        })?;
        if size == 0 {
            return Err(ConfigError::InvalidParameter {
                operator: OPERATOR,
                parameter: "size",
                reason: "must be greater than zero".to_string(),
            });
        }
        let aggregate = config.aggregate.ok_or(ConfigError::MissingParameter {
            operator: OPERATOR,
            parameter: "aggregate",
        })?;

        Ok(Self {
            name: store_name(base_name, "sequence"),
            group_key,
            size,
            aggregate,
            store: None,
            metrics: None,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

impl<K, V, GK, VR> Transformer<K, V> for SequenceOperator<K, V, GK, VR>
where
    V: Serialize + DeserializeOwned + Clone,
    GK: Serialize,
{
    type Output = VR;

    fn name(&self) -> &str {
        &self.name
    }

    fn init(&mut self, ctx: &ProcessorContext) -> Result<(), ConfigError> {
        self.store = Some(TypedStore::new(ctx.state_store(&self.name)?));
        self.metrics = ctx.operator_metrics(&self.name);
        Ok(())
    }

    fn transform(&mut self, key: &K, value: &V) -> OperatorResult<Option<VR>> {
        let store = self
            .store
            .as_ref()
            .ok_or_else(|| OperatorError::NotInitialized(self.name.clone()))?;

        let group = (self.group_key)(key, value);
        let mut buffer = store.get(&group)?.unwrap_or_default();
        buffer.push_back(value.clone());

        if buffer.len() < self.size {
            trace!("{}: buffering {}/{}", self.name, buffer.len(), self.size);
            store.put(&group, &buffer)?;
            observe(self.metrics.as_ref(), &None::<()>);
            return Ok(None);
        }

        // A buffer persisted under a larger size is trimmed to the current one
        while buffer.len() > self.size {
            buffer.pop_front();
        }

        let result = (self.aggregate)(&group, buffer.make_contiguous());
        buffer.pop_front();
        store.put(&group, &buffer)?;

        let output = Some(result);
        observe(self.metrics.as_ref(), &output);
        Ok(output)
    }
}
