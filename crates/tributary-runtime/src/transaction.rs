//! Session grouping between a start and an end predicate

use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ConfigError, OperatorError, OperatorResult};
use crate::metrics::{observe, OperatorMetrics};
use crate::processor::{KeyFn, Predicate, ProcessorContext, Transformer};
use crate::store::{store_name, TypedStore};

/// Which classified records contribute to a transaction's members
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmitType {
    Start,
    Ongoing,
    End,
    #[default]
    All,
    StartAndEnd,
}

/// How a record relates to its group's open transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Start,
    Ongoing,
    End,
    /// Opens and closes a transaction in one record
    StartAndEnd,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Start => write!(f, "start"),
            Phase::Ongoing => write!(f, "ongoing"),
            Phase::End => write!(f, "end"),
            Phase::StartAndEnd => write!(f, "start+end"),
        }
    }
}

impl EmitType {
    /// Whether a record in `phase` is appended to the members.
    pub fn covers(self, phase: Phase) -> bool {
        match phase {
            Phase::Start => matches!(self, EmitType::Start | EmitType::All | EmitType::StartAndEnd),
            Phase::Ongoing => matches!(self, EmitType::Ongoing | EmitType::All),
            Phase::End => matches!(self, EmitType::End | EmitType::All | EmitType::StartAndEnd),
            Phase::StartAndEnd => self.covers(Phase::Start) || self.covers(Phase::End),
        }
    }
}

/// A closed (or in-progress) transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionRecord<GK, V> {
    pub group_key: GK,
    /// Covered records in arrival order, without duplicates
    pub members: Vec<V>,
}

impl<GK, V: PartialEq> TransactionRecord<GK, V> {
    pub fn new(group_key: GK) -> Self {
        Self {
            group_key,
            members: Vec::new(),
        }
    }

    fn add(&mut self, value: &V)
    where
        V: Clone,
    {
        if !self.members.contains(value) {
            self.members.push(value.clone());
        }
    }
}

/// Configuration for [`TransactionOperator`]
pub struct TransactionConfig<K, V, GK> {
    group_key: Option<KeyFn<K, V, GK>>,
    starts_with: Option<Predicate<K, V>>,
    ends_with: Option<Predicate<K, V>>,
    emit_type: EmitType,
}

impl<K, V, GK> Default for TransactionConfig<K, V, GK> {
    fn default() -> Self {
        Self {
            group_key: None,
            starts_with: None,
            ends_with: None,
            emit_type: EmitType::default(),
        }
    }
}

impl<K, V, GK> TransactionConfig<K, V, GK> {
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

    pub fn starts_with<F>(mut self, f: F) -> Self
    where
        F: Fn(&K, &V) -> bool + Send + Sync + 'static,
    {
        self.starts_with = Some(Arc::new(f));
        self
    }

    pub fn ends_with<F>(mut self, f: F) -> Self
    where
        F: Fn(&K, &V) -> bool + Send + Sync + 'static,
    {
        self.ends_with = Some(Arc::new(f));
        self
    }

    pub fn emit_type(mut self, emit_type: EmitType) -> Self {
        self.emit_type = emit_type;
        self
    }
}

/// Groups each run of records from a start match to an end match into one
/// [`TransactionRecord`], emitted when the run closes.
pub struct TransactionOperator<K, V, GK> {
    name: String,
    group_key: KeyFn<K, V, GK>,
    starts_with: Predicate<K, V>,
    ends_with: Predicate<K, V>,
    emit_type: EmitType,
    store: Option<TypedStore<TransactionRecord<GK, V>>>,
    metrics: Option<OperatorMetrics>,
}

impl<K, V, GK> TransactionOperator<K, V, GK>
where
    V: Serialize + DeserializeOwned + Clone + PartialEq,
    GK: Serialize + DeserializeOwned,
{
    pub fn new(base_name: &str, config: TransactionConfig<K, V, GK>) -> Result<Self, ConfigError> {
        const OPERATOR: &str = "transaction";
        let missing = |parameter: &'static str| ConfigError::MissingParameter {
            operator: OPERATOR,
            parameter,
        };
        Ok(Self {
            name: store_name(base_name, "transaction"),
            group_key: config.group_key.ok_or_else(|| missing("group_key"))?,
            starts_with: config.starts_with.ok_or_else(|| missing("starts_with"))?,
            ends_with: config.ends_with.ok_or_else(|| missing("ends_with"))?,
            emit_type: config.emit_type,
            store: None,
            metrics: None,
        })
    }

    pub fn emit_type(&self) -> EmitType {
        self.emit_type
    }
}

impl<K, V, GK> Transformer<K, V> for TransactionOperator<K, V, GK>
where
    V: Serialize + DeserializeOwned + Clone + PartialEq,
    GK: Serialize + DeserializeOwned,
{
    type Output = TransactionRecord<GK, V>;

    fn name(&self) -> &str {
        &self.name
    }

    fn init(&mut self, ctx: &ProcessorContext) -> Result<(), ConfigError> {
        self.store = Some(TypedStore::new(ctx.state_store(&self.name)?));
        self.metrics = ctx.operator_metrics(&self.name);
        Ok(())
    }

    fn transform(&mut self, key: &K, value: &V) -> OperatorResult<Option<Self::Output>> {
        let store = self
            .store
            .as_ref()
            .ok_or_else(|| OperatorError::NotInitialized(self.name.clone()))?;

        let group = (self.group_key)(key, value);
        let (mut txn, phase) = match store.get(&group)? {
            Some(open) => {
                let phase = if (self.ends_with)(key, value) {
                    Phase::End
                } else {
                    Phase::Ongoing
                };
                (open, phase)
            }
            None if (self.starts_with)(key, value) => {
                let phase = if (self.ends_with)(key, value) {
                    Phase::StartAndEnd
                } else {
                    Phase::Start
                };
                (TransactionRecord::new((self.group_key)(key, value)), phase)
            }
            None => {
                observe(self.metrics.as_ref(), &None::<()>);
                return Ok(None);
            }
        };

        if self.emit_type.covers(phase) {
            txn.add(value);
        }

        let output = match phase {
            Phase::End | Phase::StartAndEnd => {
                store.delete(&group)?;
                debug!(
                    "{}: closed transaction on {} with {} members",
                    self.name,
                    phase,
                    txn.members.len()
                );
                Some(txn)
            }
            Phase::Start | Phase::Ongoing => {
                store.put(&group, &txn)?;
                None
            }
        };

        observe(self.metrics.as_ref(), &output);
        Ok(output)
    }
}
