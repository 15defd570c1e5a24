//! Tributary Runtime - stateful stream operators
//!
//! Keyed operators that read and write all cross-record state through a
//! [`StateStore`], so a shard restored from its changelog resumes exactly
//! where it stopped:
//!
//! - [`DedupOperator`]: drop records that repeat their group's last record
//! - [`SequenceOperator`]: rolling aggregate over the last N records
//! - [`TransactionOperator`]: group runs between start and end predicates
//! - [`WindowedJoin`]: time-bounded inner join of two keyed streams
//! - [`StatisticsOperator`]: incremental statistics per group

pub mod aggregation;
pub mod config;
pub mod dedup;
pub mod error;
pub mod join;
pub mod metrics;
pub mod processor;
pub mod sequence;
pub mod store;
pub mod transaction;

pub use aggregation::{AggregateRecord, Expression, StatisticsConfig, StatisticsOperator};
pub use config::RuntimeConfig;
pub use dedup::{DedupConfig, DedupOperator};
pub use error::{ConfigError, OperatorError, OperatorResult, StoreError, StoreResult};
pub use join::{JoinWindowConfig, WindowedJoin};
pub use metrics::{Metrics, OperatorMetrics};
pub use processor::{KeyFn, Predicate, ProcessorContext, Transformer};
pub use sequence::{SequenceConfig, SequenceOperator};
pub use store::{
    ChangelogStore, MemoryStore, StateStore, StoreBackend, StoreConfig, StoreRegistry,
};
pub use transaction::{EmitType, TransactionConfig, TransactionOperator, TransactionRecord};
