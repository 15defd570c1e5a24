//! Time-windowed inner join of two keyed streams
//!
//! Each side keeps its records in a [`WindowedStore`] for
//! `retention + before + after`. A left record at `T` joins every right record
//! of the same key in `[T - before, T + after]`; a right record at `T` joins
//! every left record in `[T - after, T + before]`. Each matching pair produces
//! one output stamped with the later of the two timestamps.
//!
//! Both stores share one stream time, the highest timestamp seen on either
//! side. A record already older than stream time minus the retain period can
//! never be matched consistently and is dropped.

use std::sync::Arc;

use chrono::Duration;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, trace, warn};
use tributary_core::Timestamped;

use crate::error::{ConfigError, OperatorError, OperatorResult};
use crate::metrics::OperatorMetrics;
use crate::processor::ProcessorContext;
use crate::store::{store_name, WindowedStore};

/// Builds one output from a matching left/right pair
pub type Joiner<L, R, O> = Arc<dyn Fn(&L, &R) -> O + Send + Sync>;

/// Configuration for [`WindowedJoin`]
pub struct JoinWindowConfig<L, R, O> {
    before: Duration,
    after: Duration,
    retention: Option<Duration>,
    joiner: Option<Joiner<L, R, O>>,
}

impl<L, R, O> Default for JoinWindowConfig<L, R, O> {
    fn default() -> Self {
        Self {
            before: Duration::zero(),
            after: Duration::zero(),
            retention: None,
            joiner: None,
        }
    }
}

impl<L, R, O> JoinWindowConfig<L, R, O> {
    pub fn new() -> Self {
        Self::default()
    }

    /// How far a right record may precede a left one
    pub fn before(mut self, before: Duration) -> Self {
        self.before = before;
        self
    }

    /// How far a right record may follow a left one
    pub fn after(mut self, after: Duration) -> Self {
        self.after = after;
        self
    }

    pub fn retention(mut self, retention: Duration) -> Self {
        self.retention = Some(retention);
        self
    }

    pub fn joiner<F>(mut self, f: F) -> Self
    where
        F: Fn(&L, &R) -> O + Send + Sync + 'static,
    {
        self.joiner = Some(Arc::new(f));
        self
    }
}

/// Inner join of a left and a right stream sharing key type `K`.
pub struct WindowedJoin<K, L, R, O> {
    name: String,
    before_ms: i64,
    after_ms: i64,
    retain_ms: i64,
    joiner: Joiner<L, R, O>,
    left: Option<WindowedStore<K, L>>,
    right: Option<WindowedStore<K, R>>,
    dropped_late: u64,
    metrics: Option<OperatorMetrics>,
}

impl<K, L, R, O> WindowedJoin<K, L, R, O>
where
    K: Serialize + Clone,
    L: Serialize + DeserializeOwned + Clone,
    R: Serialize + DeserializeOwned + Clone,
{
    pub fn new(base_name: &str, config: JoinWindowConfig<L, R, O>) -> Result<Self, ConfigError> {
        const OPERATOR: &str = "windowed join";
        let non_negative = |parameter: &'static str, d: Duration| {
            if d < Duration::zero() {
                Err(ConfigError::InvalidParameter {
                    operator: OPERATOR,
                    parameter,
                    reason: format!("must not be negative, got {}ms", d.num_milliseconds()),
                })
            } else {
                Ok(d.num_milliseconds())
            }
        };

        let retention = config.retention.ok_or(ConfigError::MissingParameter {
            operator: OPERATOR,
            parameter: "retention",
        })?;
        let joiner = config.joiner.ok_or(ConfigError::MissingParameter {
            operator: OPERATOR,
            parameter: "joiner",
        })?;
        let before_ms = non_negative("before", config.before)?;
        let after_ms = non_negative("after", config.after)?;
        let retention_ms = non_negative("retention", retention)?;

        Ok(Self {
            name: store_name(base_name, "join"),
            before_ms,
            after_ms,
            retain_ms: retention_ms
                .saturating_add(before_ms)
                .saturating_add(after_ms),
            joiner,
            left: None,
            right: None,
            dropped_late: 0,
            metrics: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Period each side retains its records
    pub fn retain_ms(&self) -> i64 {
        self.retain_ms
    }

    /// Records dropped for arriving behind retention
    pub fn dropped_late(&self) -> u64 {
        self.dropped_late
    }

    pub fn stream_time(&self) -> Option<i64> {
        self.left.as_ref().and_then(|s| s.stream_time())
    }

    /// Claim the `join-left` and `join-right` stores.
    pub fn init(&mut self, ctx: &ProcessorContext) -> Result<(), ConfigError> {
        let left_name = format!("{}-left", self.name);
        let right_name = format!("{}-right", self.name);
        let mut left = WindowedStore::new(ctx.state_store(&left_name)?, self.retain_ms)?;
        let mut right = WindowedStore::new(ctx.state_store(&right_name)?, self.retain_ms)?;

        // Either side may have persisted the newer stream time
        let newest = left.stream_time().max(right.stream_time());
        if let Some(t) = newest {
            left.observe(t)?;
            right.observe(t)?;
        }

        self.left = Some(left);
        self.right = Some(right);
        self.metrics = ctx.operator_metrics(&self.name);
        Ok(())
    }

    /// Process a left record at `timestamp_ms`.
    pub fn process_left(
        &mut self,
        key: &K,
        value: &L,
        timestamp_ms: i64,
    ) -> OperatorResult<Vec<Timestamped<K, O>>> {
        let from = timestamp_ms.saturating_sub(self.before_ms);
        let to = timestamp_ms.saturating_add(self.after_ms);
        let matches = {
            let (left, right) = self.stores()?;
            if left.is_expired(timestamp_ms) {
                None
            } else {
                left.observe(timestamp_ms)?;
                right.observe(timestamp_ms)?;
                left.put(key, value.clone(), timestamp_ms)?;
                Some(right.fetch(key, from, to)?)
            }
        };
        let Some(matches) = matches else {
            self.drop_late("left", timestamp_ms);
            return Ok(Vec::new());
        };

        let joiner = &self.joiner;
        let out: Vec<_> = matches
            .into_iter()
            .map(|e| {
                Timestamped::new(
                    key.clone(),
                    joiner(value, &e.value),
                    timestamp_ms.max(e.timestamp_ms),
                )
            })
            .collect();
        self.observe(out.len());
        Ok(out)
    }

    /// Process a right record at `timestamp_ms`.
    pub fn process_right(
        &mut self,
        key: &K,
        value: &R,
        timestamp_ms: i64,
    ) -> OperatorResult<Vec<Timestamped<K, O>>> {
        let from = timestamp_ms.saturating_sub(self.after_ms);
        let to = timestamp_ms.saturating_add(self.before_ms);
        let matches = {
            let (left, right) = self.stores()?;
            if right.is_expired(timestamp_ms) {
                None
            } else {
                left.observe(timestamp_ms)?;
                right.observe(timestamp_ms)?;
                right.put(key, value.clone(), timestamp_ms)?;
                Some(left.fetch(key, from, to)?)
            }
        };
        let Some(matches) = matches else {
            self.drop_late("right", timestamp_ms);
            return Ok(Vec::new());
        };

        let joiner = &self.joiner;
        let out: Vec<_> = matches
            .into_iter()
            .map(|e| {
                Timestamped::new(
                    key.clone(),
                    joiner(&e.value, value),
                    timestamp_ms.max(e.timestamp_ms),
                )
            })
            .collect();
        self.observe(out.len());
        Ok(out)
    }

    /// Drop expired entries on both sides. Returns the number removed.
    pub fn purge_expired(&mut self) -> OperatorResult<usize> {
        let (left, right) = self.stores()?;
        let removed = left.purge_expired()? + right.purge_expired()?;
        if removed > 0 {
            debug!("{}: purged {} expired entries", self.name, removed);
        }
        Ok(removed)
    }

    fn stores(&mut self) -> OperatorResult<(&mut WindowedStore<K, L>, &mut WindowedStore<K, R>)> {
        match (self.left.as_mut(), self.right.as_mut()) {
            (Some(left), Some(right)) => Ok((left, right)),
            _ => Err(OperatorError::NotInitialized(self.name.clone())),
        }
    }

    fn drop_late(&mut self, side: &str, timestamp_ms: i64) {
        self.dropped_late += 1;
        warn!(
            "{}: dropped late {} record at {} (stream time {:?}, retain {}ms)",
            self.name,
            side,
            timestamp_ms,
            self.stream_time(),
            self.retain_ms
        );
        if let Some(m) = &self.metrics {
            m.record_in();
            m.dropped_late();
        }
    }

    fn observe(&self, emitted: usize) {
        trace!("{}: {} join results", self.name, emitted);
        if let Some(m) = &self.metrics {
            m.record_in();
            if emitted == 0 {
                m.suppressed();
            } else {
                m.emitted(emitted as u64);
            }
        }
    }
}
