//! Prometheus metrics for tributary operators

use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use std::sync::Arc;

/// Metrics collection shared by the operators of one shard
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,
    pub records_total: IntCounterVec,
    pub emitted_total: IntCounterVec,
    pub suppressed_total: IntCounterVec,
    pub dropped_late_total: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let records_total = IntCounterVec::new(
            Opts::new("tributary_records_total", "Records received by operator"),
            &["operator"],
        )
        .expect("failed to create records_total counter");

        let emitted_total = IntCounterVec::new(
            Opts::new("tributary_emitted_total", "Records emitted by operator"),
            &["operator"],
        )
        .expect("failed to create emitted_total counter");

        let suppressed_total = IntCounterVec::new(
            Opts::new(
                "tributary_suppressed_total",
                "Records consumed without output by operator",
            ),
            &["operator"],
        )
        .expect("failed to create suppressed_total counter");

        let dropped_late_total = IntCounterVec::new(
            Opts::new(
                "tributary_dropped_late_total",
                "Records dropped for arriving behind retention",
            ),
            &["operator"],
        )
        .expect("failed to create dropped_late_total counter");

        registry
            .register(Box::new(records_total.clone()))
            .expect("failed to register records_total");
        registry
            .register(Box::new(emitted_total.clone()))
            .expect("failed to register emitted_total");
        registry
            .register(Box::new(suppressed_total.clone()))
            .expect("failed to register suppressed_total");
        registry
            .register(Box::new(dropped_late_total.clone()))
            .expect("failed to register dropped_late_total");

        Self {
            registry: Arc::new(registry),
            records_total,
            emitted_total,
            suppressed_total,
            dropped_late_total,
        }
    }

    /// Counters bound to one operator's label
    pub fn operator(&self, name: &str) -> OperatorMetrics {
        OperatorMetrics {
            records: self.records_total.with_label_values(&[name]),
            emitted: self.emitted_total.with_label_values(&[name]),
            suppressed: self.suppressed_total.with_label_values(&[name]),
            dropped_late: self.dropped_late_total.with_label_values(&[name]),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render all metrics in Prometheus text format
    pub fn gather(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if encoder.encode(&metric_families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-operator counter handles
#[derive(Clone)]
pub struct OperatorMetrics {
    records: IntCounter,
    emitted: IntCounter,
    suppressed: IntCounter,
    dropped_late: IntCounter,
}

impl OperatorMetrics {
    pub fn record_in(&self) {
        self.records.inc();
    }

    pub fn emitted(&self, count: u64) {
        self.emitted.inc_by(count);
    }

    pub fn suppressed(&self) {
        self.suppressed.inc();
    }

    pub fn dropped_late(&self) {
        self.dropped_late.inc();
    }
}

/// Record the outcome of one `transform` call, if metrics are enabled.
pub(crate) fn observe<T>(metrics: Option<&OperatorMetrics>, output: &Option<T>) {
    if let Some(m) = metrics {
        m.record_in();
        if output.is_some() {
            m.emitted(1);
        } else {
            m.suppressed();
        }
    }
}
