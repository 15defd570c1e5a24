//! Incremental statistics per group
//!
//! [`StatisticsOperator`] keeps one [`AggregateRecord`] per group, where the
//! group is the configured `group_by` field values rendered and joined with
//! `|`. Every input runs each registered [`Expression`] in order and emits the
//! updated visible fields.
//!
//! # Example
//!
//! ```rust
//! use tributary_core::{Record, Value};
//! use tributary_runtime::aggregation::{
//!     Count, Expression, Median, StatisticsConfig, StatisticsOperator,
//! };
//! use tributary_runtime::{ProcessorContext, Transformer};
//!
//! let config = StatisticsConfig::new()
//!     .group_by("symbol")
//!     .expression(Expression::new(Count))
//!     .expression(Expression::new(Median).field("price").alias("median_price"));
//! let mut stats = StatisticsOperator::<String>::new("trades", config).unwrap();
//! stats.init(&ProcessorContext::in_memory()).unwrap();
//!
//! let trade = Record::new().with_field("symbol", "BTC").with_field("price", 10.0);
//! let out = stats.transform(&"k".to_string(), &trade).unwrap().unwrap();
//! assert_eq!(out.get("count"), Some(&Value::Int(1)));
//! assert_eq!(out.get("median_price"), Some(&Value::Float(10.0)));
//! ```

mod expr;
mod spec;
mod state;

pub use expr::{
    Average, Count, DistinctCount, First, Last, Max, Median, Min, Mode, NullPolicy, Percentile,
    Range, StatExpression, StatInput, StdDev, Sum, Variance,
};
pub use spec::{ExpressionSpec, StatKind, StatisticsSpec};
pub use state::{
    DistinctSet, ExprState, Frequency, FrequencyTable, MedianHeaps, RunningMean, RunningRange,
    RunningVariance, SortedSamples,
};

use std::collections::HashSet;
use std::marker::PhantomData;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};
use tributary_core::{Record, Value};

use crate::error::{ConfigError, OperatorError, OperatorResult};
use crate::metrics::{observe, OperatorMetrics};
use crate::processor::{ProcessorContext, Transformer};
use crate::store::{store_name, TypedStore};

static NO_FIELD: Value = Value::Null;

fn key_part(value: &Value) -> String {
    match value {
        Value::Str(s) if s == "null" => "\\null".to_string(),
        other => other.render().replace('\\', "\\\\").replace('|', "\\|"),
    }
}

/// Running aggregate of one group
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AggregateRecord {
    pub group_key: String,
    /// Group-by fields followed by each expression's result
    pub fields: Record,
    /// Hidden expression state keyed by `_<alias>_<kind>`
    pub internals: IndexMap<String, ExprState>,
}

impl AggregateRecord {
    pub fn new(group_key: impl Into<String>) -> Self {
        Self {
            group_key: group_key.into(),
            fields: Record::new(),
            internals: IndexMap::new(),
        }
    }
}

/// A statistical expression bound to an input field and output alias
pub struct Expression {
    func: Box<dyn StatExpression>,
    field: Option<String>,
    alias: Option<String>,
    null_policy: Option<NullPolicy>,
}

impl Expression {
    pub fn new<E: StatExpression + 'static>(func: E) -> Self {
        Self::boxed(Box::new(func))
    }

    pub fn boxed(func: Box<dyn StatExpression>) -> Self {
        Self {
            func,
            field: None,
            alias: None,
            null_policy: None,
        }
    }

    /// Input field to read
    pub fn field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    /// Output field name; defaults to the expression kind
    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn null_policy(mut self, policy: NullPolicy) -> Self {
        self.null_policy = Some(policy);
        self
    }

    pub fn output_name(&self) -> &str {
        self.alias.as_deref().unwrap_or_else(|| self.func.name())
    }

    pub fn effective_null_policy(&self) -> NullPolicy {
        self.null_policy
            .unwrap_or_else(|| self.func.default_null_policy())
    }

    /// Key of this expression's hidden state in the aggregate record
    pub fn internal_key(&self) -> String {
        format!("_{}_{}", self.output_name(), self.func.name())
    }
}

/// Configuration for [`StatisticsOperator`]
#[derive(Default)]
pub struct StatisticsConfig {
    group_by: Vec<String>,
    expressions: Vec<Expression>,
}

impl StatisticsConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn group_by(mut self, field: impl Into<String>) -> Self {
        self.group_by.push(field.into());
        self
    }

    pub fn expression(mut self, expression: Expression) -> Self {
        self.expressions.push(expression);
        self
    }
}

/// Maintains a running [`AggregateRecord`] per group and emits its visible
/// fields for every input record.
///
/// The record key `K` plays no part in grouping.
pub struct StatisticsOperator<K> {
    name: String,
    group_by: Vec<String>,
    expressions: Vec<Expression>,
    store: Option<TypedStore<AggregateRecord>>,
    metrics: Option<OperatorMetrics>,
    _key: PhantomData<fn(&K)>,
}

impl<K> StatisticsOperator<K> {
    pub fn new(base_name: &str, config: StatisticsConfig) -> Result<Self, ConfigError> {
        const OPERATOR: &str = "statistics";
        if config.expressions.is_empty() {
            return Err(ConfigError::MissingParameter {
                operator: OPERATOR,
                parameter: "expressions",
            });
        }

        let mut outputs = HashSet::new();
        for expr in &config.expressions {
            if expr.func.requires_field() && expr.field.is_none() {
                return Err(ConfigError::InvalidParameter {
                    operator: OPERATOR,
                    parameter: "field",
                    reason: format!("expression '{}' needs an input field", expr.output_name()),
                });
            }
            let name = expr.output_name();
            if !outputs.insert(name.to_string()) || config.group_by.iter().any(|g| g == name) {
                return Err(ConfigError::InvalidParameter {
                    operator: OPERATOR,
                    parameter: "alias",
                    reason: format!("output field '{}' is defined twice", name),
                });
            }
        }

        Ok(Self {
            name: store_name(base_name, "stats"),
            group_by: config.group_by,
            expressions: config.expressions,
            store: None,
            metrics: None,
            _key: PhantomData,
        })
    }

    /// Group key of `input`: group-by values joined with `|`.
    ///
    /// Rendered values escape `\` and `|`, and the string `"null"` becomes
    /// `\null` so it never meets a missing field's `null`.
    pub fn group_key(&self, input: &Record) -> String {
        self.group_by
            .iter()
            .map(|f| key_part(input.get_or_null(f)))
            .collect::<Vec<_>>()
            .join("|")
    }

    /// Current aggregate of a group, if any
    pub fn aggregate(&self, group_key: &str) -> OperatorResult<Option<AggregateRecord>> {
        let store = self
            .store
            .as_ref()
            .ok_or_else(|| OperatorError::NotInitialized(self.name.clone()))?;
        Ok(store.get(group_key)?)
    }

    /// Apply every expression to `agg` for one input record.
    pub fn apply(&self, input: &Record, agg: &mut AggregateRecord) -> OperatorResult<()> {
        for expr in &self.expressions {
            let alias = expr.output_name();
            let value = match &expr.field {
                Some(field) => input.get_or_null(field),
                None => &NO_FIELD,
            };

            if let (Some(field), true) = (&expr.field, value.is_null()) {
                match expr.effective_null_policy() {
                    NullPolicy::Skip => {
                        trace!("{}: '{}' skipped null '{}'", self.name, alias, field);
                        if !agg.fields.contains(alias) {
                            agg.fields.insert(alias, Value::Null);
                        }
                        continue;
                    }
                    NullPolicy::Fail => {
                        return Err(OperatorError::NullField {
                            expression: alias.to_string(),
                            field: field.clone(),
                        });
                    }
                }
            }
            if !value.is_finite() {
                return Err(OperatorError::NonFinite {
                    expression: alias.to_string(),
                    field: expr.field.clone().unwrap_or_default(),
                });
            }

            let internal_key = expr.internal_key();
            let state = match expr.func.initial_state() {
                Some(initial) => Some(agg.internals.entry(internal_key).or_insert(initial)),
                None => None,
            };

            let result = {
                let input = StatInput {
                    group_key: &agg.group_key,
                    alias,
                    field: expr.field.as_deref(),
                    value,
                    previous: agg.fields.get_or_null(alias),
                };
                expr.func.update(&input, state)?
            };
            agg.fields.insert(alias, result);
        }
        Ok(())
    }

    fn new_aggregate(&self, group_key: String, input: &Record) -> AggregateRecord {
        let mut agg = AggregateRecord::new(group_key);
        for field in &self.group_by {
            agg.fields.insert(field.as_str(), input.get_or_null(field).clone());
        }
        debug!("{}: new group '{}'", self.name, agg.group_key);
        agg
    }
}

impl<K> Transformer<K, Record> for StatisticsOperator<K> {
    type Output = Record;

    fn name(&self) -> &str {
        &self.name
    }

    fn init(&mut self, ctx: &ProcessorContext) -> Result<(), ConfigError> {
        self.store = Some(TypedStore::new(ctx.state_store(&self.name)?));
        self.metrics = ctx.operator_metrics(&self.name);
        Ok(())
    }

    fn transform(&mut self, _key: &K, value: &Record) -> OperatorResult<Option<Record>> {
        let store = self
            .store
            .as_ref()
            .ok_or_else(|| OperatorError::NotInitialized(self.name.clone()))?;

        let group_key = self.group_key(value);
        let mut agg = match store.get(&group_key)? {
            Some(agg) => agg,
            None => self.new_aggregate(group_key, value),
        };

        self.apply(value, &mut agg)?;
        if let Some((name, _)) = agg.fields.iter().find(|(_, v)| !v.is_finite()) {
            return Err(OperatorError::NonFinite {
                expression: name.clone(),
                field: name.clone(),
            });
        }
        store.put(&agg.group_key, &agg)?;

        let output = Some(agg.fields);
        observe(self.metrics.as_ref(), &output);
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn operator(config: StatisticsConfig) -> StatisticsOperator<String> {
        let mut op = StatisticsOperator::new("trades", config).unwrap();
        op.init(&ProcessorContext::in_memory()).unwrap();
        op
    }

    fn trade(symbol: &str, price: impl Into<Value>) -> Record {
        Record::new()
            .with_field("symbol", symbol)
            .with_field("price", price.into())
    }

    fn run(op: &mut StatisticsOperator<String>, input: &Record) -> OperatorResult<Record> {
        op.transform(&"k".to_string(), input)
            .map(|out| out.unwrap_or_default())
    }

    #[test]
    fn test_group_key_rendering() {
        let op = operator(
            StatisticsConfig::new()
                .group_by("symbol")
                .group_by("venue")
                .expression(Expression::new(Count)),
        );
        let input = Record::new()
            .with_field("symbol", "BTC")
            .with_field("venue", 3);
        assert_eq!(op.group_key(&input), "BTC|3");
        assert_eq!(op.group_key(&Record::new()), "null|null");
    }

    #[test]
    fn test_group_keys_are_unambiguous() {
        let op = operator(
            StatisticsConfig::new()
                .group_by("a")
                .group_by("b")
                .expression(Expression::new(Count)),
        );
        let pair = |a: Value, b: Value| {
            op.group_key(&Record::new().with_field("a", a).with_field("b", b))
        };

        assert_ne!(
            pair("x|y".into(), "z".into()),
            pair("x".into(), "y|z".into())
        );
        assert_ne!(
            pair(Value::Null, "z".into()),
            pair("null".into(), "z".into())
        );
        assert_ne!(pair("x\\".into(), "y".into()), pair("x\\|y".into(), Value::Null));
        assert_eq!(pair("x|y".into(), Value::Null), "x\\|y|null");
    }

    #[test]
    fn test_non_finite_group_field_leaves_store_untouched() {
        let mut op = operator(
            StatisticsConfig::new()
                .group_by("symbol")
                .expression(Expression::new(Count)),
        );
        let bad = Record::new().with_field("symbol", f64::NAN);
        assert!(matches!(
            run(&mut op, &bad),
            Err(OperatorError::NonFinite { ref field, .. }) if field == "symbol"
        ));
        assert_eq!(op.aggregate(&op.group_key(&bad)).unwrap(), None);
    }

    #[test]
    fn test_non_finite_input_is_rejected_before_any_update() {
        let mut op = operator(
            StatisticsConfig::new()
                .expression(Expression::new(Last).field("price"))
                .expression(Expression::new(Mode).field("price")),
        );
        run(&mut op, &trade("BTC", 2.0)).unwrap();
        assert!(matches!(
            run(&mut op, &trade("BTC", f64::INFINITY)),
            Err(OperatorError::NonFinite { ref expression, .. }) if expression == "last"
        ));
        let out = run(&mut op, &trade("BTC", 2.0)).unwrap();
        assert_eq!(out.get("last"), Some(&Value::Float(2.0)));
        assert_eq!(
            out.get("mode"),
            Some(&Value::Array(vec![Value::Float(2.0)]))
        );
    }

    #[test]
    fn test_visible_fields_and_hidden_state() {
        let mut op = operator(
            StatisticsConfig::new()
                .group_by("symbol")
                .expression(Expression::new(Count))
                .expression(Expression::new(Average).field("price").alias("avg")),
        );
        run(&mut op, &trade("BTC", 10.0)).unwrap();
        let out = run(&mut op, &trade("BTC", 20.0)).unwrap();

        let names: Vec<&str> = out.field_names().collect();
        assert_eq!(names, vec!["symbol", "count", "avg"]);
        assert_eq!(out.get("avg"), Some(&Value::Float(15.0)));

        let agg = op.aggregate("BTC").unwrap().unwrap();
        assert_eq!(
            agg.internals.get("_avg_average"),
            Some(&ExprState::Mean(RunningMean {
                sum: 30.0,
                count: 2
            }))
        );
    }

    #[test]
    fn test_groups_are_separate() {
        let mut op = operator(
            StatisticsConfig::new()
                .group_by("symbol")
                .expression(Expression::new(Sum).field("price")),
        );
        run(&mut op, &trade("BTC", 1)).unwrap();
        run(&mut op, &trade("ETH", 10)).unwrap();
        let out = run(&mut op, &trade("BTC", 2)).unwrap();
        assert_eq!(out.get("sum"), Some(&Value::Int(3)));
    }

    #[test]
    fn test_null_is_skipped_by_default() {
        let mut op = operator(
            StatisticsConfig::new()
                .expression(Expression::new(Min).field("price"))
                .expression(Expression::new(Last).field("price"))
                .expression(Expression::new(Mode).field("price"))
                .expression(Expression::new(Range).field("price"))
                .expression(
                    Expression::new(Percentile::new(50.0).unwrap())
                        .field("price")
                        .alias("p50"),
                ),
        );
        let first = run(&mut op, &trade("BTC", 5)).unwrap();
        let after_null = run(&mut op, &trade("BTC", Value::Null)).unwrap();
        assert_eq!(first, after_null);

        // A missing field is treated like a null one
        let missing = run(&mut op, &Record::new().with_field("symbol", "BTC")).unwrap();
        assert_eq!(first, missing);
    }

    #[test]
    fn test_null_before_any_value_yields_null_result() {
        let mut op = operator(
            StatisticsConfig::new().expression(Expression::new(Max).field("price")),
        );
        let out = run(&mut op, &Record::new()).unwrap();
        assert_eq!(out.get("max"), Some(&Value::Null));
        let out = run(&mut op, &trade("BTC", 7)).unwrap();
        assert_eq!(out.get("max"), Some(&Value::Int(7)));
    }

    #[test]
    fn test_variance_fails_on_null_unless_skipped() {
        let mut op = operator(
            StatisticsConfig::new().expression(Expression::new(Variance::sample()).field("price")),
        );
        run(&mut op, &trade("BTC", 1.0)).unwrap();
        let err = run(&mut op, &trade("BTC", Value::Null)).unwrap_err();
        assert!(matches!(
            err,
            OperatorError::NullField { ref expression, ref field }
                if expression == "variance" && field == "price"
        ));

        let mut op = operator(
            StatisticsConfig::new().expression(
                Expression::new(StdDev::sample())
                    .field("price")
                    .null_policy(NullPolicy::Skip),
            ),
        );
        run(&mut op, &trade("BTC", 1.0)).unwrap();
        assert!(run(&mut op, &trade("BTC", Value::Null)).is_ok());
    }

    #[test]
    fn test_type_mismatch_is_reported() {
        let mut op = operator(
            StatisticsConfig::new().expression(Expression::new(Median).field("price")),
        );
        assert!(matches!(
            run(&mut op, &trade("BTC", "cheap")),
            Err(OperatorError::TypeMismatch {
                expected: "numeric",
                actual: "str",
                ..
            })
        ));
    }

    #[test]
    fn test_setup_validation() {
        let no_expressions = StatisticsOperator::<String>::new("t", StatisticsConfig::new());
        assert!(matches!(
            no_expressions,
            Err(ConfigError::MissingParameter { .. })
        ));

        let no_field = StatisticsOperator::<String>::new(
            "t",
            StatisticsConfig::new().expression(Expression::new(Sum)),
        );
        assert!(matches!(
            no_field,
            Err(ConfigError::InvalidParameter {
                parameter: "field",
                ..
            })
        ));

        let duplicate = StatisticsOperator::<String>::new(
            "t",
            StatisticsConfig::new()
                .expression(Expression::new(Sum).field("a"))
                .expression(Expression::new(Sum).field("b")),
        );
        assert!(matches!(
            duplicate,
            Err(ConfigError::InvalidParameter {
                parameter: "alias",
                ..
            })
        ));

        let shadows_group = StatisticsOperator::<String>::new(
            "t",
            StatisticsConfig::new()
                .group_by("symbol")
                .expression(Expression::new(Last).field("symbol").alias("symbol")),
        );
        assert!(shadows_group.is_err());
    }
}
