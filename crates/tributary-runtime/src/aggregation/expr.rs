//! Built-in incremental statistical expressions
//!
//! | Expression | Hidden state | Result |
//! |------------|--------------|--------|
//! | [`Count`] | none | records seen |
//! | [`Sum`] | none | running sum, integer while inputs are integers |
//! | [`Average`] | [`RunningMean`] | sum / count |
//! | [`Min`], [`Max`] | none | most extreme value |
//! | [`Range`] | [`RunningRange`] | max - min |
//! | [`Variance`], [`StdDev`] | [`RunningVariance`] | population or sample |
//! | [`Median`] | [`MedianHeaps`] | two-heap median |
//! | [`Percentile`] | [`SortedSamples`] | interpolated percentile |
//! | [`Mode`] | [`FrequencyTable`] | every value tied at the top count |
//! | [`DistinctCount`] | [`DistinctSet`] | distinct values seen |
//! | [`First`], [`Last`] | none | earliest / latest non-null value |
//!
//! Expressions without hidden state derive their next result from their
//! previous one.
//!
//! Percentile samples and Mode frequencies grow with every distinct input;
//! bound long-lived groups with a store eviction policy.

use serde::{Deserialize, Serialize};
use tributary_core::Value;

use super::state::{
    DistinctSet, ExprState, FrequencyTable, MedianHeaps, RunningMean, RunningRange,
    RunningVariance, SortedSamples,
};
use crate::error::{ConfigError, OperatorError, OperatorResult, StoreError};

/// What an expression does when its input field is null or missing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NullPolicy {
    /// Leave state untouched and keep the previous result
    Skip,
    /// Fail the record with [`OperatorError::NullField`]
    Fail,
}

/// One input value as seen by an expression
#[derive(Debug, Clone, Copy)]
pub struct StatInput<'a> {
    pub group_key: &'a str,
    /// Output field name of the expression
    pub alias: &'a str,
    /// Input field, if the expression reads one
    pub field: Option<&'a str>,
    /// Input value; never null when a field is configured
    pub value: &'a Value,
    /// The expression's result after the previous record, or null
    pub previous: &'a Value,
}

impl StatInput<'_> {
    /// The input as a float, or a type mismatch.
    pub fn number(&self) -> OperatorResult<f64> {
        let n = self
            .value
            .as_float()
            .ok_or_else(|| self.mismatch("numeric"))?;
        if !n.is_finite() {
            return Err(self.non_finite());
        }
        Ok(n)
    }

    pub fn non_finite(&self) -> OperatorError {
        OperatorError::NonFinite {
            expression: self.alias.to_string(),
            field: self.field.unwrap_or_default().to_string(),
        }
    }

    pub fn mismatch(&self, expected: &'static str) -> OperatorError {
        OperatorError::TypeMismatch {
            expression: self.alias.to_string(),
            field: self.field.unwrap_or_default().to_string(),
            expected,
            actual: self.value.type_name(),
        }
    }
}

/// An incremental statistic over one field of a group's records.
///
/// `update` is called once per record with the expression's own hidden
/// state, if it declares one, and returns the new visible result.
pub trait StatExpression: Send + Sync {
    /// Expression kind, e.g. "median"
    fn name(&self) -> &str;

    fn default_null_policy(&self) -> NullPolicy {
        NullPolicy::Skip
    }

    /// Whether the expression needs an input field
    fn requires_field(&self) -> bool {
        true
    }

    /// Hidden state for a new group, if any
    fn initial_state(&self) -> Option<ExprState> {
        None
    }

    fn update(&self, input: &StatInput<'_>, state: Option<&mut ExprState>)
        -> OperatorResult<Value>;
}

fn state_mismatch(input: &StatInput<'_>, expected: &str, found: Option<&ExprState>) -> OperatorError {
    OperatorError::Store(StoreError::Serialization(format!(
        "expression '{}' expected {} state, found {}",
        input.alias,
        expected,
        found.map_or("none", ExprState::kind)
    )))
}

macro_rules! expect_state {
    ($input:expr, $state:expr, $variant:ident, $kind:literal) => {
        match $state {
            Some(ExprState::$variant(s)) => s,
            other => return Err(state_mismatch($input, $kind, other.as_deref())),
        }
    };
}

/// Number of records seen
#[derive(Debug, Clone, Copy, Default)]
pub struct Count;

impl StatExpression for Count {
    fn name(&self) -> &str {
        "count"
    }

    fn requires_field(&self) -> bool {
        false
    }

    fn update(&self, input: &StatInput<'_>, _state: Option<&mut ExprState>) -> OperatorResult<Value> {
        Ok(Value::Int(input.previous.as_int().unwrap_or(0) + 1))
    }
}

/// Running sum. Integer inputs keep an integer sum until it would overflow.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sum;

impl StatExpression for Sum {
    fn name(&self) -> &str {
        "sum"
    }

    fn update(&self, input: &StatInput<'_>, _state: Option<&mut ExprState>) -> OperatorResult<Value> {
        let x = input.number()?;
        Ok(match (input.previous, input.value) {
            (Value::Null, v) => v.clone(),
            (Value::Int(a), Value::Int(b)) => match a.checked_add(*b) {
                Some(sum) => Value::Int(sum),
                None => Value::Float(*a as f64 + *b as f64),
            },
            (prev, _) => {
                let sum = prev.as_float().unwrap_or(0.0) + x;
                if !sum.is_finite() {
                    return Err(input.non_finite());
                }
                Value::Float(sum)
            }
        })
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Average;

impl StatExpression for Average {
    fn name(&self) -> &str {
        "average"
    }

    fn initial_state(&self) -> Option<ExprState> {
        Some(ExprState::Mean(RunningMean::default()))
    }

    fn update(&self, input: &StatInput<'_>, state: Option<&mut ExprState>) -> OperatorResult<Value> {
        let x = input.number()?;
        let acc = expect_state!(input, state, Mean, "mean");
        acc.push(x);
        Ok(acc.mean().map_or(Value::Null, Value::Float))
    }
}

fn extremum(input: &StatInput<'_>, keep_if: std::cmp::Ordering) -> OperatorResult<Value> {
    if input.previous.is_null() {
        return Ok(input.value.clone());
    }
    match input.value.compare(input.previous) {
        Some(ord) if ord == keep_if => Ok(input.value.clone()),
        Some(_) => Ok(input.previous.clone()),
        None => Err(input.mismatch(input.previous.type_name())),
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Min;

impl StatExpression for Min {
    fn name(&self) -> &str {
        "min"
    }

    fn update(&self, input: &StatInput<'_>, _state: Option<&mut ExprState>) -> OperatorResult<Value> {
        extremum(input, std::cmp::Ordering::Less)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Max;

impl StatExpression for Max {
    fn name(&self) -> &str {
        "max"
    }

    fn update(&self, input: &StatInput<'_>, _state: Option<&mut ExprState>) -> OperatorResult<Value> {
        extremum(input, std::cmp::Ordering::Greater)
    }
}

/// `max - min` over numeric values
#[derive(Debug, Clone, Copy, Default)]
pub struct Range;

impl StatExpression for Range {
    fn name(&self) -> &str {
        "range"
    }

    fn initial_state(&self) -> Option<ExprState> {
        Some(ExprState::Range(RunningRange::default()))
    }

    fn update(&self, input: &StatInput<'_>, state: Option<&mut ExprState>) -> OperatorResult<Value> {
        input.number()?;
        let acc = expect_state!(input, state, Range, "range");
        acc.push(input.value);
        Ok(acc.range())
    }
}

/// Variance by Welford's algorithm.
///
/// Fails on null input unless configured to skip.
#[derive(Debug, Clone, Copy, Default)]
pub struct Variance {
    /// Use the n - 1 denominator
    pub sample: bool,
}

impl Variance {
    pub fn population() -> Self {
        Self { sample: false }
    }

    pub fn sample() -> Self {
        Self { sample: true }
    }
}

impl StatExpression for Variance {
    fn name(&self) -> &str {
        "variance"
    }

    fn default_null_policy(&self) -> NullPolicy {
        NullPolicy::Fail
    }

    fn initial_state(&self) -> Option<ExprState> {
        Some(ExprState::Variance(RunningVariance::default()))
    }

    fn update(&self, input: &StatInput<'_>, state: Option<&mut ExprState>) -> OperatorResult<Value> {
        let x = input.number()?;
        let acc = expect_state!(input, state, Variance, "variance");
        acc.push(x);
        Ok(Value::Float(if self.sample {
            acc.sample()
        } else {
            acc.population()
        }))
    }
}

/// Square root of [`Variance`]
#[derive(Debug, Clone, Copy, Default)]
pub struct StdDev {
    pub sample: bool,
}

impl StdDev {
    pub fn population() -> Self {
        Self { sample: false }
    }

    pub fn sample() -> Self {
        Self { sample: true }
    }
}

impl StatExpression for StdDev {
    fn name(&self) -> &str {
        "stddev"
    }

    fn default_null_policy(&self) -> NullPolicy {
        NullPolicy::Fail
    }

    fn initial_state(&self) -> Option<ExprState> {
        Some(ExprState::Variance(RunningVariance::default()))
    }

    fn update(&self, input: &StatInput<'_>, state: Option<&mut ExprState>) -> OperatorResult<Value> {
        let variance = Variance {
            sample: self.sample,
        }
        .update(input, state)?;
        Ok(Value::Float(variance.as_float().unwrap_or(0.0).sqrt()))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Median;

impl StatExpression for Median {
    fn name(&self) -> &str {
        "median"
    }

    fn initial_state(&self) -> Option<ExprState> {
        Some(ExprState::Median(MedianHeaps::default()))
    }

    fn update(&self, input: &StatInput<'_>, state: Option<&mut ExprState>) -> OperatorResult<Value> {
        let x = input.number()?;
        let heaps = expect_state!(input, state, Median, "median");
        heaps.push(x);
        Ok(heaps.median().map_or(Value::Null, Value::Float))
    }
}

/// Linearly interpolated percentile over every value seen
#[derive(Debug, Clone, Copy)]
pub struct Percentile {
    p: f64,
}

impl Percentile {
    /// `p` must lie in `[0, 100]`.
    pub fn new(p: f64) -> Result<Self, ConfigError> {
        if !(0.0..=100.0).contains(&p) {
            return Err(ConfigError::InvalidParameter {
                operator: "percentile",
                parameter: "p",
                reason: format!("{} is outside [0, 100]", p),
            });
        }
        Ok(Self { p })
    }

    pub fn p(&self) -> f64 {
        self.p
    }
}

impl StatExpression for Percentile {
    fn name(&self) -> &str {
        "percentile"
    }

    fn initial_state(&self) -> Option<ExprState> {
        Some(ExprState::Samples(SortedSamples::default()))
    }

    fn update(&self, input: &StatInput<'_>, state: Option<&mut ExprState>) -> OperatorResult<Value> {
        let x = input.number()?;
        let samples = expect_state!(input, state, Samples, "samples");
        samples.push(x);
        Ok(samples.percentile(self.p).map_or(Value::Null, Value::Float))
    }
}

/// Most frequent values; ties are all reported, in first-seen order
#[derive(Debug, Clone, Copy, Default)]
pub struct Mode;

impl StatExpression for Mode {
    fn name(&self) -> &str {
        "mode"
    }

    fn initial_state(&self) -> Option<ExprState> {
        Some(ExprState::Frequency(FrequencyTable::default()))
    }

    fn update(&self, input: &StatInput<'_>, state: Option<&mut ExprState>) -> OperatorResult<Value> {
        let table = expect_state!(input, state, Frequency, "frequency");
        table.push(input.value);
        Ok(Value::Array(table.modes()))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DistinctCount;

impl StatExpression for DistinctCount {
    fn name(&self) -> &str {
        "distinct_count"
    }

    fn initial_state(&self) -> Option<ExprState> {
        Some(ExprState::Distinct(DistinctSet::default()))
    }

    fn update(&self, input: &StatInput<'_>, state: Option<&mut ExprState>) -> OperatorResult<Value> {
        let set = expect_state!(input, state, Distinct, "distinct");
        set.push(input.value);
        Ok(Value::Int(set.len() as i64))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct First;

impl StatExpression for First {
    fn name(&self) -> &str {
        "first"
    }

    fn update(&self, input: &StatInput<'_>, _state: Option<&mut ExprState>) -> OperatorResult<Value> {
        if input.previous.is_null() {
            Ok(input.value.clone())
        } else {
            Ok(input.previous.clone())
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Last;

impl StatExpression for Last {
    fn name(&self) -> &str {
        "last"
    }

    fn update(&self, input: &StatInput<'_>, _state: Option<&mut ExprState>) -> OperatorResult<Value> {
        Ok(input.value.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Drive one expression over `values` the way the engine does.
    fn run(expr: &dyn StatExpression, values: &[Value]) -> OperatorResult<Vec<Value>> {
        let mut state = expr.initial_state();
        let mut previous = Value::Null;
        let mut out = Vec::new();
        for value in values {
            let input = StatInput {
                group_key: "g",
                alias: expr.name(),
                field: Some("x"),
                value,
                previous: &previous,
            };
            previous = expr.update(&input, state.as_mut())?;
            out.push(previous.clone());
        }
        Ok(out)
    }

    fn ints(xs: &[i64]) -> Vec<Value> {
        xs.iter().map(|x| Value::Int(*x)).collect()
    }

    #[test]
    fn test_count_and_sum() {
        assert_eq!(run(&Count, &ints(&[5, 5, 5])).unwrap(), ints(&[1, 2, 3]));
        assert_eq!(run(&Sum, &ints(&[1, 2, 3])).unwrap(), ints(&[1, 3, 6]));

        let mixed = vec![Value::Int(1), Value::Float(0.5)];
        assert_eq!(
            run(&Sum, &mixed).unwrap(),
            vec![Value::Int(1), Value::Float(1.5)]
        );
    }

    #[test]
    fn test_sum_overflow_falls_back_to_float() {
        let out = run(&Sum, &ints(&[i64::MAX, 1])).unwrap();
        assert!(matches!(out[1], Value::Float(_)));
    }

    #[test]
    fn test_average() {
        let out = run(&Average, &ints(&[2, 4, 9])).unwrap();
        assert_eq!(
            out,
            vec![Value::Float(2.0), Value::Float(3.0), Value::Float(5.0)]
        );
    }

    #[test]
    fn test_min_max_range() {
        let xs = ints(&[5, 3, 8]);
        assert_eq!(run(&Min, &xs).unwrap(), ints(&[5, 3, 3]));
        assert_eq!(run(&Max, &xs).unwrap(), ints(&[5, 5, 8]));
        assert_eq!(run(&Range, &xs).unwrap(), ints(&[0, 2, 5]));
    }

    #[test]
    fn test_min_over_strings() {
        let xs = vec![Value::from("pear"), Value::from("apple")];
        assert_eq!(run(&Min, &xs).unwrap()[1], Value::from("apple"));
    }

    #[test]
    fn test_min_rejects_incomparable_types() {
        let xs = vec![Value::Int(1), Value::from("x")];
        assert!(matches!(
            run(&Min, &xs),
            Err(OperatorError::TypeMismatch {
                expected: "int",
                actual: "str",
                ..
            })
        ));
    }

    #[test]
    fn test_variance_and_stddev_known_values() {
        let xs = ints(&[10, -20]);
        let sample = run(&Variance::sample(), &xs).unwrap();
        let population = run(&Variance::population(), &xs).unwrap();
        assert_eq!(sample[0], Value::Float(0.0));
        assert_eq!(sample[1], Value::Float(450.0));
        assert_eq!(population[1], Value::Float(225.0));

        let sd = run(&StdDev::sample(), &xs).unwrap()[1].as_float().unwrap();
        assert!((sd - 21.2132).abs() < 1e-4);
        let sd = run(&StdDev::population(), &xs).unwrap()[1]
            .as_float()
            .unwrap();
        assert!((sd - 15.0).abs() < 1e-9);
    }

    #[test]
    fn test_variance_fails_on_null_by_default() {
        assert_eq!(Variance::default().default_null_policy(), NullPolicy::Fail);
        assert_eq!(StdDev::default().default_null_policy(), NullPolicy::Fail);
        assert_eq!(Median.default_null_policy(), NullPolicy::Skip);
    }

    #[test]
    fn test_median_sequences() {
        let floats = |xs: &[f64]| xs.iter().map(|x| Value::Float(*x)).collect::<Vec<_>>();
        assert_eq!(
            run(&Median, &ints(&[10, 20, 30])).unwrap(),
            floats(&[10.0, 15.0, 20.0])
        );
        assert_eq!(
            run(&Median, &ints(&[10, 20, 5, 0])).unwrap(),
            floats(&[10.0, 15.0, 10.0, 7.5])
        );
    }

    #[test]
    fn test_percentile_50_matches_median() {
        let xs = ints(&[7, 1, 9, 4, 4, 12, 3]);
        let p50 = run(&Percentile::new(50.0).unwrap(), &xs).unwrap();
        assert_eq!(p50, run(&Median, &xs).unwrap());
    }

    #[test]
    fn test_percentile_bounds() {
        assert!(Percentile::new(-0.1).is_err());
        assert!(Percentile::new(100.1).is_err());
        assert!(Percentile::new(f64::NAN).is_err());
        assert_eq!(Percentile::new(95.0).unwrap().p(), 95.0);
    }

    #[test]
    fn test_mode_tie_set() {
        let xs = vec![
            Value::from("apple"),
            Value::from("banana"),
            Value::from("apple"),
        ];
        let out = run(&Mode, &xs).unwrap();
        assert_eq!(out[0], Value::Array(vec![Value::from("apple")]));
        assert_eq!(
            out[1],
            Value::Array(vec![Value::from("apple"), Value::from("banana")])
        );
        assert_eq!(out[2], Value::Array(vec![Value::from("apple")]));
    }

    #[test]
    fn test_distinct_first_last() {
        let xs = ints(&[3, 1, 3, 2]);
        assert_eq!(run(&DistinctCount, &xs).unwrap(), ints(&[1, 2, 2, 3]));
        assert_eq!(run(&First, &xs).unwrap(), ints(&[3, 3, 3, 3]));
        assert_eq!(run(&Last, &xs).unwrap(), xs);
    }

    #[test]
    fn test_numeric_expressions_reject_strings() {
        let xs = vec![Value::from("ten")];
        for expr in [
            &Sum as &dyn StatExpression,
            &Average,
            &Range,
            &Median,
            &Variance::population(),
        ] {
            assert!(matches!(
                run(expr, &xs),
                Err(OperatorError::TypeMismatch {
                    expected: "numeric",
                    ..
                })
            ));
        }
    }

    #[test]
    fn test_numeric_expressions_reject_non_finite() {
        for bad in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let xs = vec![Value::Float(bad)];
            for expr in [
                &Sum as &dyn StatExpression,
                &Average,
                &Range,
                &Median,
                &Percentile::new(90.0).unwrap(),
                &Variance::sample(),
            ] {
                assert!(matches!(
                    run(expr, &xs),
                    Err(OperatorError::NonFinite { ref field, .. }) if field == "x"
                ));
            }
        }
    }

    #[test]
    fn test_sum_overflow_to_infinity_is_rejected() {
        let xs = vec![Value::Float(1e308), Value::Float(1e308)];
        assert!(matches!(
            run(&Sum, &xs),
            Err(OperatorError::NonFinite { ref expression, .. }) if expression == "sum"
        ));
    }

    #[test]
    fn test_wrong_state_is_reported() {
        let input = StatInput {
            group_key: "g",
            alias: "avg",
            field: Some("x"),
            value: &Value::Int(1),
            previous: &Value::Null,
        };
        let mut wrong = ExprState::Distinct(DistinctSet::default());
        assert!(matches!(
            Average.update(&input, Some(&mut wrong)),
            Err(OperatorError::Store(StoreError::Serialization(_)))
        ));
    }
}
