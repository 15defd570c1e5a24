//! Typed internal state of the stateful statistical expressions
//!
//! Each accumulator is updated one value at a time and serialized with its
//! aggregate record, so a restored record resumes exactly where it stopped.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use tributary_core::Value;

/// Hidden state of one expression within an aggregate record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "state", rename_all = "snake_case")]
pub enum ExprState {
    Mean(RunningMean),
    Range(RunningRange),
    Variance(RunningVariance),
    Median(MedianHeaps),
    Samples(SortedSamples),
    Frequency(FrequencyTable),
    Distinct(DistinctSet),
}

impl ExprState {
    pub fn kind(&self) -> &'static str {
        match self {
            ExprState::Mean(_) => "mean",
            ExprState::Range(_) => "range",
            ExprState::Variance(_) => "variance",
            ExprState::Median(_) => "median",
            ExprState::Samples(_) => "samples",
            ExprState::Frequency(_) => "frequency",
            ExprState::Distinct(_) => "distinct",
        }
    }
}

/// Running sum and count
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunningMean {
    pub sum: f64,
    pub count: u64,
}

impl RunningMean {
    pub fn push(&mut self, x: f64) {
        self.sum += x;
        self.count += 1;
    }

    pub fn mean(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }
}

/// Smallest and largest value seen
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunningRange {
    pub min: Option<Value>,
    pub max: Option<Value>,
}

impl RunningRange {
    /// Numeric values only; the caller checks the type.
    pub fn push(&mut self, value: &Value) {
        let replace = |current: &Option<Value>, wanted: Ordering| match current {
            None => true,
            Some(c) => value.compare(c) == Some(wanted),
        };
        if replace(&self.min, Ordering::Less) {
            self.min = Some(value.clone());
        }
        if replace(&self.max, Ordering::Greater) {
            self.max = Some(value.clone());
        }
    }

    /// `max - min`, kept as an integer when both ends are integers
    pub fn range(&self) -> Value {
        match (&self.min, &self.max) {
            (Some(Value::Int(lo)), Some(Value::Int(hi))) => match hi.checked_sub(*lo) {
                Some(d) => Value::Int(d),
                None => Value::Float(*hi as f64 - *lo as f64),
            },
            (Some(lo), Some(hi)) => match (lo.as_float(), hi.as_float()) {
                (Some(lo), Some(hi)) => Value::Float(hi - lo),
                _ => Value::Null,
            },
            _ => Value::Null,
        }
    }
}

/// Welford's online mean and sum of squared deviations.
///
/// Shared by variance and standard deviation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunningVariance {
    pub count: u64,
    pub mean: f64,
    pub m2: f64,
}

impl RunningVariance {
    pub fn push(&mut self, x: f64) {
        self.count += 1;
        let delta = x - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (x - self.mean);
    }

    /// Population variance; zero until two values are seen
    pub fn population(&self) -> f64 {
        if self.count <= 1 {
            0.0
        } else {
            self.m2 / self.count as f64
        }
    }

    /// Sample variance (n - 1 denominator); zero until two values are seen
    pub fn sample(&self) -> f64 {
        if self.count <= 1 {
            0.0
        } else {
            self.m2 / (self.count - 1) as f64
        }
    }
}

/// Max-heap ordering over f64
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrdF64(pub f64);

impl Eq for OrdF64 {}

impl PartialOrd for OrdF64 {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrdF64 {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// Min-heap ordering over f64
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MinF64(pub f64);

impl Eq for MinF64 {}

impl PartialOrd for MinF64 {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MinF64 {
    fn cmp(&self, other: &Self) -> Ordering {
        other.0.total_cmp(&self.0)
    }
}

/// Streaming median: lower half in a max-heap, upper half in a min-heap.
///
/// The lower half holds at most one more value than the upper half.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MedianHeaps {
    lower: BinaryHeap<OrdF64>,
    upper: BinaryHeap<MinF64>,
}

impl PartialEq for MedianHeaps {
    fn eq(&self, other: &Self) -> bool {
        self.lower.clone().into_sorted_vec() == other.lower.clone().into_sorted_vec()
            && self.upper.clone().into_sorted_vec() == other.upper.clone().into_sorted_vec()
    }
}

impl MedianHeaps {
    pub fn push(&mut self, x: f64) {
        match self.lower.peek() {
            Some(top) if x >= top.0 => self.upper.push(MinF64(x)),
            _ => self.lower.push(OrdF64(x)),
        }

        if self.lower.len() > self.upper.len() + 1 {
            if let Some(OrdF64(v)) = self.lower.pop() {
                self.upper.push(MinF64(v));
            }
        } else if self.upper.len() > self.lower.len() {
            if let Some(MinF64(v)) = self.upper.pop() {
                self.lower.push(OrdF64(v));
            }
        }
    }

    pub fn len(&self) -> usize {
        self.lower.len() + self.upper.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lower.is_empty()
    }

    pub fn median(&self) -> Option<f64> {
        let lo = self.lower.peek()?.0;
        if self.lower.len() == self.upper.len() {
            let hi = self.upper.peek()?.0;
            Some((lo + hi) / 2.0)
        } else {
            Some(lo)
        }
    }
}

/// Every value seen, kept sorted
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SortedSamples {
    values: Vec<f64>,
}

impl SortedSamples {
    pub fn push(&mut self, x: f64) {
        let idx = self.values.partition_point(|v| v.total_cmp(&x) != Ordering::Greater);
        self.values.insert(idx, x);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Linearly interpolated percentile, `p` in `[0, 100]`.
    ///
    /// The 1-based rank is `p / 100 * (n - 1) + 1`.
    pub fn percentile(&self, p: f64) -> Option<f64> {
        let n = self.values.len();
        if n == 0 {
            return None;
        }
        let rank = p / 100.0 * (n - 1) as f64 + 1.0;
        let lower_rank = rank.floor();
        let idx = (lower_rank as usize).saturating_sub(1).min(n - 1);
        let frac = rank - lower_rank;

        let lo = self.values[idx];
        match self.values.get(idx + 1) {
            Some(hi) if frac > 0.0 => Some(lo + frac * (hi - lo)),
            _ => Some(lo),
        }
    }
}

/// A value and how often it was seen
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frequency {
    pub value: Value,
    pub count: u64,
}

/// Occurrence counts keyed by [`Value::identity_key`], in first-seen order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FrequencyTable {
    counts: IndexMap<String, Frequency>,
}

impl FrequencyTable {
    pub fn push(&mut self, value: &Value) {
        self.counts
            .entry(value.identity_key())
            .or_insert_with(|| Frequency {
                value: value.clone(),
                count: 0,
            })
            .count += 1;
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// All values tied at the highest count, in first-seen order
    pub fn modes(&self) -> Vec<Value> {
        let Some(max) = self.counts.values().map(|f| f.count).max() else {
            return Vec::new();
        };
        self.counts
            .values()
            .filter(|f| f.count == max)
            .map(|f| f.value.clone())
            .collect()
    }
}

/// Distinct values seen, by identity key
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DistinctSet {
    seen: IndexSet<String>,
}

impl DistinctSet {
    pub fn push(&mut self, value: &Value) {
        self.seen.insert(value.identity_key());
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}
