//! Declarative statistics definitions, as found in configuration files

use serde::{Deserialize, Serialize};

use super::expr::{
    Average, Count, DistinctCount, First, Last, Max, Median, Min, Mode, NullPolicy, Percentile,
    Range, StdDev, Sum, Variance,
};
use super::{Expression, StatisticsConfig, StatisticsOperator};
use crate::error::ConfigError;

/// Built-in expression kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatKind {
    Count,
    Sum,
    Average,
    Min,
    Max,
    Range,
    Variance,
    Stddev,
    Median,
    Percentile,
    Mode,
    DistinctCount,
    First,
    Last,
}

/// One expression in a [`StatisticsSpec`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpressionSpec {
    pub kind: StatKind,
    #[serde(default)]
    pub field: Option<String>,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub null_policy: Option<NullPolicy>,
    /// Percentile rank in `[0, 100]`
    #[serde(default)]
    pub p: Option<f64>,
    /// Sample rather than population variance / stddev
    #[serde(default)]
    pub sample: bool,
}

impl ExpressionSpec {
    pub fn new(kind: StatKind) -> Self {
        Self {
            kind,
            field: None,
            alias: None,
            null_policy: None,
            p: None,
            sample: false,
        }
    }

    pub fn build(&self) -> Result<Expression, ConfigError> {
        let mut expr = match self.kind {
            StatKind::Count => Expression::new(Count),
            StatKind::Sum => Expression::new(Sum),
            StatKind::Average => Expression::new(Average),
            StatKind::Min => Expression::new(Min),
            StatKind::Max => Expression::new(Max),
            StatKind::Range => Expression::new(Range),
            StatKind::Variance => Expression::new(Variance {
                sample: self.sample,
            }),
            StatKind::Stddev => Expression::new(StdDev {
                sample: self.sample,
            }),
            StatKind::Median => Expression::new(Median),
            StatKind::Percentile => {
                let p = self.p.ok_or(ConfigError::MissingParameter {
                    operator: "percentile",
                    parameter: "p",
                })?;
                Expression::new(Percentile::new(p)?)
            }
            StatKind::Mode => Expression::new(Mode),
            StatKind::DistinctCount => Expression::new(DistinctCount),
            StatKind::First => Expression::new(First),
            StatKind::Last => Expression::new(Last),
        };

        if let Some(field) = &self.field {
            expr = expr.field(field.as_str());
        }
        if let Some(alias) = &self.alias {
            expr = expr.alias(alias.as_str());
        }
        if let Some(policy) = self.null_policy {
            expr = expr.null_policy(policy);
        }
        Ok(expr)
    }
}

/// A named statistics operator definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatisticsSpec {
    /// Base name; the operator's store is `<name>-stats`
    pub name: String,
    #[serde(default)]
    pub group_by: Vec<String>,
    pub expressions: Vec<ExpressionSpec>,
}

impl StatisticsSpec {
    pub fn build<K>(&self) -> Result<StatisticsOperator<K>, ConfigError> {
        let mut config = StatisticsConfig::new();
        for field in &self.group_by {
            config = config.group_by(field.as_str());
        }
        for expr in &self.expressions {
            config = config.expression(expr.build()?);
        }
        StatisticsOperator::new(&self.name, config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_percentile_requires_p() {
        let mut spec = ExpressionSpec::new(StatKind::Percentile);
        spec.field = Some("latency".into());
        assert!(matches!(
            spec.build(),
            Err(ConfigError::MissingParameter { parameter: "p", .. })
        ));

        spec.p = Some(99.0);
        let expr = spec.build().unwrap();
        assert_eq!(expr.output_name(), "percentile");
        assert_eq!(expr.internal_key(), "_percentile_percentile");
    }

    #[test]
    fn test_spec_overrides_null_policy() {
        let spec = ExpressionSpec {
            kind: StatKind::Stddev,
            field: Some("price".into()),
            alias: Some("price_sd".into()),
            null_policy: Some(NullPolicy::Skip),
            p: None,
            sample: true,
        };
        let expr = spec.build().unwrap();
        assert_eq!(expr.output_name(), "price_sd");
        assert_eq!(expr.effective_null_policy(), NullPolicy::Skip);
    }

    #[test]
    fn test_statistics_spec_from_json() {
        let spec: StatisticsSpec = serde_json::from_str(
            r#"{
                "name": "trades",
                "group_by": ["symbol"],
                "expressions": [
                    {"kind": "count"},
                    {"kind": "average", "field": "price", "alias": "avg_price"}
                ]
            }"#,
        )
        .unwrap();
        let op = spec.build::<String>().unwrap();
        assert_eq!(
            crate::processor::Transformer::<String, tributary_core::Record>::name(&op),
            "trades-stats"
        );
    }

    #[test]
    fn test_empty_expression_list_is_rejected() {
        let spec = StatisticsSpec {
            name: "trades".into(),
            group_by: vec![],
            expressions: vec![],
        };
        assert!(matches!(
            spec.build::<String>(),
            Err(ConfigError::MissingParameter {
                parameter: "expressions",
                ..
            })
        ));
    }
}
