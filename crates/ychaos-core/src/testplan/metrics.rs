//! Verification criteria over time-series metrics: aggregators, comparators
//! and the criteria shapes referenced by the TSDB verification plugin.

use std::collections::BTreeMap;

use rand::seq::IteratorRandom;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::SystemState;

/// A dense time-to-value series, keyed by POSIX seconds.
pub type TimeSeries = BTreeMap<i64, f64>;

/// Errors raised while evaluating metrics criteria.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// The `slope` aggregator is reserved but not implemented.
    #[error("the `slope` aggregator is not implemented")]
    UnimplementedAggregator,

    /// The condition value shape does not fit the comparator.
    #[error("condition value does not match the `{0}` comparator")]
    MalformedCondition(&'static str),

    /// A percent-change comparison had no stored prior-state value.
    #[error("no prior state value available for percent-change comparison")]
    MissingPriorValue,
}

/// Transforms a time series into a single comparable value.
///
/// NaN datapoints are filtered before aggregation. An empty series (or one
/// that is all NaN) aggregates to no value, which satisfies no conditional.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MetricsAggregator {
    /// Average of all valid datapoints.
    #[default]
    Avg,
    /// The most recent valid datapoint.
    Latest,
    /// The oldest valid datapoint.
    Oldest,
    /// A random valid datapoint.
    Random,
    /// The largest valid datapoint.
    Max,
    /// The smallest valid datapoint.
    Min,
    /// Reserved. Evaluating it is an error.
    Slope,
}

impl MetricsAggregator {
    /// Aggregate `series` into a single value, if any valid datapoint exists.
    pub fn aggregate(&self, series: &TimeSeries) -> Result<Option<f64>, MetricsError> {
        let mut valid = series.iter().filter(|(_, value)| !value.is_nan()).peekable();
        if valid.peek().is_none() {
            return Ok(None);
        }
        let value = match self {
            Self::Avg => {
                let (sum, count) = valid.fold((0.0, 0u32), |(sum, count), (_, value)| {
                    (sum + value, count + 1)
                });
                sum / f64::from(count)
            }
            Self::Latest => *valid.last().map(|(_, value)| value).expect("non-empty"),
            Self::Oldest => *valid.next().map(|(_, value)| value).expect("non-empty"),
            Self::Random => *valid
                .map(|(_, value)| value)
                .choose(&mut rand::rng())
                .expect("non-empty"),
            Self::Max => valid.map(|(_, value)| *value).fold(f64::NEG_INFINITY, f64::max),
            Self::Min => valid.map(|(_, value)| *value).fold(f64::INFINITY, f64::min),
            Self::Slope => return Err(MetricsError::UnimplementedAggregator),
        };
        Ok(Some(value))
    }
}

/// Comparison operator between aggregated data and the expected value.
///
/// The range variants encode endpoint inclusiveness in the tag itself; the
/// bare `range` tag means exclusive on both ends. `pct` is only meaningful in
/// state-bound criteria.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetricsComparator {
    /// Strictly less than.
    #[serde(rename = "lt", alias = "<")]
    Lt,
    /// Less than or equal.
    #[serde(rename = "le", alias = "<=")]
    Le,
    /// Strictly greater than.
    #[serde(rename = "gt", alias = ">")]
    Gt,
    /// Greater than or equal.
    #[serde(rename = "ge", alias = ">=")]
    Ge,
    /// Equal.
    #[serde(rename = "eq", alias = "==")]
    Eq,
    /// Not equal.
    #[serde(rename = "neq", alias = "!=")]
    Neq,
    /// Within an exclusive-exclusive range.
    #[serde(rename = "range", alias = "()")]
    RangeOpen,
    /// Within an inclusive-exclusive range.
    #[serde(rename = "[)")]
    RangeClosedOpen,
    /// Within an exclusive-inclusive range.
    #[serde(rename = "(]")]
    RangeOpenClosed,
    /// Within an inclusive-inclusive range.
    #[serde(rename = "[]")]
    RangeClosed,
    /// Percent change against the stored prior-state value.
    #[serde(rename = "pct", alias = "%%")]
    PctChange,
}

/// The expected side of a comparison: a scalar or a 2-element range whose
/// missing endpoints default to the respective infinity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionValue {
    /// A single numeric bound.
    Scalar(f64),
    /// A `[low, high]` pair; `null` endpoints are unbounded.
    Range(Option<f64>, Option<f64>),
}

impl ConditionValue {
    fn scalar(&self, comparator: &'static str) -> Result<f64, MetricsError> {
        match self {
            Self::Scalar(value) => Ok(*value),
            Self::Range(..) => Err(MetricsError::MalformedCondition(comparator)),
        }
    }

    fn bounds(&self, comparator: &'static str) -> Result<(f64, f64), MetricsError> {
        match self {
            Self::Range(low, high) => Ok((
                low.unwrap_or(f64::NEG_INFINITY),
                high.unwrap_or(f64::INFINITY),
            )),
            Self::Scalar(_) => Err(MetricsError::MalformedCondition(comparator)),
        }
    }
}

/// A single conditional applied to the aggregated value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonCondition {
    /// The comparison operator.
    pub comparator: MetricsComparator,
    /// Numerical value or range to compare against.
    pub value: ConditionValue,
}

impl ComparisonCondition {
    /// Whether the condition holds for `data`. No data satisfies nothing.
    pub fn holds(&self, data: Option<f64>) -> Result<bool, MetricsError> {
        self.holds_with_prior(data, None)
    }

    /// Whether the condition holds, with the stored prior-state value made
    /// available for the percent-change comparator.
    pub fn holds_with_prior(
        &self,
        data: Option<f64>,
        prior: Option<f64>,
    ) -> Result<bool, MetricsError> {
        let Some(data) = data else {
            // NaN analogue: no valid datapoint compares false everywhere,
            // except that pct still needs a prior to even get that far.
            if self.comparator == MetricsComparator::PctChange && prior.is_none() {
                return Err(MetricsError::MissingPriorValue);
            }
            return Ok(false);
        };

        match self.comparator {
            MetricsComparator::Lt => Ok(data < self.value.scalar("lt")?),
            MetricsComparator::Le => Ok(data <= self.value.scalar("le")?),
            MetricsComparator::Gt => Ok(data > self.value.scalar("gt")?),
            MetricsComparator::Ge => Ok(data >= self.value.scalar("ge")?),
            MetricsComparator::Eq => Ok(data == self.value.scalar("eq")?),
            MetricsComparator::Neq => Ok(data != self.value.scalar("neq")?),
            MetricsComparator::RangeOpen => {
                let (low, high) = self.value.bounds("range")?;
                Ok(low < data && data < high)
            }
            MetricsComparator::RangeClosedOpen => {
                let (low, high) = self.value.bounds("[)")?;
                Ok(low <= data && data < high)
            }
            MetricsComparator::RangeOpenClosed => {
                let (low, high) = self.value.bounds("(]")?;
                Ok(low < data && data <= high)
            }
            MetricsComparator::RangeClosed => {
                let (low, high) = self.value.bounds("[]")?;
                Ok(low <= data && data <= high)
            }
            MetricsComparator::PctChange => {
                let prior = prior.ok_or(MetricsError::MissingPriorValue)?;
                let pct_change = ((data - prior) / prior) * 100.0;
                match self.value {
                    ConditionValue::Scalar(expected) => Ok(pct_change == expected),
                    ConditionValue::Range(low, high) => Ok(low
                        .unwrap_or(f64::NEG_INFINITY)
                        <= pct_change
                        && pct_change <= high.unwrap_or(f64::INFINITY)),
                }
            }
        }
    }
}

/// A stateless metrics criterion: one aggregator, several conditionals of
/// which any one passing marks the criterion as passed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsCriteria {
    /// How the series is reduced to a comparable value.
    #[serde(default)]
    pub aggregator: MetricsAggregator,
    /// Conditionals, any one of which needs to pass.
    #[serde(default)]
    pub conditionals: Vec<ComparisonCondition>,
}

impl MetricsCriteria {
    /// Evaluate this criterion against one series.
    pub fn passes(&self, series: &TimeSeries) -> Result<bool, MetricsError> {
        let aggregated = self.aggregator.aggregate(series)?;
        for condition in &self.conditionals {
            if condition.holds(aggregated)? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// A state-bound metrics criterion: one condition per system state, with the
/// percent-change comparator measured against the stored prior-state value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateBoundMetricsCriteria {
    /// How the series is reduced to a comparable value.
    #[serde(default)]
    pub aggregator: MetricsAggregator,
    /// The condition to apply while the system is in a given state.
    pub criteria: BTreeMap<SystemState, ComparisonCondition>,
}

impl StateBoundMetricsCriteria {
    /// The condition bound to `state`, if any.
    pub fn condition_for(&self, state: SystemState) -> Option<&ComparisonCondition> {
        self.criteria.get(&state)
    }
}
