//! Metric, slice, and segment specifications plus the reporting time window.
//!
//! These arrive already validated by the spec loader; the planner only checks
//! the structural invariants it depends on (ratio/denominator pairing, names).

use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Sentinel used for `slice_type` and `segment_name` when nothing was supplied.
pub const NONE_SENTINEL: &str = "none";
/// Sentinel used for `slice_value` when no slices were supplied.
pub const ALL_SENTINEL: &str = "all";
/// Separator joining slice names/values of a multi-slice combination.
pub const SLICE_SEPARATOR: char = '|';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregationKind {
    Sum,
    Avg,
    Count,
    Min,
    Max,
    Ratio,
}

impl AggregationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AggregationKind::Sum => "sum",
            AggregationKind::Avg => "avg",
            AggregationKind::Count => "count",
            AggregationKind::Min => "min",
            AggregationKind::Max => "max",
            AggregationKind::Ratio => "ratio",
        }
    }
}

impl fmt::Display for AggregationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricSpec {
    pub name: String,
    /// Opaque source locator, e.g. `duckdb://analytics.db/events`.
    pub source: String,
    pub aggregation: AggregationKind,
    pub numerator: String,
    /// Present iff `aggregation` is `Ratio`.
    #[serde(default)]
    pub denominator: Option<String>,
    /// Column the time window is applied to.
    #[serde(default)]
    pub timestamp_col: Option<String>,
}

impl MetricSpec {
    pub fn new(
        name: impl Into<String>,
        source: impl Into<String>,
        aggregation: AggregationKind,
        numerator: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            aggregation,
            numerator: numerator.into(),
            denominator: None,
            timestamp_col: None,
        }
    }

    pub fn ratio(
        name: impl Into<String>,
        source: impl Into<String>,
        numerator: impl Into<String>,
        denominator: impl Into<String>,
    ) -> Self {
        Self::new(name, source, AggregationKind::Ratio, numerator).with_denominator(denominator)
    }

    pub fn with_denominator(mut self, denominator: impl Into<String>) -> Self {
        self.denominator = Some(denominator.into());
        self
    }

    pub fn with_timestamp_col(mut self, col: impl Into<String>) -> Self {
        self.timestamp_col = Some(col.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SliceValue {
    pub name: String,
    pub predicate: String,
}

impl SliceValue {
    pub fn new(name: impl Into<String>, predicate: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            predicate: predicate.into(),
        }
    }
}

/// A named dimension split into predicate-defined buckets. Buckets may overlap
/// and need not cover every row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SliceSpec {
    pub name: String,
    pub values: Vec<SliceValue>,
}

impl SliceSpec {
    pub fn new(name: impl Into<String>, values: Vec<SliceValue>) -> Self {
        Self {
            name: name.into(),
            values,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentSpec {
    pub name: String,
    pub predicate: String,
}

impl SegmentSpec {
    pub fn new(name: impl Into<String>, predicate: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            predicate: predicate.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeriodType {
    AllTime,
    Daily,
    Weekly,
    Monthly,
    Yearly,
    Custom,
}

impl PeriodType {
    pub fn as_str(self) -> &'static str {
        match self {
            PeriodType::AllTime => "all_time",
            PeriodType::Daily => "daily",
            PeriodType::Weekly => "weekly",
            PeriodType::Monthly => "monthly",
            PeriodType::Yearly => "yearly",
            PeriodType::Custom => "custom",
        }
    }
}

impl fmt::Display for PeriodType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inclusive pair of period boundaries supplied by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub period_type: PeriodType,
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl TimeWindow {
    pub fn new(period_type: PeriodType, start: NaiveDate, end: NaiveDate) -> Self {
        Self {
            period_type,
            start,
            end,
        }
    }

    pub fn custom(start: NaiveDate, end: NaiveDate) -> Self {
        Self::new(PeriodType::Custom, start, end)
    }

    pub fn is_empty(&self) -> bool {
        self.start > self.end
    }
}

/// Period columns stamped on every row of one compute call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Period {
    pub period_type: PeriodType,
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
}

impl Period {
    pub fn all_time() -> Self {
        Self {
            period_type: PeriodType::AllTime,
            start: None,
            end: None,
        }
    }
}

impl From<Option<&TimeWindow>> for Period {
    fn from(window: Option<&TimeWindow>) -> Self {
        match window {
            Some(w) => Self {
                period_type: w.period_type,
                start: Some(w.start),
                end: Some(w.end),
            },
            None => Self::all_time(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metric_spec_deserializes_lowercase_kind() {
        let spec: MetricSpec = serde_json::from_str(
            r#"{"name":"ctr","source":"duckdb://a.db/events","aggregation":"ratio",
                "numerator":"clicks","denominator":"impressions"}"#,
        )
        .unwrap();
        assert_eq!(spec.aggregation, AggregationKind::Ratio);
        assert_eq!(spec.denominator.as_deref(), Some("impressions"));
        assert!(spec.timestamp_col.is_none());
    }

    #[test]
    fn period_from_window() {
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let end = NaiveDate::from_ymd_opt(2024, 1, 31).unwrap();
        let window = TimeWindow::new(PeriodType::Monthly, start, end);
        let period = Period::from(Some(&window));
        assert_eq!(period.period_type.as_str(), "monthly");
        assert_eq!(period.start, Some(start));
        assert_eq!(Period::from(None).period_type, PeriodType::AllTime);
    }
}
