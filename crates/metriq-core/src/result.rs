//! Canonical long-format output table and per-plan failure records.

use std::io;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{Error, Result};
use crate::schema::{DataType, Field, Schema};
use crate::types::{Column, RowBatch, Scalar};

/// Output columns, in order.
pub const OUTPUT_COLUMNS: [&str; 8] = [
    "period_type",
    "period_start_date",
    "period_end_date",
    "metric_name",
    "slice_type",
    "slice_value",
    "segment_name",
    "metric_value",
];

/// Days between 0001-01-01 (CE day 1) and the Unix epoch.
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRow {
    pub period_type: String,
    pub period_start_date: Option<NaiveDate>,
    pub period_end_date: Option<NaiveDate>,
    pub metric_name: String,
    pub slice_type: String,
    pub slice_value: String,
    pub segment_name: String,
    pub metric_value: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultTable {
    pub rows: Vec<ResultRow>,
}

impl ResultTable {
    pub fn new(rows: Vec<ResultRow>) -> Self {
        Self { rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn schema() -> Schema {
        Schema::new(vec![
            Field::new(OUTPUT_COLUMNS[0], DataType::Utf8, false),
            Field::new(OUTPUT_COLUMNS[1], DataType::Date, true),
            Field::new(OUTPUT_COLUMNS[2], DataType::Date, true),
            Field::new(OUTPUT_COLUMNS[3], DataType::Utf8, false),
            Field::new(OUTPUT_COLUMNS[4], DataType::Utf8, false),
            Field::new(OUTPUT_COLUMNS[5], DataType::Utf8, false),
            Field::new(OUTPUT_COLUMNS[6], DataType::Utf8, false),
            Field::new(OUTPUT_COLUMNS[7], DataType::Float64, true),
        ])
    }

    /// Rows for one metric, in table order.
    pub fn rows_for<'a>(&'a self, metric: &'a str) -> impl Iterator<Item = &'a ResultRow> + 'a {
        self.rows.iter().filter(move |r| r.metric_name == metric)
    }

    /// Columnar view. Consumes the table so strings move instead of being copied.
    pub fn into_row_batch(self) -> RowBatch {
        let n = self.rows.len();
        let mut cols: Vec<Vec<Scalar>> = (0..OUTPUT_COLUMNS.len())
            .map(|_| Vec::with_capacity(n))
            .collect();
        for row in self.rows {
            cols[0].push(Scalar::Str(row.period_type));
            cols[1].push(row.period_start_date.into());
            cols[2].push(row.period_end_date.into());
            cols[3].push(Scalar::Str(row.metric_name));
            cols[4].push(Scalar::Str(row.slice_type));
            cols[5].push(Scalar::Str(row.slice_value));
            cols[6].push(Scalar::Str(row.segment_name));
            cols[7].push(row.metric_value.into());
        }
        RowBatch::new(
            OUTPUT_COLUMNS
                .iter()
                .zip(cols)
                .map(|(name, values)| Column::new(*name, values))
                .collect(),
        )
    }

    /// Write the table as CSV with a header row. NULLs become empty fields.
    pub fn write_csv<W: io::Write>(&self, writer: W) -> Result<()> {
        let mut w = csv::Writer::from_writer(writer);
        w.write_record(OUTPUT_COLUMNS)?;
        for row in &self.rows {
            let start = row.period_start_date.map(fmt_date).unwrap_or_default();
            let end = row.period_end_date.map(fmt_date).unwrap_or_default();
            let value = row.metric_value.map(|v| v.to_string()).unwrap_or_default();
            w.write_record([
                row.period_type.as_str(),
                start.as_str(),
                end.as_str(),
                row.metric_name.as_str(),
                row.slice_type.as_str(),
                row.slice_value.as_str(),
                row.segment_name.as_str(),
                value.as_str(),
            ])?;
        }
        w.flush().map_err(|e| Error::Output(e.to_string()))?;
        Ok(())
    }

    /// Arrow conversion; numeric and date buffers are built straight from the
    /// row values without an intermediate scalar representation.
    #[cfg(feature = "arrow")]
    pub fn to_record_batch(&self) -> Result<arrow_array::RecordBatch> {
        use std::sync::Arc;

        use arrow_array::{ArrayRef, Date32Array, Float64Array, RecordBatch, StringArray};
        use arrow_schema::{DataType as ArrowType, Field as ArrowField, Schema as ArrowSchema};

        let strings = |f: fn(&ResultRow) -> &str| -> ArrayRef {
            Arc::new(StringArray::from_iter_values(self.rows.iter().map(f)))
        };
        let dates = |f: fn(&ResultRow) -> Option<NaiveDate>| -> ArrayRef {
            Arc::new(Date32Array::from(
                self.rows
                    .iter()
                    .map(|r| f(r).map(days_since_epoch))
                    .collect::<Vec<_>>(),
            ))
        };

        let columns: Vec<ArrayRef> = vec![
            strings(|r| r.period_type.as_str()),
            dates(|r| r.period_start_date),
            dates(|r| r.period_end_date),
            strings(|r| r.metric_name.as_str()),
            strings(|r| r.slice_type.as_str()),
            strings(|r| r.slice_value.as_str()),
            strings(|r| r.segment_name.as_str()),
            Arc::new(Float64Array::from(
                self.rows.iter().map(|r| r.metric_value).collect::<Vec<_>>(),
            )),
        ];
        let schema = ArrowSchema::new(vec![
            ArrowField::new(OUTPUT_COLUMNS[0], ArrowType::Utf8, false),
            ArrowField::new(OUTPUT_COLUMNS[1], ArrowType::Date32, true),
            ArrowField::new(OUTPUT_COLUMNS[2], ArrowType::Date32, true),
            ArrowField::new(OUTPUT_COLUMNS[3], ArrowType::Utf8, false),
            ArrowField::new(OUTPUT_COLUMNS[4], ArrowType::Utf8, false),
            ArrowField::new(OUTPUT_COLUMNS[5], ArrowType::Utf8, false),
            ArrowField::new(OUTPUT_COLUMNS[6], ArrowType::Utf8, false),
            ArrowField::new(OUTPUT_COLUMNS[7], ArrowType::Float64, true),
        ]);
        RecordBatch::try_new(Arc::new(schema), columns).map_err(|e| Error::Output(e.to_string()))
    }
}

fn fmt_date(d: NaiveDate) -> String {
    d.format("%Y-%m-%d").to_string()
}

/// Arrow Date32 representation.
pub fn days_since_epoch(d: NaiveDate) -> i32 {
    d.num_days_from_ce() - UNIX_EPOCH_DAYS_FROM_CE
}

/// Why a plan produced no rows.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum FailureCause {
    #[error("no connector configured for backend '{backend}'")]
    ConnectorNotFound { backend: String },

    #[error("invalid source locator: {0}")]
    InvalidSource(String),

    #[error("table resolution failed: {0}")]
    TableResolution(String),

    #[error("backend '{backend}' is not available")]
    Unavailable { backend: String },

    #[error("query failed: {0}")]
    Query(String),

    #[error("deadline exceeded before the plan completed")]
    DeadlineExceeded,

    #[error("plan task panicked: {0}")]
    TaskPanicked(String),
}

/// One skipped source and the metrics it took down with it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanFailure {
    pub source: String,
    pub metrics: Vec<String>,
    pub cause: FailureCause,
}

impl PlanFailure {
    pub fn new(source: impl Into<String>, metrics: Vec<String>, cause: FailureCause) -> Self {
        Self {
            source: source.into(),
            metrics,
            cause,
        }
    }
}

impl std::fmt::Display for PlanFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "source '{}' skipped (metrics: {}): {}",
            self.source,
            self.metrics.join(", "),
            self.cause
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(metric: &str, value: Option<f64>) -> ResultRow {
        ResultRow {
            period_type: "all_time".into(),
            period_start_date: None,
            period_end_date: None,
            metric_name: metric.into(),
            slice_type: "none".into(),
            slice_value: "all".into(),
            segment_name: "none".into(),
            metric_value: value,
        }
    }

    #[test]
    fn row_batch_follows_output_schema() {
        let table = ResultTable::new(vec![row("revenue", Some(10.0)), row("ctr", None)]);
        let batch = table.into_row_batch();
        assert_eq!(batch.column_names(), OUTPUT_COLUMNS.to_vec());
        assert_eq!(batch.num_rows(), 2);
        assert_eq!(batch.columns[7].values[1], Scalar::Null);
        assert_eq!(batch.columns[1].values[0], Scalar::Null);
    }

    #[test]
    fn csv_leaves_nulls_empty() {
        let table = ResultTable::new(vec![row("ctr", None)]);
        let mut buf = Vec::new();
        table.write_csv(&mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next().unwrap(), OUTPUT_COLUMNS.join(","));
        assert_eq!(lines.next().unwrap(), "all_time,,,ctr,none,all,none,");
    }

    #[test]
    fn epoch_days() {
        let epoch = NaiveDate::from_ymd_opt(1970, 1, 1).unwrap();
        assert_eq!(days_since_epoch(epoch), 0);
        let d = NaiveDate::from_ymd_opt(1970, 1, 11).unwrap();
        assert_eq!(days_since_epoch(d), 10);
    }

    #[test]
    fn failure_display_names_source_and_metrics() {
        let f = PlanFailure::new(
            "bigquery://p.d.t",
            vec!["revenue".into(), "ctr".into()],
            FailureCause::ConnectorNotFound {
                backend: "bigquery".into(),
            },
        );
        let msg = f.to_string();
        assert!(msg.contains("bigquery://p.d.t"));
        assert!(msg.contains("revenue, ctr"));
    }
}
