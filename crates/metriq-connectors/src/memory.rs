//! In-process reference backend.
//!
//! Tables are `RowBatch`es held in memory; plans are answered by evaluating
//! each cell's compiled measure with `metriq_expr::eval`. Faults can be
//! injected to exercise the executor's failure paths.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use tracing::debug;

use metriq_core::types::{Column, RowBatch, Scalar};
use metriq_expr::eval::eval_measure;
use metriq_expr::{SqlDialect, TableHandle};
use metriq_planner::CompiledQuery;

use crate::connector::Connector;
use crate::error::{ConnectorError, Result};
use crate::uri::SourceUri;

/// Injected misbehavior for `run_query`.
#[derive(Debug, Clone, PartialEq)]
pub enum Fault {
    /// Sleep before answering.
    Latency(Duration),
    /// Fail the query with this message.
    Error(String),
    /// Panic inside the query task.
    Panic,
    /// Report unavailable from the health check.
    Unavailable,
    /// Sleep before describing a table.
    ResolveLatency(Duration),
}

pub struct MemoryConnector {
    backend: String,
    tables: HashMap<String, Arc<RowBatch>>,
    faults: Vec<Fault>,
    closed: AtomicBool,
    queries: AtomicUsize,
}

impl MemoryConnector {
    /// `backend` is the URI scheme served, so a memory connector can stand in
    /// for `duckdb://...` sources in tests.
    pub fn new(backend: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            tables: HashMap::new(),
            faults: Vec::new(),
            closed: AtomicBool::new(false),
            queries: AtomicUsize::new(0),
        }
    }

    pub fn with_table(mut self, name: impl Into<String>, batch: RowBatch) -> Self {
        self.tables.insert(name.into(), Arc::new(batch));
        self
    }

    pub fn with_fault(mut self, fault: Fault) -> Self {
        self.faults.push(fault);
        self
    }

    /// Load a CSV file (header row required) as a table. Column types are
    /// inferred per column: integer, float, boolean, date, else text. Empty
    /// fields are NULL.
    pub fn with_csv_table(self, name: impl Into<String>, path: impl AsRef<Path>) -> Result<Self> {
        let batch = read_csv(path.as_ref())?;
        Ok(self.with_table(name, batch))
    }

    /// Number of `run_query` calls answered or attempted so far.
    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    fn table(&self, name: &str) -> Result<&Arc<RowBatch>> {
        self.tables
            .get(name)
            .ok_or_else(|| ConnectorError::TableNotFound {
                backend: self.backend.clone(),
                table: name.to_string(),
            })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ConnectorError::Closed(self.backend.clone()));
        }
        Ok(())
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    fn backend_type(&self) -> &str {
        &self.backend
    }

    fn dialect(&self) -> SqlDialect {
        SqlDialect::Generic
    }

    async fn resolve_table(&self, uri: &SourceUri) -> Result<TableHandle> {
        self.ensure_open()?;
        for fault in &self.faults {
            if let Fault::ResolveLatency(d) = fault {
                tokio::time::sleep(*d).await;
            }
        }
        let batch = self.table(&uri.table)?;
        batch
            .validate()
            .map_err(|e| ConnectorError::Query(e.to_string()))?;
        Ok(TableHandle::new(
            uri.as_str(),
            uri.table.clone(),
            SqlDialect::Generic,
            batch.infer_schema(),
        ))
    }

    async fn is_available(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && !self.faults.contains(&Fault::Unavailable)
    }

    async fn run_query(&self, query: &CompiledQuery) -> Result<RowBatch> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        self.ensure_open()?;
        for fault in &self.faults {
            match fault {
                Fault::Latency(d) => tokio::time::sleep(*d).await,
                Fault::Error(msg) => return Err(ConnectorError::Query(msg.clone())),
                Fault::Panic => panic!("injected fault in {} connector", self.backend),
                Fault::Unavailable | Fault::ResolveLatency(_) => {}
            }
        }

        let batch = self.table(&query.table.table)?;
        let n = query.cells.len();
        let mut index = Vec::with_capacity(n);
        let mut metric = Vec::with_capacity(n);
        let mut slice_type = Vec::with_capacity(n);
        let mut slice_value = Vec::with_capacity(n);
        let mut segment = Vec::with_capacity(n);
        let mut value = Vec::with_capacity(n);
        for cell in &query.cells {
            index.push(Scalar::I64(cell.index as i64));
            metric.push(Scalar::Str(cell.metric_name.clone()));
            slice_type.push(Scalar::Str(cell.slice_type.clone()));
            slice_value.push(Scalar::Str(cell.slice_value.clone()));
            segment.push(Scalar::Str(cell.segment_name.clone()));
            value.push(
                eval_measure(&cell.measure, batch)
                    .map_err(|e| ConnectorError::Query(format!("cell {}: {e}", cell.index)))?,
            );
        }
        debug!(backend = %self.backend, table = %query.table.table, cells = n, "answered plan in memory");

        let [c0, c1, c2, c3, c4, c5] = metriq_planner::QUERY_OUTPUT_COLUMNS;
        Ok(RowBatch::new(vec![
            Column::new(c0, index),
            Column::new(c1, metric),
            Column::new(c2, slice_type),
            Column::new(c3, slice_value),
            Column::new(c4, segment),
            Column::new(c5, value),
        ]))
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

fn read_csv(path: &Path) -> Result<RowBatch> {
    let mut reader = csv::Reader::from_path(path)?;
    let headers: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
    let mut raw: Vec<Vec<String>> = vec![Vec::new(); headers.len()];
    for record in reader.records() {
        let record = record?;
        for (i, col) in raw.iter_mut().enumerate() {
            col.push(record.get(i).unwrap_or_default().to_string());
        }
    }
    Ok(RowBatch::new(
        headers
            .into_iter()
            .zip(raw)
            .map(|(name, values)| Column::new(name, infer_column(values)))
            .collect(),
    ))
}

/// Pick the narrowest type every non-empty field parses as.
fn infer_column(values: Vec<String>) -> Vec<Scalar> {
    let filled = || values.iter().filter(|v| !v.trim().is_empty());
    let parse_all = |f: &dyn Fn(&str) -> Option<Scalar>| -> Option<Vec<Scalar>> {
        values
            .iter()
            .map(|v| {
                let v = v.trim();
                if v.is_empty() {
                    Some(Scalar::Null)
                } else {
                    f(v)
                }
            })
            .collect()
    };
    if filled().next().is_none() {
        return values.iter().map(|_| Scalar::Null).collect();
    }
    let parsers: [&dyn Fn(&str) -> Option<Scalar>; 4] = [
        &|v| v.parse::<i64>().ok().map(Scalar::I64),
        &|v| v.parse::<f64>().ok().map(Scalar::F64),
        &|v| match v.to_ascii_lowercase().as_str() {
            "true" => Some(Scalar::Bool(true)),
            "false" => Some(Scalar::Bool(false)),
            _ => None,
        },
        &|v| NaiveDate::parse_from_str(v, "%Y-%m-%d").ok().map(Scalar::Date),
    ];
    for parse in parsers {
        if let Some(col) = parse_all(parse) {
            return col;
        }
    }
    values
        .into_iter()
        .map(|v| {
            if v.trim().is_empty() {
                Scalar::Null
            } else {
                Scalar::Str(v)
            }
        })
        .collect()
}
