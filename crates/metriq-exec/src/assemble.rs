//! Backend rows → canonical long-format output.

use std::sync::Arc;

use metriq_core::result::{ResultRow, ResultTable};
use metriq_core::spec::Period;
use metriq_core::types::{RowBatch, Scalar};
use metriq_planner::{QueryCell, QueryPlan, QUERY_OUTPUT_COLUMNS};

use crate::error::AssemblyError;

/// Stamps every row with the call's period and checks each backend result
/// against the plan that produced it.
#[derive(Debug, Clone, Copy)]
pub struct OutputAssembler {
    period: Period,
}

impl OutputAssembler {
    pub fn new(period: Period) -> Self {
        Self { period }
    }

    /// Concatenate per-plan results in the order given (submission order),
    /// each plan's rows in cell order.
    pub fn assemble(
        &self,
        results: Vec<(Arc<QueryPlan>, RowBatch)>,
    ) -> Result<ResultTable, AssemblyError> {
        let capacity = results.iter().map(|(p, _)| p.expected_rows).sum();
        let mut rows = Vec::with_capacity(capacity);
        for (plan, batch) in results {
            self.append_plan(&plan, batch, &mut rows)?;
        }
        Ok(ResultTable::new(rows))
    }

    fn append_plan(
        &self,
        plan: &QueryPlan,
        batch: RowBatch,
        out: &mut Vec<ResultRow>,
    ) -> Result<(), AssemblyError> {
        let locator = || plan.source.clone();
        let query = plan.query().ok_or_else(|| AssemblyError::NotReady {
            plan: plan.id,
            locator: locator(),
        })?;

        let names = batch.column_names();
        if names != QUERY_OUTPUT_COLUMNS {
            return Err(AssemblyError::Columns {
                plan: plan.id,
                locator: locator(),
                expected: QUERY_OUTPUT_COLUMNS.iter().map(|c| c.to_string()).collect(),
                found: names.iter().map(|c| c.to_string()).collect(),
            });
        }
        let expected = query.cells.len();
        let ragged = batch.columns.iter().find(|c| c.len() != expected);
        if let Some(col) = ragged {
            return Err(AssemblyError::RowCount {
                plan: plan.id,
                locator: locator(),
                expected,
                found: col.len(),
            });
        }

        let mut columns = batch.columns.into_iter().map(|c| c.values.into_iter());
        let (Some(index), Some(metric), Some(slice_type), Some(slice_value), Some(segment), Some(value)) = (
            columns.next(),
            columns.next(),
            columns.next(),
            columns.next(),
            columns.next(),
            columns.next(),
        ) else {
            return Err(AssemblyError::NotReady {
                plan: plan.id,
                locator: locator(),
            });
        };

        let mut slots: Vec<Option<ResultRow>> = (0..expected).map(|_| None).collect();
        let rows = index
            .zip(metric)
            .zip(slice_type)
            .zip(slice_value)
            .zip(segment)
            .zip(value);
        for (((((idx, metric), slice_type), slice_value), segment), value) in rows {
            let bad_index = |detail: String| AssemblyError::CellIndex {
                plan: plan.id,
                locator: locator(),
                detail,
            };
            let i = match idx {
                Scalar::I64(i) if i >= 0 && (i as usize) < expected => i as usize,
                other => return Err(bad_index(format!("{other:?} outside 0..{expected}"))),
            };
            if slots[i].is_some() {
                return Err(bad_index(format!("{i} returned twice")));
            }
            let cell = &query.cells[i];
            let check = CellCheck { plan, cell };
            slots[i] = Some(ResultRow {
                period_type: self.period.period_type.as_str().to_string(),
                period_start_date: self.period.start,
                period_end_date: self.period.end,
                metric_name: check.text("metric_name", metric, &cell.metric_name)?,
                slice_type: check.text("slice_type", slice_type, &cell.slice_type)?,
                slice_value: check.text("slice_value", slice_value, &cell.slice_value)?,
                segment_name: check.text("segment_name", segment, &cell.segment_name)?,
                metric_value: check.number(value)?,
            });
        }

        // Row count equals cell count and duplicates were rejected, so every
        // slot is filled.
        out.extend(slots.into_iter().flatten());
        Ok(())
    }
}

struct CellCheck<'a> {
    plan: &'a QueryPlan,
    cell: &'a QueryCell,
}

impl CellCheck<'_> {
    fn mismatch(&self, column: &'static str, expected: String, found: String) -> AssemblyError {
        AssemblyError::CellMismatch {
            plan: self.plan.id,
            locator: self.plan.source.clone(),
            index: self.cell.index,
            column,
            expected,
            found,
        }
    }

    /// Constant label columns must echo the plan. The backend's string is
    /// moved into the row.
    fn text(&self, column: &'static str, value: Scalar, expected: &str) -> Result<String, AssemblyError> {
        match value {
            Scalar::Str(s) if s == expected => Ok(s),
            other => Err(self.mismatch(column, format!("{expected:?}"), format!("{other:?}"))),
        }
    }

    fn number(&self, value: Scalar) -> Result<Option<f64>, AssemblyError> {
        match value {
            Scalar::Null => Ok(None),
            Scalar::I64(v) => Ok(Some(v as f64)),
            Scalar::F64(v) => Ok(v.is_finite().then_some(v)),
            other => Err(self.mismatch(QUERY_OUTPUT_COLUMNS[5], "a number".into(), format!("{other:?}"))),
        }
    }
}
