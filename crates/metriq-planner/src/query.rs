//! Plans and the batched per-source query they carry.

use serde::Serialize;

use metriq_core::hash::{hash_serde, Hash256};
use metriq_core::id::PlanId;
use metriq_core::result::FailureCause;
use metriq_expr::{CastType, CompiledExpr, SqlDialect, TableHandle};

/// Columns every backend returns for a `CompiledQuery`, in order.
pub const QUERY_OUTPUT_COLUMNS: [&str; 6] = [
    "cell_index",
    "metric_name",
    "slice_type",
    "slice_value",
    "segment_name",
    "metric_value",
];

/// One output row of a plan: a (metric × segment × combination) measure and
/// the constant labels stamped on it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryCell {
    pub index: usize,
    pub metric_name: String,
    pub slice_type: String,
    pub slice_value: String,
    pub segment_name: String,
    pub measure: CompiledExpr,
}

/// All cells of one source. Backends answer it with a single request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompiledQuery {
    pub table: TableHandle,
    pub cells: Vec<QueryCell>,
}

impl CompiledQuery {
    pub fn dialect(&self) -> SqlDialect {
        self.table.dialect
    }

    pub fn fingerprint(&self) -> metriq_core::error::Result<Hash256> {
        hash_serde(self)
    }

    /// One statement: conditional aggregation of every cell in a single scan,
    /// unpivoted into one row per cell and ordered by `cell_index`.
    pub fn render_sql(&self) -> String {
        let d = self.dialect();
        let q = |s: &str| d.quote_ident(s);

        if self.cells.is_empty() {
            // Still a well-formed statement with the right columns.
            let cols: Vec<String> = QUERY_OUTPUT_COLUMNS
                .iter()
                .map(|c| format!("NULL AS {}", q(*c)))
                .collect();
            return format!(
                "SELECT {} FROM {} WHERE FALSE",
                cols.join(", "),
                d.quote_table(&self.table.table)
            );
        }

        let mut sql = String::from("WITH agg AS (\n  SELECT\n");
        for (i, cell) in self.cells.iter().enumerate() {
            let sep = if i + 1 < self.cells.len() { "," } else { "" };
            sql.push_str(&format!(
                "    {} AS {}{}\n",
                cell.measure.render(d),
                q(&value_alias(cell.index)),
                sep
            ));
        }
        sql.push_str(&format!("  FROM {}\n)\n", d.quote_table(&self.table.table)));

        for (i, cell) in self.cells.iter().enumerate() {
            if i > 0 {
                sql.push_str("UNION ALL\n");
            }
            sql.push_str(&format!(
                "SELECT {} AS {}, {} AS {}, {} AS {}, {} AS {}, {} AS {}, CAST({} AS {}) AS {} FROM agg\n",
                cell.index,
                q(QUERY_OUTPUT_COLUMNS[0]),
                d.quote_literal(&cell.metric_name),
                q(QUERY_OUTPUT_COLUMNS[1]),
                d.quote_literal(&cell.slice_type),
                q(QUERY_OUTPUT_COLUMNS[2]),
                d.quote_literal(&cell.slice_value),
                q(QUERY_OUTPUT_COLUMNS[3]),
                d.quote_literal(&cell.segment_name),
                q(QUERY_OUTPUT_COLUMNS[4]),
                q(&value_alias(cell.index)),
                d.cast_name(CastType::Float64),
                q(QUERY_OUTPUT_COLUMNS[5]),
            ));
        }
        sql.push_str(&format!("ORDER BY {}", q(QUERY_OUTPUT_COLUMNS[0])));
        sql
    }
}

fn value_alias(index: usize) -> String {
    format!("m{index}")
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum PlanState {
    Ready(CompiledQuery),
    /// The source could not be bound to a table; the executor reports it.
    Unresolved(FailureCause),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryPlan {
    pub id: PlanId,
    pub source: String,
    /// Metric names covered by this plan, in declaration order.
    pub metrics: Vec<String>,
    /// Rows the plan contributes when it succeeds.
    pub expected_rows: usize,
    pub state: PlanState,
}

impl QueryPlan {
    pub fn query(&self) -> Option<&CompiledQuery> {
        match &self.state {
            PlanState::Ready(q) => Some(q),
            PlanState::Unresolved(_) => None,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.state, PlanState::Ready(_))
    }
}
