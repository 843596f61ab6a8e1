//! The backend seam.

use async_trait::async_trait;

use metriq_core::types::RowBatch;
use metriq_expr::{SqlDialect, TableHandle};
use metriq_planner::CompiledQuery;

use crate::error::Result;
use crate::uri::SourceUri;

/// One analytical backend.
///
/// `run_query` must answer the whole plan in one request and return the
/// columns in `metriq_planner::QUERY_OUTPUT_COLUMNS`, one row per cell.
#[async_trait]
pub trait Connector: Send + Sync {
    /// URI scheme this connector serves (`duckdb`, `bigquery`, ...).
    fn backend_type(&self) -> &str;

    fn dialect(&self) -> SqlDialect;

    /// Describe the table a source URI points at. Called once per source
    /// before planning, under the compute deadline.
    async fn resolve_table(&self, uri: &SourceUri) -> Result<TableHandle>;

    /// Health check run right before dispatch.
    async fn is_available(&self) -> bool;

    async fn run_query(&self, query: &CompiledQuery) -> Result<RowBatch>;

    /// Release backend resources. Later calls to `is_available` report false.
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
