//! Connector for any backend reachable through a SQL client.
//!
//! The client only needs to describe tables and run one statement; the plan
//! is rendered with `CompiledQuery::render_sql` in the client's dialect.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tracing::debug;

use metriq_core::schema::Schema;
use metriq_core::types::RowBatch;
use metriq_expr::{SqlDialect, TableHandle};
use metriq_planner::{CompiledQuery, QUERY_OUTPUT_COLUMNS};

use crate::connector::Connector;
use crate::error::{ConnectorError, Result};
use crate::uri::SourceUri;

/// Minimal driver surface.
#[async_trait]
pub trait SqlClient: Send + Sync {
    fn dialect(&self) -> SqlDialect;

    /// Column names and types of a fully-qualified table.
    async fn describe(&self, table: &str) -> Result<Schema>;

    async fn query(&self, sql: &str) -> Result<RowBatch>;

    async fn ping(&self) -> bool {
        true
    }
}

pub struct SqlConnector<C> {
    backend: String,
    client: C,
    closed: AtomicBool,
}

impl<C: SqlClient> SqlConnector<C> {
    pub fn new(backend: impl Into<String>, client: C) -> Self {
        Self {
            backend: backend.into(),
            client,
            closed: AtomicBool::new(false),
        }
    }

    pub fn client(&self) -> &C {
        &self.client
    }
}

#[async_trait]
impl<C: SqlClient> Connector for SqlConnector<C> {
    fn backend_type(&self) -> &str {
        &self.backend
    }

    fn dialect(&self) -> SqlDialect {
        self.client.dialect()
    }

    async fn resolve_table(&self, uri: &SourceUri) -> Result<TableHandle> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ConnectorError::Closed(self.backend.clone()));
        }
        let table = uri.qualified_table();
        let schema = self.client.describe(&table).await?;
        Ok(TableHandle::new(uri.as_str(), table, self.client.dialect(), schema))
    }

    async fn is_available(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.client.ping().await
    }

    async fn run_query(&self, query: &CompiledQuery) -> Result<RowBatch> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ConnectorError::Closed(self.backend.clone()));
        }
        let sql = query.render_sql();
        debug!(backend = %self.backend, cells = query.cells.len(), sql = %sql, "issuing plan query");
        let batch = self.client.query(&sql).await?;
        let names = batch.column_names();
        if names != QUERY_OUTPUT_COLUMNS {
            return Err(ConnectorError::Query(format!(
                "backend returned columns {names:?}, expected {QUERY_OUTPUT_COLUMNS:?}"
            )));
        }
        Ok(batch)
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
