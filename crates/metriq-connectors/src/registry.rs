//! Explicit connector registry keyed by backend type.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, warn};

use metriq_core::result::FailureCause;
use metriq_expr::{SqlDialect, TableHandle};
use metriq_planner::TableResolver;

use crate::connector::Connector;
use crate::error::{ConnectorError, Result};
use crate::uri::SourceUri;

type Resolution = std::result::Result<TableHandle, FailureCause>;

#[derive(Clone, Default)]
pub struct ConnectorRegistry {
    connectors: BTreeMap<String, Arc<dyn Connector>>,
}

impl std::fmt::Debug for ConnectorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectorRegistry")
            .field("backends", &self.backends())
            .finish()
    }
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register under the connector's backend type, replacing any previous
    /// connector for that backend.
    pub fn register(&mut self, connector: Arc<dyn Connector>) -> Option<Arc<dyn Connector>> {
        let backend = connector.backend_type().to_ascii_lowercase();
        debug!(backend = %backend, "registering connector");
        self.connectors.insert(backend, connector)
    }

    pub fn with(mut self, connector: Arc<dyn Connector>) -> Self {
        self.register(connector);
        self
    }

    pub fn backends(&self) -> Vec<&str> {
        self.connectors.keys().map(String::as_str).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.connectors.is_empty()
    }

    pub fn get(&self, backend: &str) -> Result<Arc<dyn Connector>> {
        self.connectors
            .get(&backend.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| ConnectorError::NotConfigured(backend.to_string()))
    }

    /// Parse the URI and pick the connector for its backend.
    pub fn connector_for(&self, source: &str) -> Result<(Arc<dyn Connector>, SourceUri)> {
        let uri = SourceUri::parse(source)?;
        let connector = self.get(&uri.backend)?;
        Ok((connector, uri))
    }

    pub async fn resolve_table(&self, source: &str) -> Resolution {
        let (connector, uri) = self.connector_for(source).map_err(ConnectorError::into_failure)?;
        connector
            .resolve_table(&uri)
            .await
            .map_err(ConnectorError::into_failure)
    }

    /// Resolve every source concurrently, one task per source. Lookups still
    /// running at `deadline` are aborted and recorded as `DeadlineExceeded`.
    pub async fn resolve_all(&self, sources: &[&str], deadline: Option<Instant>) -> ResolvedTables {
        let mut resolved = ResolvedTables::default();
        let mut pending = Vec::new();
        for &source in sources {
            if resolved.dialects.contains_key(source) {
                continue;
            }
            resolved.dialects.insert(source.to_string(), self.dialect_hint(source));
            match self.connector_for(source) {
                Ok((connector, uri)) => {
                    let task = tokio::spawn(async move { connector.resolve_table(&uri).await });
                    pending.push((source, task));
                }
                Err(e) => {
                    resolved.tables.insert(source.to_string(), Err(e.into_failure()));
                }
            }
        }

        for (source, task) in pending {
            let abort = task.abort_handle();
            let joined = match deadline {
                Some(at) => match tokio::time::timeout_at(at, task).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        abort.abort();
                        warn!(source, "table resolution missed the deadline");
                        resolved
                            .tables
                            .insert(source.to_string(), Err(FailureCause::DeadlineExceeded));
                        continue;
                    }
                },
                None => task.await,
            };
            let outcome = match joined {
                Ok(result) => result.map_err(ConnectorError::into_failure),
                Err(e) if e.is_panic() => Err(FailureCause::TaskPanicked(format!(
                    "table resolution for '{source}' panicked"
                ))),
                Err(_) => Err(FailureCause::DeadlineExceeded),
            };
            resolved.tables.insert(source.to_string(), outcome);
        }
        resolved
    }

    /// Dialect of the connector serving `source`, else a guess from its scheme.
    pub fn dialect_hint(&self, source: &str) -> SqlDialect {
        match self.connector_for(source) {
            Ok((connector, _)) => connector.dialect(),
            Err(_) => match SourceUri::parse(source).map(|u| u.backend) {
                Ok(b) if b == "duckdb" => SqlDialect::DuckDb,
                Ok(b) if b == "bigquery" => SqlDialect::BigQuery,
                Ok(b) if b == "postgres" || b == "postgresql" => SqlDialect::Postgres,
                _ => SqlDialect::Generic,
            },
        }
    }

    /// Close every connector. All are attempted; the first error is returned.
    pub async fn close_all(&self) -> Result<()> {
        let mut first_err = None;
        for (backend, connector) in &self.connectors {
            if let Err(e) = connector.close().await {
                warn!(backend = %backend, error = %e, "closing connector failed");
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

/// Outcome of `ConnectorRegistry::resolve_all`, handed to the planner.
#[derive(Debug, Clone, Default)]
pub struct ResolvedTables {
    tables: HashMap<String, Resolution>,
    dialects: HashMap<String, SqlDialect>,
}

impl ResolvedTables {
    pub fn get(&self, source: &str) -> Option<&Resolution> {
        self.tables.get(source)
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

impl TableResolver for ResolvedTables {
    fn resolve_table(&self, source: &str) -> Resolution {
        self.tables.get(source).cloned().unwrap_or_else(|| {
            Err(FailureCause::TableResolution(format!(
                "source '{source}' was not resolved before planning"
            )))
        })
    }

    fn dialect_hint(&self, source: &str) -> SqlDialect {
        self.dialects.get(source).copied().unwrap_or_default()
    }
}
