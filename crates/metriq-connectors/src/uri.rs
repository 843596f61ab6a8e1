//! Source locators: `backend://database/table`.
//!
//! - duckdb: the last `/` splits database from table, so `:memory:` and
//!   absolute paths (`duckdb:///abs/db/events`) work.
//! - bigquery: `project.dataset.table` or `project/dataset.table`; at least
//!   three parts, the first being the project.
//! - anything else: the last `/` splits database from table.

use std::fmt;

use crate::error::{ConnectorError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceUri {
    raw: String,
    pub backend: String,
    pub database: String,
    pub table: String,
}

impl SourceUri {
    pub fn parse(uri: &str) -> Result<Self> {
        let invalid = |reason: &str| ConnectorError::InvalidUri {
            uri: uri.to_string(),
            reason: reason.to_string(),
        };

        let (scheme, rest) = uri
            .split_once("://")
            .ok_or_else(|| invalid("missing backend type, expected e.g. duckdb://analytics.db/events"))?;
        let valid_scheme = !scheme.is_empty()
            && scheme
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '+' | '.'));
        if !valid_scheme {
            return Err(invalid("missing backend type, expected e.g. duckdb://analytics.db/events"));
        }
        let backend = scheme.to_ascii_lowercase();
        if rest.is_empty() {
            return Err(invalid("empty path; the URI must include database and table"));
        }

        let (database, table) = if backend == "bigquery" {
            let normalized = rest.replace('/', ".");
            let parts: Vec<&str> = normalized.split('.').collect();
            if parts.len() < 3 || parts.iter().any(|p| p.is_empty()) {
                return Err(invalid(
                    "BigQuery URIs need project.dataset.table or project/dataset.table",
                ));
            }
            (parts[0].to_string(), parts[1..].join("."))
        } else {
            let (database, table) = rest
                .rsplit_once('/')
                .ok_or_else(|| invalid("missing table separator '/'"))?;
            (database.to_string(), table.to_string())
        };
        if table.is_empty() {
            return Err(invalid("empty table name"));
        }

        Ok(Self {
            raw: uri.to_string(),
            backend,
            database,
            table,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Fully-qualified table path as the backend spells it.
    pub fn qualified_table(&self) -> String {
        if self.backend == "bigquery" {
            format!("{}.{}", self.database, self.table)
        } else {
            self.table.clone()
        }
    }
}

impl fmt::Display for SourceUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
