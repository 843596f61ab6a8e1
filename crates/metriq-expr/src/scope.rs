//! Table scopes that fragments are compiled against.

use serde::{Deserialize, Serialize};
use sqlparser::dialect::{BigQueryDialect, Dialect, DuckDbDialect, GenericDialect, PostgreSqlDialect};

use metriq_core::schema::Schema;

use crate::expr::CastType;

/// SQL flavor of a backend. Drives both parsing of fragments and rendering
/// of compiled queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SqlDialect {
    #[default]
    Generic,
    DuckDb,
    BigQuery,
    Postgres,
}

impl SqlDialect {
    pub fn parser_dialect(self) -> Box<dyn Dialect> {
        match self {
            SqlDialect::Generic => Box::new(GenericDialect {}),
            SqlDialect::DuckDb => Box::new(DuckDbDialect {}),
            SqlDialect::BigQuery => Box::new(BigQueryDialect {}),
            SqlDialect::Postgres => Box::new(PostgreSqlDialect {}),
        }
    }

    pub fn quote_ident(self, ident: &str) -> String {
        match self {
            SqlDialect::BigQuery => format!("`{}`", ident.replace('`', "\\`")),
            _ => format!("\"{}\"", ident.replace('"', "\"\"")),
        }
    }

    /// Single-quoted string literal. BigQuery escapes with backslashes, the
    /// others double the quote.
    pub fn quote_literal(self, s: &str) -> String {
        match self {
            SqlDialect::BigQuery => {
                format!("'{}'", s.replace('\\', "\\\\").replace('\'', "\\'"))
            }
            _ => format!("'{}'", s.replace('\'', "''")),
        }
    }

    /// Dotted table paths are quoted per part.
    pub fn quote_table(self, table: &str) -> String {
        match self {
            // BigQuery accepts the whole project.dataset.table path in one pair of backticks.
            SqlDialect::BigQuery => self.quote_ident(table),
            _ => table
                .split('.')
                .map(|part| self.quote_ident(part))
                .collect::<Vec<_>>()
                .join("."),
        }
    }

    pub fn cast_name(self, to: CastType) -> &'static str {
        match (self, to) {
            (SqlDialect::BigQuery, CastType::Int64) => "INT64",
            (SqlDialect::BigQuery, CastType::Float64) => "FLOAT64",
            (SqlDialect::BigQuery, CastType::Utf8) => "STRING",
            (SqlDialect::BigQuery, CastType::Boolean) => "BOOL",
            (SqlDialect::Postgres, CastType::Float64) => "DOUBLE PRECISION",
            (SqlDialect::Postgres, CastType::Utf8) => "TEXT",
            (_, CastType::Int64) => "BIGINT",
            (_, CastType::Float64) => "DOUBLE",
            (_, CastType::Utf8) => "VARCHAR",
            (_, CastType::Boolean) => "BOOLEAN",
            (_, CastType::Date) => "DATE",
        }
    }

    pub fn supports_ilike(self) -> bool {
        !matches!(self, SqlDialect::BigQuery)
    }
}

/// A resolved (or unresolvable) table that fragments bind to.
///
/// `schema == None` marks an unbound scope: the table could not be described,
/// so only syntax and placement are checked, never column names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableHandle {
    /// Source locator the handle was resolved from.
    pub source: String,
    /// Backend-native table path (`events`, `proj.dataset.events`, ...).
    pub table: String,
    pub dialect: SqlDialect,
    pub schema: Option<Schema>,
}

impl TableHandle {
    pub fn new(
        source: impl Into<String>,
        table: impl Into<String>,
        dialect: SqlDialect,
        schema: Schema,
    ) -> Self {
        Self {
            source: source.into(),
            table: table.into(),
            dialect,
            schema: Some(schema),
        }
    }

    pub fn unbound(source: impl Into<String>, table: impl Into<String>, dialect: SqlDialect) -> Self {
        Self {
            source: source.into(),
            table: table.into(),
            dialect,
            schema: None,
        }
    }

    pub fn is_bound(&self) -> bool {
        self.schema.is_some()
    }

    /// Last dotted segment of the table path, used to accept `events.col`
    /// qualified references.
    pub fn short_name(&self) -> &str {
        self.table
            .rsplit(['.', '/'])
            .next()
            .unwrap_or(self.table.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quoting_per_dialect() {
        assert_eq!(SqlDialect::DuckDb.quote_ident("a\"b"), "\"a\"\"b\"");
        assert_eq!(SqlDialect::BigQuery.quote_table("p.d.t"), "`p.d.t`");
        assert_eq!(SqlDialect::Postgres.quote_table("s.t"), "\"s\".\"t\"");
    }

    #[test]
    fn string_literals_per_dialect() {
        assert_eq!(SqlDialect::DuckDb.quote_literal("O'Brien"), "'O''Brien'");
        assert_eq!(SqlDialect::Postgres.quote_literal("a\\b"), "'a\\b'");
        assert_eq!(SqlDialect::BigQuery.quote_literal("O'Brien"), "'O\\'Brien'");
        assert_eq!(SqlDialect::BigQuery.quote_literal("a\\'b"), "'a\\\\\\'b'");
    }

    #[test]
    fn short_name_strips_qualifiers() {
        let h = TableHandle::unbound("bigquery://p.d.events", "p.d.events", SqlDialect::BigQuery);
        assert_eq!(h.short_name(), "events");
        assert!(!h.is_bound());
    }
}
