//! DuckDB through the bundled `duckdb` crate.
//!
//! `duckdb::Connection` is synchronous, so every call runs on tokio's
//! blocking pool with the connection behind a mutex.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::NaiveDate;
use duckdb::types::Value;
use duckdb::Connection;
use tracing::debug;

use metriq_core::schema::{DataType, Field, Schema};
use metriq_core::types::{Column, RowBatch, Scalar};
use metriq_expr::SqlDialect;

use crate::error::{ConnectorError, Result};
use crate::sql::SqlClient;

/// Days from 0001-01-01 to 1970-01-01.
const UNIX_EPOCH_DAYS_FROM_CE: i32 = 719_163;

#[derive(Clone)]
pub struct DuckDbClient {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for DuckDbClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DuckDbClient").finish_non_exhaustive()
    }
}

impl DuckDbClient {
    /// Open or create a database file. `:memory:` opens a private in-memory
    /// database.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let conn = if path.as_os_str() == ":memory:" {
            Connection::open_in_memory()?
        } else {
            Connection::open(path)?
        };
        debug!(path = %path.display(), "opened duckdb database");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run statements that return no rows.
    pub async fn execute_batch(&self, sql: &str) -> Result<()> {
        let sql = sql.to_string();
        self.blocking(move |conn| Ok(conn.execute_batch(&sql)?)).await
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|_| ConnectorError::Query("duckdb connection lock poisoned".into()))?;
            f(&guard)
        })
        .await
        .map_err(|e| ConnectorError::Query(format!("duckdb task failed: {e}")))?
    }
}

#[async_trait]
impl SqlClient for DuckDbClient {
    fn dialect(&self) -> SqlDialect {
        SqlDialect::DuckDb
    }

    async fn describe(&self, table: &str) -> Result<Schema> {
        let (schema_name, table_name) = match table.rsplit_once('.') {
            Some((s, t)) => (Some(s.to_string()), t.to_string()),
            None => (None, table.to_string()),
        };
        let fields = self
            .blocking(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT table_schema, column_name, data_type, is_nullable \
                     FROM information_schema.columns WHERE table_name = ? ORDER BY ordinal_position",
                )?;
                let mut rows = stmt.query(duckdb::params![table_name])?;
                let mut fields = Vec::new();
                while let Some(row) = rows.next()? {
                    let schema: String = row.get(0)?;
                    if schema_name.as_ref().is_some_and(|s| *s != schema) {
                        continue;
                    }
                    let name: String = row.get(1)?;
                    let sql_type: String = row.get(2)?;
                    let nullable: String = row.get(3)?;
                    fields.push(Field::new(name, data_type(&sql_type), nullable == "YES"));
                }
                Ok(fields)
            })
            .await?;
        if fields.is_empty() {
            return Err(ConnectorError::TableNotFound {
                backend: "duckdb".into(),
                table: table.to_string(),
            });
        }
        Ok(Schema::new(fields))
    }

    async fn query(&self, sql: &str) -> Result<RowBatch> {
        let sql = sql.to_string();
        self.blocking(move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query([])?;
            let names: Vec<String> = rows.as_ref().map(|s| s.column_names()).unwrap_or_default();
            let mut values: Vec<Vec<Scalar>> = vec![Vec::new(); names.len()];
            while let Some(row) = rows.next()? {
                for (i, column) in values.iter_mut().enumerate() {
                    column.push(scalar(row.get::<_, Value>(i)?)?);
                }
            }
            Ok(RowBatch::new(
                names
                    .into_iter()
                    .zip(values)
                    .map(|(name, values)| Column::new(name, values))
                    .collect(),
            ))
        })
        .await
    }
}

/// Collapse DuckDB column types onto the five logical types.
fn data_type(sql_type: &str) -> DataType {
    let upper = sql_type.to_ascii_uppercase();
    let base = upper.split('(').next().unwrap_or_default().trim();
    match base {
        "BOOLEAN" | "BOOL" => DataType::Boolean,
        "TINYINT" | "SMALLINT" | "INTEGER" | "INT" | "BIGINT" | "HUGEINT" | "UTINYINT"
        | "USMALLINT" | "UINTEGER" | "UBIGINT" => DataType::Int64,
        "FLOAT" | "REAL" | "DOUBLE" | "DECIMAL" | "NUMERIC" => DataType::Float64,
        t if t == "DATE" || t.starts_with("TIMESTAMP") => DataType::Date,
        _ => DataType::Utf8,
    }
}

fn scalar(value: Value) -> Result<Scalar> {
    Ok(match value {
        Value::Null => Scalar::Null,
        Value::Boolean(b) => Scalar::Bool(b),
        Value::TinyInt(i) => Scalar::I64(i.into()),
        Value::SmallInt(i) => Scalar::I64(i.into()),
        Value::Int(i) => Scalar::I64(i.into()),
        Value::BigInt(i) => Scalar::I64(i),
        Value::UTinyInt(i) => Scalar::I64(i.into()),
        Value::USmallInt(i) => Scalar::I64(i.into()),
        Value::UInt(i) => Scalar::I64(i.into()),
        Value::UBigInt(i) => i64::try_from(i).map_or(Scalar::F64(i as f64), Scalar::I64),
        Value::HugeInt(i) => i64::try_from(i).map_or(Scalar::F64(i as f64), Scalar::I64),
        Value::Float(f) => Scalar::F64(f.into()),
        Value::Double(f) => Scalar::F64(f),
        Value::Decimal(d) => Scalar::F64(
            d.to_string()
                .parse()
                .map_err(|e| ConnectorError::Query(format!("decimal {d}: {e}")))?,
        ),
        Value::Text(s) => Scalar::Str(s),
        Value::Date32(days) => NaiveDate::from_num_days_from_ce_opt(UNIX_EPOCH_DAYS_FROM_CE + days)
            .map(Scalar::Date)
            .ok_or_else(|| ConnectorError::Query(format!("date out of range: {days}")))?,
        other => {
            return Err(ConnectorError::Query(format!(
                "unsupported DuckDB value {other:?}"
            )))
        }
    })
}
