#![forbid(unsafe_code)]
//! metriq-connectors: how plans reach backends.
//!
//! - `Connector` is the async seam every backend implements: describe a
//!   table, report availability, answer one `CompiledQuery` per call.
//! - `ConnectorRegistry` routes source URIs (`backend://database/table`) to
//!   connectors by backend type. It is an explicit value handed to the
//!   engine; nothing here is global.
//! - `ConnectionsConfig` loads the connections YAML (with `${VAR}`
//!   substitution) and builds a registry through a `ConnectorFactory`.
//! - `MemoryConnector` evaluates plans over in-process `RowBatch`es;
//!   `SqlConnector` renders plans to SQL for any `SqlClient`.
//! - `DuckDbClient` (feature `duckdb`) is the built-in `SqlClient` for
//!   DuckDB database files.

pub mod config;
pub mod connector;
#[cfg(feature = "duckdb")]
pub mod duckdb_client;
pub mod error;
pub mod memory;
pub mod registry;
pub mod sql;
pub mod uri;

pub use config::{BackendSettings, BuiltinFactory, ConnectionsConfig, ConnectorFactory};
pub use connector::Connector;
#[cfg(feature = "duckdb")]
pub use duckdb_client::DuckDbClient;
pub use error::{ConnectorError, Result};
pub use memory::{Fault, MemoryConnector};
pub use registry::{ConnectorRegistry, ResolvedTables};
pub use sql::{SqlClient, SqlConnector};
pub use uri::SourceUri;
