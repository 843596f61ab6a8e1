use thiserror::Error;

use metriq_core::result::FailureCause;

pub type Result<T> = std::result::Result<T, ConnectorError>;

#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error("invalid source URI '{uri}': {reason}")]
    InvalidUri { uri: String, reason: String },

    #[error("no connection configured for backend '{0}'; add it to the connections file or register a connector")]
    NotConfigured(String),

    #[error("unsupported backend '{0}'")]
    UnsupportedBackend(String),

    #[error("connection config: {0}")]
    Config(String),

    #[error("environment variable '{var}' referenced in {origin} but not set")]
    MissingEnvVar { var: String, origin: String },

    #[error("table '{table}' not found in {backend}")]
    TableNotFound { backend: String, table: String },

    #[error("connector '{0}' is closed")]
    Closed(String),

    #[error("query failed: {0}")]
    Query(String),

    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("CSV: {0}")]
    Csv(#[from] csv::Error),

    #[cfg(feature = "duckdb")]
    #[error("DuckDB: {0}")]
    DuckDb(#[from] duckdb::Error),
}

impl ConnectorError {
    /// Per-plan failure cause recorded when this error stops a plan.
    pub fn into_failure(self) -> FailureCause {
        match self {
            ConnectorError::InvalidUri { .. } => FailureCause::InvalidSource(self.to_string()),
            ConnectorError::NotConfigured(backend) | ConnectorError::UnsupportedBackend(backend) => {
                FailureCause::ConnectorNotFound { backend }
            }
            ConnectorError::TableNotFound { .. } => FailureCause::TableResolution(self.to_string()),
            ConnectorError::Closed(backend) => FailureCause::Unavailable { backend },
            ConnectorError::Query(msg) => FailureCause::Query(msg),
            other => FailureCause::Query(other.to_string()),
        }
    }
}
