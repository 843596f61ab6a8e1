//! Connections file.
//!
//! ```yaml
//! duckdb:
//!   path: ${WAREHOUSE_DIR}/analytics.db
//! bigquery:
//!   project_id: my-project
//! memory:
//!   tables:
//!     events: data/events.csv
//! ```
//!
//! Each top-level key is a backend type whose value must be a mapping.
//! `${VAR}` in any string value is replaced from the environment; an unset
//! variable is an error. Turning entries into connectors is the job of a
//! `ConnectorFactory`.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use serde_yaml::Value;
use tracing::info;

use crate::connector::Connector;
use crate::error::{ConnectorError, Result};
use crate::memory::MemoryConnector;
use crate::registry::ConnectorRegistry;

/// Fields a backend entry must carry.
fn required_fields(backend: &str) -> &'static [&'static str] {
    match backend {
        "duckdb" => &["path"],
        "bigquery" => &["project_id"],
        _ => &[],
    }
}

/// Settings for one backend after substitution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackendSettings {
    pub backend: String,
    pub values: BTreeMap<String, Value>,
}

impl BackendSettings {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(Value::as_str)
    }

    pub fn require_str(&self, key: &str) -> Result<&str> {
        self.get_str(key).ok_or_else(|| {
            ConnectorError::Config(format!(
                "missing required field '{key}' in {} configuration",
                self.backend
            ))
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConnectionsConfig {
    pub backends: Vec<BackendSettings>,
}

impl ConnectionsConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text, &path.display().to_string())
    }

    /// Parse with substitution from the process environment. `origin` names
    /// the file in error messages.
    pub fn from_yaml_str(text: &str, origin: &str) -> Result<Self> {
        Self::from_yaml_str_with(text, origin, |var| std::env::var(var).ok())
    }

    pub fn from_yaml_str_with(
        text: &str,
        origin: &str,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        let root: Value = serde_yaml::from_str(text)?;
        let mapping = match root {
            Value::Null => return Ok(Self::default()),
            Value::Mapping(m) => m,
            _ => {
                return Err(ConnectorError::Config(format!(
                    "{origin}: expected a mapping of backend type to settings"
                )))
            }
        };

        let mut backends = Vec::with_capacity(mapping.len());
        for (key, value) in mapping {
            let backend = key
                .as_str()
                .ok_or_else(|| ConnectorError::Config(format!("{origin}: backend keys must be strings")))?
                .to_ascii_lowercase();
            let Value::Mapping(entries) = value else {
                return Err(ConnectorError::Config(format!(
                    "invalid configuration for backend '{backend}' in {origin}: expected a mapping"
                )));
            };
            let mut values = BTreeMap::new();
            for (k, v) in entries {
                let k = k.as_str().ok_or_else(|| {
                    ConnectorError::Config(format!("{origin}: keys under '{backend}' must be strings"))
                })?;
                values.insert(k.to_string(), substitute_value(v, origin, &env)?);
            }
            let settings = BackendSettings { backend, values };
            for field in required_fields(&settings.backend) {
                settings.require_str(field)?;
            }
            backends.push(settings);
        }
        Ok(Self { backends })
    }

    pub fn get(&self, backend: &str) -> Option<&BackendSettings> {
        self.backends.iter().find(|b| b.backend == backend)
    }

    /// Build one connector per entry and register them all.
    pub fn into_registry(self, factory: &dyn ConnectorFactory) -> Result<ConnectorRegistry> {
        let mut registry = ConnectorRegistry::new();
        for settings in &self.backends {
            let connector = factory.create(settings)?;
            info!(backend = %settings.backend, "connection configured");
            registry.register(connector);
        }
        Ok(registry)
    }
}

fn substitute_value(
    value: Value,
    origin: &str,
    env: &impl Fn(&str) -> Option<String>,
) -> Result<Value> {
    Ok(match value {
        Value::String(s) => Value::String(substitute_str(&s, origin, env)?),
        Value::Mapping(m) => {
            let mut out = serde_yaml::Mapping::with_capacity(m.len());
            for (k, v) in m {
                out.insert(k, substitute_value(v, origin, env)?);
            }
            Value::Mapping(out)
        }
        Value::Sequence(seq) => Value::Sequence(
            seq.into_iter()
                .map(|v| substitute_value(v, origin, env))
                .collect::<Result<_>>()?,
        ),
        other => other,
    })
}

/// Replace every `${NAME}`. A `$` not followed by `{`, or an unclosed
/// `${`, is kept literally.
fn substitute_str(s: &str, origin: &str, env: &impl Fn(&str) -> Option<String>) -> Result<String> {
    let mut out = String::with_capacity(s.len());
    let mut rest = s;
    while let Some(start) = rest.find("${") {
        let Some(len) = rest[start + 2..].find('}') else {
            break;
        };
        let var = &rest[start + 2..start + 2 + len];
        out.push_str(&rest[..start]);
        let value = env(var).ok_or_else(|| ConnectorError::MissingEnvVar {
            var: var.to_string(),
            origin: origin.to_string(),
        })?;
        out.push_str(&value);
        rest = &rest[start + 3 + len..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Turns one configured backend into a connector.
pub trait ConnectorFactory {
    fn create(&self, settings: &BackendSettings) -> Result<Arc<dyn Connector>>;
}

/// Factory for backends shipped with this crate:
/// - `memory`: its `tables` mapping names CSV files loaded at startup;
/// - `duckdb` (feature `duckdb`): opens the database file at `path`.
///
/// Other backend types need a caller-supplied factory.
#[derive(Debug, Clone, Copy, Default)]
pub struct BuiltinFactory;

impl ConnectorFactory for BuiltinFactory {
    fn create(&self, settings: &BackendSettings) -> Result<Arc<dyn Connector>> {
        match settings.backend.as_str() {
            "memory" => {
                let mut conn = MemoryConnector::new("memory");
                if let Some(tables) = settings.get("tables") {
                    let Value::Mapping(tables) = tables else {
                        return Err(ConnectorError::Config(
                            "memory.tables must map table names to CSV paths".into(),
                        ));
                    };
                    for (name, path) in tables {
                        let (Some(name), Some(path)) = (name.as_str(), path.as_str()) else {
                            return Err(ConnectorError::Config(
                                "memory.tables must map table names to CSV paths".into(),
                            ));
                        };
                        conn = conn.with_csv_table(name, path)?;
                    }
                }
                Ok(Arc::new(conn))
            }
            #[cfg(feature = "duckdb")]
            "duckdb" => {
                let client = crate::duckdb_client::DuckDbClient::open(settings.require_str("path")?)?;
                Ok(Arc::new(crate::sql::SqlConnector::new("duckdb", client)))
            }
            other => Err(ConnectorError::UnsupportedBackend(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(var: &str) -> Option<String> {
        match var {
            "DB_DIR" => Some("/data".into()),
            "PROJECT" => Some("acme".into()),
            _ => None,
        }
    }

    #[test]
    fn substitutes_environment_variables() {
        let text = "duckdb:\n  path: ${DB_DIR}/analytics.db\nbigquery:\n  project_id: ${PROJECT}\n";
        let cfg = ConnectionsConfig::from_yaml_str_with(text, "connections.yaml", env).unwrap();
        assert_eq!(cfg.backends.len(), 2);
        assert_eq!(cfg.get("duckdb").unwrap().get_str("path"), Some("/data/analytics.db"));
        assert_eq!(cfg.get("bigquery").unwrap().get_str("project_id"), Some("acme"));
    }

    #[test]
    fn unset_variable_names_the_file() {
        let err = ConnectionsConfig::from_yaml_str_with(
            "duckdb:\n  path: ${NOPE}\n",
            "connections.yaml",
            env,
        )
        .unwrap_err();
        match err {
            ConnectorError::MissingEnvVar { var, origin } => {
                assert_eq!(var, "NOPE");
                assert_eq!(origin, "connections.yaml");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn required_fields_are_enforced() {
        let err = ConnectionsConfig::from_yaml_str_with("duckdb:\n  read_only: true\n", "c.yaml", env)
            .unwrap_err();
        assert!(err.to_string().contains("'path'"), "{err}");
        let err = ConnectionsConfig::from_yaml_str_with("bigquery: 3\n", "c.yaml", env).unwrap_err();
        assert!(err.to_string().contains("expected a mapping"), "{err}");
    }

    #[test]
    fn empty_file_is_empty_config() {
        let cfg = ConnectionsConfig::from_yaml_str_with("", "c.yaml", env).unwrap();
        assert!(cfg.backends.is_empty());
    }

    #[test]
    fn literal_dollars_are_kept() {
        assert_eq!(substitute_str("cost $5 ${", "c", &env).unwrap(), "cost $5 ${");
        assert_eq!(substitute_str("${DB_DIR}${DB_DIR}", "c", &env).unwrap(), "/data/data");
    }

    #[test]
    fn builtin_factory_rejects_backends_it_cannot_build() {
        let cfg = ConnectionsConfig::from_yaml_str_with(
            "memory: {}\nbigquery:\n  project_id: ${PROJECT}\n",
            "c.yaml",
            env,
        )
        .unwrap();
        let memory = cfg.get("memory").unwrap();
        let conn = BuiltinFactory.create(memory).unwrap();
        assert_eq!(conn.backend_type(), "memory");
        assert!(matches!(
            cfg.into_registry(&BuiltinFactory),
            Err(ConnectorError::UnsupportedBackend(b)) if b == "bigquery"
        ));
    }

    #[cfg(feature = "duckdb")]
    #[test]
    fn builtin_factory_opens_duckdb() {
        let cfg = ConnectionsConfig::from_yaml_str_with("duckdb:\n  path: ':memory:'\n", "c.yaml", env)
            .unwrap();
        let registry = cfg.into_registry(&BuiltinFactory).unwrap();
        assert_eq!(registry.backends(), vec!["duckdb"]);
    }
}
