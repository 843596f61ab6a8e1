//! Engine configuration that downstream crates can serialize/deserialize.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound on plans in flight at once. One plan maps to one source,
    /// so this only matters for requests touching many sources.
    pub max_parallel_tasks: usize,

    /// Overall deadline applied to a compute call when the request carries none.
    pub default_deadline_ms: Option<u64>,

    /// Optional path to a connections YAML file (see `metriq-connectors`).
    pub connections_path: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel_tasks: 16,
            default_deadline_ms: None,
            connections_path: None,
        }
    }
}

impl EngineConfig {
    /// Create a config from environment variables, falling back to defaults.
    ///
    /// Environment variables:
    /// - `METRIQ_MAX_PARALLEL_TASKS`: max plans in flight
    /// - `METRIQ_DEFAULT_DEADLINE_MS`: default compute deadline in milliseconds
    /// - `METRIQ_CONNECTIONS`: path to the connections YAML file
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(s) = std::env::var("METRIQ_MAX_PARALLEL_TASKS") {
            if let Ok(v) = s.parse::<usize>() {
                cfg.max_parallel_tasks = v.max(1);
            }
        }

        if let Ok(s) = std::env::var("METRIQ_DEFAULT_DEADLINE_MS") {
            if let Ok(v) = s.parse::<u64>() {
                cfg.default_deadline_ms = Some(v);
            }
        }

        if let Ok(s) = std::env::var("METRIQ_CONNECTIONS") {
            if !s.trim().is_empty() {
                cfg.connections_path = Some(s);
            }
        }

        cfg
    }

    pub fn default_deadline(&self) -> Option<Duration> {
        self.default_deadline_ms.map(Duration::from_millis)
    }
}
