#![forbid(unsafe_code)]
//! metriq: batched metric computation over analytical backends.
//!
//! Callers describe metrics, slices, segments and an optional time window;
//! the engine compiles one query per source, runs them concurrently through
//! registered connectors, and returns a long-format `ResultTable` plus a
//! `PlanFailure` for every source that could not answer.
//!
//! ```no_run
//! use std::sync::Arc;
//! use metriq::prelude::*;
//!
//! # async fn run(events: RowBatch) -> std::result::Result<(), EngineError> {
//! let registry = ConnectorRegistry::new()
//!     .with(Arc::new(MemoryConnector::new("memory").with_table("events", events)));
//! let engine = MetricEngine::new(registry, EngineConfig::default());
//! let request = ComputeRequest::new(vec![MetricSpec::new(
//!     "revenue",
//!     "memory://analytics/events",
//!     AggregationKind::Sum,
//!     "amount",
//! )]);
//! let output = engine.compute(&request).await?;
//! println!("{} rows, {} failures", output.table.len(), output.failures.len());
//! # Ok(())
//! # }
//! ```

pub use metriq_connectors;
pub use metriq_core;
pub use metriq_exec;
pub use metriq_expr;
pub use metriq_planner;

pub mod prelude {
    pub use metriq_connectors::{
        BuiltinFactory, ConnectionsConfig, Connector, ConnectorRegistry, Fault, MemoryConnector,
        SourceUri, SqlClient, SqlConnector,
    };
    #[cfg(feature = "duckdb")]
    pub use metriq_connectors::DuckDbClient;
    pub use metriq_core::prelude::*;
    pub use metriq_exec::{ComputeOutput, ComputeRequest, EngineError, MetricEngine};
    pub use metriq_planner::{QueryPlan, QueryPlanner};
}
