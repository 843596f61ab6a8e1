#![forbid(unsafe_code)]
//! metriq-exec: dispatch, assembly, and the compute entry point.
//!
//! - `Executor` runs one tokio task per dispatchable plan, bounded by a
//!   semaphore, and funnels completions through a single collector. Every
//!   per-source problem becomes a `PlanFailure`; siblings always finish.
//! - `OutputAssembler` validates backend rows against the plan and builds the
//!   long-format `ResultTable` in submission and cell order.
//! - `MetricEngine::compute` ties planning, execution and assembly together
//!   and emits a `ComputeReport`.

pub mod assemble;
pub mod engine;
pub mod error;
pub mod executor;

pub use assemble::OutputAssembler;
pub use engine::{ComputeOutput, ComputeRequest, MetricEngine};
pub use error::{AssemblyError, EngineError, Result};
pub use executor::{ExecutionOutput, Executor, PlanOutcome};
