#![forbid(unsafe_code)]
//! metriq-planner: metric/slice/segment specs → one batched query per source.
//!
//! Design:
//! - `slices::expand` turns slice specs into the ordered cross-product of
//!   combinations; that order fixes output row order.
//! - `QueryPlanner::build_plans` validates the request, partitions metrics by
//!   source, resolves each table once, and compiles every
//!   (metric × segment × combination) cell into one `CompiledQuery`.
//! - Sources that cannot be resolved still get a plan (unresolved), so the
//!   executor can report them without aborting the batch.
//!
//! No I/O happens here; tables are resolved before planning and handed in
//! through `TableResolver`.

pub mod build;
pub mod error;
pub mod query;
pub mod slices;

pub use build::{sources, QueryPlanner, TableResolver};
pub use error::{PlanningError, Result};
pub use query::{CompiledQuery, PlanState, QueryCell, QueryPlan, QUERY_OUTPUT_COLUMNS};
pub use slices::{expand, SliceCombination};
