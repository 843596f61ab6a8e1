//! Convenient re-exports for downstream crates.

pub use crate::config::EngineConfig;
pub use crate::error::{Error, Result};
pub use crate::hash::Hash256;
pub use crate::id::PlanId;
pub use crate::report::{ComputeReport, PlanFingerprint, RunId};
pub use crate::result::{FailureCause, PlanFailure, ResultRow, ResultTable, OUTPUT_COLUMNS};
pub use crate::schema::{DataType, Field, Schema};
pub use crate::spec::{
    AggregationKind, MetricSpec, Period, PeriodType, SegmentSpec, SliceSpec, SliceValue,
    TimeWindow,
};
pub use crate::types::{Column, RowBatch, Scalar};
