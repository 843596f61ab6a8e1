use thiserror::Error;

use metriq_expr::CompilationError;

pub type Result<T> = std::result::Result<T, PlanningError>;

/// Structural problems in a compute request. Always raised before any
/// query is dispatched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanningError {
    #[error("no metrics requested")]
    NoMetrics,

    #[error("metric '{0}' is declared more than once")]
    DuplicateMetric(String),

    #[error("ratio metric '{0}' has no denominator")]
    MissingDenominator(String),

    #[error("metric '{metric}' uses {kind} aggregation but declares a denominator")]
    UnexpectedDenominator { metric: String, kind: String },

    #[error("slice '{0}' has no values")]
    EmptySlice(String),

    #[error("slice '{0}' is declared more than once")]
    DuplicateSlice(String),

    #[error("slice '{slice}' declares value '{value}' more than once")]
    DuplicateSliceValue { slice: String, value: String },

    #[error("segment '{0}' is declared more than once")]
    DuplicateSegment(String),

    #[error("{kind} name '{name}' contains the reserved separator '|'")]
    ReservedSeparator { kind: &'static str, name: String },

    #[error("metric '{0}' has no timestamp column to apply the time window to")]
    MissingTimestampColumn(String),

    #[error("time window starts ({start}) after it ends ({end})")]
    EmptyTimeWindow { start: String, end: String },

    #[error(transparent)]
    Compilation(#[from] CompilationError),
}
