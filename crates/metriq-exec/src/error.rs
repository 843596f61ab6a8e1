use thiserror::Error;

use metriq_connectors::ConnectorError;
use metriq_core::id::PlanId;
use metriq_planner::PlanningError;

pub type Result<T> = std::result::Result<T, EngineError>;

/// A backend answered, but not with what its plan asked for. Fatal for the
/// whole compute call.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AssemblyError {
    #[error("{plan} ({locator}) has no compiled query to assemble against")]
    NotReady { plan: PlanId, locator: String },

    #[error("{plan} ({locator}): expected columns {expected:?}, backend returned {found:?}")]
    Columns {
        plan: PlanId,
        locator: String,
        expected: Vec<String>,
        found: Vec<String>,
    },

    #[error("{plan} ({locator}): expected {expected} rows, backend returned {found}")]
    RowCount {
        plan: PlanId,
        locator: String,
        expected: usize,
        found: usize,
    },

    #[error("{plan} ({locator}): bad cell_index: {detail}")]
    CellIndex {
        plan: PlanId,
        locator: String,
        detail: String,
    },

    #[error("{plan} ({locator}): cell {index} column '{column}' is {found}, expected {expected}")]
    CellMismatch {
        plan: PlanId,
        locator: String,
        index: usize,
        column: &'static str,
        expected: String,
        found: String,
    },
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Planning(#[from] PlanningError),

    #[error(transparent)]
    Assembly(#[from] AssemblyError),

    #[error(transparent)]
    Connector(#[from] ConnectorError),

    #[error(transparent)]
    Core(#[from] metriq_core::error::Error),
}
