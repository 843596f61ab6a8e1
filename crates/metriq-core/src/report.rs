//! Per-call compute report for audit and log correlation.
//!
//! The engine emits one report per compute call. Plan fingerprints are stable
//! across calls with identical specs, resolved tables, and window.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::hash::Hash256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanFingerprint {
    pub source: String,
    /// `None` when the plan never got a compiled query (unresolved table).
    pub query_hash: Option<Hash256>,
    pub cells: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputeReport {
    pub id: RunId,

    /// Engine version string for provenance.
    pub engine_version: String,

    /// One entry per plan, in submission order.
    pub plans: Vec<PlanFingerprint>,

    pub rows: usize,
    pub failures: usize,

    /// Milliseconds since Unix epoch (UTC).
    pub started_ms: u64,
    pub finished_ms: u64,
}

impl ComputeReport {
    pub fn new(started_ms: u64) -> Self {
        Self {
            id: RunId(Uuid::new_v4()),
            engine_version: crate::VERSION.to_string(),
            plans: Vec::new(),
            rows: 0,
            failures: 0,
            started_ms,
            finished_ms: started_ms,
        }
    }

    pub fn finish(mut self, finished_ms: u64, rows: usize, failures: usize) -> Self {
        self.finished_ms = finished_ms;
        self.rows = rows;
        self.failures = failures;
        self
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.finished_ms.saturating_sub(self.started_ms)
    }
}
