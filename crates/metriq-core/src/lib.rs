#![forbid(unsafe_code)]
//! metriq-core: value objects and shared plumbing for the metriq engine.
//!
//! - metric/slice/segment specs and the reporting window (`spec`)
//! - scalar batches exchanged with backends (`types`, `schema`)
//! - the canonical output table and plan failures (`result`)
//! - engine config, stable hashing, ids, and the per-call report
//!
//! No async, no I/O beyond writers handed in by the caller.

pub mod config;
pub mod error;
pub mod hash;
pub mod id;
pub mod prelude;
pub mod report;
pub mod result;
pub mod schema;
pub mod spec;
pub mod types;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
