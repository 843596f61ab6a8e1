#![forbid(unsafe_code)]
//! metriq-expr: binds user-supplied filter/aggregation fragments to one table
//! scope and turns them into opaque compiled expressions.
//!
//! Design:
//! - Fragment text is parsed with `sqlparser` using the backend's dialect,
//!   then lowered into a small typed IR (`Expr`). Nothing downstream ever
//!   sees the raw text again.
//! - Column resolution, position typing, and aggregate placement are checked
//!   at compile time; failures carry the fragment and its owning spec.
//! - `eval` runs the IR over `RowBatch`es (used by the in-memory backend);
//!   `render` prints it as dialect-correct SQL for SQL-speaking backends.

pub mod compile;
pub mod error;
pub mod eval;
pub mod expr;
pub mod render;
pub mod scope;

pub use compile::{CompiledExpr, ExprPosition, ExprShape, ExpressionCompiler, Fragment};
pub use error::{CompilationError, CompileErrorReason, EvalError};
pub use expr::{AggregateFunc, BinaryOp, CastType, Expr, ScalarFunc};
pub use scope::{SqlDialect, TableHandle};
