use thiserror::Error;

/// Why a fragment failed to compile.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileErrorReason {
    #[error("syntax error: {0}")]
    Syntax(String),

    #[error("unknown column '{column}' in table '{table}'")]
    UnknownColumn { column: String, table: String },

    #[error("unsupported construct: {0}")]
    Unsupported(String),

    #[error("expected a boolean predicate, found a {found} expression")]
    ExpectedPredicate { found: &'static str },

    #[error("expected a numeric value, found a {found} expression")]
    ExpectedNumeric { found: &'static str },

    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    #[error("misplaced aggregate: {0}")]
    MisplacedAggregate(String),

    #[error("expressions bound to different tables: '{left}' and '{right}'")]
    ScopeMismatch { left: String, right: String },
}

/// Compile-time failure, tagged with the offending fragment and the spec
/// that owns it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot compile `{fragment}` (owned by '{owner}'): {reason}")]
pub struct CompilationError {
    pub owner: String,
    pub fragment: String,
    pub reason: CompileErrorReason,
}

impl CompilationError {
    pub fn new(
        owner: impl Into<String>,
        fragment: impl Into<String>,
        reason: CompileErrorReason,
    ) -> Self {
        Self {
            owner: owner.into(),
            fragment: fragment.into(),
            reason,
        }
    }
}

/// Runtime failure while evaluating compiled IR against a batch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EvalError {
    #[error("column '{0}' not present in batch")]
    MissingColumn(String),

    #[error("type error: {0}")]
    Type(String),

    #[error("integer overflow in {0}")]
    Overflow(&'static str),

    #[error("{0}")]
    Context(String),
}
