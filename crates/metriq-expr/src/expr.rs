//! Typed expression IR produced by the compiler.
//!
//! The IR is deliberately small: it covers the scalar subset that metric
//! fragments use (boolean logic, comparisons, arithmetic, CASE, CAST, a few
//! scalar functions) plus the five aggregate calls. Column names are already
//! normalized to the bound table's spelling.

use serde::Serialize;

use metriq_core::types::Scalar;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BinaryOp {
    And,
    Or,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Plus,
    Minus,
    Multiply,
    Divide,
    Modulo,
}

impl BinaryOp {
    pub fn sql(self) -> &'static str {
        match self {
            BinaryOp::And => "AND",
            BinaryOp::Or => "OR",
            BinaryOp::Eq => "=",
            BinaryOp::NotEq => "<>",
            BinaryOp::Lt => "<",
            BinaryOp::LtEq => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::GtEq => ">=",
            BinaryOp::Plus => "+",
            BinaryOp::Minus => "-",
            BinaryOp::Multiply => "*",
            BinaryOp::Divide => "/",
            BinaryOp::Modulo => "%",
        }
    }

    pub fn is_logical(self) -> bool {
        matches!(self, BinaryOp::And | BinaryOp::Or)
    }

    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Eq
                | BinaryOp::NotEq
                | BinaryOp::Lt
                | BinaryOp::LtEq
                | BinaryOp::Gt
                | BinaryOp::GtEq
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AggregateFunc {
    Sum,
    Avg,
    Count,
    Min,
    Max,
}

impl AggregateFunc {
    pub fn sql(self) -> &'static str {
        match self {
            AggregateFunc::Sum => "SUM",
            AggregateFunc::Avg => "AVG",
            AggregateFunc::Count => "COUNT",
            AggregateFunc::Min => "MIN",
            AggregateFunc::Max => "MAX",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "SUM" => Some(AggregateFunc::Sum),
            "AVG" => Some(AggregateFunc::Avg),
            "COUNT" => Some(AggregateFunc::Count),
            "MIN" => Some(AggregateFunc::Min),
            "MAX" => Some(AggregateFunc::Max),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ScalarFunc {
    Coalesce,
    NullIf,
    Abs,
    Lower,
    Upper,
}

impl ScalarFunc {
    pub fn sql(self) -> &'static str {
        match self {
            ScalarFunc::Coalesce => "COALESCE",
            ScalarFunc::NullIf => "NULLIF",
            ScalarFunc::Abs => "ABS",
            ScalarFunc::Lower => "LOWER",
            ScalarFunc::Upper => "UPPER",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "COALESCE" | "IFNULL" => Some(ScalarFunc::Coalesce),
            "NULLIF" => Some(ScalarFunc::NullIf),
            "ABS" => Some(ScalarFunc::Abs),
            "LOWER" => Some(ScalarFunc::Lower),
            "UPPER" => Some(ScalarFunc::Upper),
            _ => None,
        }
    }

    /// Accepted argument counts as (min, max).
    pub fn arity(self) -> (usize, usize) {
        match self {
            ScalarFunc::Coalesce => (1, usize::MAX),
            ScalarFunc::NullIf => (2, 2),
            ScalarFunc::Abs | ScalarFunc::Lower | ScalarFunc::Upper => (1, 1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CastType {
    Int64,
    Float64,
    Utf8,
    Boolean,
    Date,
}

impl CastType {
    /// Map a parsed SQL type name onto the supported cast targets.
    pub fn from_sql_name(name: &str) -> Option<Self> {
        let upper = name.trim().to_ascii_uppercase();
        let base = upper.split('(').next().unwrap_or("").trim();
        match base {
            "INT" | "INTEGER" | "BIGINT" | "INT64" | "SMALLINT" | "INT4" | "INT8" => {
                Some(CastType::Int64)
            }
            "DOUBLE" | "DOUBLE PRECISION" | "FLOAT" | "FLOAT64" | "REAL" | "DECIMAL"
            | "NUMERIC" | "FLOAT8" => Some(CastType::Float64),
            "VARCHAR" | "TEXT" | "STRING" | "CHAR" => Some(CastType::Utf8),
            "BOOLEAN" | "BOOL" => Some(CastType::Boolean),
            "DATE" => Some(CastType::Date),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Expr {
    Column(String),
    Literal(Scalar),
    Binary {
        left: Box<Expr>,
        op: BinaryOp,
        right: Box<Expr>,
    },
    Not(Box<Expr>),
    Negate(Box<Expr>),
    IsNull {
        expr: Box<Expr>,
        negated: bool,
    },
    InList {
        expr: Box<Expr>,
        list: Vec<Expr>,
        negated: bool,
    },
    Between {
        expr: Box<Expr>,
        low: Box<Expr>,
        high: Box<Expr>,
        negated: bool,
    },
    Like {
        expr: Box<Expr>,
        pattern: Box<Expr>,
        negated: bool,
        case_insensitive: bool,
    },
    Case {
        operand: Option<Box<Expr>>,
        branches: Vec<(Expr, Expr)>,
        otherwise: Option<Box<Expr>>,
    },
    Cast {
        expr: Box<Expr>,
        to: CastType,
    },
    Call {
        func: ScalarFunc,
        args: Vec<Expr>,
    },
    /// `arg == None` is `COUNT(*)`. `filter` restricts the rows fed to the
    /// aggregate; it is applied before aggregation.
    Aggregate {
        func: AggregateFunc,
        arg: Option<Box<Expr>>,
        distinct: bool,
        filter: Option<Box<Expr>>,
    },
}

impl Expr {
    pub fn binary(left: Expr, op: BinaryOp, right: Expr) -> Self {
        Expr::Binary {
            left: Box::new(left),
            op,
            right: Box::new(right),
        }
    }

    pub fn is_true_literal(&self) -> bool {
        matches!(self, Expr::Literal(Scalar::Bool(true)))
    }

    /// Direct children, in evaluation order.
    pub fn children(&self) -> Vec<&Expr> {
        match self {
            Expr::Column(_) | Expr::Literal(_) => Vec::new(),
            Expr::Binary { left, right, .. } => vec![left.as_ref(), right.as_ref()],
            Expr::Not(e) | Expr::Negate(e) => vec![e.as_ref()],
            Expr::IsNull { expr, .. } | Expr::Cast { expr, .. } => vec![expr.as_ref()],
            Expr::InList { expr, list, .. } => {
                let mut out = vec![expr.as_ref()];
                out.extend(list.iter());
                out
            }
            Expr::Between {
                expr, low, high, ..
            } => vec![expr.as_ref(), low.as_ref(), high.as_ref()],
            Expr::Like { expr, pattern, .. } => vec![expr.as_ref(), pattern.as_ref()],
            Expr::Case {
                operand,
                branches,
                otherwise,
            } => {
                let mut out = Vec::new();
                if let Some(op) = operand {
                    out.push(op.as_ref());
                }
                for (when, then) in branches {
                    out.push(when);
                    out.push(then);
                }
                if let Some(e) = otherwise {
                    out.push(e.as_ref());
                }
                out
            }
            Expr::Call { args, .. } => args.iter().collect(),
            Expr::Aggregate { arg, filter, .. } => {
                let mut out = Vec::new();
                if let Some(a) = arg {
                    out.push(a.as_ref());
                }
                if let Some(f) = filter {
                    out.push(f.as_ref());
                }
                out
            }
        }
    }

    pub fn contains_aggregate(&self) -> bool {
        matches!(self, Expr::Aggregate { .. })
            || self.children().iter().any(|c| c.contains_aggregate())
    }

    /// Column names referenced anywhere in the tree, first occurrence first.
    pub fn columns(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_columns(&mut out);
        out
    }

    fn collect_columns<'a>(&'a self, out: &mut Vec<&'a str>) {
        if let Expr::Column(name) = self {
            if !out.contains(&name.as_str()) {
                out.push(name);
            }
        }
        for child in self.children() {
            child.collect_columns(out);
        }
    }

    /// Rewrite every aggregate call in place, leaving everything else intact.
    pub(crate) fn map_aggregates(&mut self, f: &mut dyn FnMut(&mut Option<Box<Expr>>)) {
        match self {
            Expr::Aggregate { filter, .. } => f(filter),
            Expr::Column(_) | Expr::Literal(_) => {}
            Expr::Binary { left, right, .. } => {
                left.map_aggregates(f);
                right.map_aggregates(f);
            }
            Expr::Not(e) | Expr::Negate(e) => e.map_aggregates(f),
            Expr::IsNull { expr, .. } | Expr::Cast { expr, .. } => expr.map_aggregates(f),
            Expr::InList { expr, list, .. } => {
                expr.map_aggregates(f);
                list.iter_mut().for_each(|e| e.map_aggregates(f));
            }
            Expr::Between {
                expr, low, high, ..
            } => {
                expr.map_aggregates(f);
                low.map_aggregates(f);
                high.map_aggregates(f);
            }
            Expr::Like { expr, pattern, .. } => {
                expr.map_aggregates(f);
                pattern.map_aggregates(f);
            }
            Expr::Case {
                operand,
                branches,
                otherwise,
            } => {
                if let Some(op) = operand {
                    op.map_aggregates(f);
                }
                for (when, then) in branches {
                    when.map_aggregates(f);
                    then.map_aggregates(f);
                }
                if let Some(e) = otherwise {
                    e.map_aggregates(f);
                }
            }
            Expr::Call { args, .. } => args.iter_mut().for_each(|e| e.map_aggregates(f)),
        }
    }
}
