//! IR to SQL text. Identifiers and literals are always quoted by the
//! renderer, so user text can only reach a query through the IR.
//!
//! Division and modulo render with `NULLIF(divisor, 0)` and division casts
//! its dividend to the dialect's float type, so every backend returns what
//! `eval` computes: a float, or NULL for a zero divisor.

use metriq_core::types::Scalar;

use crate::expr::{AggregateFunc, BinaryOp, CastType, Expr, ScalarFunc};
use crate::scope::SqlDialect;

pub fn render_expr(expr: &Expr, dialect: SqlDialect) -> String {
    let mut out = String::new();
    write_expr(&mut out, expr, dialect);
    out
}

pub fn render_scalar(s: &Scalar, dialect: SqlDialect) -> String {
    match s {
        Scalar::Null => "NULL".to_string(),
        Scalar::Bool(true) => "TRUE".to_string(),
        Scalar::Bool(false) => "FALSE".to_string(),
        Scalar::I64(i) => i.to_string(),
        // Debug keeps the decimal point (`1.0`), so the value stays a float.
        Scalar::F64(f) if f.is_finite() => format!("{f:?}"),
        Scalar::F64(_) => "NULL".to_string(),
        Scalar::Str(s) => dialect.quote_literal(s),
        Scalar::Date(d) => format!("DATE '{}'", d.format("%Y-%m-%d")),
    }
}

fn write_expr(out: &mut String, expr: &Expr, dialect: SqlDialect) {
    match expr {
        Expr::Column(name) => out.push_str(&dialect.quote_ident(name)),
        Expr::Literal(s) => out.push_str(&render_scalar(s, dialect)),
        Expr::Binary {
            left,
            op: BinaryOp::Divide,
            right,
        } => {
            out.push_str("(CAST(");
            write_expr(out, left, dialect);
            out.push_str(" AS ");
            out.push_str(dialect.cast_name(CastType::Float64));
            out.push_str(") / ");
            write_nonzero(out, right, dialect);
            out.push(')');
        }
        Expr::Binary {
            left,
            op: BinaryOp::Modulo,
            right,
        } if dialect == SqlDialect::BigQuery => {
            out.push_str("MOD(");
            write_expr(out, left, dialect);
            out.push_str(", ");
            write_nonzero(out, right, dialect);
            out.push(')');
        }
        Expr::Binary {
            left,
            op: BinaryOp::Modulo,
            right,
        } => {
            out.push('(');
            write_expr(out, left, dialect);
            out.push_str(" % ");
            write_nonzero(out, right, dialect);
            out.push(')');
        }
        Expr::Binary { left, op, right } => {
            out.push('(');
            write_expr(out, left, dialect);
            out.push(' ');
            out.push_str(op.sql());
            out.push(' ');
            write_expr(out, right, dialect);
            out.push(')');
        }
        Expr::Not(e) => {
            out.push_str("(NOT ");
            write_expr(out, e, dialect);
            out.push(')');
        }
        Expr::Negate(e) => {
            out.push_str("(-");
            write_expr(out, e, dialect);
            out.push(')');
        }
        Expr::IsNull { expr, negated } => {
            out.push('(');
            write_expr(out, expr, dialect);
            out.push_str(if *negated { " IS NOT NULL)" } else { " IS NULL)" });
        }
        Expr::InList {
            expr,
            list,
            negated,
        } => {
            out.push('(');
            write_expr(out, expr, dialect);
            out.push_str(if *negated { " NOT IN (" } else { " IN (" });
            write_list(out, list, dialect);
            out.push_str("))");
        }
        Expr::Between {
            expr,
            low,
            high,
            negated,
        } => {
            out.push('(');
            write_expr(out, expr, dialect);
            out.push_str(if *negated {
                " NOT BETWEEN "
            } else {
                " BETWEEN "
            });
            write_expr(out, low, dialect);
            out.push_str(" AND ");
            write_expr(out, high, dialect);
            out.push(')');
        }
        Expr::Like {
            expr,
            pattern,
            negated,
            case_insensitive,
        } => {
            let not = if *negated { "NOT " } else { "" };
            out.push('(');
            if *case_insensitive && !dialect.supports_ilike() {
                out.push_str("LOWER(");
                write_expr(out, expr, dialect);
                out.push_str(&format!(") {not}LIKE LOWER("));
                write_expr(out, pattern, dialect);
                out.push(')');
            } else {
                let kw = if *case_insensitive { "ILIKE" } else { "LIKE" };
                write_expr(out, expr, dialect);
                out.push_str(&format!(" {not}{kw} "));
                write_expr(out, pattern, dialect);
            }
            out.push(')');
        }
        Expr::Case {
            operand,
            branches,
            otherwise,
        } => {
            out.push_str("CASE");
            if let Some(op) = operand {
                out.push(' ');
                write_expr(out, op, dialect);
            }
            for (when, then) in branches {
                out.push_str(" WHEN ");
                write_expr(out, when, dialect);
                out.push_str(" THEN ");
                write_expr(out, then, dialect);
            }
            if let Some(e) = otherwise {
                out.push_str(" ELSE ");
                write_expr(out, e, dialect);
            }
            out.push_str(" END");
        }
        Expr::Cast { expr, to } => {
            out.push_str("CAST(");
            write_expr(out, expr, dialect);
            out.push_str(" AS ");
            out.push_str(dialect.cast_name(*to));
            out.push(')');
        }
        Expr::Call { func, args } => {
            out.push_str(func.sql());
            out.push('(');
            write_list(out, args, dialect);
            out.push(')');
        }
        Expr::Aggregate {
            func,
            arg,
            distinct,
            filter,
        } => {
            out.push_str(func.sql());
            out.push('(');
            if *distinct {
                out.push_str("DISTINCT ");
            }
            // Filters render as CASE inside the call; every target dialect
            // accepts that, unlike FILTER (WHERE ...).
            match (arg, filter) {
                (None, None) => out.push('*'),
                (Some(a), None) => write_expr(out, a, dialect),
                (arg, Some(f)) => {
                    out.push_str("CASE WHEN ");
                    write_expr(out, f, dialect);
                    out.push_str(" THEN ");
                    match arg {
                        Some(a) => write_expr(out, a, dialect),
                        None => {
                            debug_assert_eq!(*func, AggregateFunc::Count);
                            out.push('1');
                        }
                    }
                    out.push_str(" END");
                }
            }
            out.push(')');
        }
    }
}

/// `NULLIF(expr, 0)`, skipped when `expr` is already a NULLIF call.
fn write_nonzero(out: &mut String, expr: &Expr, dialect: SqlDialect) {
    if matches!(expr, Expr::Call { func, .. } if *func == ScalarFunc::NullIf) {
        write_expr(out, expr, dialect);
        return;
    }
    out.push_str("NULLIF(");
    write_expr(out, expr, dialect);
    out.push_str(", 0)");
}

fn write_list(out: &mut String, items: &[Expr], dialect: SqlDialect) {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        write_expr(out, item, dialect);
    }
}
