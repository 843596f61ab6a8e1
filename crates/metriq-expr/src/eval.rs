//! Interpreter for the IR over `RowBatch`es.
//!
//! Follows SQL semantics: three-valued logic, NULL propagation through
//! arithmetic, empty or all-NULL SUM/AVG/MIN/MAX yield NULL and COUNT yields
//! 0, division always happens in floating point and division by zero is NULL.

use std::cmp::Ordering;

use metriq_core::types::{RowBatch, Scalar};

use crate::compile::{parse_date, CompiledExpr, ExprShape};
use crate::error::EvalError;
use crate::expr::{AggregateFunc, BinaryOp, CastType, Expr, ScalarFunc};

pub type Result<T> = std::result::Result<T, EvalError>;

#[derive(Clone, Copy)]
enum Ctx<'a> {
    Row { batch: &'a RowBatch, row: usize },
    Group { batch: &'a RowBatch },
}

/// Evaluate an aggregate-form expression over the whole batch.
pub fn eval_measure(expr: &CompiledExpr, batch: &RowBatch) -> Result<Scalar> {
    if expr.shape() != ExprShape::Aggregated {
        return Err(EvalError::Context(
            "only aggregate expressions evaluate over a whole batch".to_string(),
        ));
    }
    eval(expr.expr(), Ctx::Group { batch })
}

/// Row indices where a predicate is TRUE (NULL and FALSE are dropped).
pub fn select_rows(predicate: &CompiledExpr, batch: &RowBatch) -> Result<Vec<usize>> {
    if predicate.shape() != ExprShape::Predicate {
        return Err(EvalError::Context("expected a predicate".to_string()));
    }
    let mut out = Vec::new();
    for row in 0..batch.num_rows() {
        if truthy(&eval(predicate.expr(), Ctx::Row { batch, row })?)? == Some(true) {
            out.push(row);
        }
    }
    Ok(out)
}

fn eval(expr: &Expr, ctx: Ctx<'_>) -> Result<Scalar> {
    match expr {
        Expr::Column(name) => match ctx {
            Ctx::Row { batch, row } => batch
                .column(name)
                .ok_or_else(|| EvalError::MissingColumn(name.clone()))?
                .values
                .get(row)
                .cloned()
                .ok_or_else(|| EvalError::Context(format!("row {row} out of range"))),
            Ctx::Group { .. } => Err(EvalError::Context(format!(
                "column '{name}' used outside an aggregate"
            ))),
        },
        Expr::Literal(s) => Ok(s.clone()),
        Expr::Binary { left, op, right } => match op {
            BinaryOp::And => {
                let l = truthy(&eval(left, ctx)?)?;
                if l == Some(false) {
                    return Ok(Scalar::Bool(false));
                }
                let r = truthy(&eval(right, ctx)?)?;
                Ok(match (l, r) {
                    (_, Some(false)) => Scalar::Bool(false),
                    (Some(true), Some(true)) => Scalar::Bool(true),
                    _ => Scalar::Null,
                })
            }
            BinaryOp::Or => {
                let l = truthy(&eval(left, ctx)?)?;
                if l == Some(true) {
                    return Ok(Scalar::Bool(true));
                }
                let r = truthy(&eval(right, ctx)?)?;
                Ok(match (l, r) {
                    (_, Some(true)) => Scalar::Bool(true),
                    (Some(false), Some(false)) => Scalar::Bool(false),
                    _ => Scalar::Null,
                })
            }
            op if op.is_comparison() => {
                let (l, r) = (eval(left, ctx)?, eval(right, ctx)?);
                Ok(compare(*op, &l, &r))
            }
            op => arithmetic(*op, eval(left, ctx)?, eval(right, ctx)?),
        },
        Expr::Not(e) => Ok(match truthy(&eval(e, ctx)?)? {
            Some(b) => Scalar::Bool(!b),
            None => Scalar::Null,
        }),
        Expr::Negate(e) => match eval(e, ctx)? {
            Scalar::Null => Ok(Scalar::Null),
            Scalar::I64(i) => i
                .checked_neg()
                .map(Scalar::I64)
                .ok_or(EvalError::Overflow("negation")),
            Scalar::F64(f) => Ok(Scalar::F64(-f)),
            other => Err(type_error("unary minus", &other)),
        },
        Expr::IsNull { expr, negated } => {
            let null = eval(expr, ctx)?.is_null();
            Ok(Scalar::Bool(null != *negated))
        }
        Expr::InList {
            expr,
            list,
            negated,
        } => {
            let needle = eval(expr, ctx)?;
            if needle.is_null() {
                return Ok(Scalar::Null);
            }
            let mut saw_null = false;
            for item in list {
                match compare(BinaryOp::Eq, &needle, &eval(item, ctx)?) {
                    Scalar::Bool(true) => return Ok(Scalar::Bool(!negated)),
                    Scalar::Null => saw_null = true,
                    _ => {}
                }
            }
            Ok(if saw_null {
                Scalar::Null
            } else {
                Scalar::Bool(*negated)
            })
        }
        Expr::Between {
            expr,
            low,
            high,
            negated,
        } => {
            let v = eval(expr, ctx)?;
            let lo = compare(BinaryOp::GtEq, &v, &eval(low, ctx)?);
            let hi = compare(BinaryOp::LtEq, &v, &eval(high, ctx)?);
            let both = match (truthy(&lo)?, truthy(&hi)?) {
                (Some(false), _) | (_, Some(false)) => Some(false),
                (Some(true), Some(true)) => Some(true),
                _ => None,
            };
            Ok(match both {
                Some(b) => Scalar::Bool(b != *negated),
                None => Scalar::Null,
            })
        }
        Expr::Like {
            expr,
            pattern,
            negated,
            case_insensitive,
        } => match (eval(expr, ctx)?, eval(pattern, ctx)?) {
            (Scalar::Null, _) | (_, Scalar::Null) => Ok(Scalar::Null),
            (Scalar::Str(s), Scalar::Str(p)) => {
                let hit = if *case_insensitive {
                    like(&s.to_lowercase(), &p.to_lowercase())
                } else {
                    like(&s, &p)
                };
                Ok(Scalar::Bool(hit != *negated))
            }
            (other, _) => Err(type_error("LIKE", &other)),
        },
        Expr::Case {
            operand,
            branches,
            otherwise,
        } => {
            let subject = match operand {
                Some(op) => Some(eval(op, ctx)?),
                None => None,
            };
            for (when, then) in branches {
                let w = eval(when, ctx)?;
                let hit = match &subject {
                    Some(s) => compare(BinaryOp::Eq, s, &w) == Scalar::Bool(true),
                    None => truthy(&w)? == Some(true),
                };
                if hit {
                    return eval(then, ctx);
                }
            }
            match otherwise {
                Some(e) => eval(e, ctx),
                None => Ok(Scalar::Null),
            }
        }
        Expr::Cast { expr, to } => cast(eval(expr, ctx)?, *to),
        Expr::Call { func, args } => {
            let values = args
                .iter()
                .map(|a| eval(a, ctx))
                .collect::<Result<Vec<_>>>()?;
            call(*func, values)
        }
        Expr::Aggregate {
            func,
            arg,
            distinct,
            filter,
        } => match ctx {
            Ctx::Group { batch } => aggregate(
                *func,
                arg.as_deref(),
                *distinct,
                filter.as_deref(),
                batch,
            ),
            Ctx::Row { .. } => Err(EvalError::Context(format!(
                "{} used in a row-level context",
                func.sql()
            ))),
        },
    }
}

fn aggregate(
    func: AggregateFunc,
    arg: Option<&Expr>,
    distinct: bool,
    filter: Option<&Expr>,
    batch: &RowBatch,
) -> Result<Scalar> {
    let mut values: Vec<Scalar> = Vec::new();
    for row in 0..batch.num_rows() {
        let ctx = Ctx::Row { batch, row };
        if let Some(f) = filter {
            if truthy(&eval(f, ctx)?)? != Some(true) {
                continue;
            }
        }
        let v = match arg {
            Some(a) => eval(a, ctx)?,
            // COUNT(*) counts rows; any non-null marker will do.
            None => Scalar::Bool(true),
        };
        if v.is_null() {
            continue;
        }
        if distinct && values.contains(&v) {
            continue;
        }
        values.push(v);
    }

    match func {
        AggregateFunc::Count => Ok(Scalar::I64(values.len() as i64)),
        AggregateFunc::Sum => {
            let mut iter = values.into_iter();
            let Some(first) = iter.next() else {
                return Ok(Scalar::Null);
            };
            iter.try_fold(first, |acc, v| arithmetic(BinaryOp::Plus, acc, v))
        }
        AggregateFunc::Avg => {
            if values.is_empty() {
                return Ok(Scalar::Null);
            }
            let mut total = 0.0;
            for v in &values {
                total += v.as_f64().ok_or_else(|| type_error("AVG", v))?;
            }
            Ok(Scalar::F64(total / values.len() as f64))
        }
        AggregateFunc::Min | AggregateFunc::Max => {
            let keep = if func == AggregateFunc::Min {
                Ordering::Less
            } else {
                Ordering::Greater
            };
            let mut best: Option<Scalar> = None;
            for v in values {
                best = match best {
                    None => Some(v),
                    Some(b) => match v.sql_cmp(&b) {
                        Some(ord) if ord == keep => Some(v),
                        Some(_) => Some(b),
                        None => return Err(type_error(func.sql(), &v)),
                    },
                };
            }
            Ok(best.unwrap_or(Scalar::Null))
        }
    }
}

/// SQL truth value: `None` is UNKNOWN.
fn truthy(v: &Scalar) -> Result<Option<bool>> {
    match v {
        Scalar::Bool(b) => Ok(Some(*b)),
        Scalar::Null => Ok(None),
        other => Err(type_error("boolean context", other)),
    }
}

fn compare(op: BinaryOp, l: &Scalar, r: &Scalar) -> Scalar {
    let ord = match (l, r) {
        // Date columns compared against string literals, as SQL engines coerce.
        (Scalar::Date(d), Scalar::Str(s)) => parse_date(s).map(|p| d.cmp(&p)),
        (Scalar::Str(s), Scalar::Date(d)) => parse_date(s).map(|p| p.cmp(d)),
        _ => l.sql_cmp(r),
    };
    let Some(ord) = ord else {
        return Scalar::Null;
    };
    Scalar::Bool(match op {
        BinaryOp::Eq => ord == Ordering::Equal,
        BinaryOp::NotEq => ord != Ordering::Equal,
        BinaryOp::Lt => ord == Ordering::Less,
        BinaryOp::LtEq => ord != Ordering::Greater,
        BinaryOp::Gt => ord == Ordering::Greater,
        BinaryOp::GtEq => ord != Ordering::Less,
        _ => return Scalar::Null,
    })
}

fn arithmetic(op: BinaryOp, l: Scalar, r: Scalar) -> Result<Scalar> {
    use Scalar::*;
    if l.is_null() || r.is_null() {
        return Ok(Null);
    }
    if op == BinaryOp::Divide {
        let (a, b) = (num(&l, op)?, num(&r, op)?);
        return Ok(if b == 0.0 { Null } else { F64(a / b) });
    }
    match (&l, &r) {
        (I64(a), I64(b)) => {
            let (a, b) = (*a, *b);
            let out = match op {
                BinaryOp::Plus => a.checked_add(b),
                BinaryOp::Minus => a.checked_sub(b),
                BinaryOp::Multiply => a.checked_mul(b),
                BinaryOp::Modulo => {
                    if b == 0 {
                        return Ok(Null);
                    }
                    a.checked_rem(b)
                }
                _ => return Err(EvalError::Type(format!("{} is not arithmetic", op.sql()))),
            };
            out.map(I64).ok_or(EvalError::Overflow("integer arithmetic"))
        }
        _ => {
            let (a, b) = (num(&l, op)?, num(&r, op)?);
            Ok(match op {
                BinaryOp::Plus => F64(a + b),
                BinaryOp::Minus => F64(a - b),
                BinaryOp::Multiply => F64(a * b),
                BinaryOp::Modulo if b == 0.0 => Null,
                BinaryOp::Modulo => F64(a % b),
                _ => return Err(EvalError::Type(format!("{} is not arithmetic", op.sql()))),
            })
        }
    }
}

fn num(v: &Scalar, op: BinaryOp) -> Result<f64> {
    v.as_f64().ok_or_else(|| type_error(op.sql(), v))
}

fn cast(v: Scalar, to: CastType) -> Result<Scalar> {
    use Scalar::*;
    if v.is_null() {
        return Ok(Null);
    }
    let failed = |v: &Scalar| EvalError::Type(format!("cannot cast {v} to {to:?}"));
    Ok(match (to, v) {
        (CastType::Float64, I64(i)) => F64(i as f64),
        (CastType::Float64, F64(f)) => F64(f),
        (CastType::Float64, Bool(b)) => F64(if b { 1.0 } else { 0.0 }),
        (CastType::Float64, Str(s)) => F64(s.trim().parse().map_err(|_| failed(&Str(s.clone())))?),
        (CastType::Int64, I64(i)) => I64(i),
        (CastType::Int64, F64(f)) => {
            let r = f.round();
            if !r.is_finite() || r < i64::MIN as f64 || r > i64::MAX as f64 {
                return Err(EvalError::Overflow("cast to integer"));
            }
            I64(r as i64)
        }
        (CastType::Int64, Bool(b)) => I64(b as i64),
        (CastType::Int64, Str(s)) => I64(s.trim().parse().map_err(|_| failed(&Str(s.clone())))?),
        (CastType::Utf8, v) => Str(v.to_string()),
        (CastType::Boolean, Bool(b)) => Bool(b),
        (CastType::Boolean, I64(i)) => Bool(i != 0),
        (CastType::Boolean, Str(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "t" | "1" => Bool(true),
            "false" | "f" | "0" => Bool(false),
            _ => return Err(failed(&Str(s))),
        },
        (CastType::Date, Date(d)) => Date(d),
        (CastType::Date, Str(s)) => Date(parse_date(&s).ok_or_else(|| failed(&Str(s.clone())))?),
        (_, v) => return Err(failed(&v)),
    })
}

fn call(func: ScalarFunc, mut args: Vec<Scalar>) -> Result<Scalar> {
    match func {
        ScalarFunc::Coalesce => Ok(args
            .into_iter()
            .find(|v| !v.is_null())
            .unwrap_or(Scalar::Null)),
        ScalarFunc::NullIf => {
            let second = args.pop().unwrap_or(Scalar::Null);
            let first = args.pop().unwrap_or(Scalar::Null);
            Ok(match compare(BinaryOp::Eq, &first, &second) {
                Scalar::Bool(true) => Scalar::Null,
                _ => first,
            })
        }
        ScalarFunc::Abs => match args.into_iter().next().unwrap_or(Scalar::Null) {
            Scalar::Null => Ok(Scalar::Null),
            Scalar::I64(i) => i
                .checked_abs()
                .map(Scalar::I64)
                .ok_or(EvalError::Overflow("ABS")),
            Scalar::F64(f) => Ok(Scalar::F64(f.abs())),
            other => Err(type_error("ABS", &other)),
        },
        ScalarFunc::Lower | ScalarFunc::Upper => {
            match args.into_iter().next().unwrap_or(Scalar::Null) {
                Scalar::Null => Ok(Scalar::Null),
                Scalar::Str(s) if func == ScalarFunc::Lower => Ok(Scalar::Str(s.to_lowercase())),
                Scalar::Str(s) => Ok(Scalar::Str(s.to_uppercase())),
                other => Err(type_error(func.sql(), &other)),
            }
        }
    }
}

/// SQL LIKE with `%` and `_` wildcards.
fn like(s: &str, pattern: &str) -> bool {
    let s: Vec<char> = s.chars().collect();
    let p: Vec<char> = pattern.chars().collect();
    let (mut si, mut pi) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;
    while si < s.len() {
        if pi < p.len() && (p[pi] == '_' || p[pi] == s[si]) {
            si += 1;
            pi += 1;
        } else if pi < p.len() && p[pi] == '%' {
            backtrack = Some((pi, si));
            pi += 1;
        } else if let Some((bp, bs)) = backtrack {
            pi = bp + 1;
            si = bs + 1;
            backtrack = Some((bp, bs + 1));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|c| *c == '%')
}

fn type_error(ctx: &str, v: &Scalar) -> EvalError {
    let ty = v
        .data_type()
        .map(|t| format!("{t:?}"))
        .unwrap_or_else(|| "NULL".to_string());
    EvalError::Type(format!("{ctx} cannot take a {ty} value"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile::{ExpressionCompiler, Fragment};
    use crate::scope::{SqlDialect, TableHandle};
    use metriq_core::types::Column;

    fn batch() -> RowBatch {
        RowBatch::new(vec![
            Column::new(
                "country",
                vec!["US".into(), "US".into(), "DE".into(), Scalar::Null],
            ),
            Column::new(
                "amount",
                vec![10.0.into(), Scalar::Null, 5.0.into(), 1.0.into()],
            ),
            Column::new(
                "clicks",
                vec![1i64.into(), 2i64.into(), 0i64.into(), 3i64.into()],
            ),
        ])
    }

    fn scope() -> TableHandle {
        TableHandle::new("memory://t", "t", SqlDialect::Generic, batch().infer_schema())
    }

    fn compile(f: Fragment<'_>) -> CompiledExpr {
        ExpressionCompiler::new().compile(&f, &scope()).unwrap()
    }

    #[test]
    fn predicates_drop_unknown_rows() {
        let p = compile(Fragment::filter("s", "country = 'US'"));
        assert_eq!(select_rows(&p, &batch()).unwrap(), vec![0, 1]);
        let p = compile(Fragment::filter("s", "country <> 'US'"));
        assert_eq!(select_rows(&p, &batch()).unwrap(), vec![2]);
        let p = compile(Fragment::filter("s", "country IS NULL OR clicks > 2"));
        assert_eq!(select_rows(&p, &batch()).unwrap(), vec![3]);
    }

    #[test]
    fn sum_skips_nulls_and_empty_is_null() {
        let m = compile(Fragment::value("m", "SUM(amount)"));
        assert_eq!(eval_measure(&m, &batch()).unwrap(), Scalar::F64(16.0));
        let us = compile(Fragment::filter("s", "country = 'XX'"));
        let empty = m.with_filter(&us).unwrap();
        assert_eq!(eval_measure(&empty, &batch()).unwrap(), Scalar::Null);
    }

    #[test]
    fn count_of_nothing_is_zero() {
        let none = compile(Fragment::filter("s", "clicks > 100"));
        let c = CompiledExpr::count_star(&none).unwrap();
        assert_eq!(eval_measure(&c, &batch()).unwrap(), Scalar::I64(0));
        let all = CompiledExpr::count_star(&CompiledExpr::always_true(&scope())).unwrap();
        assert_eq!(eval_measure(&all, &batch()).unwrap(), Scalar::I64(4));
    }

    #[test]
    fn safe_ratio_is_null_on_zero_denominator() {
        let de = compile(Fragment::filter("s", "country = 'DE'"));
        let clicks = compile(Fragment::value("m", "clicks"));
        let amount = compile(Fragment::value("m", "amount"));
        let num = CompiledExpr::aggregate(AggregateFunc::Sum, &amount, &de).unwrap();
        let den = CompiledExpr::aggregate(AggregateFunc::Sum, &clicks, &de).unwrap();
        let ratio = CompiledExpr::safe_ratio(&num, &den).unwrap();
        assert_eq!(eval_measure(&ratio, &batch()).unwrap(), Scalar::Null);

        let t = CompiledExpr::always_true(&scope());
        let num = CompiledExpr::aggregate(AggregateFunc::Sum, &clicks, &t).unwrap();
        let den = CompiledExpr::aggregate(AggregateFunc::Count, &clicks, &t).unwrap();
        let ratio = CompiledExpr::safe_ratio(&num, &den).unwrap();
        assert_eq!(eval_measure(&ratio, &batch()).unwrap(), Scalar::F64(1.5));
    }

    #[test]
    fn like_wildcards() {
        assert!(like("premium_plus", "prem%"));
        assert!(like("abc", "a_c"));
        assert!(like("abc", "%"));
        assert!(!like("abc", "a_"));
        assert!(like("aXbXc", "a%b%c"));
    }

    #[test]
    fn dates_compare_against_string_literals() {
        let d = chrono::NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
        assert_eq!(
            compare(BinaryOp::GtEq, &Scalar::Date(d), &Scalar::Str("2024-01-01".into())),
            Scalar::Bool(true)
        );
    }
}
