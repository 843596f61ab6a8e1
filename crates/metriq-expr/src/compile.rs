//! Fragment compilation: parse with `sqlparser`, lower into `Expr`, then
//! check columns, types and aggregate placement against one table scope.

use serde::Serialize;
use sqlparser::ast::{
    BinaryOperator, DuplicateTreatment, Expr as SqlExpr, FunctionArg, FunctionArgExpr,
    FunctionArguments, Ident, UnaryOperator, Value,
};
use sqlparser::parser::Parser;
use sqlparser::tokenizer::Token;

use chrono::NaiveDate;
use metriq_core::schema::DataType;
use metriq_core::types::Scalar;

use crate::error::{CompilationError, CompileErrorReason};
use crate::expr::{AggregateFunc, BinaryOp, CastType, Expr, ScalarFunc};
use crate::render;
use crate::scope::{SqlDialect, TableHandle};

type Reason = CompileErrorReason;

/// Where a fragment is used. Decides which shapes and types are legal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExprPosition {
    /// Slice/segment predicate; boolean, row-level.
    Filter,
    /// Aggregation input or aggregate-form measure; numeric.
    Value,
    /// COUNT input; any scalar.
    CountTarget,
}

/// Raw fragment text and the spec that owns it.
#[derive(Debug, Clone, Copy)]
pub struct Fragment<'a> {
    pub owner: &'a str,
    pub text: &'a str,
    pub position: ExprPosition,
}

impl<'a> Fragment<'a> {
    pub fn new(owner: &'a str, text: &'a str, position: ExprPosition) -> Self {
        Self {
            owner,
            text,
            position,
        }
    }

    pub fn filter(owner: &'a str, text: &'a str) -> Self {
        Self::new(owner, text, ExprPosition::Filter)
    }

    pub fn value(owner: &'a str, text: &'a str) -> Self {
        Self::new(owner, text, ExprPosition::Value)
    }

    pub fn count_target(owner: &'a str, text: &'a str) -> Self {
        Self::new(owner, text, ExprPosition::CountTarget)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExprShape {
    /// Row-level boolean.
    Predicate,
    /// Row-level scalar.
    Row,
    /// One value per group; every column sits inside an aggregate call.
    Aggregated,
}

/// A fragment bound to one table scope. Only the compiler and the
/// combinators below construct these.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompiledExpr {
    expr: Expr,
    source: String,
    shape: ExprShape,
    /// Spec named in errors raised by the combinators.
    #[serde(skip)]
    owner: String,
}

impl CompiledExpr {
    pub fn expr(&self) -> &Expr {
        &self.expr
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Re-attribute this expression to another spec.
    pub fn owned_by(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    pub fn shape(&self) -> ExprShape {
        self.shape
    }

    pub fn is_aggregate(&self) -> bool {
        self.shape == ExprShape::Aggregated
    }

    pub fn render(&self, dialect: SqlDialect) -> String {
        render::render_expr(&self.expr, dialect)
    }

    pub fn always_true(scope: &TableHandle) -> Self {
        Self {
            expr: Expr::Literal(Scalar::Bool(true)),
            source: scope.source.clone(),
            shape: ExprShape::Predicate,
            owner: String::new(),
        }
    }

    pub fn is_always_true(&self) -> bool {
        self.expr.is_true_literal()
    }

    /// Conjunction of two predicates over the same table.
    pub fn and(&self, other: &CompiledExpr) -> Result<CompiledExpr, CompilationError> {
        self.same_scope(other)?;
        self.require(ExprShape::Predicate)?;
        other.require(ExprShape::Predicate)?;
        if self.is_always_true() {
            return Ok(other.clone());
        }
        if other.is_always_true() {
            return Ok(self.clone());
        }
        Ok(Self {
            expr: Expr::binary(self.expr.clone(), BinaryOp::And, other.expr.clone()),
            source: self.source.clone(),
            shape: ExprShape::Predicate,
            owner: self.owner.clone(),
        })
    }

    /// `func(arg)` over the rows matching `filter`.
    pub fn aggregate(
        func: AggregateFunc,
        arg: &CompiledExpr,
        filter: &CompiledExpr,
    ) -> Result<CompiledExpr, CompilationError> {
        arg.same_scope(filter)?;
        arg.require(ExprShape::Row)?;
        filter.require(ExprShape::Predicate)?;
        Ok(Self {
            expr: Expr::Aggregate {
                func,
                arg: Some(Box::new(arg.expr.clone())),
                distinct: false,
                filter: filter_expr(filter),
            },
            source: arg.source.clone(),
            shape: ExprShape::Aggregated,
            owner: arg.owner.clone(),
        })
    }

    /// `COUNT(*)` over the rows matching `filter`.
    pub fn count_star(filter: &CompiledExpr) -> Result<CompiledExpr, CompilationError> {
        filter.require(ExprShape::Predicate)?;
        Ok(Self {
            expr: Expr::Aggregate {
                func: AggregateFunc::Count,
                arg: None,
                distinct: false,
                filter: filter_expr(filter),
            },
            source: filter.source.clone(),
            shape: ExprShape::Aggregated,
            owner: filter.owner.clone(),
        })
    }

    /// Restrict every aggregate call inside an aggregate-form expression to
    /// the rows matching `filter`, on top of any filter it already has.
    pub fn with_filter(&self, filter: &CompiledExpr) -> Result<CompiledExpr, CompilationError> {
        self.same_scope(filter)?;
        self.require(ExprShape::Aggregated)?;
        filter.require(ExprShape::Predicate)?;
        let mut expr = self.expr.clone();
        if !filter.is_always_true() {
            expr.map_aggregates(&mut |slot| {
                let merged = match slot.take() {
                    Some(existing) => Expr::binary(*existing, BinaryOp::And, filter.expr.clone()),
                    None => filter.expr.clone(),
                };
                *slot = Some(Box::new(merged));
            });
        }
        Ok(Self {
            expr,
            source: self.source.clone(),
            shape: ExprShape::Aggregated,
            owner: self.owner.clone(),
        })
    }

    /// `num / den` as floating-point division that yields NULL for a zero or
    /// NULL denominator. Renders as `CAST(num AS DOUBLE) / NULLIF(den, 0)`.
    pub fn safe_ratio(
        num: &CompiledExpr,
        den: &CompiledExpr,
    ) -> Result<CompiledExpr, CompilationError> {
        num.same_scope(den)?;
        num.require(ExprShape::Aggregated)?;
        den.require(ExprShape::Aggregated)?;
        Ok(Self {
            expr: Expr::binary(num.expr.clone(), BinaryOp::Divide, den.expr.clone()),
            source: num.source.clone(),
            shape: ExprShape::Aggregated,
            owner: num.owner.clone(),
        })
    }

    fn same_scope(&self, other: &CompiledExpr) -> Result<(), CompilationError> {
        if self.source == other.source {
            return Ok(());
        }
        Err(self.error(Reason::ScopeMismatch {
            left: self.source.clone(),
            right: other.source.clone(),
        }))
    }

    fn require(&self, shape: ExprShape) -> Result<(), CompilationError> {
        if self.shape == shape {
            return Ok(());
        }
        let reason = match shape {
            ExprShape::Predicate => Reason::ExpectedPredicate {
                found: shape_name(self.shape),
            },
            ExprShape::Row => Reason::MisplacedAggregate(format!(
                "expected a row-level value, found a {}",
                shape_name(self.shape)
            )),
            ExprShape::Aggregated => Reason::MisplacedAggregate(format!(
                "expected an aggregate expression, found a {}",
                shape_name(self.shape)
            )),
        };
        Err(self.error(reason))
    }

    fn error(&self, reason: Reason) -> CompilationError {
        CompilationError::new(
            self.owner.clone(),
            render::render_expr(&self.expr, SqlDialect::Generic),
            reason,
        )
    }
}

fn filter_expr(filter: &CompiledExpr) -> Option<Box<Expr>> {
    if filter.is_always_true() {
        None
    } else {
        Some(Box::new(filter.expr.clone()))
    }
}

fn shape_name(shape: ExprShape) -> &'static str {
    match shape {
        ExprShape::Predicate => "predicate",
        ExprShape::Row => "row-level value",
        ExprShape::Aggregated => "aggregate",
    }
}

/// Stateless; holds no caches so compilation is a pure function of the
/// fragment and the scope.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExpressionCompiler;

impl ExpressionCompiler {
    pub fn new() -> Self {
        Self
    }

    pub fn compile(
        &self,
        fragment: &Fragment<'_>,
        scope: &TableHandle,
    ) -> Result<CompiledExpr, CompilationError> {
        let fail = |reason| CompilationError::new(fragment.owner, fragment.text, reason);

        let parsed = parse(fragment.text, scope.dialect).map_err(fail)?;
        let expr = Lowering { scope }.lower(&parsed).map_err(fail)?;
        let shape = check(&expr, fragment.position, scope).map_err(fail)?;

        Ok(CompiledExpr {
            expr,
            source: scope.source.clone(),
            shape,
            owner: fragment.owner.to_string(),
        })
    }
}

fn parse(text: &str, dialect: SqlDialect) -> Result<SqlExpr, Reason> {
    if text.trim().is_empty() {
        return Err(Reason::Syntax("empty expression".to_string()));
    }
    let dialect = dialect.parser_dialect();
    let mut parser = Parser::new(dialect.as_ref())
        .try_with_sql(text)
        .map_err(|e| Reason::Syntax(e.to_string()))?;
    let expr = parser
        .parse_expr()
        .map_err(|e| Reason::Syntax(e.to_string()))?;
    let next = parser.peek_token();
    if next.token != Token::EOF {
        return Err(Reason::Syntax(format!(
            "unexpected trailing input starting at '{}'",
            next.token
        )));
    }
    Ok(expr)
}

struct Lowering<'s> {
    scope: &'s TableHandle,
}

impl Lowering<'_> {
    fn lower(&self, e: &SqlExpr) -> Result<Expr, Reason> {
        match e {
            SqlExpr::Identifier(ident) => self.column(ident),
            SqlExpr::CompoundIdentifier(parts) => self.qualified_column(parts),
            SqlExpr::Value(v) => literal(v).map(Expr::Literal),
            SqlExpr::TypedString {
                data_type, value, ..
            } => {
                let ty = data_type.to_string();
                if CastType::from_sql_name(&ty) != Some(CastType::Date) {
                    return Err(Reason::Unsupported(format!("typed literal of type {ty}")));
                }
                let text = value.to_string();
                parse_date(text.trim_matches('\''))
                    .map(|d| Expr::Literal(Scalar::Date(d)))
                    .ok_or_else(|| Reason::TypeMismatch(format!("invalid date literal {text}")))
            }
            SqlExpr::Nested(inner) => self.lower(inner),
            SqlExpr::BinaryOp { left, op, right } => Ok(Expr::binary(
                self.lower(left)?,
                binary_op(op)?,
                self.lower(right)?,
            )),
            SqlExpr::UnaryOp { op, expr } => {
                let inner = self.lower(expr)?;
                match op {
                    UnaryOperator::Not => Ok(Expr::Not(Box::new(inner))),
                    UnaryOperator::Minus => Ok(Expr::Negate(Box::new(inner))),
                    UnaryOperator::Plus => Ok(inner),
                    other => Err(Reason::Unsupported(format!("unary operator {other}"))),
                }
            }
            SqlExpr::IsNull(inner) => Ok(Expr::IsNull {
                expr: Box::new(self.lower(inner)?),
                negated: false,
            }),
            SqlExpr::IsNotNull(inner) => Ok(Expr::IsNull {
                expr: Box::new(self.lower(inner)?),
                negated: true,
            }),
            SqlExpr::InList {
                expr,
                list,
                negated,
            } => Ok(Expr::InList {
                expr: Box::new(self.lower(expr)?),
                list: list.iter().map(|e| self.lower(e)).collect::<Result<_, _>>()?,
                negated: *negated,
            }),
            SqlExpr::Between {
                expr,
                negated,
                low,
                high,
            } => Ok(Expr::Between {
                expr: Box::new(self.lower(expr)?),
                low: Box::new(self.lower(low)?),
                high: Box::new(self.lower(high)?),
                negated: *negated,
            }),
            SqlExpr::Like {
                escape_char: Some(_),
                ..
            }
            | SqlExpr::ILike {
                escape_char: Some(_),
                ..
            } => Err(Reason::Unsupported("LIKE ... ESCAPE".to_string())),
            SqlExpr::Like {
                negated,
                expr,
                pattern,
                ..
            } => self.like(expr, pattern, *negated, false),
            SqlExpr::ILike {
                negated,
                expr,
                pattern,
                ..
            } => self.like(expr, pattern, *negated, true),
            SqlExpr::Case {
                operand,
                conditions,
                results,
                else_result,
                ..
            } => {
                let operand = match operand {
                    Some(op) => Some(Box::new(self.lower(op)?)),
                    None => None,
                };
                let branches = conditions
                    .iter()
                    .zip(results.iter())
                    .map(|(w, t)| Ok((self.lower(w)?, self.lower(t)?)))
                    .collect::<Result<Vec<_>, Reason>>()?;
                let otherwise = match else_result {
                    Some(e) => Some(Box::new(self.lower(e)?)),
                    None => None,
                };
                Ok(Expr::Case {
                    operand,
                    branches,
                    otherwise,
                })
            }
            SqlExpr::Cast {
                expr, data_type, ..
            } => {
                let name = data_type.to_string();
                let to = CastType::from_sql_name(&name)
                    .ok_or_else(|| Reason::Unsupported(format!("cast to {name}")))?;
                Ok(Expr::Cast {
                    expr: Box::new(self.lower(expr)?),
                    to,
                })
            }
            SqlExpr::Function(f) => {
                if f.over.is_some() {
                    return Err(Reason::Unsupported("window functions".to_string()));
                }
                let name = f
                    .name
                    .0
                    .iter()
                    .map(|i| i.value.as_str())
                    .collect::<Vec<_>>()
                    .join(".");
                let (args, distinct) = match &f.args {
                    FunctionArguments::None => (Vec::new(), false),
                    FunctionArguments::Subquery(_) => {
                        return Err(Reason::Unsupported("subqueries".to_string()))
                    }
                    FunctionArguments::List(list) => (
                        list.args.iter().collect::<Vec<_>>(),
                        matches!(list.duplicate_treatment, Some(DuplicateTreatment::Distinct)),
                    ),
                };

                if let Some(func) = AggregateFunc::from_name(&name) {
                    let arg = match args.as_slice() {
                        [FunctionArg::Unnamed(FunctionArgExpr::Wildcard)]
                            if func == AggregateFunc::Count && !distinct =>
                        {
                            None
                        }
                        [FunctionArg::Unnamed(FunctionArgExpr::Expr(a))] => {
                            Some(Box::new(self.lower(a)?))
                        }
                        _ => {
                            return Err(Reason::Unsupported(format!(
                                "{name} expects exactly one argument"
                            )))
                        }
                    };
                    let filter = match &f.filter {
                        Some(fe) => Some(Box::new(self.lower(fe)?)),
                        None => None,
                    };
                    return Ok(Expr::Aggregate {
                        func,
                        arg,
                        distinct,
                        filter,
                    });
                }

                let func = ScalarFunc::from_name(&name)
                    .ok_or_else(|| Reason::Unsupported(format!("function {name}")))?;
                if distinct || f.filter.is_some() {
                    return Err(Reason::Unsupported(format!(
                        "DISTINCT/FILTER on scalar function {name}"
                    )));
                }
                let (min, max) = func.arity();
                if args.len() < min || args.len() > max {
                    return Err(Reason::Unsupported(format!(
                        "{name} called with {} arguments",
                        args.len()
                    )));
                }
                let args = args
                    .into_iter()
                    .map(|a| match a {
                        FunctionArg::Unnamed(FunctionArgExpr::Expr(e)) => self.lower(e),
                        other => Err(Reason::Unsupported(format!("argument {other}"))),
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Expr::Call { func, args })
            }
            SqlExpr::Subquery(_) | SqlExpr::Exists { .. } | SqlExpr::InSubquery { .. } => {
                Err(Reason::Unsupported("subqueries".to_string()))
            }
            other => Err(Reason::Unsupported(other.to_string())),
        }
    }

    fn like(
        &self,
        expr: &SqlExpr,
        pattern: &SqlExpr,
        negated: bool,
        case_insensitive: bool,
    ) -> Result<Expr, Reason> {
        Ok(Expr::Like {
            expr: Box::new(self.lower(expr)?),
            pattern: Box::new(self.lower(pattern)?),
            negated,
            case_insensitive,
        })
    }

    fn column(&self, ident: &Ident) -> Result<Expr, Reason> {
        let Some(schema) = &self.scope.schema else {
            return Ok(Expr::Column(ident.value.clone()));
        };
        // Quoted identifiers are case-sensitive.
        let field = if ident.quote_style.is_some() {
            schema.fields.iter().find(|f| f.name == ident.value)
        } else {
            schema.resolve(&ident.value)
        };
        field
            .map(|f| Expr::Column(f.name.clone()))
            .ok_or_else(|| Reason::UnknownColumn {
                column: ident.value.clone(),
                table: self.scope.table.clone(),
            })
    }

    fn qualified_column(&self, parts: &[Ident]) -> Result<Expr, Reason> {
        match parts {
            [qualifier, col] if qualifier.value.eq_ignore_ascii_case(self.scope.short_name()) => {
                self.column(col)
            }
            _ => Err(Reason::UnknownColumn {
                column: parts
                    .iter()
                    .map(|p| p.value.as_str())
                    .collect::<Vec<_>>()
                    .join("."),
                table: self.scope.table.clone(),
            }),
        }
    }
}

fn literal(v: &Value) -> Result<Scalar, Reason> {
    match v {
        Value::Number(n, _) => n
            .parse::<i64>()
            .map(Scalar::I64)
            .or_else(|_| n.parse::<f64>().map(Scalar::F64))
            .map_err(|_| Reason::Syntax(format!("invalid number {n}"))),
        Value::SingleQuotedString(s) | Value::DoubleQuotedString(s) => Ok(Scalar::Str(s.clone())),
        Value::Boolean(b) => Ok(Scalar::Bool(*b)),
        Value::Null => Ok(Scalar::Null),
        other => Err(Reason::Unsupported(format!("literal {other}"))),
    }
}

fn binary_op(op: &BinaryOperator) -> Result<BinaryOp, Reason> {
    Ok(match op {
        BinaryOperator::And => BinaryOp::And,
        BinaryOperator::Or => BinaryOp::Or,
        BinaryOperator::Eq => BinaryOp::Eq,
        BinaryOperator::NotEq => BinaryOp::NotEq,
        BinaryOperator::Lt => BinaryOp::Lt,
        BinaryOperator::LtEq => BinaryOp::LtEq,
        BinaryOperator::Gt => BinaryOp::Gt,
        BinaryOperator::GtEq => BinaryOp::GtEq,
        BinaryOperator::Plus => BinaryOp::Plus,
        BinaryOperator::Minus => BinaryOp::Minus,
        BinaryOperator::Multiply => BinaryOp::Multiply,
        BinaryOperator::Divide => BinaryOp::Divide,
        BinaryOperator::Modulo => BinaryOp::Modulo,
        other => return Err(Reason::Unsupported(format!("operator {other}"))),
    })
}

/// Accepts `YYYY-MM-DD`, optionally followed by a time part.
pub(crate) fn parse_date(s: &str) -> Option<NaiveDate> {
    let head = s.trim().get(..10)?;
    NaiveDate::parse_from_str(head, "%Y-%m-%d").ok()
}

/// Static type of an IR node. `Unknown` covers columns of unbound scopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ty {
    Bool,
    Num,
    Text,
    Date,
    Null,
    Unknown,
}

impl Ty {
    fn name(self) -> &'static str {
        match self {
            Ty::Bool => "boolean",
            Ty::Num => "numeric",
            Ty::Text => "text",
            Ty::Date => "date",
            Ty::Null => "null",
            Ty::Unknown => "unknown",
        }
    }

    fn is_open(self) -> bool {
        matches!(self, Ty::Null | Ty::Unknown)
    }

    fn accepts(self, want: Ty) -> bool {
        self == want || self.is_open()
    }

    fn comparable(self, other: Ty) -> bool {
        self == other
            || self.is_open()
            || other.is_open()
            || matches!((self, other), (Ty::Date, Ty::Text) | (Ty::Text, Ty::Date))
    }

    fn of_scalar(s: &Scalar) -> Ty {
        match s {
            Scalar::Null => Ty::Null,
            Scalar::Bool(_) => Ty::Bool,
            Scalar::I64(_) | Scalar::F64(_) => Ty::Num,
            Scalar::Str(_) => Ty::Text,
            Scalar::Date(_) => Ty::Date,
        }
    }

    fn of_data_type(dt: DataType) -> Ty {
        match dt {
            DataType::Boolean => Ty::Bool,
            DataType::Int64 | DataType::Float64 => Ty::Num,
            DataType::Utf8 => Ty::Text,
            DataType::Date => Ty::Date,
        }
    }

    fn of_cast(to: CastType) -> Ty {
        match to {
            CastType::Int64 | CastType::Float64 => Ty::Num,
            CastType::Utf8 => Ty::Text,
            CastType::Boolean => Ty::Bool,
            CastType::Date => Ty::Date,
        }
    }
}

fn check(expr: &Expr, position: ExprPosition, scope: &TableHandle) -> Result<ExprShape, Reason> {
    let aggregated = placement(expr)?;
    let ty = type_of(expr, scope)?;

    match position {
        ExprPosition::Filter => {
            if aggregated {
                return Err(Reason::MisplacedAggregate(
                    "filters cannot contain aggregate calls".to_string(),
                ));
            }
            if ty != Ty::Bool && ty != Ty::Unknown {
                return Err(Reason::ExpectedPredicate { found: ty.name() });
            }
            Ok(ExprShape::Predicate)
        }
        ExprPosition::Value => {
            if !ty.accepts(Ty::Num) {
                return Err(Reason::ExpectedNumeric { found: ty.name() });
            }
            Ok(if aggregated {
                ExprShape::Aggregated
            } else {
                ExprShape::Row
            })
        }
        ExprPosition::CountTarget => {
            if aggregated {
                if !ty.accepts(Ty::Num) {
                    return Err(Reason::ExpectedNumeric { found: ty.name() });
                }
                Ok(ExprShape::Aggregated)
            } else {
                Ok(ExprShape::Row)
            }
        }
    }
}

/// `Ok(true)` for aggregate form, `Ok(false)` for row-level. Mixed forms and
/// nested aggregates are rejected.
fn placement(expr: &Expr) -> Result<bool, Reason> {
    if let Expr::Aggregate { arg, filter, .. } = expr {
        let nested = arg.as_deref().is_some_and(Expr::contains_aggregate)
            || filter.as_deref().is_some_and(Expr::contains_aggregate);
        if nested {
            return Err(Reason::MisplacedAggregate(
                "aggregate calls cannot be nested".to_string(),
            ));
        }
        return Ok(true);
    }
    if !expr.contains_aggregate() {
        return Ok(false);
    }
    if let Some(col) = bare_column(expr) {
        return Err(Reason::MisplacedAggregate(format!(
            "column '{col}' is referenced outside an aggregate call"
        )));
    }
    for child in expr.children() {
        placement(child)?;
    }
    Ok(true)
}

/// First column not wrapped by an aggregate call.
fn bare_column(expr: &Expr) -> Option<&str> {
    match expr {
        Expr::Column(name) => Some(name),
        Expr::Aggregate { .. } => None,
        other => other.children().into_iter().find_map(bare_column),
    }
}

fn type_of(expr: &Expr, scope: &TableHandle) -> Result<Ty, Reason> {
    let expect = |ty: Ty, want: Ty, ctx: &str| -> Result<(), Reason> {
        if ty.accepts(want) {
            Ok(())
        } else {
            Err(Reason::TypeMismatch(format!(
                "{ctx} expects {} operands, found {}",
                want.name(),
                ty.name()
            )))
        }
    };

    Ok(match expr {
        Expr::Column(name) => scope
            .schema
            .as_ref()
            .and_then(|s| s.resolve(name))
            .map(|f| Ty::of_data_type(f.data_type))
            .unwrap_or(Ty::Unknown),
        Expr::Literal(s) => Ty::of_scalar(s),
        Expr::Binary { left, op, right } => {
            let (l, r) = (type_of(left, scope)?, type_of(right, scope)?);
            if op.is_logical() {
                expect(l, Ty::Bool, op.sql())?;
                expect(r, Ty::Bool, op.sql())?;
                Ty::Bool
            } else if op.is_comparison() {
                if !l.comparable(r) {
                    return Err(Reason::TypeMismatch(format!(
                        "cannot compare {} with {}",
                        l.name(),
                        r.name()
                    )));
                }
                Ty::Bool
            } else {
                expect(l, Ty::Num, op.sql())?;
                expect(r, Ty::Num, op.sql())?;
                Ty::Num
            }
        }
        Expr::Not(e) => {
            expect(type_of(e, scope)?, Ty::Bool, "NOT")?;
            Ty::Bool
        }
        Expr::Negate(e) => {
            expect(type_of(e, scope)?, Ty::Num, "unary minus")?;
            Ty::Num
        }
        Expr::IsNull { expr, .. } => {
            type_of(expr, scope)?;
            Ty::Bool
        }
        Expr::InList { expr, list, .. } => {
            let t = type_of(expr, scope)?;
            for item in list {
                let it = type_of(item, scope)?;
                if !t.comparable(it) {
                    return Err(Reason::TypeMismatch(format!(
                        "IN list mixes {} with {}",
                        t.name(),
                        it.name()
                    )));
                }
            }
            Ty::Bool
        }
        Expr::Between {
            expr, low, high, ..
        } => {
            let t = type_of(expr, scope)?;
            for bound in [low, high] {
                let bt = type_of(bound, scope)?;
                if !t.comparable(bt) {
                    return Err(Reason::TypeMismatch(format!(
                        "BETWEEN compares {} with {}",
                        t.name(),
                        bt.name()
                    )));
                }
            }
            Ty::Bool
        }
        Expr::Like { expr, pattern, .. } => {
            expect(type_of(expr, scope)?, Ty::Text, "LIKE")?;
            expect(type_of(pattern, scope)?, Ty::Text, "LIKE")?;
            Ty::Bool
        }
        Expr::Case {
            operand,
            branches,
            otherwise,
        } => {
            let operand_ty = match operand {
                Some(op) => Some(type_of(op, scope)?),
                None => None,
            };
            let mut result = Ty::Null;
            for (when, then) in branches {
                let wt = type_of(when, scope)?;
                match operand_ty {
                    Some(ot) if !ot.comparable(wt) => {
                        return Err(Reason::TypeMismatch(format!(
                            "CASE compares {} with {}",
                            ot.name(),
                            wt.name()
                        )))
                    }
                    Some(_) => {}
                    None => expect(wt, Ty::Bool, "CASE WHEN")?,
                }
                result = merge_branch(result, type_of(then, scope)?)?;
            }
            if let Some(e) = otherwise {
                result = merge_branch(result, type_of(e, scope)?)?;
            }
            result
        }
        Expr::Cast { expr, to } => {
            type_of(expr, scope)?;
            Ty::of_cast(*to)
        }
        Expr::Call { func, args } => {
            let tys = args
                .iter()
                .map(|a| type_of(a, scope))
                .collect::<Result<Vec<_>, _>>()?;
            match func {
                ScalarFunc::Coalesce => {
                    let mut result = Ty::Null;
                    for t in tys {
                        result = merge_branch(result, t)?;
                    }
                    result
                }
                ScalarFunc::NullIf => tys.first().copied().unwrap_or(Ty::Null),
                ScalarFunc::Abs => {
                    for t in tys {
                        expect(t, Ty::Num, "ABS")?;
                    }
                    Ty::Num
                }
                ScalarFunc::Lower | ScalarFunc::Upper => {
                    for t in tys {
                        expect(t, Ty::Text, func.sql())?;
                    }
                    Ty::Text
                }
            }
        }
        Expr::Aggregate {
            func, arg, filter, ..
        } => {
            if let Some(f) = filter {
                expect(type_of(f, scope)?, Ty::Bool, "aggregate FILTER")?;
            }
            let arg_ty = match arg {
                Some(a) => type_of(a, scope)?,
                None => Ty::Unknown,
            };
            match func {
                AggregateFunc::Count => Ty::Num,
                AggregateFunc::Sum | AggregateFunc::Avg => {
                    expect(arg_ty, Ty::Num, func.sql())?;
                    Ty::Num
                }
                AggregateFunc::Min | AggregateFunc::Max => arg_ty,
            }
        }
    })
}

fn merge_branch(acc: Ty, next: Ty) -> Result<Ty, Reason> {
    match (acc, next) {
        (a, Ty::Null) => Ok(a),
        (Ty::Null, b) => Ok(b),
        (a, b) if a == b => Ok(a),
        (Ty::Unknown, b) | (b, Ty::Unknown) => Ok(b),
        (a, b) => Err(Reason::TypeMismatch(format!(
            "branches mix {} and {}",
            a.name(),
            b.name()
        ))),
    }
}
