//! Request validation and per-source plan construction.

use std::collections::HashSet;

use tracing::{debug, info, warn};

use metriq_core::id::PlanId;
use metriq_core::result::FailureCause;
use metriq_core::spec::{
    AggregationKind, MetricSpec, SegmentSpec, SliceSpec, TimeWindow, NONE_SENTINEL,
    SLICE_SEPARATOR,
};
use metriq_expr::{
    AggregateFunc, CompiledExpr, ExprPosition, ExpressionCompiler, Fragment, SqlDialect,
    TableHandle,
};

use crate::error::{PlanningError, Result};
use crate::query::{CompiledQuery, PlanState, QueryCell, QueryPlan};
use crate::slices::{expand, SliceCombination};

/// Binds a source locator to a table. Implemented by the connector registry;
/// closures work too, which keeps planning testable without backends.
pub trait TableResolver {
    fn resolve_table(&self, source: &str) -> std::result::Result<TableHandle, FailureCause>;

    /// Dialect for syntax-checking fragments of a source that did not resolve.
    fn dialect_hint(&self, _source: &str) -> SqlDialect {
        SqlDialect::Generic
    }
}

impl<F> TableResolver for F
where
    F: Fn(&str) -> std::result::Result<TableHandle, FailureCause>,
{
    fn resolve_table(&self, source: &str) -> std::result::Result<TableHandle, FailureCause> {
        self(source)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct QueryPlanner {
    compiler: ExpressionCompiler,
}

/// A compiled numerator or denominator, before the cell filter is applied.
enum Operand {
    /// `COUNT(*)`.
    Star,
    Row(CompiledExpr),
    Aggregated(CompiledExpr),
}

impl Operand {
    fn measure(&self, owner: &str, func: AggregateFunc, filter: &CompiledExpr) -> Result<CompiledExpr> {
        let measure = match self {
            Operand::Star => CompiledExpr::count_star(filter)?,
            Operand::Row(e) => CompiledExpr::aggregate(func, e, filter)?,
            // Aggregate-form fragments are used verbatim; only the filter is added.
            Operand::Aggregated(e) => e.with_filter(filter)?,
        };
        Ok(measure.owned_by(owner))
    }
}

fn aggregate_func(kind: AggregationKind) -> AggregateFunc {
    match kind {
        AggregationKind::Sum | AggregationKind::Ratio => AggregateFunc::Sum,
        AggregationKind::Avg => AggregateFunc::Avg,
        AggregationKind::Count => AggregateFunc::Count,
        AggregationKind::Min => AggregateFunc::Min,
        AggregationKind::Max => AggregateFunc::Max,
    }
}

impl QueryPlanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Structural checks on a request. `build_plans` runs these too; callers
    /// that resolve tables first use this to fail before touching backends.
    pub fn validate(
        &self,
        metrics: &[MetricSpec],
        slices: &[SliceSpec],
        segments: &[SegmentSpec],
        window: Option<&TimeWindow>,
    ) -> Result<()> {
        validate(metrics, slices, segments, window)
    }

    /// One plan per distinct source, in order of first appearance.
    ///
    /// Structural problems and compilation errors are fatal and raised before
    /// anything runs. A source that fails to resolve still yields a plan in
    /// the `Unresolved` state after its fragments pass a syntax-only check.
    pub fn build_plans(
        &self,
        metrics: &[MetricSpec],
        slices: &[SliceSpec],
        segments: &[SegmentSpec],
        window: Option<&TimeWindow>,
        resolver: &dyn TableResolver,
    ) -> Result<Vec<QueryPlan>> {
        validate(metrics, slices, segments, window)?;
        let combos = expand(slices);

        let mut groups: Vec<(&str, Vec<&MetricSpec>)> = Vec::new();
        for m in metrics {
            match groups.iter_mut().find(|(s, _)| *s == m.source) {
                Some((_, group)) => group.push(m),
                None => groups.push((m.source.as_str(), vec![m])),
            }
        }

        let mut plans = Vec::with_capacity(groups.len());
        for (i, (source, group)) in groups.into_iter().enumerate() {
            let id = PlanId::new(i as u64);
            let (scope, failure) = match resolver.resolve_table(source) {
                Ok(handle) => (handle, None),
                Err(cause) => {
                    warn!(%id, source, %cause, "table resolution failed; plan will be skipped");
                    let hint = resolver.dialect_hint(source);
                    (TableHandle::unbound(source, "", hint), Some(cause))
                }
            };

            let query = self.compile_source(&scope, &group, slices, segments, &combos, window)?;
            let expected_rows = query.cells.len();
            debug!(
                %id,
                source,
                table = %scope.table,
                metrics = group.len(),
                cells = expected_rows,
                "compiled plan"
            );

            plans.push(QueryPlan {
                id,
                source: source.to_string(),
                metrics: group.iter().map(|m| m.name.clone()).collect(),
                expected_rows,
                state: match failure {
                    None => PlanState::Ready(query),
                    Some(cause) => PlanState::Unresolved(cause),
                },
            });
        }

        info!(
            plans = plans.len(),
            metrics = metrics.len(),
            combinations = combos.len(),
            segments = segments.len(),
            "planning complete"
        );
        Ok(plans)
    }

    fn compile_source(
        &self,
        scope: &TableHandle,
        metrics: &[&MetricSpec],
        slices: &[SliceSpec],
        segments: &[SegmentSpec],
        combos: &[SliceCombination],
        window: Option<&TimeWindow>,
    ) -> Result<CompiledQuery> {
        let always = CompiledExpr::always_true(scope);

        // Each slice value and segment is compiled once per source.
        let mut slice_preds: Vec<Vec<CompiledExpr>> = Vec::with_capacity(slices.len());
        for slice in slices {
            let mut values = Vec::with_capacity(slice.values.len());
            for v in &slice.values {
                let owner = format!("{}.{}", slice.name, v.name);
                values.push(self.compile(&owner, &v.predicate, ExprPosition::Filter, scope)?);
            }
            slice_preds.push(values);
        }

        let mut combo_preds = Vec::with_capacity(combos.len());
        for combo in combos {
            let mut pred = always.clone();
            for &(s, v) in &combo.members {
                pred = pred.and(&slice_preds[s][v])?;
            }
            combo_preds.push(pred);
        }

        let mut segment_preds = Vec::with_capacity(segments.len().max(1));
        for seg in segments {
            segment_preds.push((
                seg.name.as_str(),
                self.compile(&seg.name, &seg.predicate, ExprPosition::Filter, scope)?,
            ));
        }
        if segment_preds.is_empty() {
            segment_preds.push((NONE_SENTINEL, always.clone()));
        }

        let mut cells = Vec::with_capacity(metrics.len() * combos.len() * segment_preds.len());
        for metric in metrics {
            let window_pred = match window {
                Some(w) => self.window_predicate(metric, w, scope)?,
                None => always.clone(),
            };
            let func = aggregate_func(metric.aggregation);
            let numerator = self.operand(metric, &metric.numerator, scope)?;
            let denominator = match (&metric.denominator, metric.aggregation) {
                (Some(den), AggregationKind::Ratio) => Some(self.operand(metric, den, scope)?),
                _ => None,
            };

            for (segment_name, segment_pred) in &segment_preds {
                let base = segment_pred.and(&window_pred)?;
                for (combo, combo_pred) in combos.iter().zip(&combo_preds) {
                    let filter = base.and(combo_pred)?;
                    let owner = metric.name.as_str();
                    let measure = match &denominator {
                        Some(den) => CompiledExpr::safe_ratio(
                            &numerator.measure(owner, func, &filter)?,
                            &den.measure(owner, func, &filter)?,
                        )?,
                        None => numerator.measure(owner, func, &filter)?,
                    };
                    cells.push(QueryCell {
                        index: cells.len(),
                        metric_name: metric.name.clone(),
                        slice_type: combo.slice_type.clone(),
                        slice_value: combo.slice_value.clone(),
                        segment_name: segment_name.to_string(),
                        measure,
                    });
                }
            }
        }

        Ok(CompiledQuery {
            table: scope.clone(),
            cells,
        })
    }

    fn compile(
        &self,
        owner: &str,
        text: &str,
        position: ExprPosition,
        scope: &TableHandle,
    ) -> Result<CompiledExpr> {
        Ok(self
            .compiler
            .compile(&Fragment::new(owner, text, position), scope)?)
    }

    fn operand(&self, metric: &MetricSpec, text: &str, scope: &TableHandle) -> Result<Operand> {
        if metric.aggregation == AggregationKind::Count && text.trim() == "*" {
            return Ok(Operand::Star);
        }
        let position = if metric.aggregation == AggregationKind::Count {
            ExprPosition::CountTarget
        } else {
            ExprPosition::Value
        };
        let compiled = self.compile(&metric.name, text, position, scope)?;
        Ok(if compiled.is_aggregate() {
            Operand::Aggregated(compiled)
        } else {
            Operand::Row(compiled)
        })
    }

    /// Inclusive calendar-date window on the metric's timestamp column.
    fn window_predicate(
        &self,
        metric: &MetricSpec,
        window: &TimeWindow,
        scope: &TableHandle,
    ) -> Result<CompiledExpr> {
        // validate() guarantees the column is present.
        let column = metric.timestamp_col.as_deref().unwrap_or_default();
        let text = format!(
            "CAST({} AS DATE) BETWEEN DATE '{}' AND DATE '{}'",
            scope.dialect.quote_ident(column),
            window.start.format("%Y-%m-%d"),
            window.end.format("%Y-%m-%d"),
        );
        self.compile(&metric.name, &text, ExprPosition::Filter, scope)
    }
}

/// Distinct metric sources in order of first appearance.
pub fn sources(metrics: &[MetricSpec]) -> Vec<&str> {
    let mut out: Vec<&str> = Vec::new();
    for m in metrics {
        if !out.contains(&m.source.as_str()) {
            out.push(m.source.as_str());
        }
    }
    out
}

fn validate(
    metrics: &[MetricSpec],
    slices: &[SliceSpec],
    segments: &[SegmentSpec],
    window: Option<&TimeWindow>,
) -> Result<()> {
    if metrics.is_empty() {
        return Err(PlanningError::NoMetrics);
    }

    let mut seen = HashSet::new();
    for m in metrics {
        if !seen.insert(m.name.as_str()) {
            return Err(PlanningError::DuplicateMetric(m.name.clone()));
        }
        match (m.aggregation, &m.denominator) {
            (AggregationKind::Ratio, None) => {
                return Err(PlanningError::MissingDenominator(m.name.clone()))
            }
            (kind, Some(_)) if kind != AggregationKind::Ratio => {
                return Err(PlanningError::UnexpectedDenominator {
                    metric: m.name.clone(),
                    kind: kind.to_string(),
                })
            }
            _ => {}
        }
        if window.is_some() && m.timestamp_col.as_deref().map_or(true, |c| c.trim().is_empty()) {
            return Err(PlanningError::MissingTimestampColumn(m.name.clone()));
        }
    }

    if let Some(w) = window {
        if w.is_empty() {
            return Err(PlanningError::EmptyTimeWindow {
                start: w.start.to_string(),
                end: w.end.to_string(),
            });
        }
    }

    let mut slice_names = HashSet::new();
    for s in slices {
        reject_separator("slice", &s.name)?;
        if !slice_names.insert(s.name.as_str()) {
            return Err(PlanningError::DuplicateSlice(s.name.clone()));
        }
        if s.values.is_empty() {
            return Err(PlanningError::EmptySlice(s.name.clone()));
        }
        let mut value_names = HashSet::new();
        for v in &s.values {
            reject_separator("slice value", &v.name)?;
            if !value_names.insert(v.name.as_str()) {
                return Err(PlanningError::DuplicateSliceValue {
                    slice: s.name.clone(),
                    value: v.name.clone(),
                });
            }
        }
    }

    let mut segment_names = HashSet::new();
    for seg in segments {
        if !segment_names.insert(seg.name.as_str()) {
            return Err(PlanningError::DuplicateSegment(seg.name.clone()));
        }
    }
    Ok(())
}

fn reject_separator(kind: &'static str, name: &str) -> Result<()> {
    if name.contains(SLICE_SEPARATOR) {
        return Err(PlanningError::ReservedSeparator {
            kind,
            name: name.to_string(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use chrono::NaiveDate;
    use metriq_core::schema::{DataType, Field, Schema};
    use metriq_core::spec::{PeriodType, SliceValue};
    use metriq_expr::CompileErrorReason;

    use super::*;

    const EVENTS: &str = "duckdb://analytics.db/events";
    const ORDERS: &str = "duckdb://analytics.db/orders";
    const REMOTE: &str = "bigquery://proj.ds.sessions";

    fn resolve(source: &str) -> std::result::Result<TableHandle, FailureCause> {
        let schema = Schema::new(vec![
            Field::new("amount", DataType::Float64, true),
            Field::new("clicks", DataType::Int64, true),
            Field::new("impressions", DataType::Int64, true),
            Field::new("country", DataType::Utf8, true),
            Field::new("is_premium", DataType::Boolean, true),
            Field::new("event_date", DataType::Date, true),
        ]);
        match source {
            EVENTS | ORDERS => {
                let table = source.rsplit('/').next().unwrap_or_default();
                Ok(TableHandle::new(source, table, SqlDialect::DuckDb, schema))
            }
            _ => Err(FailureCause::ConnectorNotFound {
                backend: "bigquery".into(),
            }),
        }
    }

    fn country() -> SliceSpec {
        SliceSpec::new(
            "country",
            vec![
                SliceValue::new("US", "country = 'US'"),
                SliceValue::new("EU", "country IN ('DE', 'FR')"),
            ],
        )
    }

    fn premium() -> SegmentSpec {
        SegmentSpec::new("premium", "is_premium")
    }

    fn plan(
        metrics: &[MetricSpec],
        slices: &[SliceSpec],
        segments: &[SegmentSpec],
    ) -> Result<Vec<QueryPlan>> {
        QueryPlanner::new().build_plans(metrics, slices, segments, None, &resolve)
    }

    #[test]
    fn one_plan_per_source_in_first_appearance_order() {
        let metrics = [
            MetricSpec::new("orders", ORDERS, AggregationKind::Count, "*"),
            MetricSpec::new("revenue", EVENTS, AggregationKind::Sum, "amount"),
            MetricSpec::new("aov", ORDERS, AggregationKind::Avg, "amount"),
        ];
        let plans = plan(&metrics, &[], &[]).unwrap();
        assert_eq!(plans.len(), 2);
        assert_eq!(plans[0].source, ORDERS);
        assert_eq!(plans[0].metrics, vec!["orders", "aov"]);
        assert_eq!(plans[1].metrics, vec!["revenue"]);
        assert_eq!(plans[0].id, PlanId::new(0));
    }

    #[test]
    fn sources_are_distinct_in_first_appearance_order() {
        let metrics = [
            MetricSpec::new("orders", ORDERS, AggregationKind::Count, "*"),
            MetricSpec::new("revenue", EVENTS, AggregationKind::Sum, "amount"),
            MetricSpec::new("aov", ORDERS, AggregationKind::Avg, "amount"),
        ];
        assert_eq!(sources(&metrics), vec![ORDERS, EVENTS]);
        let planner = QueryPlanner::new();
        assert!(planner.validate(&metrics, &[], &[], None).is_ok());
        assert_eq!(
            planner.validate(&[], &[], &[], None).unwrap_err(),
            PlanningError::NoMetrics
        );
    }

    #[test]
    fn cells_follow_metric_segment_combination_order() {
        let metrics = [
            MetricSpec::new("revenue", EVENTS, AggregationKind::Sum, "amount"),
            MetricSpec::ratio("ctr", EVENTS, "clicks", "impressions"),
        ];
        let segments = [premium(), SegmentSpec::new("free", "NOT is_premium")];
        let plans = plan(&metrics, &[country()], &segments).unwrap();
        let q = plans[0].query().unwrap();
        assert_eq!(q.cells.len(), 2 * 2 * 2);
        assert_eq!(plans[0].expected_rows, 8);
        let labels: Vec<(usize, &str, &str, &str)> = q
            .cells
            .iter()
            .map(|c| {
                (
                    c.index,
                    c.metric_name.as_str(),
                    c.segment_name.as_str(),
                    c.slice_value.as_str(),
                )
            })
            .collect();
        assert_eq!(labels[0], (0, "revenue", "premium", "US"));
        assert_eq!(labels[1], (1, "revenue", "premium", "EU"));
        assert_eq!(labels[2], (2, "revenue", "free", "US"));
        assert_eq!(labels[7], (7, "ctr", "free", "EU"));
    }

    #[test]
    fn sentinels_without_slices_or_segments() {
        let metrics = [MetricSpec::new("revenue", EVENTS, AggregationKind::Sum, "amount")];
        let plans = plan(&metrics, &[], &[]).unwrap();
        let cell = &plans[0].query().unwrap().cells[0];
        assert_eq!(plans[0].expected_rows, 1);
        assert_eq!(
            (cell.slice_type.as_str(), cell.slice_value.as_str(), cell.segment_name.as_str()),
            ("none", "all", "none")
        );
    }

    #[test]
    fn denominator_pairing_is_checked_before_resolution() {
        let calls = Cell::new(0);
        let counting = |source: &str| {
            calls.set(calls.get() + 1);
            resolve(source)
        };
        let bad = [MetricSpec::new("ctr", EVENTS, AggregationKind::Ratio, "clicks")];
        let err = QueryPlanner::new()
            .build_plans(&bad, &[], &[], None, &counting)
            .unwrap_err();
        assert_eq!(err, PlanningError::MissingDenominator("ctr".into()));

        let bad = [MetricSpec::new("rev", EVENTS, AggregationKind::Sum, "amount")
            .with_denominator("clicks")];
        let err = QueryPlanner::new()
            .build_plans(&bad, &[], &[], None, &counting)
            .unwrap_err();
        assert!(matches!(err, PlanningError::UnexpectedDenominator { .. }));
        assert_eq!(calls.get(), 0);
    }

    #[test]
    fn structural_errors() {
        assert_eq!(plan(&[], &[], &[]).unwrap_err(), PlanningError::NoMetrics);

        let m = MetricSpec::new("revenue", EVENTS, AggregationKind::Sum, "amount");
        let dup = [m.clone(), m.clone()];
        assert!(matches!(
            plan(&dup, &[], &[]).unwrap_err(),
            PlanningError::DuplicateMetric(_)
        ));

        let empty = SliceSpec::new("country", vec![]);
        assert!(matches!(
            plan(&[m.clone()], &[empty], &[]).unwrap_err(),
            PlanningError::EmptySlice(_)
        ));

        let piped = SliceSpec::new("a|b", vec![SliceValue::new("x", "TRUE")]);
        assert!(matches!(
            plan(&[m], &[piped], &[]).unwrap_err(),
            PlanningError::ReservedSeparator { .. }
        ));
    }

    #[test]
    fn compilation_errors_name_the_owner() {
        let metrics = [MetricSpec::new("revenue", EVENTS, AggregationKind::Sum, "amount_usd")];
        match plan(&metrics, &[], &[]).unwrap_err() {
            PlanningError::Compilation(e) => {
                assert_eq!(e.owner, "revenue");
                assert!(matches!(e.reason, CompileErrorReason::UnknownColumn { .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn unresolved_sources_are_syntax_checked_but_not_fatal() {
        let metrics = [
            MetricSpec::new("revenue", EVENTS, AggregationKind::Sum, "amount"),
            MetricSpec::new("sessions", REMOTE, AggregationKind::Count, "session_id"),
        ];
        let plans = plan(&metrics, &[country()], &[]).unwrap();
        assert!(plans[0].is_ready());
        assert!(matches!(
            plans[1].state,
            PlanState::Unresolved(FailureCause::ConnectorNotFound { .. })
        ));
        assert_eq!(plans[1].expected_rows, 2);

        let broken = [MetricSpec::new("sessions", REMOTE, AggregationKind::Sum, "SUM(")];
        assert!(matches!(
            plan(&broken, &[], &[]).unwrap_err(),
            PlanningError::Compilation(_)
        ));
    }

    #[test]
    fn time_window_needs_timestamp_column() {
        let d = |day| NaiveDate::from_ymd_opt(2024, 1, day).unwrap();
        let window = TimeWindow::new(PeriodType::Monthly, d(1), d(31));
        let metrics = [MetricSpec::new("revenue", EVENTS, AggregationKind::Sum, "amount")];
        let err = QueryPlanner::new()
            .build_plans(&metrics, &[], &[], Some(&window), &resolve)
            .unwrap_err();
        assert_eq!(err, PlanningError::MissingTimestampColumn("revenue".into()));

        let metrics = [metrics[0].clone().with_timestamp_col("event_date")];
        let plans = QueryPlanner::new()
            .build_plans(&metrics, &[], &[], Some(&window), &resolve)
            .unwrap();
        let sql = plans[0].query().unwrap().render_sql();
        assert!(sql.contains("BETWEEN DATE '2024-01-01' AND DATE '2024-01-31'"));

        let backwards = TimeWindow::custom(d(31), d(1));
        assert!(matches!(
            QueryPlanner::new()
                .build_plans(&metrics, &[], &[], Some(&backwards), &resolve)
                .unwrap_err(),
            PlanningError::EmptyTimeWindow { .. }
        ));
    }

    #[test]
    fn rendered_sql_is_one_statement_per_plan() {
        let metrics = [
            MetricSpec::new("revenue", EVENTS, AggregationKind::Sum, "amount"),
            MetricSpec::ratio("ctr", EVENTS, "clicks", "impressions"),
        ];
        let plans = plan(&metrics, &[country()], &[premium()]).unwrap();
        let sql = plans[0].query().unwrap().render_sql();
        assert!(sql.starts_with("WITH agg AS ("));
        assert_eq!(sql.matches("UNION ALL").count(), 3);
        assert!(sql.contains("FROM \"events\""));
        assert!(sql.contains("NULLIF(SUM(CASE WHEN"));
        assert!(sql.ends_with("ORDER BY \"cell_index\""));
    }

    #[test]
    fn aggregate_form_numerators_get_the_cell_filter() {
        let metrics = [MetricSpec::new(
            "aov",
            EVENTS,
            AggregationKind::Sum,
            "SUM(amount) / COUNT(*)",
        )];
        let plans = plan(&metrics, &[country()], &[]).unwrap();
        let measure = &plans[0].query().unwrap().cells[0].measure;
        assert_eq!(measure.owner(), "aov");
        let rendered = measure.render(SqlDialect::DuckDb);
        assert_eq!(
            rendered,
            "(CAST(SUM(CASE WHEN (\"country\" = 'US') THEN \"amount\" END) AS DOUBLE) / NULLIF(COUNT(CASE WHEN (\"country\" = 'US') THEN 1 END), 0))"
        );
    }
}
