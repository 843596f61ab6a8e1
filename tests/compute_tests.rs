//! End-to-end compute tests over in-memory backends.

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use metriq::prelude::*;
use metriq::metriq_exec::AssemblyError;
use metriq::metriq_planner::PlanningError;

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn events() -> RowBatch {
    RowBatch::new(vec![
        Column::new("country", vec!["US".into(), "US".into(), "EU".into(), "EU".into(), "US".into()]),
        Column::new(
            "is_premium",
            vec![true.into(), false.into(), true.into(), true.into(), true.into()],
        ),
        Column::new("amount", vec![10.0.into(), 5.0.into(), 7.5.into(), 2.5.into(), 4.0.into()]),
        Column::new("clicks", vec![1i64.into(), 2i64.into(), 0i64.into(), 3i64.into(), 2i64.into()]),
        Column::new(
            "impressions",
            vec![10i64.into(), 20i64.into(), 0i64.into(), 30i64.into(), 0i64.into()],
        ),
        Column::new(
            "event_date",
            vec![
                date(2024, 1, 5).into(),
                date(2024, 1, 10).into(),
                date(2024, 2, 1).into(),
                date(2024, 1, 20).into(),
                date(2024, 3, 1).into(),
            ],
        ),
    ])
}

const EVENTS: &str = "memory://analytics/events";

fn engine_with(conn: MemoryConnector) -> (MetricEngine, Arc<MemoryConnector>) {
    let conn = Arc::new(conn);
    let registry = ConnectorRegistry::new().with(conn.clone());
    (MetricEngine::new(registry, EngineConfig::default()), conn)
}

fn engine() -> (MetricEngine, Arc<MemoryConnector>) {
    engine_with(MemoryConnector::new("memory").with_table("events", events()))
}

fn revenue() -> MetricSpec {
    MetricSpec::new("revenue", EVENTS, AggregationKind::Sum, "amount")
}

fn ctr() -> MetricSpec {
    MetricSpec::ratio("ctr", EVENTS, "clicks", "impressions")
}

fn country(values: &[&str]) -> SliceSpec {
    SliceSpec::new(
        "country",
        values
            .iter()
            .map(|v| SliceValue::new(*v, format!("country = '{v}'")))
            .collect(),
    )
}

fn premium() -> SegmentSpec {
    SegmentSpec::new("premium", "is_premium = TRUE")
}

#[tokio::test]
async fn revenue_and_ctr_by_country_for_premium() {
    let (engine, conn) = engine();
    let request = ComputeRequest::new(vec![revenue(), ctr()])
        .with_slices(vec![country(&["US", "EU"])])
        .with_segments(vec![premium()]);
    let out = engine.compute(&request).await.unwrap();

    assert!(out.failures.is_empty());
    assert_eq!(conn.query_count(), 1);
    let got: Vec<(&str, &str, Option<f64>)> = out
        .table
        .rows
        .iter()
        .map(|r| (r.metric_name.as_str(), r.slice_value.as_str(), r.metric_value))
        .collect();
    assert_eq!(
        got,
        vec![
            ("revenue", "US", Some(14.0)),
            ("revenue", "EU", Some(10.0)),
            ("ctr", "US", Some(0.3)),
            ("ctr", "EU", Some(0.1)),
        ]
    );
    for row in &out.table.rows {
        assert_eq!(row.slice_type, "country");
        assert_eq!(row.segment_name, "premium");
        assert_eq!(row.period_type, "all_time");
        assert_eq!(row.period_start_date, None);
        assert_eq!(row.period_end_date, None);
    }
}

#[tokio::test]
async fn no_slices_and_no_segments_use_sentinels() {
    let (engine, _) = engine();
    let out = engine
        .compute(&ComputeRequest::new(vec![revenue()]))
        .await
        .unwrap();
    assert_eq!(out.table.len(), 1);
    let row = &out.table.rows[0];
    assert_eq!(row.slice_type, "none");
    assert_eq!(row.slice_value, "all");
    assert_eq!(row.segment_name, "none");
    assert_eq!(row.metric_value, Some(29.0));
}

#[tokio::test]
async fn zero_or_null_denominator_gives_null() {
    let (engine, _) = engine();
    let request = ComputeRequest::new(vec![ctr()])
        .with_slices(vec![country(&["US", "APAC"])])
        .with_segments(vec![SegmentSpec::new("unseen", "impressions = 0")]);
    let out = engine.compute(&request).await.unwrap();
    // US with no impressions: 2 clicks over 0 impressions.
    assert_eq!(out.table.rows[0].metric_value, None);
    // APAC matches no rows, so both sums are NULL.
    assert_eq!(out.table.rows[1].metric_value, None);
}

#[tokio::test]
async fn row_count_is_metrics_times_combinations_times_segments() {
    let (engine, conn) = engine();
    let tier = SliceSpec::new(
        "tier",
        vec![
            SliceValue::new("premium", "is_premium"),
            SliceValue::new("free", "NOT is_premium"),
        ],
    );
    let request = ComputeRequest::new(vec![
        revenue(),
        ctr(),
        MetricSpec::new("orders", EVENTS, AggregationKind::Count, "*"),
    ])
    .with_slices(vec![country(&["US", "EU"]), tier])
    .with_segments(vec![premium(), SegmentSpec::new("big", "amount > 5")]);
    let out = engine.compute(&request).await.unwrap();

    assert_eq!(out.table.len(), 3 * 4 * 2);
    assert_eq!(conn.query_count(), 1);
    let first = &out.table.rows[0];
    assert_eq!(first.slice_type, "country|tier");
    assert_eq!(first.slice_value, "US|premium");
    assert_eq!(out.table.rows[1].slice_value, "US|free");
    assert_eq!(out.table.rows[2].slice_value, "EU|premium");
    // orders / big / US|premium: rows 1 only.
    let orders_big: Vec<_> = out
        .table
        .rows_for("orders")
        .filter(|r| r.segment_name == "big")
        .map(|r| r.metric_value)
        .collect();
    assert_eq!(orders_big, vec![Some(1.0), Some(0.0), Some(1.0), Some(0.0)]);
}

#[tokio::test]
async fn time_window_is_inclusive_and_stamped_on_rows() {
    let (engine, _) = engine();
    let window = TimeWindow::new(PeriodType::Monthly, date(2024, 1, 5), date(2024, 1, 10));
    let request = ComputeRequest::new(vec![revenue().with_timestamp_col("event_date")])
        .with_time_window(window);
    let out = engine.compute(&request).await.unwrap();
    let row = &out.table.rows[0];
    assert_eq!(row.metric_value, Some(15.0));
    assert_eq!(row.period_type, "monthly");
    assert_eq!(row.period_start_date, Some(date(2024, 1, 5)));
    assert_eq!(row.period_end_date, Some(date(2024, 1, 10)));
}

#[tokio::test]
async fn missing_connector_yields_partial_rows_and_one_failure() {
    let (engine, _) = engine();
    let request = ComputeRequest::new(vec![
        revenue(),
        MetricSpec::new("sessions", "bigquery://acme.web.sessions", AggregationKind::Count, "*"),
        MetricSpec::new("users", "bigquery://acme.web.sessions", AggregationKind::Count, "user_id"),
    ])
    .with_slices(vec![country(&["US", "EU"])]);
    let out = engine.compute(&request).await.unwrap();

    assert_eq!(out.table.len(), 2);
    assert!(out.table.rows.iter().all(|r| r.metric_name == "revenue"));
    assert_eq!(out.failures.len(), 1);
    let failure = &out.failures[0];
    assert_eq!(failure.source, "bigquery://acme.web.sessions");
    assert_eq!(failure.metrics, vec!["sessions".to_string(), "users".to_string()]);
    assert_eq!(
        failure.cause,
        FailureCause::ConnectorNotFound {
            backend: "bigquery".into()
        }
    );
    assert_eq!(out.report.plans.len(), 2);
    assert!(out.report.plans[1].query_hash.is_none());
    assert_eq!(out.report.rows, 2);
    assert_eq!(out.report.failures, 1);
}

#[tokio::test]
async fn unknown_table_is_reported_per_source() {
    let (engine, _) = engine();
    let request = ComputeRequest::new(vec![
        revenue(),
        MetricSpec::new("refunds", "memory://analytics/refunds", AggregationKind::Sum, "amount"),
    ]);
    let out = engine.compute(&request).await.unwrap();
    assert_eq!(out.table.len(), 1);
    assert!(matches!(out.failures[0].cause, FailureCause::TableResolution(_)));
}

#[tokio::test]
async fn planning_errors_stop_before_any_query() {
    let (engine, conn) = engine();
    let bad = MetricSpec::new("ctr", EVENTS, AggregationKind::Ratio, "clicks");
    let err = engine
        .compute(&ComputeRequest::new(vec![revenue(), bad]))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::Planning(PlanningError::MissingDenominator(ref m)) if m == "ctr"
    ));

    let typo = MetricSpec::new("revenue", EVENTS, AggregationKind::Sum, "amout");
    let err = engine
        .compute(&ComputeRequest::new(vec![typo]))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Planning(PlanningError::Compilation(_))));
    assert_eq!(conn.query_count(), 0);
}

#[tokio::test]
async fn request_deadline_fails_slow_sources_only() {
    let slow = Arc::new(
        MemoryConnector::new("duckdb")
            .with_table("events", events())
            .with_fault(Fault::Latency(Duration::from_secs(30))),
    );
    let fast = Arc::new(MemoryConnector::new("memory").with_table("events", events()));
    let engine = MetricEngine::new(
        ConnectorRegistry::new().with(slow).with(fast),
        EngineConfig::default(),
    );
    let request = ComputeRequest::new(vec![
        MetricSpec::new("slow_revenue", "duckdb://warehouse.db/events", AggregationKind::Sum, "amount"),
        revenue(),
    ])
    .with_deadline(Duration::from_millis(200));
    let out = engine.compute(&request).await.unwrap();
    assert_eq!(out.table.len(), 1);
    assert_eq!(out.table.rows[0].metric_name, "revenue");
    assert_eq!(out.failures[0].cause, FailureCause::DeadlineExceeded);
}

#[tokio::test]
async fn closed_connectors_report_unavailable() {
    let (engine, _) = engine();
    let request = ComputeRequest::new(vec![revenue()]);
    engine.close().await.unwrap();
    let out = engine.compute(&request).await.unwrap();
    assert!(out.table.is_empty());
    assert_eq!(out.failures.len(), 1);
}

#[tokio::test]
async fn fingerprints_are_stable_across_calls() {
    let (engine, _) = engine();
    let request = ComputeRequest::new(vec![revenue(), ctr()]).with_slices(vec![country(&["US"])]);
    let a = engine.compute(&request).await.unwrap();
    let b = engine.compute(&request).await.unwrap();
    assert_eq!(a.report.plans, b.report.plans);
    assert_ne!(a.report.id, b.report.id);
    assert_eq!(a.table, b.table);
}

#[tokio::test]
async fn output_table_converts_to_batch_and_csv() {
    let (engine, _) = engine();
    let out = engine
        .compute(&ComputeRequest::new(vec![revenue()]).with_slices(vec![country(&["US", "EU"])]))
        .await
        .unwrap();

    let mut csv = Vec::new();
    out.table.write_csv(&mut csv).unwrap();
    let text = String::from_utf8(csv).unwrap();
    let mut lines = text.lines();
    assert_eq!(
        lines.next(),
        Some("period_type,period_start_date,period_end_date,metric_name,slice_type,slice_value,segment_name,metric_value")
    );
    assert_eq!(lines.next(), Some("all_time,,,revenue,country,US,none,19"));

    let batch = out.table.into_row_batch();
    assert_eq!(batch.column_names(), OUTPUT_COLUMNS.to_vec());
    assert_eq!(batch.num_rows(), 2);
}

#[test]
fn assembly_errors_are_distinct_from_plan_failures() {
    // Backend answers that contradict the plan are fatal, not per-source.
    let err: EngineError = AssemblyError::NotReady {
        plan: PlanId::new(0),
        locator: EVENTS.into(),
    }
    .into();
    assert!(matches!(err, EngineError::Assembly(_)));
}
