use criterion::{criterion_group, criterion_main, Criterion};
use metriq_core::result::FailureCause;
use metriq_core::schema::{DataType, Field, Schema};
use metriq_core::spec::{AggregationKind, MetricSpec, SegmentSpec, SliceSpec, SliceValue};
use metriq_core::types::{Column, RowBatch, Scalar};
use metriq_expr::eval::eval_measure;
use metriq_expr::{SqlDialect, TableHandle};
use metriq_planner::{expand, QueryPlanner};

const SOURCE: &str = "duckdb://warehouse.db/events";

fn schema() -> Schema {
    Schema::new(vec![
        Field::new("country", DataType::Utf8, false),
        Field::new("device", DataType::Utf8, false),
        Field::new("amount", DataType::Float64, true),
        Field::new("clicks", DataType::Int64, false),
        Field::new("impressions", DataType::Int64, false),
    ])
}

fn make_batch(rows: usize) -> RowBatch {
    let countries = ["US", "EU", "APAC", "LATAM"];
    let devices = ["ios", "android", "web"];
    let mut country = Vec::with_capacity(rows);
    let mut device = Vec::with_capacity(rows);
    let mut amount = Vec::with_capacity(rows);
    let mut clicks = Vec::with_capacity(rows);
    let mut impressions = Vec::with_capacity(rows);
    for i in 0..rows {
        country.push(Scalar::Str(countries[i % countries.len()].to_string()));
        device.push(Scalar::Str(devices[i % devices.len()].to_string()));
        amount.push(Scalar::F64((i % 100) as f64 * 1.5));
        clicks.push(Scalar::I64((i % 7) as i64));
        impressions.push(Scalar::I64((i % 50) as i64));
    }
    RowBatch::new(vec![
        Column::new("country", country),
        Column::new("device", device),
        Column::new("amount", amount),
        Column::new("clicks", clicks),
        Column::new("impressions", impressions),
    ])
}

fn request() -> (Vec<MetricSpec>, Vec<SliceSpec>, Vec<SegmentSpec>) {
    let metrics = vec![
        MetricSpec::new("revenue", SOURCE, AggregationKind::Sum, "amount"),
        MetricSpec::new("orders", SOURCE, AggregationKind::Count, "*"),
        MetricSpec::new("aov", SOURCE, AggregationKind::Avg, "amount"),
        MetricSpec::ratio("ctr", SOURCE, "clicks", "impressions"),
    ];
    let slices = vec![
        SliceSpec::new(
            "country",
            ["US", "EU", "APAC", "LATAM"]
                .iter()
                .map(|c| SliceValue::new(*c, format!("country = '{c}'")))
                .collect(),
        ),
        SliceSpec::new(
            "device",
            ["ios", "android", "web"]
                .iter()
                .map(|d| SliceValue::new(*d, format!("device = '{d}'")))
                .collect(),
        ),
    ];
    let segments = vec![
        SegmentSpec::new("high_value", "amount > 100"),
        SegmentSpec::new("engaged", "clicks >= 3"),
    ];
    (metrics, slices, segments)
}

fn bench_planning(c: &mut Criterion) {
    let (metrics, slices, segments) = request();
    let resolver = |s: &str| -> Result<TableHandle, FailureCause> {
        Ok(TableHandle::new(s, "events", SqlDialect::DuckDb, schema()))
    };
    let planner = QueryPlanner::new();

    c.bench_function("expand_slices", |b| b.iter(|| expand(&slices)));

    c.bench_function("build_plans_96_cells", |b| {
        b.iter(|| {
            planner
                .build_plans(&metrics, &slices, &segments, None, &resolver)
                .unwrap()
        })
    });

    let plans = planner
        .build_plans(&metrics, &slices, &segments, None, &resolver)
        .unwrap();
    let query = plans[0].query().unwrap();

    c.bench_function("render_sql_96_cells", |b| b.iter(|| query.render_sql()));

    let batch = make_batch(4096);
    c.bench_function("eval_96_cells_4096_rows", |b| {
        b.iter(|| {
            for cell in &query.cells {
                eval_measure(&cell.measure, &batch).unwrap();
            }
        })
    });
}

criterion_group!(benches, bench_planning);
criterion_main!(benches);
