//! `MetricEngine`: the public compute entry point.
//!
//! Build → Compile → Plan → Execute → Assemble → Return. Nothing persists
//! between calls besides the registry handed in at construction.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::info;

use metriq_connectors::{ConnectionsConfig, ConnectorFactory, ConnectorRegistry};
use metriq_core::config::EngineConfig;
use metriq_core::report::{ComputeReport, PlanFingerprint};
use metriq_core::result::{PlanFailure, ResultTable};
use metriq_core::spec::{MetricSpec, Period, SegmentSpec, SliceSpec, TimeWindow};
use metriq_planner::{sources, QueryPlan, QueryPlanner};

use crate::error::Result;
use crate::executor::{ExecutionOutput, Executor};

/// Everything one compute call needs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComputeRequest {
    pub metrics: Vec<MetricSpec>,
    pub slices: Vec<SliceSpec>,
    pub segments: Vec<SegmentSpec>,
    pub time_window: Option<TimeWindow>,
    /// Overrides `EngineConfig::default_deadline_ms` for this call.
    pub deadline: Option<Duration>,
}

impl ComputeRequest {
    pub fn new(metrics: Vec<MetricSpec>) -> Self {
        Self {
            metrics,
            ..Self::default()
        }
    }

    pub fn with_slices(mut self, slices: Vec<SliceSpec>) -> Self {
        self.slices = slices;
        self
    }

    pub fn with_segments(mut self, segments: Vec<SegmentSpec>) -> Self {
        self.segments = segments;
        self
    }

    pub fn with_time_window(mut self, window: TimeWindow) -> Self {
        self.time_window = Some(window);
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

#[derive(Debug, Clone)]
pub struct ComputeOutput {
    pub table: ResultTable,
    /// One entry per source that produced no rows.
    pub failures: Vec<PlanFailure>,
    pub report: ComputeReport,
}

#[derive(Debug, Clone)]
pub struct MetricEngine {
    planner: QueryPlanner,
    executor: Executor,
    config: EngineConfig,
}

impl MetricEngine {
    pub fn new(registry: ConnectorRegistry, config: EngineConfig) -> Self {
        let executor = Executor::new(registry, config.max_parallel_tasks);
        Self {
            planner: QueryPlanner::new(),
            executor,
            config,
        }
    }

    /// Build the registry from `config.connections_path` (empty when unset).
    pub fn from_config(config: EngineConfig, factory: &dyn ConnectorFactory) -> Result<Self> {
        let registry = match &config.connections_path {
            Some(path) => ConnectionsConfig::from_path(path)?.into_registry(factory)?,
            None => ConnectorRegistry::new(),
        };
        Ok(Self::new(registry, config))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &ConnectorRegistry {
        self.executor.registry()
    }

    /// Validate and plan without touching backends beyond table resolution.
    pub async fn plan(&self, request: &ComputeRequest) -> Result<Vec<QueryPlan>> {
        self.plan_until(request, None).await
    }

    /// Structural checks run before any backend is contacted; table lookups
    /// still pending at `deadline` leave their source unresolved.
    async fn plan_until(&self, request: &ComputeRequest, deadline: Option<Instant>) -> Result<Vec<QueryPlan>> {
        let window = request.time_window.as_ref();
        self.planner
            .validate(&request.metrics, &request.slices, &request.segments, window)?;
        let tables = self
            .registry()
            .resolve_all(&sources(&request.metrics), deadline)
            .await;
        let plans = self.planner.build_plans(
            &request.metrics,
            &request.slices,
            &request.segments,
            window,
            &tables,
        )?;
        Ok(plans)
    }

    pub async fn compute(&self, request: &ComputeRequest) -> Result<ComputeOutput> {
        let mut report = ComputeReport::new(now_ms());
        let deadline = request
            .deadline
            .or_else(|| self.config.default_deadline())
            .map(|d| Instant::now() + d);
        let plans = self.plan_until(request, deadline).await?;
        report.plans = plans
            .iter()
            .map(fingerprint)
            .collect::<metriq_core::error::Result<_>>()?;

        let period = Period::from(request.time_window.as_ref());
        let ExecutionOutput { table, failures } = self.executor.execute(plans, period, deadline).await?;

        let report = report.finish(now_ms(), table.len(), failures.len());
        info!(
            run = %report.id,
            rows = report.rows,
            failures = report.failures,
            elapsed_ms = report.elapsed_ms(),
            "compute finished"
        );
        Ok(ComputeOutput {
            table,
            failures,
            report,
        })
    }

    /// Close every registered connector.
    pub async fn close(&self) -> Result<()> {
        self.registry().close_all().await?;
        Ok(())
    }
}

fn fingerprint(plan: &QueryPlan) -> metriq_core::error::Result<PlanFingerprint> {
    Ok(PlanFingerprint {
        source: plan.source.clone(),
        query_hash: plan.query().map(|q| q.fingerprint()).transpose()?,
        cells: plan.expected_rows,
    })
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use metriq_core::spec::AggregationKind;

    #[test]
    fn request_deserializes_with_defaults() {
        let request: ComputeRequest = serde_json::from_str(
            r#"{
                "metrics": [{
                    "name": "ctr",
                    "source": "duckdb://analytics.db/events",
                    "aggregation": "ratio",
                    "numerator": "clicks",
                    "denominator": "impressions",
                    "timestamp_col": null
                }],
                "time_window": {"period_type": "weekly", "start": "2024-01-01", "end": "2024-01-07"}
            }"#,
        )
        .unwrap();
        assert_eq!(request.metrics[0].aggregation, AggregationKind::Ratio);
        assert!(request.slices.is_empty());
        assert!(request.deadline.is_none());
        let period = Period::from(request.time_window.as_ref());
        assert_eq!(period.period_type.as_str(), "weekly");
    }

    #[test]
    fn engine_without_connections_file_has_empty_registry() {
        let engine = MetricEngine::from_config(
            EngineConfig::default(),
            &metriq_connectors::BuiltinFactory,
        )
        .unwrap();
        assert!(engine.registry().is_empty());
        assert_eq!(engine.config().max_parallel_tasks, 16);
    }

    #[tokio::test]
    async fn deadline_covers_table_resolution() {
        use metriq_connectors::{Fault, MemoryConnector};
        use metriq_core::result::FailureCause;
        use metriq_core::types::{Column, RowBatch};
        use std::sync::Arc;

        let events = || RowBatch::new(vec![Column::new("amount", vec![2.0.into(), 3.0.into()])]);
        let registry = ConnectorRegistry::new()
            .with(Arc::new(MemoryConnector::new("duckdb").with_table("events", events())))
            .with(Arc::new(
                MemoryConnector::new("memory")
                    .with_table("events", events())
                    .with_fault(Fault::ResolveLatency(Duration::from_secs(30))),
            ));
        let engine = MetricEngine::new(registry, EngineConfig::default());
        let request = ComputeRequest::new(vec![
            MetricSpec::new("revenue", "duckdb://a.db/events", AggregationKind::Sum, "amount"),
            MetricSpec::new("stalled", "memory://db/events", AggregationKind::Sum, "amount"),
        ])
        .with_deadline(Duration::from_millis(150));

        let started = Instant::now();
        let out = engine.compute(&request).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        let stalled = out
            .failures
            .iter()
            .find(|f| f.source == "memory://db/events")
            .unwrap();
        assert_eq!(stalled.cause, FailureCause::DeadlineExceeded);
        assert_eq!(stalled.metrics, vec!["stalled".to_string()]);
        // Resolution used up the budget, so the fast source either answered
        // or was cut off too; either way it is accounted for once.
        assert_eq!(out.table.len() + out.failures.len(), 2);
        assert_eq!(out.report.plans.len(), 2);
    }

    #[tokio::test]
    async fn invalid_requests_never_reach_backends() {
        use metriq_connectors::{Fault, MemoryConnector};
        use std::sync::Arc;

        let registry = ConnectorRegistry::new().with(Arc::new(
            MemoryConnector::new("duckdb").with_fault(Fault::ResolveLatency(Duration::from_secs(30))),
        ));
        let engine = MetricEngine::new(registry, EngineConfig::default());
        let bad = ComputeRequest::new(vec![MetricSpec::new(
            "ctr",
            "duckdb://a.db/events",
            AggregationKind::Ratio,
            "clicks",
        )]);
        let started = Instant::now();
        let err = engine.compute(&bad).await.unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(matches!(
            err,
            crate::error::EngineError::Planning(metriq_planner::PlanningError::MissingDenominator(_))
        ));
    }

    #[tokio::test]
    async fn planning_error_is_fatal() {
        let engine = MetricEngine::new(ConnectorRegistry::new(), EngineConfig::default());
        let err = engine.compute(&ComputeRequest::default()).await.unwrap_err();
        assert!(matches!(
            err,
            crate::error::EngineError::Planning(metriq_planner::PlanningError::NoMetrics)
        ));
    }
}
