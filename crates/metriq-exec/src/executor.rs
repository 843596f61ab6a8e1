//! Concurrent dispatch of query plans.
//!
//! One task per dispatchable plan, at most `max_parallel_tasks` in flight.
//! Each task checks connector health and then issues exactly one
//! `run_query`. Completions travel over one channel to a single collector,
//! which is the only place results are merged. No retries.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use metriq_connectors::{Connector, ConnectorError, ConnectorRegistry};
use metriq_core::result::{FailureCause, PlanFailure, ResultTable};
use metriq_core::spec::Period;
use metriq_core::types::RowBatch;
use metriq_planner::{PlanState, QueryPlan};

use crate::assemble::OutputAssembler;
use crate::error::AssemblyError;

type PlanResult = Result<RowBatch, FailureCause>;

/// What happened to one plan.
#[derive(Debug)]
pub struct PlanOutcome {
    pub plan: Arc<QueryPlan>,
    pub result: PlanResult,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionOutput {
    pub table: ResultTable,
    pub failures: Vec<PlanFailure>,
}

#[derive(Debug, Clone)]
pub struct Executor {
    registry: ConnectorRegistry,
    max_parallel_tasks: usize,
}

impl Executor {
    pub fn new(registry: ConnectorRegistry, max_parallel_tasks: usize) -> Self {
        Self {
            registry,
            max_parallel_tasks: max_parallel_tasks.max(1),
        }
    }

    pub fn registry(&self) -> &ConnectorRegistry {
        &self.registry
    }

    /// Run every plan and return one outcome per plan, in submission order.
    ///
    /// Plans still outstanding at `deadline` are aborted and reported as
    /// `DeadlineExceeded`.
    pub async fn dispatch(&self, plans: Vec<QueryPlan>, deadline: Option<Instant>) -> Vec<PlanOutcome> {
        let plans: Vec<Arc<QueryPlan>> = plans.into_iter().map(Arc::new).collect();
        let mut results: Vec<Option<(PlanResult, Duration)>> = (0..plans.len()).map(|_| None).collect();
        let semaphore = Arc::new(Semaphore::new(self.max_parallel_tasks));
        let (tx, mut rx) = mpsc::unbounded_channel::<(usize, PlanResult, Duration)>();
        let mut in_flight: HashMap<usize, AbortHandle> = HashMap::new();

        for (slot, plan) in plans.iter().enumerate() {
            let connector = match &plan.state {
                PlanState::Unresolved(cause) => {
                    results[slot] = Some((Err(cause.clone()), Duration::ZERO));
                    continue;
                }
                PlanState::Ready(_) => match self.registry.connector_for(&plan.source) {
                    Ok((connector, _)) => connector,
                    Err(e) => {
                        results[slot] = Some((Err(e.into_failure()), Duration::ZERO));
                        continue;
                    }
                },
            };

            let started = Instant::now();
            let task = tokio::spawn(run_plan(connector, Arc::clone(plan), Arc::clone(&semaphore)));
            in_flight.insert(slot, task.abort_handle());
            let tx = tx.clone();
            tokio::spawn(async move {
                let result = match task.await {
                    Ok(result) => result,
                    Err(e) if e.is_panic() => Err(FailureCause::TaskPanicked(panic_message(e.into_panic()))),
                    Err(_) => Err(FailureCause::DeadlineExceeded),
                };
                // The collector may already have given up on this plan.
                let _ = tx.send((slot, result, started.elapsed()));
            });
        }
        drop(tx);
        debug!(tasks = in_flight.len(), skipped = plans.len() - in_flight.len(), "plans dispatched");

        while !in_flight.is_empty() {
            let next = match deadline {
                Some(at) => match tokio::time::timeout_at(at, rx.recv()).await {
                    Ok(next) => next,
                    Err(_) => {
                        warn!(outstanding = in_flight.len(), "deadline reached, aborting outstanding plans");
                        break;
                    }
                },
                None => rx.recv().await,
            };
            let Some((slot, result, elapsed)) = next else {
                break;
            };
            in_flight.remove(&slot);
            results[slot] = Some((result, elapsed));
        }
        for (slot, handle) in in_flight {
            handle.abort();
            results[slot] = Some((Err(FailureCause::DeadlineExceeded), Duration::ZERO));
        }

        plans
            .into_iter()
            .zip(results)
            .map(|(plan, result)| {
                let (result, elapsed) =
                    result.unwrap_or((Err(FailureCause::DeadlineExceeded), Duration::ZERO));
                trace!(
                    source = %plan.source,
                    ok = result.is_ok(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "plan finished"
                );
                PlanOutcome { plan, result, elapsed }
            })
            .collect()
    }

    /// Dispatch, then assemble the successful plans and collect failures.
    pub async fn execute(
        &self,
        plans: Vec<QueryPlan>,
        period: Period,
        deadline: Option<Instant>,
    ) -> Result<ExecutionOutput, AssemblyError> {
        let outcomes = self.dispatch(plans, deadline).await;
        let mut answered = Vec::with_capacity(outcomes.len());
        let mut failures = Vec::new();
        for outcome in outcomes {
            match outcome.result {
                Ok(batch) => answered.push((outcome.plan, batch)),
                Err(cause) => {
                    warn!(source = %outcome.plan.source, cause = %cause, "plan failed");
                    failures.push(PlanFailure::new(
                        outcome.plan.source.clone(),
                        outcome.plan.metrics.clone(),
                        cause,
                    ));
                }
            }
        }
        let table = OutputAssembler::new(period).assemble(answered)?;
        info!(rows = table.len(), failures = failures.len(), "execution finished");
        Ok(ExecutionOutput { table, failures })
    }
}

async fn run_plan(
    connector: Arc<dyn Connector>,
    plan: Arc<QueryPlan>,
    semaphore: Arc<Semaphore>,
) -> PlanResult {
    let _permit = semaphore
        .acquire_owned()
        .await
        .map_err(|e| FailureCause::Query(e.to_string()))?;
    let query = match &plan.state {
        PlanState::Ready(query) => query,
        PlanState::Unresolved(cause) => return Err(cause.clone()),
    };
    if !connector.is_available().await {
        return Err(FailureCause::Unavailable {
            backend: connector.backend_type().to_string(),
        });
    }
    debug!(source = %plan.source, cells = query.cells.len(), "running plan");
    connector
        .run_query(query)
        .await
        .map_err(ConnectorError::into_failure)
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
