//! Orchestrator contract and composition root

use crate::core::{context::RunContext, error::RunReport, error::WorkflowError};
use crate::events::EventBus;
use crate::execution::{
    decorators::{
        EventPublishingOrchestrator, MetricsOrchestrator, RetryGuardOrchestrator, RetrySettings,
        TracingOrchestrator,
    },
    metrics::WorkflowMetrics,
    pipeline::StepPipeline,
};
use crate::resilience::MultiErrorBudget;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;

/// Input of a workflow run
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowArgs {
    /// Initial payload handed to the first step
    pub input: Value,
}

impl WorkflowArgs {
    pub fn new(input: Value) -> Self {
        Self { input }
    }
}

/// Successful outcome of a workflow run
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowResult {
    pub workflow_id: String,
    /// Accumulated payload after the last step
    pub output: Map<String, Value>,
    pub report: RunReport,
    pub duration: Duration,
}

/// Anything that can run a workflow: the step pipeline itself and every
/// decorator wrapped around it.
#[async_trait]
pub trait WorkflowOrchestrator: Send + Sync {
    /// Number of steps a run will attempt
    fn step_count(&self) -> usize;

    async fn execute(&self, ctx: &RunContext, args: WorkflowArgs) -> Result<WorkflowResult, WorkflowError>;
}

/// Shared, process-scoped collaborators of the decorator chain
#[derive(Clone)]
pub struct OrchestratorDeps {
    pub events: Arc<EventBus>,
    pub budgets: Arc<MultiErrorBudget>,
    pub metrics: Arc<WorkflowMetrics>,
    pub retry: RetrySettings,
}

/// Wrap a pipeline in the decorator chain.
///
/// Order, outer to inner: tracing, metrics, retry guard, event publishing,
/// pipeline. Tracing spans every retry, metrics see the retry count of the
/// whole run, and events are published once per run outcome. The retry guard
/// shares the bus so a run that ends during backoff still reports its outcome.
pub fn compose_orchestrator(pipeline: Arc<StepPipeline>, deps: OrchestratorDeps) -> Arc<dyn WorkflowOrchestrator> {
    let name = pipeline.name().to_string();

    let events: Arc<dyn WorkflowOrchestrator> =
        Arc::new(EventPublishingOrchestrator::new(pipeline, deps.events.clone()));
    let retry: Arc<dyn WorkflowOrchestrator> =
        Arc::new(RetryGuardOrchestrator::new(events, deps.budgets, deps.retry).with_events(deps.events));
    let metrics: Arc<dyn WorkflowOrchestrator> = Arc::new(MetricsOrchestrator::new(retry, deps.metrics));
    Arc::new(TracingOrchestrator::new(metrics, name))
}
