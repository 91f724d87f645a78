//! Cross-cutting layers wrapped around the step pipeline

use crate::core::{
    context::RunContext,
    error::{Escalation, RunReport, WorkflowError},
};
use crate::events::{DomainEvent, EventBus, EventKind};
use crate::execution::{
    metrics::WorkflowMetrics,
    orchestrator::{WorkflowArgs, WorkflowOrchestrator, WorkflowResult},
};
use crate::resilience::{
    retry_with_budget_classified, Backoff, ErrorBudgetGuard, MultiErrorBudget, RetryDecision, RetryError,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Budget and backoff used by [`RetryGuardOrchestrator`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrySettings {
    /// Name of the error budget in the shared registry
    pub budget_name: String,
    pub max_errors: u32,
    pub window: Duration,
    pub backoff: Backoff,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            budget_name: "workflow".to_string(),
            max_errors: 5,
            window: Duration::from_secs(300),
            backoff: Backoff::default(),
        }
    }
}

/// Opens a `workflow` span around the run and logs its outcome
pub struct TracingOrchestrator {
    next: Arc<dyn WorkflowOrchestrator>,
    name: String,
}

impl TracingOrchestrator {
    pub fn new(next: Arc<dyn WorkflowOrchestrator>, name: impl Into<String>) -> Self {
        Self {
            next,
            name: name.into(),
        }
    }
}

#[async_trait]
impl WorkflowOrchestrator for TracingOrchestrator {
    fn step_count(&self) -> usize {
        self.next.step_count()
    }

    async fn execute(&self, ctx: &RunContext, args: WorkflowArgs) -> Result<WorkflowResult, WorkflowError> {
        let span = info_span!(
            "workflow",
            pipeline = %self.name,
            workflow_id = ctx.workflow_id(),
            trace_id = ctx.trace_id()
        );

        async {
            let started = Instant::now();
            info!(steps = self.next.step_count(), "Workflow started");

            let result = self.next.execute(ctx, args).await;
            let duration_ms = started.elapsed().as_millis() as u64;
            match &result {
                Ok(res) => info!(duration_ms, attempts = res.report.attempts, "Workflow completed"),
                Err(e) => error!(duration_ms, error = %e, "Workflow failed"),
            }
            result
        }
        .instrument(span)
        .await
    }
}

/// Feeds run outcomes into the shared [`WorkflowMetrics`]
pub struct MetricsOrchestrator {
    next: Arc<dyn WorkflowOrchestrator>,
    metrics: Arc<WorkflowMetrics>,
}

impl MetricsOrchestrator {
    pub fn new(next: Arc<dyn WorkflowOrchestrator>, metrics: Arc<WorkflowMetrics>) -> Self {
        Self { next, metrics }
    }
}

#[async_trait]
impl WorkflowOrchestrator for MetricsOrchestrator {
    fn step_count(&self) -> usize {
        self.next.step_count()
    }

    async fn execute(&self, ctx: &RunContext, args: WorkflowArgs) -> Result<WorkflowResult, WorkflowError> {
        let started = Instant::now();
        let result = self.next.execute(ctx, args).await;
        let duration = started.elapsed();

        match &result {
            Ok(res) => self.metrics.record_run(
                true,
                res.report.attempts,
                res.report.compensated_count(),
                false,
                duration,
            ),
            Err(err) => {
                let report = err.report();
                self.metrics.record_run(
                    false,
                    report.map(|r| r.attempts).unwrap_or_else(|| ctx.attempt()),
                    report.map(RunReport::compensated_count).unwrap_or(0),
                    err.escalation().is_some(),
                    duration,
                );
            }
        }
        result
    }
}

/// Whether the retry guard would run another attempt after `err`, budget permitting
fn wants_retry(ctx: &RunContext, err: &WorkflowError) -> bool {
    err.is_retryable()
        && !err
            .failed_step()
            .map(|step| ctx.tracker().should_escalate(step))
            .unwrap_or(false)
}

/// Re-runs the whole workflow on retryable step failures while the error
/// budget allows it.
///
/// Each attempt gets fresh workflow state; the run context (and with it the
/// error tracker) is shared by all attempts. Only step failures are charged
/// to the budget. Before each attempt the guard marks on the context whether
/// a failure would be the last one, so the event layer below knows when an
/// outcome is terminal.
pub struct RetryGuardOrchestrator {
    next: Arc<dyn WorkflowOrchestrator>,
    budgets: Arc<MultiErrorBudget>,
    settings: RetrySettings,
    events: Option<Arc<EventBus>>,
}

impl RetryGuardOrchestrator {
    pub fn new(next: Arc<dyn WorkflowOrchestrator>, budgets: Arc<MultiErrorBudget>, settings: RetrySettings) -> Self {
        Self {
            next,
            budgets,
            settings,
            events: None,
        }
    }

    /// Publish the outcome of runs that end between attempts, e.g. when the
    /// context is cancelled during backoff
    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    fn attach_escalation(ctx: &RunContext, err: &mut WorkflowError) {
        let Some(step) = err.failed_step().map(str::to_string) else {
            return;
        };
        let Some(reason) = ctx.tracker().escalation_reason(&step) else {
            return;
        };

        warn!(step = %step, reason = %reason, "Escalating step failure");
        if let Some(report) = err.report_mut() {
            report.escalation = Some(Escalation { step, reason });
        }
    }
}

#[async_trait]
impl WorkflowOrchestrator for RetryGuardOrchestrator {
    fn step_count(&self) -> usize {
        self.next.step_count()
    }

    async fn execute(&self, ctx: &RunContext, args: WorkflowArgs) -> Result<WorkflowResult, WorkflowError> {
        let budget = self.budgets.get_or_create(
            &self.settings.budget_name,
            self.settings.max_errors,
            self.settings.window,
        );

        let classify = |err: &WorkflowError| match err {
            WorkflowError::StepFailed { .. } if wants_retry(ctx, err) => RetryDecision::Retry,
            WorkflowError::StepFailed { .. } => RetryDecision::Abort,
            _ => RetryDecision::PassThrough,
        };

        let next = &self.next;
        let args = &args;
        let gate: &ErrorBudgetGuard = &budget;
        let result = retry_with_budget_classified(ctx, gate, self.settings.backoff, classify, || async move {
            let attempt = ctx.begin_attempt();
            ctx.set_final_attempt(gate.next_error_exhausts());
            debug!(attempt, final_attempt = ctx.is_final_attempt(), "Starting workflow attempt");
            next.execute(ctx, args.clone()).await
        })
        .await;

        let err = match result {
            Ok(res) => return Ok(res),
            Err(RetryError::BudgetExceeded {
                budget,
                attempts,
                last_error,
            }) => {
                let mut last_error = last_error;
                Self::attach_escalation(ctx, &mut last_error);
                WorkflowError::BudgetExceeded {
                    budget,
                    attempts,
                    last_error: Box::new(last_error),
                }
            }
            Err(RetryError::Aborted { mut error, .. }) => {
                Self::attach_escalation(ctx, &mut error);
                error
            }
            Err(RetryError::Interrupted {
                cause, last_error, ..
            }) => WorkflowError::interrupted(cause, last_error),
        };

        if let Some(events) = &self.events {
            if !ctx.outcome_published() {
                publish_outcome(events, ctx, self.next.step_count(), Err(&err)).await;
            }
        }
        Err(err)
    }
}

async fn publish(bus: &EventBus, ctx: &RunContext, kind: EventKind) {
    let event = DomainEvent::new(ctx.workflow_id(), kind);
    bus.publish(ctx, &event).await;
}

async fn publish_steps(bus: &EventBus, ctx: &RunContext, report: &RunReport) {
    for (index, step) in report.steps.iter().enumerate().filter(|(_, s)| s.attempted) {
        publish(
            bus,
            ctx,
            EventKind::WorkflowStepCompleted {
                step_name: step.name.clone(),
                step_index: index,
                success: step.succeeded,
                duration_ms: step.duration_ms,
                error: step.error.clone(),
            },
        )
        .await;
    }
}

async fn publish_failure(bus: &EventBus, ctx: &RunContext, err: &WorkflowError) {
    let Some(report) = err.report() else {
        return;
    };
    publish_steps(bus, ctx, report).await;

    let Some(failed_step) = err.failed_step() else {
        return;
    };

    let compensated_steps: Vec<String> = report
        .steps
        .iter()
        .rev()
        .filter(|s| s.compensated)
        .map(|s| s.name.clone())
        .collect();
    let compensation_failures: Vec<String> = err
        .compensation_failures()
        .iter()
        .map(|f| f.to_string())
        .collect();

    if !compensated_steps.is_empty() || !compensation_failures.is_empty() {
        publish(
            bus,
            ctx,
            EventKind::WorkflowCompensated {
                failed_step: failed_step.to_string(),
                compensated_steps,
                compensation_failures,
            },
        )
        .await;
    }

    if let Some(reason) = ctx.tracker().escalation_reason(failed_step) {
        publish(
            bus,
            ctx,
            EventKind::ErrorAnalysis {
                step_name: failed_step.to_string(),
                should_escalate: true,
                reason: Some(reason.to_string()),
                context: ctx.tracker().ai_context(),
            },
        )
        .await;
    }
}

/// Publish the step, rollback and completion events of a finished run, once
async fn publish_outcome(
    bus: &EventBus,
    ctx: &RunContext,
    total_steps: usize,
    outcome: Result<&WorkflowResult, &WorkflowError>,
) {
    ctx.mark_outcome_published();
    let duration_ms = ctx.elapsed().as_millis() as u64;

    let completed = match outcome {
        Ok(res) => {
            publish_steps(bus, ctx, &res.report).await;
            EventKind::WorkflowCompleted {
                success: true,
                duration_ms,
                steps_succeeded: res.report.succeeded_count(),
                total_steps,
                error: None,
            }
        }
        Err(err) => {
            publish_failure(bus, ctx, err).await;
            EventKind::WorkflowCompleted {
                success: false,
                duration_ms,
                steps_succeeded: err.report().map(RunReport::succeeded_count).unwrap_or(0),
                total_steps,
                error: Some(err.to_string()),
            }
        }
    };
    publish(bus, ctx, completed).await;
}

/// Publishes domain events describing the run.
///
/// `WorkflowStarted` goes out with the first attempt only. Step, rollback,
/// analysis and completion events go out once, for the attempt whose outcome
/// is terminal: a success, a failure the retry guard will not retry, or any
/// failure after the run context ended.
pub struct EventPublishingOrchestrator {
    next: Arc<dyn WorkflowOrchestrator>,
    events: Arc<EventBus>,
}

impl EventPublishingOrchestrator {
    pub fn new(next: Arc<dyn WorkflowOrchestrator>, events: Arc<EventBus>) -> Self {
        Self { next, events }
    }

    fn is_terminal(ctx: &RunContext, result: &Result<WorkflowResult, WorkflowError>) -> bool {
        match result {
            Ok(_) => true,
            Err(err) => ctx.is_final_attempt() || ctx.is_done() || !wants_retry(ctx, err),
        }
    }
}

#[async_trait]
impl WorkflowOrchestrator for EventPublishingOrchestrator {
    fn step_count(&self) -> usize {
        self.next.step_count()
    }

    async fn execute(&self, ctx: &RunContext, args: WorkflowArgs) -> Result<WorkflowResult, WorkflowError> {
        let total_steps = self.next.step_count();
        let attempt = ctx.effective_attempt();

        if attempt == 1 {
            publish(&self.events, ctx, EventKind::WorkflowStarted { total_steps, attempt }).await;
        }

        let result = self.next.execute(ctx, args).await;

        if Self::is_terminal(ctx, &result) {
            publish_outcome(&self.events, ctx, total_steps, result.as_ref()).await;
        } else {
            debug!(attempt, "Attempt failed with a retry pending, outcome not published");
        }

        result
    }
}
