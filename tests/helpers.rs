//! Test utility functions for deployflow
#![allow(dead_code)]

use deployflow::core::{RunContext, RunReport, SagaStep, StepError, StepStatus, WorkflowState};
use deployflow::events::{DomainEvent, EventBus, EventType};
use deployflow::execution::{
    compose_orchestrator, OrchestratorDeps, RetrySettings, StepPipeline, WorkflowMetrics, WorkflowOrchestrator,
};
use deployflow::resilience::{Backoff, MultiErrorBudget};

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Shared log of step calls, e.g. `["execute:build", "compensate:build"]`
pub type Journal = Arc<Mutex<Vec<String>>>;

pub fn journal() -> Journal {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn entries(journal: &Journal) -> Vec<String> {
    journal.lock().unwrap().clone()
}

/// Step that records every execute and compensate call in a journal
pub struct JournalStep {
    name: String,
    journal: Journal,
    fail_times: u32,
    error: String,
    retryable: bool,
    compensatable: bool,
    fail_compensation: bool,
    cancel_on_compensate: bool,
    hang: bool,
    executions: AtomicU32,
}

impl JournalStep {
    pub fn new(name: &str, journal: &Journal) -> Self {
        Self {
            name: name.to_string(),
            journal: journal.clone(),
            fail_times: 0,
            error: format!("{} failed", name),
            retryable: true,
            compensatable: true,
            fail_compensation: false,
            cancel_on_compensate: false,
            hang: false,
            executions: AtomicU32::new(0),
        }
    }

    /// Fail the first `times` executions
    pub fn failing(mut self, times: u32) -> Self {
        self.fail_times = times;
        self
    }

    /// Fail every execution
    pub fn always_failing(self) -> Self {
        self.failing(u32::MAX)
    }

    pub fn with_error(mut self, message: &str) -> Self {
        self.error = message.to_string();
        self
    }

    pub fn permanent(mut self) -> Self {
        self.retryable = false;
        self
    }

    pub fn not_compensatable(mut self) -> Self {
        self.compensatable = false;
        self
    }

    pub fn failing_compensation(mut self) -> Self {
        self.fail_compensation = true;
        self
    }

    /// Cancel the run context from inside compensate, e.g. a user hitting Ctrl-C mid-rollback
    pub fn cancelling_compensation(mut self) -> Self {
        self.cancel_on_compensate = true;
        self
    }

    /// Never finish executing
    pub fn hanging(mut self) -> Self {
        self.hang = true;
        self
    }

    pub fn executions(&self) -> u32 {
        self.executions.load(Ordering::SeqCst)
    }

    fn record(&self, action: &str) {
        self.journal.lock().unwrap().push(format!("{}:{}", action, self.name));
    }
}

#[async_trait]
impl SagaStep for JournalStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, _ctx: &RunContext, state: &mut WorkflowState) -> Result<(), StepError> {
        let execution = self.executions.fetch_add(1, Ordering::SeqCst) + 1;
        self.record("execute");

        if self.hang {
            std::future::pending::<()>().await;
        }

        if execution <= self.fail_times {
            return Err(if self.retryable {
                StepError::retryable(self.error.clone())
            } else {
                StepError::permanent(self.error.clone())
            });
        }

        state.set_undo_data(serde_json::json!({ "step": self.name }));
        Ok(())
    }

    async fn compensate(&self, ctx: &RunContext, state: &mut WorkflowState) -> Result<(), StepError> {
        self.record("compensate");
        if self.cancel_on_compensate {
            ctx.cancel();
        }
        assert!(
            state.undo_data(&self.name).is_some(),
            "compensating {} without undo data",
            self.name
        );
        if self.fail_compensation {
            return Err(StepError::permanent(format!("cannot undo {}", self.name)));
        }
        Ok(())
    }

    fn is_compensatable(&self) -> bool {
        self.compensatable
    }
}

/// Build a pipeline from steps in order
pub fn pipeline_of(name: &str, steps: Vec<Arc<JournalStep>>) -> StepPipeline {
    steps
        .into_iter()
        .fold(StepPipeline::new(name), |pipeline, step| pipeline.with_step(step))
}

/// Retry settings with millisecond backoff
pub fn fast_retry(max_errors: u32) -> RetrySettings {
    RetrySettings {
        budget_name: "workflow".to_string(),
        max_errors,
        window: Duration::from_secs(300),
        backoff: Backoff::new(Duration::from_millis(1), Duration::from_millis(5)),
    }
}

/// Event bus that keeps every published event
pub fn collecting_bus() -> (Arc<EventBus>, Arc<Mutex<Vec<DomainEvent>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let mut bus = EventBus::new();
    bus.subscribe_fn(None, "collector", move |event| {
        sink.lock().unwrap().push(event.clone());
        Ok(())
    });
    (Arc::new(bus), seen)
}

pub fn event_types(events: &Arc<Mutex<Vec<DomainEvent>>>) -> Vec<EventType> {
    events.lock().unwrap().iter().map(|e| e.event_type()).collect()
}

/// Fully decorated orchestrator plus its shared collaborators
pub struct Harness {
    pub orchestrator: Arc<dyn WorkflowOrchestrator>,
    pub events: Arc<Mutex<Vec<DomainEvent>>>,
    pub budgets: Arc<MultiErrorBudget>,
    pub metrics: Arc<WorkflowMetrics>,
}

pub fn harness(pipeline: StepPipeline, retry: RetrySettings) -> Harness {
    let (bus, events) = collecting_bus();
    let budgets = Arc::new(MultiErrorBudget::new());
    let metrics = Arc::new(WorkflowMetrics::new());
    let orchestrator = compose_orchestrator(
        Arc::new(pipeline),
        OrchestratorDeps {
            events: bus,
            budgets: budgets.clone(),
            metrics: metrics.clone(),
            retry,
        },
    );
    Harness {
        orchestrator,
        events,
        budgets,
        metrics,
    }
}

/// Assert the journal matches exactly
pub fn assert_journal(journal: &Journal, expected: &[&str]) {
    let actual = entries(journal);
    assert_eq!(actual, expected, "unexpected step calls");
}

/// Assert a step ended in the given status
pub fn assert_step_status(report: &RunReport, step: &str, expected: StepStatus) {
    let found = report
        .steps
        .iter()
        .find(|s| s.name == step)
        .unwrap_or_else(|| panic!("step {} not in report", step));
    assert_eq!(found.status, expected, "status of step {}", step);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_journal_records_in_order() {
        let journal = journal();
        let step = JournalStep::new("build", &journal);
        step.record("execute");
        step.record("compensate");
        assert_journal(&journal, &["execute:build", "compensate:build"]);
    }
}
