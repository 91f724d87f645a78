//! Simulated saga steps
//!
//! Stand-ins for the real build, scan, push and deploy steps. They sleep for
//! a configured time, fail a configured number of times and record undo data,
//! which is enough to drive the orchestrator end to end from the CLI and from
//! tests.

use crate::core::{
    config::{ScanConfig, StepConfig},
    context::RunContext,
    state::WorkflowState,
    step::{SagaStep, StepError},
};
use crate::events::{DomainEvent, EventBus, EventKind};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Configurable step that performs no real work
pub struct SimulatedStep {
    name: String,
    delay: Duration,
    compensatable: bool,
    fail_times: u32,
    error: String,
    retryable: bool,
    fail_compensation: bool,
    output: Map<String, Value>,
    scan: Option<ScanConfig>,
    events: Option<Arc<EventBus>>,
    executions: AtomicU32,
    compensations: AtomicU32,
}

impl SimulatedStep {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            error: format!("{} failed", name),
            name,
            delay: Duration::ZERO,
            compensatable: true,
            fail_times: 0,
            retryable: true,
            fail_compensation: false,
            output: Map::new(),
            scan: None,
            events: None,
            executions: AtomicU32::new(0),
            compensations: AtomicU32::new(0),
        }
    }

    pub fn from_config(config: &StepConfig) -> Self {
        let mut step = Self::new(&config.name).with_delay(Duration::from_millis(config.delay_ms));
        step.compensatable = config.compensatable;
        step.fail_times = config.fail_times;
        step.retryable = config.retryable;
        step.fail_compensation = config.fail_compensation;
        step.output = config.output.clone();
        step.scan = config.scan.clone();
        if let Some(error) = &config.error {
            step.error = error.clone();
        }
        step
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fail the first `times` executions with `message`
    pub fn failing(mut self, times: u32, message: impl Into<String>) -> Self {
        self.fail_times = times;
        self.error = message.into();
        self
    }

    /// Injected failures are not retryable
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

    pub fn with_output(mut self, key: impl Into<String>, value: Value) -> Self {
        self.output.insert(key.into(), value);
        self
    }

    pub fn with_scan(mut self, scan: ScanConfig) -> Self {
        self.scan = Some(scan);
        self
    }

    /// Publish scan results on this bus
    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    /// How many times `execute` was called
    pub fn executions(&self) -> u32 {
        self.executions.load(Ordering::SeqCst)
    }

    /// How many times `compensate` was called
    pub fn compensations(&self) -> u32 {
        self.compensations.load(Ordering::SeqCst)
    }

    async fn report_scan(&self, ctx: &RunContext, scan: &ScanConfig) {
        let Some(events) = &self.events else {
            return;
        };
        let event = DomainEvent::new(
            ctx.workflow_id(),
            EventKind::SecurityScanCompleted {
                image_ref: scan.image_ref.clone(),
                scanner: scan.scanner.clone(),
                critical: scan.critical,
                high: scan.high,
                medium: scan.medium,
                low: scan.low,
            },
        );
        events.publish(ctx, &event).await;
    }
}

#[async_trait]
impl SagaStep for SimulatedStep {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, ctx: &RunContext, state: &mut WorkflowState) -> Result<(), StepError> {
        let execution = self.executions.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(step = %self.name, execution, "Simulating step");

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        if execution <= self.fail_times {
            let err = if self.retryable {
                StepError::retryable(self.error.clone())
            } else {
                StepError::permanent(self.error.clone())
            };
            return Err(err
                .with_context("execution", execution.to_string())
                .with_context("attempt", ctx.attempt().to_string()));
        }

        let run_id = state.run_id.to_string();
        state.set_undo_data(json!({
            "step": self.name,
            "execution": execution,
            "run_id": run_id,
        }));
        for (key, value) in &self.output {
            state.set_output(key.clone(), value.clone());
        }

        if let Some(scan) = &self.scan {
            info!(
                step = %self.name,
                image = %scan.image_ref,
                critical = scan.critical,
                high = scan.high,
                "Security scan completed"
            );
            state.set_output(
                "scan",
                json!({
                    "image_ref": scan.image_ref,
                    "critical": scan.critical,
                    "high": scan.high,
                    "medium": scan.medium,
                    "low": scan.low,
                }),
            );
            self.report_scan(ctx, scan).await;
        }

        Ok(())
    }

    async fn compensate(&self, _ctx: &RunContext, state: &mut WorkflowState) -> Result<(), StepError> {
        self.compensations.fetch_add(1, Ordering::SeqCst);
        let undo = state.undo_data(&self.name).cloned().unwrap_or(Value::Null);
        debug!(step = %self.name, undo = %undo, "Rolling back simulated step");

        if self.fail_compensation {
            return Err(StepError::permanent(format!("rollback of {} failed", self.name)));
        }
        Ok(())
    }

    fn is_compensatable(&self) -> bool {
        self.compensatable
    }
}
