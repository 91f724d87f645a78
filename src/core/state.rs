//! Execution state models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Overall workflow execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    /// Workflow has not started
    Pending,
    /// Workflow is currently running
    Running,
    /// Every step succeeded
    Completed,
    /// A step failed (rollback may have run)
    Failed,
    /// The caller cancelled the run or its deadline passed
    Cancelled,
}

/// State of a single step within one run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Step has not been started yet
    Pending,
    /// Step is executing
    Running,
    /// Step executed successfully
    Succeeded,
    /// Step returned an error
    Failed,
    /// Rollback of the step is in flight
    Compensating,
    /// Rollback of the step finished
    Compensated,
    /// Rollback of the step returned an error
    CompensationFailed,
}

impl StepStatus {
    /// Check if step is in a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Succeeded
                | StepStatus::Failed
                | StepStatus::Compensated
                | StepStatus::CompensationFailed
        )
    }

    /// Whether the step's execute ever returned successfully
    pub fn was_successful(&self) -> bool {
        matches!(
            self,
            StepStatus::Succeeded
                | StepStatus::Compensating
                | StepStatus::Compensated
                | StepStatus::CompensationFailed
        )
    }
}

/// Outcome of one step in the current run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOutcome {
    /// Step name
    pub name: String,

    /// Current status
    pub status: StepStatus,

    /// Data the step captured for its own rollback
    pub undo_data: Option<Value>,

    /// Error message when the step (or its rollback) failed
    pub error: Option<String>,

    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl StepOutcome {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: StepStatus::Pending,
            undo_data: None,
            error: None,
            started_at: None,
            finished_at: None,
        }
    }

    /// Wall-clock duration in milliseconds, if the step finished
    pub fn duration_ms(&self) -> Option<u64> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => end
                .signed_duration_since(start)
                .to_std()
                .ok()
                .map(|d| d.as_millis() as u64),
            _ => None,
        }
    }
}

/// Scratch space for one pipeline run.
///
/// Created when a run starts and dropped when it returns; never shared
/// between runs.
#[derive(Debug, Clone)]
pub struct WorkflowState {
    /// Unique id of this run
    pub run_id: Uuid,

    /// Workflow the run belongs to
    pub workflow_id: String,

    outcomes: Vec<StepOutcome>,
    current_step: usize,

    /// Accumulated result payload
    pub payload: Map<String, Value>,
}

impl WorkflowState {
    /// Create state for a run over `step_names`, seeding the payload from `input`.
    ///
    /// An object input is used as the payload directly; any other value is
    /// stored under the `input` key.
    pub fn new(workflow_id: impl Into<String>, step_names: &[String], input: Value) -> Self {
        let payload = match input {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("input".to_string(), other);
                map
            }
        };

        Self {
            run_id: Uuid::new_v4(),
            workflow_id: workflow_id.into(),
            outcomes: step_names.iter().map(|n| StepOutcome::new(n)).collect(),
            current_step: 0,
            payload,
        }
    }

    /// Index of the step currently executing (or last executed)
    pub fn current_step(&self) -> usize {
        self.current_step
    }

    /// All step outcomes, in pipeline order
    pub fn outcomes(&self) -> &[StepOutcome] {
        &self.outcomes
    }

    /// Outcome for a step by name
    pub fn outcome(&self, name: &str) -> Option<&StepOutcome> {
        self.outcomes.iter().find(|o| o.name == name)
    }

    /// Record undo data for the step currently executing
    pub fn set_undo_data(&mut self, value: Value) {
        if let Some(outcome) = self.outcomes.get_mut(self.current_step) {
            outcome.undo_data = Some(value);
        }
    }

    /// Undo data captured by a step
    pub fn undo_data(&self, step_name: &str) -> Option<&Value> {
        self.outcome(step_name).and_then(|o| o.undo_data.as_ref())
    }

    /// Store a value in the result payload
    pub fn set_output(&mut self, key: impl Into<String>, value: Value) {
        self.payload.insert(key.into(), value);
    }

    /// Read a value from the result payload
    pub fn output(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    pub(crate) fn begin_step(&mut self, index: usize) {
        self.current_step = index;
        if let Some(outcome) = self.outcomes.get_mut(index) {
            outcome.status = StepStatus::Running;
            outcome.started_at = Some(Utc::now());
            outcome.finished_at = None;
        }
    }

    pub(crate) fn finish_step(&mut self, index: usize, error: Option<String>) {
        if let Some(outcome) = self.outcomes.get_mut(index) {
            outcome.status = if error.is_some() {
                StepStatus::Failed
            } else {
                StepStatus::Succeeded
            };
            outcome.error = error;
            outcome.finished_at = Some(Utc::now());
        }
    }

    pub(crate) fn begin_compensation(&mut self, index: usize) {
        self.current_step = index;
        if let Some(outcome) = self.outcomes.get_mut(index) {
            outcome.status = StepStatus::Compensating;
        }
    }

    pub(crate) fn finish_compensation(&mut self, index: usize) {
        if let Some(outcome) = self.outcomes.get_mut(index) {
            outcome.status = StepStatus::Compensated;
        }
    }

    pub(crate) fn set_compensation_error(&mut self, index: usize, error: String) {
        if let Some(outcome) = self.outcomes.get_mut(index) {
            outcome.status = StepStatus::CompensationFailed;
            outcome.error = Some(error);
        }
    }

    /// Number of steps that finished successfully
    pub fn succeeded_steps(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.status.was_successful())
            .count()
    }
}
