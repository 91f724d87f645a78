//! Workflow error taxonomy and run reports

use crate::core::{
    context::ContextEnd,
    state::{StepStatus, WorkflowState},
    step::StepError,
};
use crate::resilience::tracker::EscalationReason;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// A rollback action that returned an error
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompensationFailure {
    pub step: String,
    pub message: String,
}

impl fmt::Display for CompensationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.step, self.message)
    }
}

/// Signal that automated handling of a step should stop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Escalation {
    pub step: String,
    pub reason: EscalationReason,
}

/// What happened to one step, for user-visible output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepReport {
    pub name: String,
    pub status: StepStatus,
    pub attempted: bool,
    pub succeeded: bool,
    pub failed: bool,
    pub compensated: bool,
    pub error: Option<String>,
    pub duration_ms: Option<u64>,
}

/// Per-step report of a run plus retry and escalation information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub workflow_id: String,
    pub run_id: Uuid,
    pub steps: Vec<StepReport>,
    /// Workflow attempts made so far (1 for a run without retries)
    pub attempts: u32,
    pub escalation: Option<Escalation>,
}

impl RunReport {
    pub fn from_state(state: &WorkflowState, attempts: u32) -> Self {
        let steps = state
            .outcomes()
            .iter()
            .map(|o| StepReport {
                name: o.name.clone(),
                status: o.status,
                attempted: o.status != StepStatus::Pending,
                succeeded: o.status.was_successful(),
                failed: o.status == StepStatus::Failed,
                compensated: o.status == StepStatus::Compensated,
                error: o.error.clone(),
                duration_ms: o.duration_ms(),
            })
            .collect();

        Self {
            workflow_id: state.workflow_id.clone(),
            run_id: state.run_id,
            steps,
            attempts,
            escalation: None,
        }
    }

    /// Retries performed on top of the first attempt
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }

    pub fn compensated_count(&self) -> usize {
        self.steps.iter().filter(|s| s.compensated).count()
    }

    pub fn succeeded_count(&self) -> usize {
        self.steps.iter().filter(|s| s.succeeded).count()
    }

    /// Name of the step that failed, if any
    pub fn failed_step(&self) -> Option<&str> {
        self.steps.iter().find(|s| s.failed).map(|s| s.name.as_str())
    }
}

fn compensation_summary(failures: &[CompensationFailure]) -> String {
    if failures.is_empty() {
        return String::new();
    }
    let list: Vec<String> = failures.iter().map(|f| f.to_string()).collect();
    format!("; compensation failed for [{}]", list.join(", "))
}

fn last_failure(cause: &Option<Box<WorkflowError>>) -> String {
    match cause {
        Some(cause) => format!("; last failure: {}", cause),
        None => String::new(),
    }
}

/// Errors surfaced by a workflow run
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// A step's execute returned an error; rollback has already run
    #[error("step '{step}' failed: {source}{}", compensation_summary(.compensation_failures))]
    StepFailed {
        step: String,
        source: StepError,
        compensation_failures: Vec<CompensationFailure>,
        /// The context ended before every compensation could start
        rollback_interrupted: bool,
        report: Box<RunReport>,
    },

    /// The circuit breaker refused further retries
    #[error("error budget '{budget}' exceeded after {attempts} attempt(s): {last_error}")]
    BudgetExceeded {
        budget: String,
        attempts: u32,
        last_error: Box<WorkflowError>,
    },

    /// `cause` is the failure the run was waiting to retry, if any
    #[error("workflow cancelled{}", last_failure(.cause))]
    Cancelled {
        report: Option<Box<RunReport>>,
        cause: Option<Box<WorkflowError>>,
    },

    #[error("workflow deadline exceeded{}", last_failure(.cause))]
    DeadlineExceeded {
        report: Option<Box<RunReport>>,
        cause: Option<Box<WorkflowError>>,
    },

    #[error("pipeline '{0}' is sealed; steps can only be added before execution")]
    PipelineSealed(String),

    #[error("pipeline '{0}' has no steps")]
    EmptyPipeline(String),
}

impl WorkflowError {
    pub(crate) fn from_context_end(end: ContextEnd, report: Option<RunReport>) -> Self {
        Self::context_end(end, report.map(Box::new), None)
    }

    /// The run context ended while `last_error` was waiting to be retried.
    ///
    /// An error that already reports the context end is returned unchanged.
    pub(crate) fn interrupted(end: ContextEnd, last_error: WorkflowError) -> Self {
        if last_error.is_context_end() {
            return last_error;
        }
        let report = last_error.report().cloned().map(Box::new);
        Self::context_end(end, report, Some(Box::new(last_error)))
    }

    fn context_end(end: ContextEnd, report: Option<Box<RunReport>>, cause: Option<Box<WorkflowError>>) -> Self {
        match end {
            ContextEnd::Cancelled => WorkflowError::Cancelled { report, cause },
            ContextEnd::DeadlineExceeded => WorkflowError::DeadlineExceeded { report, cause },
        }
    }

    /// Whether this error reports a cancelled or timed out run
    pub fn is_context_end(&self) -> bool {
        matches!(
            self,
            WorkflowError::Cancelled { .. } | WorkflowError::DeadlineExceeded { .. }
        )
    }

    /// Per-step report of the run that produced this error
    pub fn report(&self) -> Option<&RunReport> {
        match self {
            WorkflowError::StepFailed { report, .. } => Some(report),
            WorkflowError::BudgetExceeded { last_error, .. } => last_error.report(),
            WorkflowError::Cancelled { report, .. } | WorkflowError::DeadlineExceeded { report, .. } => {
                report.as_deref()
            }
            WorkflowError::PipelineSealed(_) | WorkflowError::EmptyPipeline(_) => None,
        }
    }

    pub fn report_mut(&mut self) -> Option<&mut RunReport> {
        match self {
            WorkflowError::StepFailed { report, .. } => Some(report),
            WorkflowError::BudgetExceeded { last_error, .. } => last_error.report_mut(),
            WorkflowError::Cancelled { report, .. } | WorkflowError::DeadlineExceeded { report, .. } => {
                report.as_deref_mut()
            }
            WorkflowError::PipelineSealed(_) | WorkflowError::EmptyPipeline(_) => None,
        }
    }

    /// Whether running the workflow again could succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            WorkflowError::StepFailed {
                source,
                rollback_interrupted,
                ..
            } => source.retryable && !rollback_interrupted,
            _ => false,
        }
    }

    /// The step whose failure caused this error
    pub fn failed_step(&self) -> Option<&str> {
        match self {
            WorkflowError::StepFailed { step, .. } => Some(step),
            WorkflowError::BudgetExceeded { last_error, .. } => last_error.failed_step(),
            WorkflowError::Cancelled { cause: Some(cause), .. }
            | WorkflowError::DeadlineExceeded { cause: Some(cause), .. } => cause.failed_step(),
            _ => None,
        }
    }

    /// Compensation failures recorded during rollback
    pub fn compensation_failures(&self) -> &[CompensationFailure] {
        match self {
            WorkflowError::StepFailed {
                compensation_failures,
                ..
            } => compensation_failures,
            WorkflowError::BudgetExceeded { last_error, .. } => last_error.compensation_failures(),
            WorkflowError::Cancelled { cause: Some(cause), .. }
            | WorkflowError::DeadlineExceeded { cause: Some(cause), .. } => cause.compensation_failures(),
            _ => &[],
        }
    }

    pub fn escalation(&self) -> Option<&Escalation> {
        self.report().and_then(|r| r.escalation.as_ref())
    }
}
