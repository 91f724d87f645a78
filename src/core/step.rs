//! Saga step contract

use crate::core::{context::RunContext, state::WorkflowState};
use async_trait::async_trait;
use std::collections::BTreeMap;
use thiserror::Error;

/// Error returned by a step's execute or compensate.
///
/// The step decides whether the failure is worth retrying; context fields are
/// carried into the error history for the remediation advisor.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct StepError {
    pub message: String,
    pub retryable: bool,
    pub context: BTreeMap<String, String>,
}

impl StepError {
    /// A failure that may succeed if the workflow is retried
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
            context: BTreeMap::new(),
        }
    }

    /// A failure that retrying will not fix
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
            context: BTreeMap::new(),
        }
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// A single pipeline stage (analyze, build, scan, push, deploy, verify, ...).
///
/// `compensate` is only ever called after `execute` succeeded, and at most once
/// per run.
#[async_trait]
pub trait SagaStep: Send + Sync {
    /// Step name used in reports, events and error history
    fn name(&self) -> &str;

    /// Perform the step
    async fn execute(&self, ctx: &RunContext, state: &mut WorkflowState) -> Result<(), StepError>;

    /// Undo the step's side effects
    async fn compensate(&self, _ctx: &RunContext, _state: &mut WorkflowState) -> Result<(), StepError> {
        Ok(())
    }

    /// Whether the step has a rollback action at all
    fn is_compensatable(&self) -> bool {
        true
    }
}
