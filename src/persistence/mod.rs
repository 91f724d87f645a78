//! Persistence layer for workflow run history
//!
//! Runs are saved once, when they finish. Nothing here is consulted while a
//! run is in flight.

#[cfg(feature = "sqlite")]
pub mod store;

#[cfg(feature = "sqlite")]
pub use store::SqliteRunStore;

pub use crate::core::ExecutionStatus;
use crate::core::{RunReport, WorkflowError};
use crate::execution::WorkflowResult;
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Summary of a finished workflow run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Id of the last attempt's run
    pub run_id: Uuid,

    pub workflow_id: String,

    /// Workflow (pipeline) name
    pub workflow_name: String,

    pub status: ExecutionStatus,

    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,

    /// Workflow attempts, including the first
    pub attempts: u32,

    pub steps_succeeded: usize,
    pub total_steps: usize,
    pub compensated_steps: usize,

    pub failed_step: Option<String>,
    pub error: Option<String>,

    /// Whether the failure was escalated
    pub escalated: bool,
}

impl RunSummary {
    fn from_report(
        workflow_name: &str,
        workflow_id: &str,
        total_steps: usize,
        started_at: DateTime<Utc>,
        status: ExecutionStatus,
        report: Option<&RunReport>,
    ) -> Self {
        Self {
            run_id: report.map(|r| r.run_id).unwrap_or_else(Uuid::new_v4),
            workflow_id: workflow_id.to_string(),
            workflow_name: workflow_name.to_string(),
            status,
            started_at,
            completed_at: Some(Utc::now()),
            attempts: report.map(|r| r.attempts).unwrap_or(0),
            steps_succeeded: report.map(RunReport::succeeded_count).unwrap_or(0),
            total_steps,
            compensated_steps: report.map(RunReport::compensated_count).unwrap_or(0),
            failed_step: report.and_then(|r| r.failed_step()).map(str::to_string),
            error: None,
            escalated: report.map(|r| r.escalation.is_some()).unwrap_or(false),
        }
    }

    /// Summary of a successful run
    pub fn from_result(workflow_name: &str, started_at: DateTime<Utc>, result: &WorkflowResult) -> Self {
        Self::from_report(
            workflow_name,
            &result.workflow_id,
            result.report.steps.len(),
            started_at,
            ExecutionStatus::Completed,
            Some(&result.report),
        )
    }

    /// Summary of a failed or interrupted run
    pub fn from_error(
        workflow_name: &str,
        workflow_id: &str,
        total_steps: usize,
        started_at: DateTime<Utc>,
        err: &WorkflowError,
    ) -> Self {
        let status = match err {
            WorkflowError::Cancelled { .. } | WorkflowError::DeadlineExceeded { .. } => {
                ExecutionStatus::Cancelled
            }
            _ => ExecutionStatus::Failed,
        };

        let mut summary = Self::from_report(workflow_name, workflow_id, total_steps, started_at, status, err.report());
        summary.error = Some(err.to_string());
        if summary.failed_step.is_none() {
            summary.failed_step = err.failed_step().map(str::to_string);
        }
        summary
    }
}

/// Trait for persistence backends
#[async_trait::async_trait]
pub trait PersistenceBackend: Send + Sync {
    /// Save a finished run
    async fn save_run(&self, run: &RunSummary) -> Result<()>;

    /// Load a run by ID
    async fn load_run(&self, run_id: Uuid) -> Result<Option<RunSummary>>;

    /// Most recent runs first, optionally for one workflow only
    async fn list_runs(&self, workflow_name: Option<&str>, limit: usize) -> Result<Vec<RunSummary>>;

    /// List all workflow names with saved runs
    async fn list_workflows(&self) -> Result<Vec<String>>;
}

/// In-memory persistence (for testing or ephemeral use)
#[derive(Default)]
pub struct InMemoryPersistence {
    runs: RwLock<HashMap<Uuid, RunSummary>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl PersistenceBackend for InMemoryPersistence {
    async fn save_run(&self, run: &RunSummary) -> Result<()> {
        self.runs.write().await.insert(run.run_id, run.clone());
        Ok(())
    }

    async fn load_run(&self, run_id: Uuid) -> Result<Option<RunSummary>> {
        Ok(self.runs.read().await.get(&run_id).cloned())
    }

    async fn list_runs(&self, workflow_name: Option<&str>, limit: usize) -> Result<Vec<RunSummary>> {
        let runs = self.runs.read().await;
        let mut result: Vec<RunSummary> = runs
            .values()
            .filter(|r| workflow_name.map_or(true, |name| r.workflow_name == name))
            .cloned()
            .collect();
        result.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        result.truncate(limit);
        Ok(result)
    }

    async fn list_workflows(&self) -> Result<Vec<String>> {
        let runs = self.runs.read().await;
        let mut names: Vec<String> = runs.values().map(|r| r.workflow_name.clone()).collect();
        names.sort();
        names.dedup();
        Ok(names)
    }
}
