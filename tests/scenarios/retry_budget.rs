//! Test: Retry Budget - whole-workflow retries gated by the error budget

use crate::helpers::*;
use deployflow::core::{RunContext, StepStatus, WorkflowError};
use deployflow::execution::{WorkflowArgs, WorkflowOrchestrator};
use std::sync::Arc;

/// A transient push failure is retried with fresh state until it goes through
#[tokio::test]
async fn test_transient_failure_is_retried_until_success() {
    let journal = journal();
    let push = Arc::new(JournalStep::new("push", &journal).failing(2));
    let pipeline = pipeline_of(
        "container-deploy",
        vec![Arc::new(JournalStep::new("build", &journal)), push.clone()],
    );
    let h = harness(pipeline, fast_retry(5));

    let ctx = RunContext::new("wf-retry");
    let result = h
        .orchestrator
        .execute(&ctx, WorkflowArgs::default())
        .await
        .unwrap();

    assert_eq!(push.executions(), 3);
    assert_eq!(result.report.attempts, 3);
    assert_eq!(result.report.retries(), 2);
    assert_step_status(&result.report, "push", StepStatus::Succeeded);

    // Each failed attempt rolled back its build before the next one
    assert_journal(
        &journal,
        &[
            "execute:build",
            "execute:push",
            "compensate:build",
            "execute:build",
            "execute:push",
            "compensate:build",
            "execute:build",
            "execute:push",
        ],
    );

    let metrics = h.metrics.snapshot();
    assert_eq!(metrics.runs, 1);
    assert_eq!(metrics.succeeded, 1);
    assert_eq!(metrics.attempts, 3);
    assert_eq!(metrics.retries, 2);
}

/// The circuit opens once max_errors failures are charged
#[tokio::test]
async fn test_budget_exhaustion_stops_retries() {
    let journal = journal();
    let deploy = Arc::new(JournalStep::new("deploy", &journal).always_failing());
    let pipeline = pipeline_of("container-deploy", vec![deploy.clone()]);
    let h = harness(pipeline, fast_retry(2));

    let ctx = RunContext::new("wf-budget");
    let err = h
        .orchestrator
        .execute(&ctx, WorkflowArgs::default())
        .await
        .unwrap_err();

    assert_eq!(deploy.executions(), 2);
    match &err {
        WorkflowError::BudgetExceeded {
            budget, attempts, ..
        } => {
            assert_eq!(budget, "workflow");
            assert_eq!(*attempts, 2);
        }
        other => panic!("expected BudgetExceeded, got {:?}", other),
    }
    assert_eq!(err.failed_step(), Some("deploy"));

    let status = h.budgets.get("workflow").unwrap().status();
    assert!(status.circuit_open);
    assert_eq!(status.current_errors, 2);

    let metrics = h.metrics.snapshot();
    assert_eq!(metrics.failed, 1);
    assert_eq!(metrics.attempts, 2);
}

/// Permanent failures are charged once and never retried
#[tokio::test]
async fn test_permanent_failure_is_not_retried() {
    let journal = journal();
    let build = Arc::new(JournalStep::new("build", &journal).always_failing().permanent());
    let pipeline = pipeline_of("container-deploy", vec![build.clone()]);
    let h = harness(pipeline, fast_retry(5));

    let ctx = RunContext::new("wf-permanent");
    let err = h
        .orchestrator
        .execute(&ctx, WorkflowArgs::default())
        .await
        .unwrap_err();

    assert_eq!(build.executions(), 1);
    assert!(matches!(err, WorkflowError::StepFailed { .. }));
    assert!(!err.is_retryable());
    assert_eq!(h.budgets.get("workflow").unwrap().current_errors(), 1);
}

/// An open circuit refuses the next run after its first failure
#[tokio::test]
async fn test_open_circuit_is_shared_between_runs() {
    let journal = journal();
    let deploy = Arc::new(JournalStep::new("deploy", &journal).always_failing());
    let pipeline = pipeline_of("container-deploy", vec![deploy.clone()]);
    let h = harness(pipeline, fast_retry(2));

    let first = RunContext::new("wf-first");
    h.orchestrator
        .execute(&first, WorkflowArgs::default())
        .await
        .unwrap_err();
    assert_eq!(deploy.executions(), 2);

    let second = RunContext::new("wf-second");
    let err = h
        .orchestrator
        .execute(&second, WorkflowArgs::default())
        .await
        .unwrap_err();

    assert_eq!(deploy.executions(), 3);
    assert!(matches!(err, WorkflowError::BudgetExceeded { attempts: 1, .. }));
}
