//! Test: Cancellation - caller cancellation and deadlines end the run

use crate::helpers::*;
use deployflow::core::{RunContext, StepStatus, WorkflowError};
use deployflow::events::EventType;
use deployflow::execution::{WorkflowArgs, WorkflowOrchestrator};
use deployflow::resilience::Backoff;
use std::sync::Arc;
use std::time::Duration;

/// Cancelling mid-step fails the step and stops the run
#[tokio::test]
async fn test_cancel_during_hanging_step() {
    let journal = journal();
    let pipeline = pipeline_of(
        "container-deploy",
        vec![
            Arc::new(JournalStep::new("build", &journal)),
            Arc::new(JournalStep::new("deploy", &journal).hanging()),
            Arc::new(JournalStep::new("verify", &journal)),
        ],
    );
    let h = harness(pipeline, fast_retry(5));

    let ctx = RunContext::new("wf-cancel");
    let token = ctx.cancellation_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();
    });

    let err = h
        .orchestrator
        .execute(&ctx, WorkflowArgs::default())
        .await
        .unwrap_err();

    assert!(matches!(err, WorkflowError::Cancelled { .. }));
    assert!(!err.is_retryable());

    let report = err.report().expect("report of the interrupted run");
    assert_step_status(report, "build", StepStatus::Succeeded);
    assert_step_status(report, "deploy", StepStatus::Failed);
    assert_step_status(report, "verify", StepStatus::Pending);
    assert!(report.steps[1].error.as_deref().unwrap_or("").starts_with("interrupted"));

    assert_journal(&journal, &["execute:build", "execute:deploy"]);
}

/// A deadline ends the run the same way
#[tokio::test]
async fn test_deadline_exceeded() {
    let journal = journal();
    let pipeline = pipeline_of(
        "container-deploy",
        vec![Arc::new(JournalStep::new("deploy", &journal).hanging())],
    );
    let h = harness(pipeline, fast_retry(5));

    let ctx = RunContext::new("wf-deadline").with_timeout(Duration::from_millis(30));
    let err = h
        .orchestrator
        .execute(&ctx, WorkflowArgs::default())
        .await
        .unwrap_err();

    assert!(matches!(err, WorkflowError::DeadlineExceeded { .. }));
    assert_eq!(h.metrics.snapshot().failed, 1);
}

/// A run started on a cancelled context never executes a step
#[tokio::test]
async fn test_already_cancelled_context() {
    let journal = journal();
    let pipeline = pipeline_of(
        "container-deploy",
        vec![Arc::new(JournalStep::new("build", &journal))],
    );
    let h = harness(pipeline, fast_retry(5));

    let ctx = RunContext::new("wf-precancelled");
    ctx.cancel();
    let err = h
        .orchestrator
        .execute(&ctx, WorkflowArgs::default())
        .await
        .unwrap_err();

    assert!(matches!(err, WorkflowError::Cancelled { .. }));
    assert!(entries(&journal).is_empty());
}

/// A cancelled run is never charged to the shared budget
#[tokio::test]
async fn test_cancelled_run_leaves_budget_untouched() {
    let journal = journal();
    let pipeline = pipeline_of(
        "container-deploy",
        vec![Arc::new(JournalStep::new("build", &journal))],
    );
    let retry = fast_retry(5);
    let h = harness(pipeline, retry.clone());

    let budget = h.budgets.get_or_create(&retry.budget_name, retry.max_errors, retry.window);
    for _ in 0..4 {
        budget.record_error(&"earlier run failed");
    }

    let ctx = RunContext::new("wf-cancel-budget");
    ctx.cancel();
    let err = h
        .orchestrator
        .execute(&ctx, WorkflowArgs::default())
        .await
        .unwrap_err();

    assert!(matches!(err, WorkflowError::Cancelled { .. }));
    assert_eq!(budget.current_errors(), 4);
    assert!(!budget.is_circuit_open());
}

/// Cancelling while waiting to retry still names the failure being retried
#[tokio::test]
async fn test_cancel_during_backoff_keeps_last_failure() {
    let journal = journal();
    let pipeline = pipeline_of(
        "container-deploy",
        vec![
            Arc::new(JournalStep::new("build", &journal)),
            Arc::new(
                JournalStep::new("push", &journal)
                    .always_failing()
                    .with_error("registry returned 503"),
            ),
        ],
    );
    let mut retry = fast_retry(5);
    retry.backoff = Backoff::new(Duration::from_secs(30), Duration::from_secs(30));
    let h = harness(pipeline, retry);

    let ctx = RunContext::new("wf-cancel-backoff");
    let token = ctx.cancellation_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();
    });

    let err = h
        .orchestrator
        .execute(&ctx, WorkflowArgs::default())
        .await
        .unwrap_err();

    assert!(matches!(err, WorkflowError::Cancelled { cause: Some(_), .. }));
    assert_eq!(err.failed_step(), Some("push"));
    assert!(err.to_string().contains("registry returned 503"));
    assert_step_status(err.report().unwrap(), "build", StepStatus::Compensated);

    let types = event_types(&h.events);
    assert_eq!(types.last(), Some(&EventType::WorkflowCompleted));
    assert_eq!(
        types.iter().filter(|t| **t == EventType::WorkflowCompleted).count(),
        1
    );
}

/// Cancellation that cuts a rollback short is reported, not retried or charged
#[tokio::test]
async fn test_cancel_during_rollback_is_not_retried() {
    let journal = journal();
    let deploy = Arc::new(JournalStep::new("deploy", &journal).always_failing());
    let pipeline = pipeline_of(
        "container-deploy",
        vec![
            Arc::new(JournalStep::new("build", &journal)),
            Arc::new(JournalStep::new("push", &journal).cancelling_compensation()),
            deploy.clone(),
        ],
    );
    let h = harness(pipeline, fast_retry(5));

    let ctx = RunContext::new("wf-cancel-rollback");
    let err = h
        .orchestrator
        .execute(&ctx, WorkflowArgs::default())
        .await
        .unwrap_err();

    assert_eq!(deploy.executions(), 1);
    assert!(err.is_context_end());
    assert_eq!(err.failed_step(), Some("deploy"));
    let report = err.report().unwrap();
    assert_step_status(report, "push", StepStatus::Compensated);
    assert_step_status(report, "build", StepStatus::Succeeded);
    assert_eq!(h.budgets.get("workflow").unwrap().current_errors(), 0);
    assert_eq!(
        event_types(&h.events)
            .iter()
            .filter(|t| **t == EventType::WorkflowCompleted)
            .count(),
        1
    );
}
