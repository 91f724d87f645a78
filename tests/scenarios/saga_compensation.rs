//! Test: Saga Compensation - reverse-order rollback of completed steps

use crate::helpers::*;
use deployflow::core::{RunContext, StepStatus, WorkflowError};
use deployflow::execution::{WorkflowArgs, WorkflowOrchestrator};
use serde_json::json;
use std::sync::Arc;

/// A failing deploy rolls back push and build, newest first
#[tokio::test]
async fn test_failure_compensates_in_reverse_order() {
    let journal = journal();
    let pipeline = pipeline_of(
        "container-deploy",
        vec![
            Arc::new(JournalStep::new("build", &journal)),
            Arc::new(JournalStep::new("push", &journal)),
            Arc::new(JournalStep::new("deploy", &journal).always_failing().permanent()),
            Arc::new(JournalStep::new("verify", &journal)),
        ],
    );

    let ctx = RunContext::new("wf-saga");
    let err = pipeline
        .execute(&ctx, WorkflowArgs::new(json!({})))
        .await
        .unwrap_err();

    assert_journal(
        &journal,
        &[
            "execute:build",
            "execute:push",
            "execute:deploy",
            "compensate:push",
            "compensate:build",
        ],
    );

    assert_eq!(err.failed_step(), Some("deploy"));
    assert!(err.compensation_failures().is_empty());

    let report = err.report().unwrap();
    assert_step_status(report, "build", StepStatus::Compensated);
    assert_step_status(report, "push", StepStatus::Compensated);
    assert_step_status(report, "deploy", StepStatus::Failed);
    assert_step_status(report, "verify", StepStatus::Pending);
    assert_eq!(report.compensated_count(), 2);
    assert!(!report.steps[3].attempted);
}

/// Rollback carries on past a compensation that fails
#[tokio::test]
async fn test_compensation_failures_are_collected() {
    let journal = journal();
    let pipeline = pipeline_of(
        "container-deploy",
        vec![
            Arc::new(JournalStep::new("build", &journal)),
            Arc::new(JournalStep::new("push", &journal).failing_compensation()),
            Arc::new(JournalStep::new("deploy", &journal).always_failing().permanent()),
        ],
    );

    let ctx = RunContext::new("wf-rollback-failure");
    let err = pipeline
        .execute(&ctx, WorkflowArgs::default())
        .await
        .unwrap_err();

    assert_journal(
        &journal,
        &[
            "execute:build",
            "execute:push",
            "execute:deploy",
            "compensate:push",
            "compensate:build",
        ],
    );

    let failures = err.compensation_failures();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].step, "push");
    assert!(err.to_string().contains("push: cannot undo push"));

    let report = err.report().unwrap();
    assert_step_status(report, "push", StepStatus::CompensationFailed);
    assert_step_status(report, "build", StepStatus::Compensated);
}

/// Steps without a rollback action are skipped during compensation
#[tokio::test]
async fn test_non_compensatable_step_is_skipped() {
    let journal = journal();
    let pipeline = pipeline_of(
        "container-deploy",
        vec![
            Arc::new(JournalStep::new("build", &journal)),
            Arc::new(JournalStep::new("scan", &journal).not_compensatable()),
            Arc::new(JournalStep::new("push", &journal).always_failing().permanent()),
        ],
    );

    let ctx = RunContext::new("wf-skip");
    let err = pipeline
        .execute(&ctx, WorkflowArgs::default())
        .await
        .unwrap_err();

    assert_journal(
        &journal,
        &["execute:build", "execute:scan", "execute:push", "compensate:build"],
    );
    let report = err.report().unwrap();
    assert_step_status(report, "scan", StepStatus::Succeeded);
    assert_step_status(report, "build", StepStatus::Compensated);
}

/// Nothing to undo when the first step fails
#[tokio::test]
async fn test_first_step_failure_compensates_nothing() {
    let journal = journal();
    let pipeline = pipeline_of(
        "container-deploy",
        vec![
            Arc::new(JournalStep::new("analyze", &journal).always_failing().permanent()),
            Arc::new(JournalStep::new("build", &journal)),
        ],
    );

    let ctx = RunContext::new("wf-first");
    let err = pipeline
        .execute(&ctx, WorkflowArgs::default())
        .await
        .unwrap_err();

    assert_journal(&journal, &["execute:analyze"]);
    assert!(matches!(err, WorkflowError::StepFailed { .. }));
    assert_eq!(err.report().unwrap().compensated_count(), 0);
}

/// A clean run touches every step once and never compensates
#[tokio::test]
async fn test_success_runs_every_step_once() {
    let journal = journal();
    let pipeline = pipeline_of(
        "container-deploy",
        vec![
            Arc::new(JournalStep::new("build", &journal)),
            Arc::new(JournalStep::new("push", &journal)),
            Arc::new(JournalStep::new("deploy", &journal)),
        ],
    );

    let ctx = RunContext::new("wf-ok");
    let result = pipeline
        .execute(&ctx, WorkflowArgs::new(json!({ "repository": "acme/api" })))
        .await
        .unwrap();

    assert_journal(&journal, &["execute:build", "execute:push", "execute:deploy"]);
    assert_eq!(result.workflow_id, "wf-ok");
    assert_eq!(result.report.succeeded_count(), 3);
    assert_eq!(result.report.compensated_count(), 0);
    assert!(result.report.failed_step().is_none());
}

/// Cancelling during rollback stops before the next compensation
#[tokio::test]
async fn test_cancel_mid_rollback_interrupts_compensation() {
    let journal = journal();
    let pipeline = pipeline_of(
        "container-deploy",
        vec![
            Arc::new(JournalStep::new("build", &journal)),
            Arc::new(JournalStep::new("push", &journal).cancelling_compensation()),
            Arc::new(JournalStep::new("deploy", &journal).always_failing().permanent()),
        ],
    );

    let ctx = RunContext::new("wf-rollback-cut");
    let err = pipeline
        .execute(&ctx, WorkflowArgs::new(json!({})))
        .await
        .unwrap_err();

    assert_journal(
        &journal,
        &["execute:build", "execute:push", "execute:deploy", "compensate:push"],
    );
    match &err {
        WorkflowError::StepFailed {
            step,
            rollback_interrupted,
            compensation_failures,
            ..
        } => {
            assert_eq!(step, "deploy");
            assert!(*rollback_interrupted);
            assert!(compensation_failures.is_empty());
        }
        other => panic!("expected StepFailed, got {:?}", other),
    }
    assert!(!err.is_retryable());

    let report = err.report().unwrap();
    assert_step_status(report, "push", StepStatus::Compensated);
    assert_step_status(report, "build", StepStatus::Succeeded);
}
