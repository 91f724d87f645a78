//! Test: Escalation - repeated failures stop retries and carry advisor context

use crate::helpers::*;
use deployflow::core::{RunContext, WorkflowError};
use deployflow::execution::{WorkflowArgs, WorkflowOrchestrator};
use deployflow::resilience::EscalationReason;
use std::sync::Arc;

/// The same error three times escalates before the budget runs out
#[tokio::test]
async fn test_repeated_error_escalates() {
    let journal = journal();
    let push = Arc::new(
        JournalStep::new("push", &journal)
            .always_failing()
            .with_error("registry returned 503"),
    );
    let pipeline = pipeline_of("container-deploy", vec![push.clone()]);
    let h = harness(pipeline, fast_retry(10));

    let ctx = RunContext::new("wf-escalate");
    let err = h
        .orchestrator
        .execute(&ctx, WorkflowArgs::default())
        .await
        .unwrap_err();

    assert_eq!(push.executions(), 3);
    assert!(matches!(err, WorkflowError::StepFailed { .. }));

    let escalation = err.escalation().expect("escalation attached");
    assert_eq!(escalation.step, "push");
    assert!(matches!(
        escalation.reason,
        EscalationReason::RepeatedError { occurrences: 3, .. }
    ));

    let digest = ctx.tracker().ai_context();
    assert_eq!(digest.total_errors, 3);
    assert!(digest.steps["push"].should_escalate);
    assert!(digest.steps["push"].still_failing);

    assert_eq!(h.metrics.snapshot().escalations, 1);
}

/// Messages differing only in numbers count as the same error
#[tokio::test]
async fn test_escalation_ignores_numeric_noise() {
    let ctx = RunContext::new("wf-normalize");
    let tracker = ctx.tracker();
    for port in [5001, 5002, 5003] {
        tracker.add_error(
            "deploy",
            &format!("connection refused on port {}", port),
            1,
            Default::default(),
        );
    }
    assert!(tracker.has_repeated_errors("deploy"));
    assert!(tracker.should_escalate("deploy"));
}

/// Recovered steps keep their history but are no longer failing
#[tokio::test]
async fn test_recovery_marks_step_resolved() {
    let journal = journal();
    let build = Arc::new(JournalStep::new("build", &journal).failing(1));
    let pipeline = pipeline_of("container-deploy", vec![build]);
    let h = harness(pipeline, fast_retry(5));

    let ctx = RunContext::new("wf-recover");
    let result = h
        .orchestrator
        .execute(&ctx, WorkflowArgs::default())
        .await
        .unwrap();

    assert!(result.report.escalation.is_none());
    let digest = ctx.tracker().ai_context();
    assert_eq!(digest.total_errors, 1);
    assert!(!digest.steps["build"].still_failing);
    assert!(!ctx.tracker().should_escalate("build"));
}
