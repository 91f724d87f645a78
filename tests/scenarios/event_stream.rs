//! Test: Event Stream - domain events published once per workflow run

use crate::helpers::*;
use deployflow::core::{RunContext, ScanConfig};
use deployflow::events::{EventKind, EventType};
use deployflow::execution::{StepPipeline, WorkflowArgs, WorkflowOrchestrator};
use deployflow::steps::SimulatedStep;
use std::sync::Arc;

/// A clean run publishes started, one event per step, then completed
#[tokio::test]
async fn test_success_event_order() {
    let journal = journal();
    let pipeline = pipeline_of(
        "container-deploy",
        vec![
            Arc::new(JournalStep::new("build", &journal)),
            Arc::new(JournalStep::new("deploy", &journal)),
        ],
    );
    let h = harness(pipeline, fast_retry(5));

    let ctx = RunContext::new("wf-events");
    h.orchestrator
        .execute(&ctx, WorkflowArgs::default())
        .await
        .unwrap();

    assert_eq!(
        event_types(&h.events),
        vec![
            EventType::WorkflowStarted,
            EventType::WorkflowStepCompleted,
            EventType::WorkflowStepCompleted,
            EventType::WorkflowCompleted,
        ]
    );

    let events = h.events.lock().unwrap();
    assert!(events.iter().all(|e| e.workflow_id == "wf-events"));
    match &events[3].kind {
        EventKind::WorkflowCompleted {
            success,
            steps_succeeded,
            total_steps,
            ..
        } => {
            assert!(*success);
            assert_eq!(*steps_succeeded, 2);
            assert_eq!(*total_steps, 2);
        }
        other => panic!("unexpected event {:?}", other),
    }
}

/// A failed attempt reports the rollback before completing
#[tokio::test]
async fn test_failure_publishes_compensation() {
    let journal = journal();
    let pipeline = pipeline_of(
        "container-deploy",
        vec![
            Arc::new(JournalStep::new("build", &journal)),
            Arc::new(JournalStep::new("push", &journal)),
            Arc::new(JournalStep::new("deploy", &journal).always_failing().permanent()),
        ],
    );
    let h = harness(pipeline, fast_retry(5));

    let ctx = RunContext::new("wf-rollback");
    h.orchestrator
        .execute(&ctx, WorkflowArgs::default())
        .await
        .unwrap_err();

    assert_eq!(
        event_types(&h.events),
        vec![
            EventType::WorkflowStarted,
            EventType::WorkflowStepCompleted,
            EventType::WorkflowStepCompleted,
            EventType::WorkflowStepCompleted,
            EventType::WorkflowCompensated,
            EventType::WorkflowCompleted,
        ]
    );

    let events = h.events.lock().unwrap();
    match &events[4].kind {
        EventKind::WorkflowCompensated {
            failed_step,
            compensated_steps,
            compensation_failures,
        } => {
            assert_eq!(failed_step, "deploy");
            assert_eq!(compensated_steps, &vec!["push".to_string(), "build".to_string()]);
            assert!(compensation_failures.is_empty());
        }
        other => panic!("unexpected event {:?}", other),
    }
}

/// A retried run is announced once and completes once, with the final outcome
#[tokio::test]
async fn test_retried_run_publishes_single_outcome() {
    let journal = journal();
    let pipeline = pipeline_of(
        "container-deploy",
        vec![
            Arc::new(JournalStep::new("build", &journal)),
            Arc::new(JournalStep::new("push", &journal).failing(1)),
        ],
    );
    let h = harness(pipeline, fast_retry(5));

    let ctx = RunContext::new("wf-attempts");
    h.orchestrator
        .execute(&ctx, WorkflowArgs::default())
        .await
        .unwrap();

    assert_eq!(
        event_types(&h.events),
        vec![
            EventType::WorkflowStarted,
            EventType::WorkflowStepCompleted,
            EventType::WorkflowStepCompleted,
            EventType::WorkflowCompleted,
        ]
    );

    let events = h.events.lock().unwrap();
    let started: Vec<u32> = events
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::WorkflowStarted { attempt, .. } => Some(*attempt),
            _ => None,
        })
        .collect();
    assert_eq!(started, vec![1]);

    let completed: Vec<bool> = events
        .iter()
        .filter_map(|e| match &e.kind {
            EventKind::WorkflowCompleted { success, .. } => Some(*success),
            _ => None,
        })
        .collect();
    assert_eq!(completed, vec![true]);
}

/// A run that exhausts its budget reports the last failure exactly once
#[tokio::test]
async fn test_exhausted_run_publishes_single_failure() {
    let journal = journal();
    let pipeline = pipeline_of(
        "container-deploy",
        vec![
            Arc::new(JournalStep::new("build", &journal)),
            Arc::new(JournalStep::new("deploy", &journal).always_failing()),
        ],
    );
    let h = harness(pipeline, fast_retry(2));

    let ctx = RunContext::new("wf-exhausted");
    h.orchestrator
        .execute(&ctx, WorkflowArgs::default())
        .await
        .unwrap_err();

    assert_eq!(
        event_types(&h.events),
        vec![
            EventType::WorkflowStarted,
            EventType::WorkflowStepCompleted,
            EventType::WorkflowStepCompleted,
            EventType::WorkflowCompensated,
            EventType::WorkflowCompleted,
        ]
    );
    let events = h.events.lock().unwrap();
    match &events[4].kind {
        EventKind::WorkflowCompleted { success, error, .. } => {
            assert!(!*success);
            assert!(error.as_deref().unwrap_or("").contains("deploy"));
        }
        other => panic!("unexpected event {:?}", other),
    }
}

/// Scan steps publish their findings on the same bus
#[tokio::test]
async fn test_scan_step_publishes_results() {
    let (bus, events) = collecting_bus();
    let scan = ScanConfig {
        image_ref: "api:1.4.2".to_string(),
        scanner: "trivy".to_string(),
        critical: 0,
        high: 2,
        medium: 5,
        low: 9,
    };
    let pipeline = StepPipeline::new("scan-only")
        .with_step(Arc::new(SimulatedStep::new("scan").with_scan(scan).with_events(bus.clone())));
    let h = harness(pipeline, fast_retry(5));

    let ctx = RunContext::new("wf-scan");
    let result = h
        .orchestrator
        .execute(&ctx, WorkflowArgs::default())
        .await
        .unwrap();

    assert_eq!(result.output["scan"]["high"], 2);
    let events = events.lock().unwrap();
    assert_eq!(events.len(), 1);
    match &events[0].kind {
        EventKind::SecurityScanCompleted {
            image_ref, high, low, ..
        } => {
            assert_eq!(image_ref, "api:1.4.2");
            assert_eq!(*high, 2);
            assert_eq!(*low, 9);
        }
        other => panic!("unexpected event {:?}", other),
    }
}
