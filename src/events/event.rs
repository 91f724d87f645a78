//! Domain events

use crate::resilience::tracker::AiContext;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Tag used to route events to handlers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    WorkflowStarted,
    WorkflowStepCompleted,
    WorkflowCompleted,
    WorkflowCompensated,
    SecurityScanCompleted,
    ErrorAnalysis,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::WorkflowStarted => "workflow_started",
            EventType::WorkflowStepCompleted => "workflow_step_completed",
            EventType::WorkflowCompleted => "workflow_completed",
            EventType::WorkflowCompensated => "workflow_compensated",
            EventType::SecurityScanCompleted => "security_scan_completed",
            EventType::ErrorAnalysis => "error_analysis",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of a domain event
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    WorkflowStarted {
        total_steps: usize,
        attempt: u32,
    },
    WorkflowStepCompleted {
        step_name: String,
        step_index: usize,
        success: bool,
        duration_ms: Option<u64>,
        error: Option<String>,
    },
    WorkflowCompleted {
        success: bool,
        duration_ms: u64,
        steps_succeeded: usize,
        total_steps: usize,
        error: Option<String>,
    },
    WorkflowCompensated {
        failed_step: String,
        compensated_steps: Vec<String>,
        compensation_failures: Vec<String>,
    },
    SecurityScanCompleted {
        image_ref: String,
        scanner: String,
        critical: u32,
        high: u32,
        medium: u32,
        low: u32,
    },
    ErrorAnalysis {
        step_name: String,
        should_escalate: bool,
        reason: Option<String>,
        context: AiContext,
    },
}

impl EventKind {
    pub fn event_type(&self) -> EventType {
        match self {
            EventKind::WorkflowStarted { .. } => EventType::WorkflowStarted,
            EventKind::WorkflowStepCompleted { .. } => EventType::WorkflowStepCompleted,
            EventKind::WorkflowCompleted { .. } => EventType::WorkflowCompleted,
            EventKind::WorkflowCompensated { .. } => EventType::WorkflowCompensated,
            EventKind::SecurityScanCompleted { .. } => EventType::SecurityScanCompleted,
            EventKind::ErrorAnalysis { .. } => EventType::ErrorAnalysis,
        }
    }
}

/// An immutable record of something that happened during a workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainEvent {
    pub id: Uuid,
    pub occurred_at: DateTime<Utc>,
    pub workflow_id: String,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl DomainEvent {
    pub fn new(workflow_id: impl Into<String>, kind: EventKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            occurred_at: Utc::now(),
            workflow_id: workflow_id.into(),
            kind,
        }
    }

    pub fn event_type(&self) -> EventType {
        self.kind.event_type()
    }
}
