//! deployflow - failure-tolerant containerize-and-deploy workflow engine
//!
//! Steps run as a saga: when one fails, the ones that already succeeded are
//! rolled back in reverse order. Whole-workflow retries are gated by
//! sliding-window error budgets, and a per-run error history decides when
//! retrying should stop and the failure be escalated.

pub mod cli;
pub mod core;
pub mod events;
pub mod execution;
pub mod persistence;
pub mod progress;
pub mod resilience;
pub mod steps;

// Re-export commonly used types
pub use core::{RunContext, SagaStep, StepError, WorkflowConfig, WorkflowError, WorkflowState};
pub use events::{DomainEvent, EventBus, EventHandler, EventKind, EventType};
pub use execution::{
    compose_orchestrator, OrchestratorDeps, StepPipeline, WorkflowArgs, WorkflowMetrics, WorkflowOrchestrator,
    WorkflowResult,
};
pub use progress::{ProgressReporter, ProgressSink, ProgressUpdate};
pub use resilience::{ErrorBudgetGuard, ErrorContextTracker, MultiErrorBudget};
pub use steps::SimulatedStep;
