//! Workflow execution: the saga pipeline and the decorators around it

pub mod decorators;
pub mod metrics;
pub mod orchestrator;
pub mod pipeline;

pub use decorators::{
    EventPublishingOrchestrator, MetricsOrchestrator, RetryGuardOrchestrator, RetrySettings,
    TracingOrchestrator,
};
pub use metrics::{MetricsSnapshot, WorkflowMetrics};
pub use orchestrator::{compose_orchestrator, OrchestratorDeps, WorkflowArgs, WorkflowOrchestrator, WorkflowResult};
pub use pipeline::StepPipeline;
