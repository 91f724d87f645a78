//! Core domain models
//!
//! Step contract, per-run state and context, the error taxonomy and the
//! YAML workflow configuration.

pub mod config;
pub mod context;
pub mod error;
pub mod state;
pub mod step;

pub use config::{RetryConfig, ScanConfig, StepConfig, WorkflowConfig};
pub use context::{ContextEnd, RunContext};
pub use error::{CompensationFailure, Escalation, RunReport, StepReport, WorkflowError};
pub use state::{ExecutionStatus, StepOutcome, StepStatus, WorkflowState};
pub use step::{SagaStep, StepError};
