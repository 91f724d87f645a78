//! Failure handling: error budgets, budget-gated retry, and error history

pub mod budget;
pub mod retry;
pub mod tracker;

pub use budget::{ErrorBudgetGuard, ErrorBudgetStatus, MultiErrorBudget};
pub use retry::{
    retry_with_budget, retry_with_budget_classified, retry_with_budget_if, Backoff, RetryDecision, RetryError,
};
pub use tracker::{AiContext, ErrorContextTracker, ErrorRecord, EscalationReason};
