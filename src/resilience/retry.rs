//! Budget-gated retry with exponential backoff

use crate::core::context::{ContextEnd, RunContext};
use crate::resilience::budget::ErrorBudgetGuard;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Exponential backoff: `base * 2^(attempt-1)`, capped at `max`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay to wait after the given (1-based) failed attempt
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max)
            .min(self.max)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
        }
    }
}

/// Why a budget-gated retry loop gave up
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// The circuit breaker refused further attempts
    #[error("error budget '{budget}' exceeded after {attempts} attempt(s)")]
    BudgetExceeded {
        budget: String,
        attempts: u32,
        last_error: E,
    },

    /// The operation failed in a way the caller does not retry
    #[error("operation failed permanently after {attempts} attempt(s)")]
    Aborted { attempts: u32, error: E },

    /// The run context ended while waiting to retry
    #[error("retry interrupted ({cause:?}) after {attempts} attempt(s)")]
    Interrupted {
        cause: ContextEnd,
        attempts: u32,
        last_error: E,
    },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::BudgetExceeded { attempts, .. }
            | RetryError::Aborted { attempts, .. }
            | RetryError::Interrupted { attempts, .. } => *attempts,
        }
    }

    /// The last error the operation returned
    pub fn into_last_error(self) -> E {
        match self {
            RetryError::BudgetExceeded { last_error, .. }
            | RetryError::Interrupted { last_error, .. } => last_error,
            RetryError::Aborted { error, .. } => error,
        }
    }
}

/// Run `op` until it succeeds, the budget is exhausted, or the context ends.
pub async fn retry_with_budget<T, E, F, Fut>(
    ctx: &RunContext,
    budget: &ErrorBudgetGuard,
    backoff: Backoff,
    op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    retry_with_budget_if(ctx, budget, backoff, |_| true, op).await
}

/// Like [`retry_with_budget`], but only errors accepted by `should_retry` are
/// retried. Rejected errors are still charged to the budget.
pub async fn retry_with_budget_if<T, E, F, Fut, P>(
    ctx: &RunContext,
    budget: &ErrorBudgetGuard,
    backoff: Backoff,
    should_retry: P,
    op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
    P: Fn(&E) -> bool,
{
    let classify = |err: &E| {
        if should_retry(err) {
            RetryDecision::Retry
        } else {
            RetryDecision::Abort
        }
    };
    retry_with_budget_classified(ctx, budget, backoff, classify, op).await
}

/// What a budget-gated retry loop does with a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Charge the budget and try again after backoff
    Retry,
    /// Charge the budget and give up
    Abort,
    /// Give up without charging the budget
    PassThrough,
}

/// Budget-gated retry loop driven by an explicit classification of each failure.
///
/// A failure observed after the run context ended is never charged: the loop
/// returns [`RetryError::Interrupted`] straight away. `PassThrough` failures
/// come back as [`RetryError::Aborted`] with the budget untouched.
pub async fn retry_with_budget_classified<T, E, F, Fut, C>(
    ctx: &RunContext,
    budget: &ErrorBudgetGuard,
    backoff: Backoff,
    classify: C,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
    C: Fn(&E) -> RetryDecision,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;

        let err = match op().await {
            Ok(value) => {
                budget.record_success();
                return Ok(value);
            }
            Err(err) => err,
        };

        if let Some(cause) = ctx.end_cause() {
            debug!(attempts = attempt, ?cause, error = %err, "Run context ended, failure not charged");
            return Err(RetryError::Interrupted {
                cause,
                attempts: attempt,
                last_error: err,
            });
        }

        let decision = classify(&err);
        if decision == RetryDecision::PassThrough {
            debug!(attempts = attempt, error = %err, "Failure passed through uncharged");
            return Err(RetryError::Aborted {
                attempts: attempt,
                error: err,
            });
        }

        if !budget.record_error(&err) {
            warn!(
                budget = budget.name(),
                attempts = attempt,
                "Retry aborted: error budget exceeded"
            );
            return Err(RetryError::BudgetExceeded {
                budget: budget.name().to_string(),
                attempts: attempt,
                last_error: err,
            });
        }

        if decision == RetryDecision::Abort {
            debug!(attempts = attempt, error = %err, "Error is not retryable");
            return Err(RetryError::Aborted {
                attempts: attempt,
                error: err,
            });
        }

        let delay = backoff.delay(attempt);
        debug!(
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Retrying after backoff"
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            cause = ctx.done() => {
                warn!(attempts = attempt, ?cause, "Retry interrupted by run context");
                return Err(RetryError::Interrupted {
                    cause,
                    attempts: attempt,
                    last_error: err,
                });
            }
        }
    }
}
