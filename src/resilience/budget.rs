//! Error budgets - sliding-window circuit breakers gating retries

use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Snapshot of a budget's health
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorBudgetStatus {
    pub name: String,
    pub current_errors: u32,
    pub max_errors: u32,
    pub health_percentage: f64,
    pub circuit_open: bool,
}

impl fmt::Display for ErrorBudgetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {}/{} errors ({:.1}% healthy, circuit {})",
            self.name,
            self.current_errors,
            self.max_errors,
            self.health_percentage,
            if self.circuit_open { "open" } else { "closed" }
        )
    }
}

#[derive(Debug)]
struct BudgetState {
    current_errors: u32,
    window_start: Instant,
    circuit_open: bool,
}

/// Circuit breaker for one operation class.
///
/// The circuit opens when `current_errors` reaches `max_errors` and only
/// closes again when the window elapses (or on an explicit [`reset`]).
///
/// [`reset`]: ErrorBudgetGuard::reset
#[derive(Debug)]
pub struct ErrorBudgetGuard {
    name: String,
    max_errors: u32,
    window: Duration,
    state: Mutex<BudgetState>,
}

impl ErrorBudgetGuard {
    /// A `max_errors` of 0 is treated as 1: the first error opens the circuit.
    pub fn new(name: impl Into<String>, max_errors: u32, window: Duration) -> Self {
        let name = name.into();
        if max_errors == 0 {
            warn!(budget = %name, "max_errors of 0 is invalid, using 1");
        }
        Self {
            name,
            max_errors: max_errors.max(1),
            window,
            state: Mutex::new(BudgetState {
                current_errors: 0,
                window_start: Instant::now(),
                circuit_open: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BudgetState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_errors(&self) -> u32 {
        self.max_errors
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Record a failure. Returns whether the operation is still within budget.
    pub fn record_error(&self, err: &dyn fmt::Display) -> bool {
        let mut state = self.lock();

        let now = Instant::now();
        if now.duration_since(state.window_start) > self.window {
            if state.circuit_open {
                info!(budget = %self.name, "Error budget window elapsed, circuit closed");
            }
            state.current_errors = 0;
            state.circuit_open = false;
            state.window_start = now;
        }

        state.current_errors += 1;

        if state.current_errors >= self.max_errors {
            if !state.circuit_open {
                error!(
                    budget = %self.name,
                    current_errors = state.current_errors,
                    max_errors = self.max_errors,
                    error = %err,
                    "Error budget exhausted, circuit opened"
                );
            }
            state.circuit_open = true;
            return false;
        }

        warn!(
            budget = %self.name,
            current_errors = state.current_errors,
            max_errors = self.max_errors,
            error = %err,
            "Error recorded against budget"
        );
        true
    }

    /// Whether one more recorded error would leave the circuit open
    pub fn next_error_exhausts(&self) -> bool {
        let state = self.lock();
        if Instant::now().duration_since(state.window_start) > self.window {
            return self.max_errors <= 1;
        }
        state.circuit_open || state.current_errors + 1 >= self.max_errors
    }

    /// Record a success: one error is forgiven. Does not close an open circuit.
    pub fn record_success(&self) {
        let mut state = self.lock();
        state.current_errors = state.current_errors.saturating_sub(1);
    }

    pub fn is_circuit_open(&self) -> bool {
        self.lock().circuit_open
    }

    pub fn current_errors(&self) -> u32 {
        self.lock().current_errors
    }

    pub fn status(&self) -> ErrorBudgetStatus {
        let state = self.lock();
        let remaining = self.max_errors.saturating_sub(state.current_errors);
        ErrorBudgetStatus {
            name: self.name.clone(),
            current_errors: state.current_errors,
            max_errors: self.max_errors,
            health_percentage: 100.0 * f64::from(remaining) / f64::from(self.max_errors),
            circuit_open: state.circuit_open,
        }
    }

    /// Clear errors and close the circuit, starting a new window
    pub fn reset(&self) {
        let mut state = self.lock();
        state.current_errors = 0;
        state.circuit_open = false;
        state.window_start = Instant::now();
        info!(budget = %self.name, "Error budget reset");
    }
}

/// Registry of independent budgets keyed by operation class.
///
/// Built once by the composition root and shared by reference; budgets are
/// created lazily and never share locks with each other.
#[derive(Debug, Default)]
pub struct MultiErrorBudget {
    budgets: RwLock<HashMap<String, Arc<ErrorBudgetGuard>>>,
}

impl MultiErrorBudget {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the budget for `name`, creating it with the given limits on first use.
    ///
    /// Limits passed for an existing budget are ignored.
    pub fn get_or_create(&self, name: &str, max_errors: u32, window: Duration) -> Arc<ErrorBudgetGuard> {
        if let Some(budget) = self.get(name) {
            return budget;
        }

        let mut budgets = self.budgets.write().unwrap_or_else(PoisonError::into_inner);
        budgets
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(ErrorBudgetGuard::new(name, max_errors, window)))
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<ErrorBudgetGuard>> {
        self.budgets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Status of every budget, sorted by name
    pub fn statuses(&self) -> Vec<ErrorBudgetStatus> {
        let budgets = self.budgets.read().unwrap_or_else(PoisonError::into_inner);
        let mut statuses: Vec<ErrorBudgetStatus> = budgets.values().map(|b| b.status()).collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }
}
