//! Run context - cancellation, deadline and per-run error history

use crate::resilience::tracker::ErrorContextTracker;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Why a run context ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextEnd {
    /// The caller cancelled the run
    Cancelled,
    /// The run's deadline passed
    DeadlineExceeded,
}

/// Context governing one top-level workflow run.
///
/// Every suspension point (step calls, retry backoff) races against
/// [`RunContext::done`]. The error tracker lives here so that it spans every
/// retry attempt of the same run.
#[derive(Debug)]
pub struct RunContext {
    workflow_id: String,
    trace_id: String,
    cancel: CancellationToken,
    deadline: Option<Instant>,
    started: Instant,
    attempt: AtomicU32,
    final_attempt: AtomicBool,
    outcome_published: AtomicBool,
    tracker: Arc<ErrorContextTracker>,
    metadata: HashMap<String, String>,
}

impl RunContext {
    /// Create a context for a workflow with a fresh trace id and no deadline
    pub fn new(workflow_id: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            trace_id: Uuid::new_v4().simple().to_string(),
            cancel: CancellationToken::new(),
            deadline: None,
            started: Instant::now(),
            attempt: AtomicU32::new(0),
            final_attempt: AtomicBool::new(true),
            outcome_published: AtomicBool::new(false),
            tracker: Arc::new(ErrorContextTracker::new()),
            metadata: HashMap::new(),
        }
    }

    /// Bound the whole run by a timeout starting now
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    /// Use a caller-owned cancellation token
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Use a specific error tracker (e.g. with a custom capacity)
    pub fn with_tracker(mut self, tracker: ErrorContextTracker) -> Self {
        self.tracker = Arc::new(tracker);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    /// Time since the context was created
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn metadata(&self) -> &HashMap<String, String> {
        &self.metadata
    }

    /// Error history shared by every attempt of this run
    pub fn tracker(&self) -> &ErrorContextTracker {
        &self.tracker
    }

    /// Token that cancels this run
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel the run
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Why the context ended, if it has
    pub fn end_cause(&self) -> Option<ContextEnd> {
        if self.cancel.is_cancelled() {
            return Some(ContextEnd::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(ContextEnd::DeadlineExceeded),
            _ => None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.end_cause().is_some()
    }

    /// Resolves when the run is cancelled or its deadline passes
    pub async fn done(&self) -> ContextEnd {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => ContextEnd::Cancelled,
                    _ = tokio::time::sleep_until(deadline) => ContextEnd::DeadlineExceeded,
                }
            }
            None => {
                self.cancel.cancelled().await;
                ContextEnd::Cancelled
            }
        }
    }

    /// Current workflow attempt (0 before the first attempt starts)
    pub fn attempt(&self) -> u32 {
        self.attempt.load(Ordering::SeqCst)
    }

    /// Start the next workflow attempt and return its number (1-based)
    pub fn begin_attempt(&self) -> u32 {
        self.attempt.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Attempt number to record for a failure; a bare pipeline run counts as attempt 1
    pub(crate) fn effective_attempt(&self) -> u32 {
        self.attempt().max(1)
    }

    /// Whether a failure of the current attempt ends the run.
    ///
    /// True unless a retry layer still has budget for another attempt.
    pub fn is_final_attempt(&self) -> bool {
        self.final_attempt.load(Ordering::SeqCst)
    }

    pub(crate) fn set_final_attempt(&self, last: bool) {
        self.final_attempt.store(last, Ordering::SeqCst);
    }

    /// Whether the terminal outcome of this run has been published
    pub(crate) fn outcome_published(&self) -> bool {
        self.outcome_published.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_outcome_published(&self) {
        self.outcome_published.store(true, Ordering::SeqCst);
    }
}
