//! In-process workflow counters

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Point-in-time copy of [`WorkflowMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub runs: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub attempts: u64,
    pub retries: u64,
    pub compensations: u64,
    pub escalations: u64,
    pub total_duration_ms: u64,
}

impl MetricsSnapshot {
    /// Mean wall-clock time of a run
    pub fn average_duration(&self) -> Option<Duration> {
        if self.runs == 0 {
            return None;
        }
        Some(Duration::from_millis(self.total_duration_ms / self.runs))
    }
}

/// Counters shared by every run in the process
#[derive(Debug, Default)]
pub struct WorkflowMetrics {
    runs: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    attempts: AtomicU64,
    retries: AtomicU64,
    compensations: AtomicU64,
    escalations: AtomicU64,
    total_duration_ms: AtomicU64,
}

impl WorkflowMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one finished top-level run
    pub fn record_run(&self, success: bool, attempts: u32, compensations: usize, escalated: bool, duration: Duration) {
        self.runs.fetch_add(1, Ordering::Relaxed);
        if success {
            self.succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        self.attempts.fetch_add(u64::from(attempts), Ordering::Relaxed);
        self.retries
            .fetch_add(u64::from(attempts.saturating_sub(1)), Ordering::Relaxed);
        self.compensations
            .fetch_add(compensations as u64, Ordering::Relaxed);
        if escalated {
            self.escalations.fetch_add(1, Ordering::Relaxed);
        }
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            runs: self.runs.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            attempts: self.attempts.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            compensations: self.compensations.load(Ordering::Relaxed),
            escalations: self.escalations.load(Ordering::Relaxed),
            total_duration_ms: self.total_duration_ms.load(Ordering::Relaxed),
        }
    }
}
