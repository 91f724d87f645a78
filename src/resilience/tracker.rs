//! Progressive error context
//!
//! Keeps a bounded history of step failures and the fixes tried for them, and
//! decides when automated retrying should give up and defer to an external
//! advisor. [`ErrorContextTracker::ai_context`] renders that history as a
//! plain structured digest; no advisor logic lives here.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};
use tracing::debug;

/// Default number of records kept across the whole run
pub const DEFAULT_CAPACITY: usize = 50;

/// Same normalized message this many times means the step is stuck
pub const REPEATED_ERROR_THRESHOLD: usize = 3;

/// More distinct messages than this means the step is thrashing
pub const DISTINCT_ERROR_LIMIT: usize = 5;

/// Fix attempts on a still-failing step before giving up
pub const FIX_ATTEMPT_LIMIT: usize = 2;

/// One recorded step failure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub step: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub attempt: u32,
    pub context: BTreeMap<String, String>,
    pub fixes: Vec<String>,
}

/// Why a step should be escalated
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EscalationReason {
    /// The same error keeps coming back
    RepeatedError { message: String, occurrences: usize },
    /// The step fails in too many different ways
    TooManyDistinctErrors { distinct: usize },
    /// Fixes were tried and the step still fails
    FixAttemptsExhausted { fix_attempts: usize },
}

impl std::fmt::Display for EscalationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EscalationReason::RepeatedError {
                message,
                occurrences,
            } => write!(f, "error repeated {} times: {}", occurrences, message),
            EscalationReason::TooManyDistinctErrors { distinct } => {
                write!(f, "{} distinct errors", distinct)
            }
            EscalationReason::FixAttemptsExhausted { fix_attempts } => {
                write!(f, "{} fix attempts did not resolve the failure", fix_attempts)
            }
        }
    }
}

/// One entry of the advisor digest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiContextEntry {
    pub step: String,
    pub message: String,
    pub attempt: u32,
    pub timestamp: DateTime<Utc>,
    pub fixes_tried: Vec<String>,
    pub context: BTreeMap<String, String>,
}

/// Per-step counts in the advisor digest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepErrorSummary {
    pub errors: usize,
    pub distinct_errors: usize,
    pub fix_attempts: usize,
    pub repeated: bool,
    pub still_failing: bool,
    pub should_escalate: bool,
}

/// Structured digest of the error history for an external remediation advisor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiContext {
    pub total_errors: usize,
    pub entries: Vec<AiContextEntry>,
    pub steps: BTreeMap<String, StepErrorSummary>,
}

#[derive(Debug)]
struct TrackerState {
    records: VecDeque<ErrorRecord>,
    resolved: HashSet<String>,
}

/// Bounded FIFO history of step failures for one run
#[derive(Debug)]
pub struct ErrorContextTracker {
    capacity: usize,
    state: Mutex<TrackerState>,
}

fn normalizer() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\b(?:0x)?[0-9a-f]{8,}\b|\d+").expect("normalization pattern is valid")
    })
}

/// Normalize a message so that errors differing only by ids, ports or
/// counters compare equal
pub fn normalize_message(message: &str) -> String {
    let lowered = message.trim().to_lowercase();
    normalizer().replace_all(&lowered, "#").into_owned()
}

impl ErrorContextTracker {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(TrackerState {
                records: VecDeque::new(),
                resolved: HashSet::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a failure, evicting the oldest record when over capacity
    pub fn add_error(
        &self,
        step: &str,
        message: &str,
        attempt: u32,
        context: BTreeMap<String, String>,
    ) {
        let mut state = self.lock();
        state.records.push_back(ErrorRecord {
            step: step.to_string(),
            message: message.to_string(),
            timestamp: Utc::now(),
            attempt,
            context,
            fixes: Vec::new(),
        });
        state.resolved.remove(step);

        while state.records.len() > self.capacity {
            if let Some(evicted) = state.records.pop_front() {
                debug!(step = %evicted.step, "Evicted oldest error record");
            }
        }
    }

    /// Attach a fix description to the most recent record for `step`.
    ///
    /// Returns false when the step has no record in the current history.
    pub fn add_fix_attempt(&self, step: &str, description: &str) -> bool {
        let mut state = self.lock();
        match state.records.iter_mut().rev().find(|r| r.step == step) {
            Some(record) => {
                record.fixes.push(description.to_string());
                true
            }
            None => false,
        }
    }

    /// Mark the step as no longer failing
    pub fn record_success(&self, step: &str) {
        self.lock().resolved.insert(step.to_string());
    }

    /// Number of records currently held
    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records for one step, oldest first
    pub fn records_for(&self, step: &str) -> Vec<ErrorRecord> {
        self.lock()
            .records
            .iter()
            .filter(|r| r.step == step)
            .cloned()
            .collect()
    }

    /// True when one normalized message appears at least three times for the step
    pub fn has_repeated_errors(&self, step: &str) -> bool {
        most_repeated(&self.lock(), step)
            .map(|(_, count)| count >= REPEATED_ERROR_THRESHOLD)
            .unwrap_or(false)
    }

    pub fn should_escalate(&self, step: &str) -> bool {
        self.escalation_reason(step).is_some()
    }

    /// First matching escalation trigger: repeated error, distinct-error count,
    /// then fix attempts on a still-failing step
    pub fn escalation_reason(&self, step: &str) -> Option<EscalationReason> {
        let state = self.lock();
        escalation_reason(&state, step)
    }

    /// Digest of the history for an external remediation advisor
    pub fn ai_context(&self) -> AiContext {
        let state = self.lock();

        let entries = state
            .records
            .iter()
            .map(|r| AiContextEntry {
                step: r.step.clone(),
                message: r.message.clone(),
                attempt: r.attempt,
                timestamp: r.timestamp,
                fixes_tried: r.fixes.clone(),
                context: r.context.clone(),
            })
            .collect();

        let mut steps = BTreeMap::new();
        for record in &state.records {
            if steps.contains_key(&record.step) {
                continue;
            }
            let step = record.step.as_str();
            let summary = StepErrorSummary {
                errors: state.records.iter().filter(|r| r.step == step).count(),
                distinct_errors: distinct_count(&state, step),
                fix_attempts: fix_count(&state, step),
                repeated: most_repeated(&state, step)
                    .map(|(_, count)| count >= REPEATED_ERROR_THRESHOLD)
                    .unwrap_or(false),
                still_failing: !state.resolved.contains(step),
                should_escalate: escalation_reason(&state, step).is_some(),
            };
            steps.insert(step.to_string(), summary);
        }

        AiContext {
            total_errors: state.records.len(),
            entries,
            steps,
        }
    }
}

impl Default for ErrorContextTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Most frequent normalized message of a step; ties go to the one seen first
fn most_repeated(state: &TrackerState, step: &str) -> Option<(String, usize)> {
    let mut counts: Vec<(String, usize)> = Vec::new();
    for record in state.records.iter().filter(|r| r.step == step) {
        let message = normalize_message(&record.message);
        match counts.iter_mut().find(|(seen, _)| *seen == message) {
            Some((_, count)) => *count += 1,
            None => counts.push((message, 1)),
        }
    }
    counts
        .into_iter()
        .fold(None, |best: Option<(String, usize)>, candidate| match best {
            Some(best) if best.1 >= candidate.1 => Some(best),
            _ => Some(candidate),
        })
}

fn distinct_count(state: &TrackerState, step: &str) -> usize {
    state
        .records
        .iter()
        .filter(|r| r.step == step)
        .map(|r| normalize_message(&r.message))
        .collect::<HashSet<_>>()
        .len()
}

fn fix_count(state: &TrackerState, step: &str) -> usize {
    state
        .records
        .iter()
        .filter(|r| r.step == step)
        .map(|r| r.fixes.len())
        .sum()
}

fn escalation_reason(state: &TrackerState, step: &str) -> Option<EscalationReason> {
    if let Some((message, occurrences)) = most_repeated(state, step) {
        if occurrences >= REPEATED_ERROR_THRESHOLD {
            return Some(EscalationReason::RepeatedError {
                message,
                occurrences,
            });
        }
    }

    let distinct = distinct_count(state, step);
    if distinct > DISTINCT_ERROR_LIMIT {
        return Some(EscalationReason::TooManyDistinctErrors { distinct });
    }

    let fix_attempts = fix_count(state, step);
    let still_failing = !state.resolved.contains(step) && state.records.iter().any(|r| r.step == step);
    if fix_attempts >= FIX_ATTEMPT_LIMIT && still_failing {
        return Some(EscalationReason::FixAttemptsExhausted { fix_attempts });
    }

    None
}
