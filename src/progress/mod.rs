//! Progress reporting
//!
//! The pipeline emits one [`ProgressUpdate`] per step transition. The
//! [`ProgressReporter`] normalizes it (percentage, trace id) and forwards it
//! to whatever sinks are attached: terminal output, a remote notification
//! channel, or nothing at all.

use crate::core::context::RunContext;
use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Minimum gap between two delivered `Running` updates
pub const DEFAULT_MIN_INTERVAL: Duration = Duration::from_millis(100);

/// Silence after which a heartbeat is sent for a step still running
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Status carried by a progress update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    Running,
    Succeeded,
    Failed,
}

impl ProgressStatus {
    /// Numeric code for clients that style updates by status
    pub fn code(self) -> u8 {
        match self {
            ProgressStatus::Running => 1,
            ProgressStatus::Succeeded => 2,
            ProgressStatus::Failed => 3,
        }
    }
}

/// One normalized progress notification
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressUpdate {
    /// 1-based index of the step this update is about
    pub step: usize,
    pub total: usize,
    pub percentage: u8,
    pub message: String,
    pub status: ProgressStatus,
    pub status_code: u8,
    pub eta: Option<Duration>,
    pub trace_id: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

impl ProgressUpdate {
    pub fn new(step: usize, total: usize, message: impl Into<String>, status: ProgressStatus) -> Self {
        Self {
            step,
            total,
            percentage: percentage(step, total),
            message: message.into(),
            status,
            status_code: status.code(),
            eta: None,
            trace_id: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_eta(mut self, eta: Duration) -> Self {
        self.eta = Some(eta);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Whether this is a watchdog heartbeat rather than a step transition
    pub fn is_heartbeat(&self) -> bool {
        self.metadata.get("kind").map(String::as_str) == Some("heartbeat")
    }

    fn normalize(mut self, ctx: &RunContext) -> Self {
        self.percentage = percentage(self.step, self.total);
        self.status_code = self.status.code();
        if self.trace_id.is_none() {
            self.trace_id = Some(ctx.trace_id().to_string());
        }
        self.message = mask_sensitive(&self.message);
        for (key, value) in self.metadata.iter_mut() {
            *value = if is_sensitive_key(key) {
                MASK.to_string()
            } else {
                mask_sensitive(value)
            };
        }
        self.metadata
            .entry("kind".to_string())
            .or_insert_with(|| "progress".to_string());
        self
    }
}

/// Integer percentage of `step` over `total`, 0 for an empty pipeline
pub fn percentage(step: usize, total: usize) -> u8 {
    if total == 0 {
        return 0;
    }
    (step.min(total) * 100 / total) as u8
}

const MASK: &str = "***";

fn secret_assignment() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)\b(password|passwd|secret|token|api[_-]?key|access[_-]?key)(\s*[=:]\s*)[^\s,;]+")
            .expect("secret pattern is valid")
    })
}

fn bearer_token() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?i)\b(bearer\s+)[A-Za-z0-9._~+/=-]+").expect("bearer pattern is valid"))
}

fn is_sensitive_key(key: &str) -> bool {
    let key = key.to_ascii_lowercase();
    ["password", "passwd", "secret", "token", "api_key", "apikey", "access_key"]
        .iter()
        .any(|k| key.contains(k))
}

/// Hide credentials (`token=...`, `password: ...`, bearer tokens) in a message
pub fn mask_sensitive(text: &str) -> String {
    let masked = secret_assignment().replace_all(text, "${1}${2}***");
    bearer_token().replace_all(&masked, "${1}***").into_owned()
}

/// Consumer of progress updates
#[async_trait]
pub trait ProgressSink: Send + Sync {
    fn name(&self) -> &str {
        "sink"
    }

    async fn send(&self, ctx: &RunContext, update: &ProgressUpdate) -> anyhow::Result<()>;
}

/// One or more sinks rejected an update
#[derive(Debug, Error)]
#[error("progress delivery failed: {}", .failures.join("; "))]
pub struct ProgressError {
    pub failures: Vec<String>,
}

/// Fans progress updates out to the attached sinks.
///
/// `Running` updates arriving within the minimum interval of the previous
/// delivery are dropped, except for the final step. Step results are never
/// dropped.
#[derive(Clone)]
pub struct ProgressReporter {
    sinks: Vec<Arc<dyn ProgressSink>>,
    min_interval: Duration,
    heartbeat_interval: Duration,
    last_delivery: Arc<Mutex<Option<Instant>>>,
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self {
            sinks: Vec::new(),
            min_interval: DEFAULT_MIN_INTERVAL,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            last_delivery: Arc::new(Mutex::new(None)),
        }
    }
}

impl ProgressReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Throttle `Running` updates; `Duration::ZERO` delivers everything
    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    /// Heartbeat period for long steps; `Duration::ZERO` disables heartbeats
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }

    fn last_delivery(&self) -> Option<Instant> {
        *self.last_delivery.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn throttled(&self, update: &ProgressUpdate) -> bool {
        if update.status != ProgressStatus::Running || update.step >= update.total {
            return false;
        }
        matches!(self.last_delivery(), Some(last) if last.elapsed() < self.min_interval)
    }

    /// Normalize and forward an update. With no sinks attached this is a no-op.
    pub async fn publish(&self, ctx: &RunContext, update: ProgressUpdate) -> Result<(), ProgressError> {
        if self.sinks.is_empty() {
            return Ok(());
        }
        if self.throttled(&update) {
            debug!(step = update.step, total = update.total, "Progress update throttled");
            return Ok(());
        }
        self.deliver(ctx, update.normalize(ctx)).await
    }

    async fn deliver(&self, ctx: &RunContext, update: ProgressUpdate) -> Result<(), ProgressError> {
        *self.last_delivery.lock().unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());

        let mut failures = Vec::new();
        for sink in &self.sinks {
            if let Err(e) = sink.send(ctx, &update).await {
                failures.push(format!("{}: {}", sink.name(), e));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(ProgressError { failures })
        }
    }

    /// Watchdog for a running step: while nothing has been delivered for a
    /// whole heartbeat interval, send "Still working on step X/Y". Returns
    /// once `stop` is cancelled.
    pub async fn heartbeat(&self, ctx: &RunContext, step: usize, total: usize, name: &str, stop: CancellationToken) {
        let period = self.heartbeat_interval;
        if self.sinks.is_empty() || period.is_zero() {
            stop.cancelled().await;
            return;
        }

        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = stop.cancelled() => return,
                _ = ticker.tick() => {}
            }

            if matches!(self.last_delivery(), Some(last) if last.elapsed() < period) {
                continue;
            }

            debug!(step = name, index = step, "Sending progress heartbeat");
            let update = ProgressUpdate::new(
                step,
                total,
                format!("Still working on step {}/{}: {}", step, total, name),
                ProgressStatus::Running,
            )
            .with_metadata("kind", "heartbeat")
            .with_metadata("step", name);
            if let Err(e) = self.deliver(ctx, update.normalize(ctx)).await {
                warn!(step = name, error = %e, "Heartbeat not delivered");
            }
        }
    }
}

/// Sink that keeps every update in memory
#[derive(Debug, Default)]
pub struct RecordingSink {
    updates: Mutex<Vec<ProgressUpdate>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn updates(&self) -> Vec<ProgressUpdate> {
        self.updates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl ProgressSink for RecordingSink {
    fn name(&self) -> &str {
        "recording"
    }

    async fn send(&self, _ctx: &RunContext, update: &ProgressUpdate) -> anyhow::Result<()> {
        self.updates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(update.clone());
        Ok(())
    }
}
