//! Workflow configuration from YAML

use crate::events::EventBus;
use crate::execution::{decorators::RetrySettings, pipeline::StepPipeline};
use crate::resilience::{tracker::DEFAULT_CAPACITY, Backoff};
use crate::steps::SimulatedStep;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Top-level workflow configuration loaded from YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    /// Workflow name, also used as the pipeline name
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    /// Initial payload handed to the first step
    #[serde(default)]
    pub input: Value,

    /// Deadline for the whole run, retries included
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// Error history kept for escalation decisions
    #[serde(default = "default_tracker_capacity")]
    pub tracker_capacity: usize,

    #[serde(default)]
    pub retry: RetryConfig,

    /// Workflow steps, in execution order
    pub steps: Vec<StepConfig>,
}

/// Error budget and backoff for whole-workflow retries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Budget name in the shared registry
    pub budget: String,
    pub max_errors: u32,
    pub window_secs: u64,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            budget: "workflow".to_string(),
            max_errors: 5,
            window_secs: 300,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
        }
    }
}

/// One simulated step as defined in YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepConfig {
    /// Unique step name
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    /// Simulated work time
    #[serde(default)]
    pub delay_ms: u64,

    /// Whether the step has a rollback action
    #[serde(default = "default_true")]
    pub compensatable: bool,

    /// Fail this many executions before succeeding
    #[serde(default)]
    pub fail_times: u32,

    /// Error message used for injected failures
    #[serde(default)]
    pub error: Option<String>,

    /// Whether injected failures may be retried
    #[serde(default = "default_true")]
    pub retryable: bool,

    /// Make the rollback action fail
    #[serde(default)]
    pub fail_compensation: bool,

    /// Values merged into the workflow payload on success
    #[serde(default)]
    pub output: serde_json::Map<String, Value>,

    /// Security scan result reported by this step
    #[serde(default)]
    pub scan: Option<ScanConfig>,
}

/// Vulnerability counts of a simulated image scan
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanConfig {
    pub image_ref: String,
    #[serde(default = "default_scanner")]
    pub scanner: String,
    #[serde(default)]
    pub critical: u32,
    #[serde(default)]
    pub high: u32,
    #[serde(default)]
    pub medium: u32,
    #[serde(default)]
    pub low: u32,
}

fn default_true() -> bool {
    true
}

fn default_tracker_capacity() -> usize {
    DEFAULT_CAPACITY
}

fn default_scanner() -> String {
    "trivy".to_string()
}

impl WorkflowConfig {
    /// Load workflow configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read workflow file {}", path.display()))?;
        Self::from_yaml(&content)
    }

    /// Parse workflow configuration from a YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: WorkflowConfig = serde_yaml::from_str(yaml).context("Invalid workflow YAML")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the workflow configuration
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            anyhow::bail!("Workflow name must not be empty");
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            if step.name.trim().is_empty() {
                anyhow::bail!("Step name must not be empty");
            }
            if !seen.insert(&step.name) {
                anyhow::bail!("Duplicate step name: {}", step.name);
            }
        }

        if self.retry.max_errors == 0 {
            anyhow::bail!("retry.max_errors must be at least 1");
        }
        if self.retry.window_secs == 0 {
            anyhow::bail!("retry.window_secs must be at least 1");
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            anyhow::bail!(
                "retry.base_delay_ms ({}) exceeds retry.max_delay_ms ({})",
                self.retry.base_delay_ms,
                self.retry.max_delay_ms
            );
        }
        if self.tracker_capacity == 0 {
            anyhow::bail!("tracker_capacity must be at least 1");
        }
        if self.timeout_secs == Some(0) {
            anyhow::bail!("timeout_secs must be at least 1 when set");
        }

        Ok(())
    }

    pub fn step(&self, name: &str) -> Option<&StepConfig> {
        self.steps.iter().find(|s| s.name == name)
    }

    /// Make `step` fail `times` executions before succeeding
    pub fn inject_failure(&mut self, step: &str, times: u32) -> Result<()> {
        let Some(config) = self.steps.iter_mut().find(|s| s.name == step) else {
            anyhow::bail!("Unknown step '{}' in workflow '{}'", step, self.name);
        };
        config.fail_times = times;
        Ok(())
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    pub fn retry_settings(&self) -> RetrySettings {
        RetrySettings {
            budget_name: self.retry.budget.clone(),
            max_errors: self.retry.max_errors,
            window: Duration::from_secs(self.retry.window_secs),
            backoff: Backoff::new(
                Duration::from_millis(self.retry.base_delay_ms),
                Duration::from_millis(self.retry.max_delay_ms),
            ),
        }
    }

    /// Build a pipeline of simulated steps. Scan results are published on
    /// `events` when a bus is given.
    pub fn to_pipeline(&self, events: Option<Arc<EventBus>>) -> StepPipeline {
        self.steps.iter().fold(StepPipeline::new(&self.name), |pipeline, step| {
            let mut simulated = SimulatedStep::from_config(step);
            if let Some(bus) = &events {
                simulated = simulated.with_events(bus.clone());
            }
            pipeline.with_step(Arc::new(simulated))
        })
    }
}
