//! CLI output formatting

use crate::{
    core::{ExecutionStatus, RunContext, RunReport, StepStatus},
    events::{DomainEvent, EventHandler, EventKind},
    execution::MetricsSnapshot,
    persistence::RunSummary,
    resilience::ErrorBudgetStatus,
};
use async_trait::async_trait;
use console::Emoji;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

// Re-export style
pub use console::style;

// Emojis for output
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "✓ ");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "✗ ");
pub static SPINNER: Emoji<'_, '_> = Emoji("⏳ ", "~ ");
pub static INFO: Emoji<'_, '_> = Emoji("ℹ️  ", "i ");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "!");
pub static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", "> ");
pub static UNDO: Emoji<'_, '_> = Emoji("↩️  ", "< ");
pub static SHIELD: Emoji<'_, '_> = Emoji("🛡️  ", "# ");

/// Create a progress bar
pub fn create_progress_bar(total: usize) -> ProgressBar {
    let progress = ProgressBar::new(total as u64);
    let style = ProgressStyle::with_template(
        "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .progress_chars("#>-");
    progress.set_style(style);
    progress.enable_steady_tick(Duration::from_millis(100));
    progress
}

/// Horizontal rule spanning the terminal width
pub fn separator() -> String {
    let width = term_size::dimensions_stdout().map(|(w, _)| w).unwrap_or(80);
    "─".repeat(width)
}

/// Format a step status for display
pub fn format_step_status(status: StepStatus) -> String {
    match status {
        StepStatus::Pending => style("PENDING").dim().to_string(),
        StepStatus::Running => style("RUNNING").yellow().to_string(),
        StepStatus::Succeeded => style("SUCCEEDED").green().to_string(),
        StepStatus::Failed => style("FAILED").red().to_string(),
        StepStatus::Compensating => style("COMPENSATING").yellow().to_string(),
        StepStatus::Compensated => style("COMPENSATED").blue().to_string(),
        StepStatus::CompensationFailed => style("ROLLBACK FAILED").red().bold().to_string(),
    }
}

/// Format an execution status for display
pub fn format_status(status: ExecutionStatus) -> String {
    match status {
        ExecutionStatus::Pending => style("PENDING").dim().to_string(),
        ExecutionStatus::Running => style("RUNNING").yellow().to_string(),
        ExecutionStatus::Completed => style("COMPLETED").green().to_string(),
        ExecutionStatus::Failed => style("FAILED").red().to_string(),
        ExecutionStatus::Cancelled => style("CANCELLED").yellow().to_string(),
    }
}

/// Format a saved run for display
pub fn format_run_summary(summary: &RunSummary) -> String {
    let status_icon = match summary.status {
        ExecutionStatus::Completed => CHECK,
        ExecutionStatus::Failed => CROSS,
        ExecutionStatus::Running => SPINNER,
        _ => INFO,
    };

    let mut line = format!(
        "{} {} - {} - {} ({}/{}) - {} attempt(s)",
        status_icon,
        style(&summary.run_id.to_string()[..8]).dim(),
        style(&summary.workflow_name).bold(),
        format_status(summary.status),
        summary.steps_succeeded,
        summary.total_steps,
        style(summary.attempts).cyan()
    );
    if let Some(step) = &summary.failed_step {
        line.push_str(&format!(" - failed at {}", style(step).red()));
    }
    if summary.escalated {
        line.push_str(&format!(" {}", style("[escalated]").yellow()));
    }
    line
}

/// Format a domain event for display
pub fn format_event(event: &DomainEvent) -> Option<String> {
    let line = match &event.kind {
        EventKind::WorkflowStarted {
            total_steps,
            attempt,
        } => {
            if *attempt > 1 {
                format!(
                    "{} Retrying {} (attempt {}, {} steps)",
                    WARN,
                    style(&event.workflow_id).bold(),
                    style(attempt).yellow(),
                    total_steps
                )
            } else {
                format!(
                    "{} Starting {} ({} steps)",
                    ROCKET,
                    style(&event.workflow_id).bold(),
                    total_steps
                )
            }
        }
        EventKind::WorkflowStepCompleted { .. } => return None,
        EventKind::WorkflowCompensated {
            failed_step,
            compensated_steps,
            compensation_failures,
        } => {
            let mut line = format!(
                "{} Rolled back after {} failed: [{}]",
                UNDO,
                style(failed_step).red(),
                compensated_steps.join(", ")
            );
            for failure in compensation_failures {
                line.push_str(&format!("\n   {} {}", CROSS, style(failure).red()));
            }
            line
        }
        EventKind::SecurityScanCompleted {
            image_ref,
            scanner,
            critical,
            high,
            medium,
            low,
        } => format!(
            "{} {} scanned {}: {} critical, {} high, {} medium, {} low",
            SHIELD,
            scanner,
            style(image_ref).cyan(),
            style(critical).red(),
            style(high).yellow(),
            medium,
            low
        ),
        EventKind::ErrorAnalysis {
            step_name, reason, ..
        } => format!(
            "{} Escalating {}: {}",
            WARN,
            style(step_name).yellow(),
            reason.as_deref().unwrap_or("unknown reason")
        ),
        EventKind::WorkflowCompleted {
            success,
            duration_ms,
            steps_succeeded,
            total_steps,
            ..
        } => {
            let outcome = if *success {
                style("succeeded").green().to_string()
            } else {
                style("failed").red().to_string()
            };
            format!(
                "{} Attempt {} ({}/{} steps, {})",
                INFO,
                outcome,
                steps_succeeded,
                total_steps,
                format_duration(Duration::from_millis(*duration_ms))
            )
        }
    };
    Some(line)
}

/// Prints domain events to the terminal
pub struct ConsoleEventHandler;

#[async_trait]
impl EventHandler for ConsoleEventHandler {
    fn name(&self) -> &str {
        "console"
    }

    async fn handle(&self, _ctx: &RunContext, event: &DomainEvent) -> anyhow::Result<()> {
        if let Some(line) = format_event(event) {
            println!("{}", line);
        }
        Ok(())
    }
}

/// Per-step table of a run report
pub fn format_report(report: &RunReport) -> String {
    let mut lines = vec![format!(
        "{} Run {} ({} attempt(s))",
        INFO,
        style(&report.run_id.to_string()[..8]).dim(),
        report.attempts
    )];
    for (index, step) in report.steps.iter().enumerate() {
        let mut line = format!(
            "  {:>2}. {:<20} {}",
            index + 1,
            step.name,
            format_step_status(step.status)
        );
        if let Some(ms) = step.duration_ms {
            line.push_str(&format!(" {}", style(format!("{}ms", ms)).dim()));
        }
        if let Some(error) = &step.error {
            line.push_str(&format!(" {}", style(error).red()));
        }
        lines.push(line);
    }
    if let Some(escalation) = &report.escalation {
        lines.push(format!(
            "{} Escalated at {}: {}",
            WARN,
            style(&escalation.step).yellow(),
            escalation.reason
        ));
    }
    lines.join("\n")
}

pub fn format_metrics(metrics: &MetricsSnapshot) -> String {
    format!(
        "{} Runs: {} ({} ok, {} failed) - attempts: {} - retries: {} - compensations: {}",
        INFO,
        metrics.runs,
        style(metrics.succeeded).green(),
        style(metrics.failed).red(),
        metrics.attempts,
        metrics.retries,
        metrics.compensations
    )
}

pub fn format_budget(status: &ErrorBudgetStatus) -> String {
    let health = format!("{:.0}%", status.health_percentage);
    let health = if status.circuit_open {
        style(format!("{} (circuit open)", health)).red()
    } else if status.health_percentage < 50.0 {
        style(health).yellow()
    } else {
        style(health).green()
    };
    format!(
        "{} Budget {}: {}/{} errors, health {}",
        INFO,
        style(&status.name).bold(),
        status.current_errors,
        status.max_errors,
        health
    )
}

pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs == 0 {
        format!("{}ms", duration.as_millis())
    } else if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
