use anyhow::{Context, Result};
use chrono::Utc;
use deployflow::cli::commands::{HistoryCommand, ListCommand, RunCommand, ValidateCommand};
use deployflow::cli::output::*;
use deployflow::cli::terminal_output::TerminalProgressSink;
use deployflow::cli::{Cli, Command};
use deployflow::core::{ExecutionStatus, RunContext, WorkflowConfig};
use deployflow::events::{EventBus, LoggingHandler};
use deployflow::execution::{compose_orchestrator, OrchestratorDeps, WorkflowArgs, WorkflowMetrics};
use deployflow::persistence::{InMemoryPersistence, PersistenceBackend, RunSummary, SqliteRunStore};
use deployflow::progress::ProgressReporter;
use deployflow::resilience::{ErrorContextTracker, MultiErrorBudget};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn, Level};
use tracing_subscriber::FmtSubscriber;
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::from_args();

    // Initialize logging
    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(log_level).finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to set logging subscriber")?;

    // Execute command
    match &cli.command {
        Command::Run(cmd) => run_workflow(cmd, cli.verbose).await?,
        Command::Validate(cmd) => validate_workflow(cmd)?,
        Command::List(cmd) => list_workflows(cmd).await?,
        Command::History(cmd) => show_history(cmd).await?,
    }

    Ok(())
}

async fn run_workflow(cmd: &RunCommand, verbose: bool) -> Result<()> {
    let mut config = WorkflowConfig::from_file(&cmd.file).context("Failed to load workflow config")?;

    println!("{} Loaded workflow: {}", INFO, style(&config.name).bold());

    if let Some(step) = &cmd.fail_at {
        config.inject_failure(step, cmd.fail_times)?;
        println!(
            "{} Injecting {} failure(s) into {}",
            WARN,
            style(cmd.fail_times).yellow(),
            style(step).cyan()
        );
    }

    let mut input = match config.input.clone() {
        Value::Object(map) => map,
        Value::Null => serde_json::Map::new(),
        other => {
            let mut map = serde_json::Map::new();
            map.insert("input".to_string(), other);
            map
        }
    };
    for (key, value) in &cmd.input {
        input.insert(key.clone(), Value::String(value.clone()));
        println!("{} Input override: {} = {}", INFO, style(key).cyan(), style(value).dim());
    }

    let store: Arc<dyn PersistenceBackend> = if cmd.no_history {
        Arc::new(InMemoryPersistence::new())
    } else {
        Arc::new(SqliteRunStore::with_default_path().await?)
    };

    // Process-scoped collaborators
    let mut bus = EventBus::new();
    bus.subscribe_all(Arc::new(ConsoleEventHandler));
    if verbose {
        bus.subscribe_all(Arc::new(LoggingHandler));
    }
    let bus = Arc::new(bus);
    let budgets = Arc::new(MultiErrorBudget::new());
    let metrics = Arc::new(WorkflowMetrics::new());

    let sink = Arc::new(TerminalProgressSink::new(config.steps.len()));
    let pipeline = config
        .to_pipeline(Some(bus.clone()))
        .with_progress(ProgressReporter::new().with_sink(sink.clone()));
    let total_steps = config.steps.len();

    let orchestrator = compose_orchestrator(
        Arc::new(pipeline),
        OrchestratorDeps {
            events: bus,
            budgets: budgets.clone(),
            metrics: metrics.clone(),
            retry: config.retry_settings(),
        },
    );

    let workflow_id = cmd
        .workflow_id
        .clone()
        .unwrap_or_else(|| format!("{}-{}", config.name, &Uuid::new_v4().simple().to_string()[..8]));
    let mut ctx = RunContext::new(&workflow_id)
        .with_tracker(ErrorContextTracker::with_capacity(config.tracker_capacity));
    if let Some(timeout) = cmd.timeout_secs.map(Duration::from_secs).or_else(|| config.timeout()) {
        ctx = ctx.with_timeout(timeout);
    }

    let token = ctx.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling workflow");
            token.cancel();
        }
    });

    println!();
    let started_at = Utc::now();
    let result = orchestrator
        .execute(&ctx, WorkflowArgs::new(Value::Object(input)))
        .await;
    sink.finish();

    println!("\n{}", separator());
    let summary = match &result {
        Ok(res) => {
            println!("{}", format_report(&res.report));
            RunSummary::from_result(&config.name, started_at, res)
        }
        Err(err) => {
            if let Some(report) = err.report() {
                println!("{}", format_report(report));
            }
            RunSummary::from_error(&config.name, &workflow_id, total_steps, started_at, err)
        }
    };

    println!("{}", format_metrics(&metrics.snapshot()));
    for status in budgets.statuses() {
        println!("{}", format_budget(&status));
    }

    if let Err(err) = &result {
        if err.escalation().is_some() {
            println!("\n{} Error context for remediation:", WARN);
            println!("{}", serde_json::to_string_pretty(&ctx.tracker().ai_context())?);
        }
    }

    // Save to history
    store.save_run(&summary).await?;
    if !cmd.no_history {
        println!(
            "\n{} Run saved to history (ID: {})",
            INFO,
            style(&summary.run_id.to_string()[..8]).dim()
        );
    }

    match result {
        Ok(res) => {
            println!(
                "\n{} {} completed {} in {}",
                CHECK,
                style(&config.name).bold(),
                style("successfully").green(),
                format_duration(res.duration)
            );
            Ok(())
        }
        Err(err) => {
            println!("\n{} {} {}", CROSS, style(&config.name).bold(), style("failed").red());
            error!("{}", err);
            std::process::exit(1);
        }
    }
}

fn validate_workflow(cmd: &ValidateCommand) -> Result<()> {
    println!("{} Validating workflow...", INFO);

    match WorkflowConfig::from_file(&cmd.file) {
        Ok(config) => {
            println!("{} Workflow configuration is valid!", CHECK);
            println!("  Name: {}", style(&config.name).bold());
            println!("  Steps: {}", style(config.steps.len()).cyan());
            println!(
                "  Budget: {} ({} errors / {}s)",
                style(&config.retry.budget).cyan(),
                config.retry.max_errors,
                config.retry.window_secs
            );

            if cmd.json {
                let json = serde_json::to_string_pretty(&config)?;
                println!("\n{}", json);
            }
            Ok(())
        }
        Err(e) => {
            println!("{} Validation failed:", CROSS);
            println!("  {}", style(format!("{:#}", e)).red());
            std::process::exit(1);
        }
    }
}

async fn list_workflows(cmd: &ListCommand) -> Result<()> {
    let store = SqliteRunStore::with_default_path().await?;
    let workflows = store.list_workflows().await?;

    if workflows.is_empty() {
        println!("{} No workflows found in history", INFO);
        return Ok(());
    }

    println!("{} Workflows in history:", INFO);

    let mut json_data = Vec::new();
    for name in &workflows {
        let runs = store.list_runs(Some(name), usize::MAX >> 1).await?;
        let completed = runs.iter().filter(|r| r.status == ExecutionStatus::Completed).count();
        let failed = runs.iter().filter(|r| r.status == ExecutionStatus::Failed).count();

        if cmd.with_counts {
            println!(
                "  {} ({} runs: {} succeeded, {} failed)",
                style(name).bold(),
                style(runs.len()).cyan(),
                style(completed).green(),
                style(failed).red()
            );
        } else {
            println!("  {}", style(name).bold());
        }
        json_data.push(serde_json::json!({ "name": name, "run_count": runs.len() }));
    }

    if cmd.json {
        let data = serde_json::json!({ "workflows": json_data });
        println!("\n{}", serde_json::to_string_pretty(&data)?);
    }

    Ok(())
}

async fn show_history(cmd: &HistoryCommand) -> Result<()> {
    let store = SqliteRunStore::with_default_path().await?;

    if let Some(run_id) = &cmd.run_id {
        let run_id = Uuid::parse_str(run_id).context("Invalid run ID format")?;
        match store.load_run(run_id).await? {
            Some(summary) => print_run_details(&summary, cmd.json)?,
            None => println!("{} Run not found", WARN),
        }
        return Ok(());
    }

    let runs = store.list_runs(cmd.workflow.as_deref(), cmd.limit).await?;
    if runs.is_empty() {
        println!("{} No runs found", INFO);
        return Ok(());
    }

    if cmd.json {
        let data = serde_json::json!({ "runs": runs });
        println!("{}", serde_json::to_string_pretty(&data)?);
    } else {
        println!("{} Run history (showing latest {}):", INFO, cmd.limit);
        for summary in &runs {
            println!("  {}", format_run_summary(summary));
        }
    }

    Ok(())
}

fn print_run_details(summary: &RunSummary, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
        return Ok(());
    }

    println!("{} Run Details", INFO);
    println!("  ID: {}", style(summary.run_id).cyan());
    println!("  Workflow: {} ({})", style(&summary.workflow_name).bold(), summary.workflow_id);
    println!("  Status: {}", format_status(summary.status));
    println!("  Started: {}", style(summary.started_at.to_rfc3339()).dim());
    if let Some(completed) = summary.completed_at {
        println!("  Completed: {}", style(completed.to_rfc3339()).dim());
        if let Ok(duration) = completed.signed_duration_since(summary.started_at).to_std() {
            println!("  Duration: {}", style(format_duration(duration)).dim());
        }
    }
    println!(
        "  Steps: {}/{} succeeded, {} compensated",
        summary.steps_succeeded, summary.total_steps, summary.compensated_steps
    );
    println!("  Attempts: {}", summary.attempts);
    if let Some(error) = &summary.error {
        println!("  Error: {}", style(error).red());
    }
    if summary.escalated {
        println!("  {}", style("Escalated for remediation").yellow());
    }

    Ok(())
}
