//! CLI command definitions

use clap::Args;

/// Run a workflow
#[derive(Debug, Args, Clone)]
pub struct RunCommand {
    /// Path to workflow YAML file
    #[arg(short, long)]
    pub file: String,

    /// Input payload overrides (key=value)
    #[arg(long, value_parser = parse_key_value)]
    pub input: Vec<(String, String)>,

    /// Inject failures into this step
    #[arg(long)]
    pub fail_at: Option<String>,

    /// Number of executions of --fail-at that fail
    #[arg(long, default_value_t = 1, requires = "fail_at")]
    pub fail_times: u32,

    /// Workflow id for this run (generated when omitted)
    #[arg(long)]
    pub workflow_id: Option<String>,

    /// Deadline for the whole run, overriding the workflow file
    #[arg(long)]
    pub timeout_secs: Option<u64>,

    /// Don't save the run to history
    #[arg(long)]
    pub no_history: bool,
}

/// Validate a workflow configuration
#[derive(Debug, Args, Clone)]
pub struct ValidateCommand {
    /// Path to workflow YAML file
    #[arg(short, long)]
    pub file: String,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// List workflows with saved runs
#[derive(Debug, Args, Clone)]
pub struct ListCommand {
    /// Show run counts
    #[arg(long)]
    pub with_counts: bool,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Show run history
#[derive(Debug, Args, Clone)]
pub struct HistoryCommand {
    /// Workflow name to filter by
    #[arg(short, long)]
    pub workflow: Option<String>,

    /// Number of recent runs to show
    #[arg(short, long, default_value_t = 10)]
    pub limit: usize,

    /// Show a single run
    #[arg(long)]
    pub run_id: Option<String>,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Parse key=value pairs
pub fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let parts: Vec<&str> = s.splitn(2, '=').collect();
    if parts.len() != 2 {
        return Err(format!("Invalid key=value pair: {}", s));
    }
    Ok((parts[0].to_string(), parts[1].to_string()))
}
