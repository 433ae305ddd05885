//! brain: run the Brain task-orchestration core and operate on its store.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context as _, Result};
use brain::{Brain, PlanRequest, SubmitRequest, TaskFilter, TaskStatus, TaskType};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;

mod config;
mod executor;

use config::CliConfig;
use executor::CommandExecutor;

/// Task-orchestration core: run workers, submit tasks, inspect state
#[derive(Parser)]
#[command(name = "brain")]
#[command(about = "Plan, schedule, dispatch and track typed tasks", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file
    #[arg(short, long, env = "BRAIN_CONFIG", default_value = "brain.toml", global = true)]
    config: PathBuf,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler, dispatcher and configured executors until Ctrl-C
    Run,

    /// Submit a task or plan from a JSON file (`-` for stdin)
    ///
    /// A document with a `tasks` array is a plan; anything else is a
    /// single task request.
    Submit {
        /// Request file
        file: PathBuf,
    },

    /// Show one task, or a summary when no id is given
    Status {
        /// Task id
        id: Option<String>,
    },

    /// List tasks, newest first
    List {
        /// Only these statuses (repeatable)
        #[arg(long = "status")]
        statuses: Vec<TaskStatus>,

        /// Only these types (repeatable)
        #[arg(long = "type")]
        types: Vec<TaskType>,

        /// Only children of this parent
        #[arg(long)]
        parent: Option<String>,

        /// Only tasks created at or after this RFC 3339 time
        #[arg(long)]
        since: Option<DateTime<Utc>>,

        /// Only tasks created before this RFC 3339 time
        #[arg(long)]
        until: Option<DateTime<Utc>>,

        /// Page size
        #[arg(long, default_value = "50")]
        limit: usize,

        /// Continue after this cursor
        #[arg(long)]
        cursor: Option<String>,
    },

    /// Cancel a task
    Cancel { id: String },

    /// Pause a pending or ready task
    Pause { id: String },

    /// Resume a paused task
    Resume { id: String },

    /// Retry a failed task, or skip a ready task's backoff
    Retry { id: String },

    /// Manage schedule rules
    Rules {
        #[command(subcommand)]
        command: RuleCommands,
    },

    /// Remove finished tasks past the retention window
    Archive,
}

#[derive(Subcommand)]
enum RuleCommands {
    /// List every rule
    List,
    /// Enable a rule; its next fire time is recomputed from now
    Enable { id: String },
    /// Stop a rule from firing
    Disable { id: String },
    /// Delete a rule
    Remove { id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = CliConfig::load(&cli.config)?;
    let brain = build(&config).await?;

    if !matches!(cli.command, Commands::Run) && config.brain.storage == brain::config::StorageConfig::Memory {
        tracing::warn!("memory storage is private to this process; configure [brain.storage] to share state");
    }

    execute_command(&brain, cli.command).await
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default.into()),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn build(config: &CliConfig) -> Result<Brain> {
    let mut builder = Brain::builder(config.brain.clone());
    for (task_type, spec) in &config.executors {
        builder = builder.with_executor(*task_type, Arc::new(CommandExecutor::new(spec.clone())));
    }
    builder.build().await.context("failed to initialize brain")
}

async fn execute_command(brain: &Brain, command: Commands) -> Result<()> {
    match command {
        Commands::Run => run(brain).await?,
        Commands::Submit { file } => {
            let outcome = submit(brain, &file).await?;
            print_json(&outcome)?;
        },
        Commands::Status { id: Some(id) } => print_json(&brain.get_status(&id).await?)?,
        Commands::Status { id: None } => print_json(&brain.status().await?)?,
        Commands::List {
            statuses,
            types,
            parent,
            since,
            until,
            limit,
            cursor,
        } => {
            let filter = TaskFilter {
                statuses,
                task_types: types,
                parent_id: parent,
                created_after: since,
                created_before: until,
                limit: Some(limit),
                cursor,
                ..TaskFilter::default()
            };
            print_json(&brain.list(&filter).await?)?;
        },
        Commands::Cancel { id } => print_json(&brain.cancel(&id).await?)?,
        Commands::Pause { id } => print_json(&brain.pause(&id).await?)?,
        Commands::Resume { id } => print_json(&brain.resume(&id).await?)?,
        Commands::Retry { id } => print_json(&brain.retry(&id).await?)?,
        Commands::Rules { command } => match command {
            RuleCommands::List => print_json(&brain.list_rules().await?)?,
            RuleCommands::Enable { id } => print_json(&brain.enable_rule(&id).await?)?,
            RuleCommands::Disable { id } => print_json(&brain.disable_rule(&id).await?)?,
            RuleCommands::Remove { id } => {
                brain.remove_rule(&id).await?;
                println!("removed {id}");
            },
        },
        Commands::Archive => {
            let archived = brain.archive(Utc::now()).await?;
            print_json(&archived)?;
        },
    }
    Ok(())
}

async fn run(brain: &Brain) -> Result<()> {
    if brain.supported_types().is_empty() {
        anyhow::bail!("no executors configured; add [executors.<TYPE>] tables to the config");
    }
    brain.start().await?;
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    brain.shutdown().await;
    Ok(())
}

async fn submit(brain: &Brain, file: &Path) -> Result<brain::SubmitOutcome> {
    let content = if file == Path::new("-") {
        std::io::read_to_string(std::io::stdin()).context("failed to read stdin")?
    } else {
        std::fs::read_to_string(file).with_context(|| format!("failed to read {}", file.display()))?
    };
    let document: serde_json::Value =
        serde_json::from_str(&content).context("request is not valid JSON")?;

    let outcome = if document.get("tasks").is_some() {
        let plan: PlanRequest = serde_json::from_value(document).context("invalid plan")?;
        brain.submit_plan(plan).await?
    } else {
        let request: SubmitRequest = serde_json::from_value(document).context("invalid request")?;
        brain.submit(request).await?
    };
    Ok(outcome)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
