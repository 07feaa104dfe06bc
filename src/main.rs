use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use cadence::telemetry::{LogFormat, TelemetryOptions, init_tracing};

mod cmd;

#[derive(Parser)]
#[command(name = "cadence")]
#[command(version, about = "Run-lifecycle orchestrator for multi-step scientific workflows")]
pub struct Cli {
    /// Workspace holding the `runs/` directory (defaults to the current directory)
    #[arg(long, global = true, env = "CADENCE_WORKSPACE")]
    pub workspace: Option<PathBuf>,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Console log format: text or json
    #[arg(long, global = true, default_value = "text")]
    pub log_format: LogFormat,

    /// Also write JSON logs to this directory
    #[arg(long, global = true)]
    pub log_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a new run
    Init {
        #[arg(long)]
        run_id: Option<String>,
        /// Workflow JSON file planned into the run
        #[arg(long)]
        workflow: Option<PathBuf>,
        /// Run config (TOML) copied into the run
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long = "tag")]
        tags: Vec<String>,
        #[arg(long)]
        description: Option<String>,
    },
    /// Resume the latest (or given) run, or start one, and tick it until it finishes
    Run {
        #[arg(long)]
        run_id: Option<String>,
        /// Resume the latest run even if it has finished
        #[arg(long)]
        always_resume: bool,
        #[arg(long)]
        workflow: Option<PathBuf>,
        /// Run config (TOML) copied into a newly created run
        #[arg(long)]
        config: Option<PathBuf>,
        /// Stop after this many ticks
        #[arg(long)]
        max_ticks: Option<u64>,
        /// Override the global concurrency limit
        #[arg(long)]
        max_concurrent: Option<usize>,
    },
    /// Run exactly one tick
    Step {
        #[arg(long)]
        run_id: String,
        /// Print the tick report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show a run and its tasks
    Status {
        /// Defaults to the latest run
        #[arg(long)]
        run_id: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// List runs in the workspace, newest first
    List,
    Pause {
        #[arg(long)]
        run_id: String,
    },
    Resume {
        #[arg(long)]
        run_id: String,
    },
    Cancel {
        #[arg(long)]
        run_id: String,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Mark attempts that were never submitted as FAILED_INIT
    Sweep {
        #[arg(long)]
        run_id: String,
        /// Age after which a CREATED attempt counts as orphaned
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    /// Record the outcome of an externally coordinated task
    External {
        #[arg(long)]
        run_id: String,
        #[arg(long)]
        task: String,
        /// RUNNING, COMPLETED, FAILED or CANCELLED
        #[arg(long)]
        status: String,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Delete a task with its attempts
    DeleteTask {
        #[arg(long)]
        run_id: String,
        #[arg(long)]
        task: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_tracing(&TelemetryOptions {
        verbose: cli.verbose,
        format: cli.log_format,
        log_dir: cli.log_dir.clone(),
    })?;
    let workspace = match cli.workspace.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Init {
            run_id,
            workflow,
            config,
            tags,
            description,
        } => {
            cmd::cmd_init(
                &workspace,
                cmd::InitArgs {
                    run_id: run_id.clone(),
                    workflow: workflow.clone(),
                    config: config.clone(),
                    tags: tags.clone(),
                    description: description.clone(),
                },
            )?;
        }
        Commands::Run {
            run_id,
            always_resume,
            workflow,
            config,
            max_ticks,
            max_concurrent,
        } => {
            cmd::cmd_run(
                &workspace,
                cmd::RunArgs {
                    run_id: run_id.clone(),
                    always_resume: *always_resume,
                    workflow: workflow.clone(),
                    config: config.clone(),
                    max_ticks: *max_ticks,
                    max_concurrent: *max_concurrent,
                },
            )
            .await?;
        }
        Commands::Step { run_id, json } => cmd::cmd_step(&workspace, run_id, *json)?,
        Commands::Status { run_id, json } => {
            cmd::cmd_status(&workspace, run_id.as_deref(), *json)?
        }
        Commands::List => cmd::cmd_list(&workspace)?,
        Commands::Pause { run_id } => cmd::cmd_pause(&workspace, run_id)?,
        Commands::Resume { run_id } => cmd::cmd_resume(&workspace, run_id)?,
        Commands::Cancel { run_id, reason } => {
            cmd::cmd_cancel(&workspace, run_id, reason.as_deref())?
        }
        Commands::Sweep {
            run_id,
            timeout_secs,
        } => cmd::cmd_sweep(&workspace, run_id, *timeout_secs)?,
        Commands::External {
            run_id,
            task,
            status,
            reason,
        } => cmd::cmd_external(&workspace, run_id, task, status, reason.as_deref())?,
        Commands::DeleteTask { run_id, task } => cmd::cmd_delete_task(&workspace, run_id, task)?,
    }

    Ok(())
}
