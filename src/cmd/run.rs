//! Creating and advancing runs: `cadence init`, `cadence run`, `cadence step`.

use anyhow::{Context, Result};
use console::style;
use std::path::{Path, PathBuf};

use cadence::campaign::WorkflowFileCampaign;
use cadence::orchestrator::{
    DriveOptions, InitOptions, RunEngine, RunOrigin, StopReason, TickReport, drive_run,
    initialize_or_resume_run, initialize_run,
};
use cadence_common::RunContext;

use super::open_engine;
use super::status::status_style;

pub struct InitArgs {
    pub run_id: Option<String>,
    pub workflow: Option<PathBuf>,
    pub config: Option<PathBuf>,
    pub tags: Vec<String>,
    pub description: Option<String>,
}

pub struct RunArgs {
    pub run_id: Option<String>,
    pub always_resume: bool,
    pub workflow: Option<PathBuf>,
    pub config: Option<PathBuf>,
    pub max_ticks: Option<u64>,
    pub max_concurrent: Option<usize>,
}

pub fn cmd_init(workspace: &Path, args: InitArgs) -> Result<()> {
    let mut campaign = WorkflowFileCampaign::from_optional_file(args.workflow.as_deref());
    let options = InitOptions {
        run_id: args.run_id,
        tags: args.tags,
        description: args.description,
        config_file: args.config,
    };
    let ctx = initialize_run(workspace, &mut campaign, &options).context("Failed to create run")?;

    println!("{} Created run {}", style("✓").green(), style(&ctx.run_id).bold());
    println!("  Root: {}", ctx.root.display());
    Ok(())
}

pub async fn cmd_run(workspace: &Path, args: RunArgs) -> Result<()> {
    let mut campaign = WorkflowFileCampaign::from_optional_file(args.workflow.as_deref());
    let options = InitOptions {
        run_id: args.run_id,
        config_file: args.config,
        ..InitOptions::default()
    };
    let (ctx, origin) =
        initialize_or_resume_run(workspace, &mut campaign, &options, args.always_resume)?;
    match origin {
        RunOrigin::Created => println!("Created run {}", style(&ctx.run_id).bold()),
        RunOrigin::Resumed => println!("Resuming run {}", style(&ctx.run_id).bold()),
    }

    let engine = open_run_engine(ctx, campaign, args.max_concurrent)?;
    let drive = DriveOptions::from_config(&engine.config().driver).with_max_ticks(args.max_ticks);
    let (engine, outcome) = drive_run(engine, drive).await?;

    let run = engine.run()?;
    let why = match outcome.stop {
        StopReason::Terminal => "finished",
        StopReason::TickBudget => "tick budget reached",
        StopReason::Interrupted => "interrupted",
    };
    println!(
        "Run {} is {} after {} tick(s) ({})",
        style(&run.run_id).bold(),
        status_style(run.status.as_str()),
        outcome.ticks,
        why
    );
    if let Some(reason) = &run.status_reason {
        println!("  Reason: {}", reason);
    }
    Ok(())
}

/// Open a run for driving, keeping the caller's campaign so follow-up
/// planning can still read its workflow source.
fn open_run_engine(
    ctx: RunContext,
    campaign: WorkflowFileCampaign,
    max_concurrent: Option<usize>,
) -> Result<RunEngine> {
    let engine = RunEngine::open(ctx, Box::new(campaign))?;
    if max_concurrent.is_none() {
        return Ok(engine);
    }
    let config = engine.config().clone().with_max_concurrent(max_concurrent);
    Ok(engine.with_config(config)?)
}

pub fn cmd_step(workspace: &Path, run_id: &str, json: bool) -> Result<()> {
    let mut engine = open_engine(workspace, run_id)?;
    let report = engine.step_run()?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_tick(&report);
    }
    Ok(())
}

fn print_tick(report: &TickReport) {
    println!(
        "Run {} → {}",
        style(&report.run_id).bold(),
        status_style(report.status.as_str())
    );
    println!(
        "  Polled {} attempt(s): {} transition(s), {} task(s) healed",
        report.poll.polled, report.poll.transitions, report.poll.healed
    );
    println!(
        "  Dispatched {}  failed {}  external {}  simulated {}  postponed {}",
        report.dispatched,
        report.dispatch_failures,
        report.external,
        report.simulated,
        report.postponed
    );
    if report.planned > 0 {
        println!("  Campaign planned {} new task(s)", report.planned);
    }
    let plan = &report.plan;
    println!(
        "  Tasks: {} ready, {} active ({} blocked), {} completed, {} failed, {} tolerated",
        plan.ready,
        plan.active,
        plan.blocked,
        plan.completed,
        plan.failed_blocking,
        plan.failed_tolerated
    );
}
