//! Administrative run operations.

use anyhow::{Result, anyhow};
use console::style;
use std::path::Path;
use std::time::Duration;

use cadence_common::AttemptStatus;

use super::open_engine;
use super::status::status_style;

pub fn cmd_pause(workspace: &Path, run_id: &str) -> Result<()> {
    let status = open_engine(workspace, run_id)?.pause_run()?;
    println!("Run {} is {}", style(run_id).bold(), status_style(status.as_str()));
    Ok(())
}

pub fn cmd_resume(workspace: &Path, run_id: &str) -> Result<()> {
    let status = open_engine(workspace, run_id)?.resume_run()?;
    println!("Run {} is {}", style(run_id).bold(), status_style(status.as_str()));
    Ok(())
}

pub fn cmd_cancel(workspace: &Path, run_id: &str, reason: Option<&str>) -> Result<()> {
    let status = open_engine(workspace, run_id)?.cancel_run(reason)?;
    println!("Run {} is {}", style(run_id).bold(), status_style(status.as_str()));
    Ok(())
}

pub fn cmd_sweep(workspace: &Path, run_id: &str, timeout_secs: Option<u64>) -> Result<()> {
    let engine = open_engine(workspace, run_id)?;
    let timeout = timeout_secs
        .map(Duration::from_secs)
        .unwrap_or_else(|| engine.config().driver.orphan_timeout());
    let swept = engine.sweep_orphans(timeout)?;
    if swept == 0 {
        println!("No orphaned attempts in run {}", style(run_id).bold());
    } else {
        println!(
            "{} Marked {} orphaned attempt(s) as FAILED_INIT",
            style("!").yellow(),
            swept
        );
    }
    Ok(())
}

pub fn cmd_external(
    workspace: &Path,
    run_id: &str,
    task_id: &str,
    status: &str,
    reason: Option<&str>,
) -> Result<()> {
    let status: AttemptStatus = status.parse().map_err(|e: String| anyhow!(e))?;
    open_engine(workspace, run_id)?.complete_external(task_id, status, reason)?;
    println!(
        "{} Task {} is {}",
        style("✓").green(),
        style(task_id).bold(),
        status_style(status.as_str())
    );
    Ok(())
}

pub fn cmd_delete_task(workspace: &Path, run_id: &str, task_id: &str) -> Result<()> {
    open_engine(workspace, run_id)?.delete_task(task_id)?;
    println!("{} Deleted task {}", style("✓").green(), style(task_id).bold());
    Ok(())
}
