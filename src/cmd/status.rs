//! Read-only views: `cadence status` and `cadence list`.

use anyhow::{Result, bail};
use console::{StyledObject, style};
use serde_json::json;
use std::path::Path;

use cadence::orchestrator::lifecycle::run_ids;
use cadence::orchestrator::list_runs;

use super::open_engine;

/// Colour a run, task or attempt status for the terminal.
pub(crate) fn status_style(status: &str) -> StyledObject<&str> {
    match status {
        "COMPLETED" => style(status).green(),
        "FAILED" | "FAILED_INIT" => style(status).red(),
        "CANCELLED" => style(status).dim(),
        "RUNNING" | "SUBMITTED" => style(status).cyan(),
        "PAUSED" | "WAITING_EXTERNAL" => style(status).yellow(),
        _ => style(status),
    }
}

pub fn cmd_status(workspace: &Path, run_id: Option<&str>, json_output: bool) -> Result<()> {
    let run_id = match run_id {
        Some(id) => id.to_string(),
        None => match run_ids(workspace)?.into_iter().next() {
            Some(latest) => latest,
            None => bail!("No runs found in {}", workspace.display()),
        },
    };
    let engine = open_engine(workspace, &run_id)?;
    let store = engine.store();
    let run = engine.run()?;
    let tasks = store.list_tasks(&run_id)?;

    if json_output {
        let mut task_views = Vec::with_capacity(tasks.len());
        for task in &tasks {
            let attempts = store.list_attempts_for_task(&run_id, &task.task_id)?;
            task_views.push(json!({ "task": task, "attempts": attempts }));
        }
        let external = store.list_external_runs(&run_id)?;
        let view = json!({ "run": run, "tasks": task_views, "external_runs": external });
        println!("{}", serde_json::to_string_pretty(&view)?);
        return Ok(());
    }

    println!(
        "Run {} [{}]",
        style(&run.run_id).bold(),
        status_style(run.status.as_str())
    );
    if let Some(reason) = &run.status_reason {
        println!("  Reason: {}", reason);
    }
    if let Some(description) = &run.description {
        println!("  {}", description);
    }
    if !run.tags.is_empty() {
        println!("  Tags: {}", run.tags.join(", "));
    }
    println!("  Updated: {}", run.updated_at);
    println!();

    if tasks.is_empty() {
        println!("No tasks.");
        return Ok(());
    }
    println!("{:<24} {:<18} {:<10} {}", "TASK", "STATUS", "ATTEMPTS", "OPERATOR");
    for task in &tasks {
        let attempts = store.list_attempts_for_task(&run_id, &task.task_id)?;
        let operator = attempts
            .last()
            .and_then(|a| a.operator_key.clone())
            .or_else(|| task.operator_key.clone())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<24} {:<18} {:<10} {}",
            task.task_id,
            status_style(task.status.as_str()),
            attempts.len(),
            operator
        );
        if let Some(reason) = attempts.last().and_then(|a| a.status_reason.as_deref()) {
            println!("  {}", style(reason).dim());
        }
    }
    Ok(())
}

pub fn cmd_list(workspace: &Path) -> Result<()> {
    let runs = list_runs(workspace)?;
    if runs.is_empty() {
        println!("No runs found in {}", workspace.display());
        return Ok(());
    }
    println!("{:<34} {}", "RUN", "STATUS");
    for summary in runs {
        match (summary.status, summary.error) {
            (Some(status), _) => {
                println!("{:<34} {}", summary.run_id, status_style(status.as_str()))
            }
            (None, error) => println!(
                "{:<34} {}",
                summary.run_id,
                style(format!("unreadable: {}", error.unwrap_or_default())).red()
            ),
        }
    }
    Ok(())
}
