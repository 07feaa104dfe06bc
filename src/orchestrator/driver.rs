//! Long-running tick loop.
//!
//! Each tick runs on a blocking thread. Lock contention is retried after a
//! short fixed backoff; PENDING, RUNNING and PAUSED runs are re-ticked after
//! the poll interval. The loop ends on a terminal status, Ctrl-C, or the
//! tick budget.

use std::time::Duration;

use super::engine::RunEngine;
use super::tick::TickReport;
use crate::config::DriverConfig;
use crate::errors::EngineError;
use crate::lock::RunLock;

#[derive(Debug, Clone)]
pub struct DriveOptions {
    pub poll_interval: Duration,
    pub lock_retry: Duration,
    /// Stop after this many tick attempts.
    pub max_ticks: Option<u64>,
    /// Sweep orphaned attempts once before the first tick.
    pub orphan_timeout: Option<Duration>,
}

impl DriveOptions {
    pub fn from_config(config: &DriverConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            lock_retry: config.lock_retry(),
            max_ticks: None,
            orphan_timeout: Some(config.orphan_timeout()),
        }
    }

    pub fn with_max_ticks(mut self, max_ticks: Option<u64>) -> Self {
        self.max_ticks = max_ticks;
        self
    }
}

/// Why the loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Terminal,
    TickBudget,
    Interrupted,
}

#[derive(Debug, Clone)]
pub struct DriveOutcome {
    pub ticks: u64,
    pub stop: StopReason,
    pub last_report: Option<TickReport>,
}

pub async fn drive_run<L>(
    mut engine: RunEngine<L>,
    options: DriveOptions,
) -> Result<(RunEngine<L>, DriveOutcome), EngineError>
where
    L: RunLock + Send + 'static,
{
    if let Some(timeout) = options.orphan_timeout {
        let (back, swept) = tokio::task::spawn_blocking(move || {
            let swept = engine.sweep_orphans(timeout);
            (engine, swept)
        })
        .await?;
        engine = back;
        match swept {
            Ok(_) => {}
            Err(e) if e.is_lock_contention() => {
                tracing::debug!("orphan sweep skipped; run is locked");
            }
            Err(e) => return Err(e),
        }
    }

    let mut ticks = 0u64;
    let mut last_report = None;
    let stop = loop {
        if options.max_ticks.is_some_and(|max| ticks >= max) {
            break StopReason::TickBudget;
        }

        let (back, result) = tokio::task::spawn_blocking(move || {
            let result = engine.step_run();
            (engine, result)
        })
        .await?;
        engine = back;
        ticks += 1;

        let wait = match result {
            Ok(report) => {
                let terminal = report.status.is_terminal();
                last_report = Some(report);
                if terminal {
                    break StopReason::Terminal;
                }
                options.poll_interval
            }
            Err(e) if e.is_lock_contention() => {
                tracing::warn!(run_id = %engine.run_id(), retry_in = ?options.lock_retry, "run is locked by another process");
                options.lock_retry
            }
            Err(e) => return Err(e),
        };
        if options.max_ticks.is_some_and(|max| ticks >= max) {
            break StopReason::TickBudget;
        }

        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = tokio::signal::ctrl_c() => {
                tracing::info!(run_id = %engine.run_id(), "interrupted; stopping after the current tick");
                break StopReason::Interrupted;
            }
        }
    };

    Ok((
        engine,
        DriveOutcome {
            ticks,
            stop,
            last_report,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunConfig;
    use crate::lock::FileRunLock;
    use crate::orchestrator::engine::test_support::engine_with_tasks;
    use cadence_common::{RunStatus, Task};
    use tempfile::tempdir;

    fn fast() -> DriveOptions {
        DriveOptions {
            poll_interval: Duration::from_millis(1),
            lock_retry: Duration::from_millis(1),
            max_ticks: None,
            orphan_timeout: None,
        }
    }

    #[tokio::test]
    async fn test_drives_to_completion() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let engine = engine_with_tasks(
            dir.path(),
            vec![
                Task::new("a", "A"),
                Task::new("b", "B").with_dependencies(&["a"]),
                Task::new("c", "C").with_dependencies(&["b"]),
            ],
            RunConfig::default(),
        )?;
        let (engine, outcome) = drive_run(engine, fast()).await?;
        assert_eq!(outcome.stop, StopReason::Terminal);
        assert_eq!(outcome.ticks, 3);
        assert_eq!(engine.run()?.status, RunStatus::Completed);
        Ok(())
    }

    #[tokio::test]
    async fn test_tick_budget_counts_contended_ticks() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let engine = engine_with_tasks(dir.path(), vec![], RunConfig::default())?;
        let held = FileRunLock::new(engine.context().lock_path()).try_acquire()?;

        let (engine, outcome) = drive_run(engine, fast().with_max_ticks(Some(2))).await?;
        assert_eq!(outcome.stop, StopReason::TickBudget);
        assert_eq!(outcome.ticks, 2);
        assert!(outcome.last_report.is_none());

        drop(held);
        let (_, outcome) = drive_run(engine, fast()).await?;
        assert_eq!(outcome.stop, StopReason::Terminal);
        Ok(())
    }
}
