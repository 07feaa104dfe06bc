//! The per-run engine: store, config, operators and campaign for one run.
//!
//! Every state-changing entry point takes the run lock first and holds it
//! until it returns. [`RunEngine::step_run`] (in `tick.rs`) is the tick; the
//! rest are administrative operations.

use std::time::Duration;

use cadence_common::{
    AttemptStatus, Campaign, Run, RunContext, RunStatus, TaskKind,
};

use super::reconcile::heal_task_statuses;
use crate::config::RunConfig;
use crate::errors::{EngineError, StoreError};
use crate::lock::{FileRunLock, RunLock};
use crate::operator::OperatorRegistry;
use crate::store::{AttemptUpdate, ExternalRunUpdate, StateStore};

/// Reason recorded on attempts cleared by the orphan sweep.
pub const ORPHAN_REASON: &str = "never submitted; swept as orphaned";

pub struct RunEngine<L: RunLock = FileRunLock> {
    pub(crate) ctx: RunContext,
    pub(crate) store: StateStore,
    pub(crate) config: RunConfig,
    pub(crate) registry: OperatorRegistry,
    pub(crate) campaign: Box<dyn Campaign>,
    pub(crate) lock: L,
}

impl RunEngine<FileRunLock> {
    /// Open an existing run: its store, its `config` file (with environment
    /// overrides) and the operator registry built from that config.
    pub fn open(ctx: RunContext, campaign: Box<dyn Campaign>) -> Result<Self, EngineError> {
        if !ctx.store_path().exists() {
            return Err(StoreError::not_found("run", ctx.run_id.clone()).into());
        }
        let config = RunConfig::load_with_env(&ctx.config_path())?;
        let registry = OperatorRegistry::from_config(&config)?;
        let store = StateStore::open(&ctx.store_path())?;
        let lock = FileRunLock::new(ctx.lock_path());
        Ok(Self::new(ctx, store, config, registry, campaign, lock))
    }
}

impl<L: RunLock> RunEngine<L> {
    pub fn new(
        ctx: RunContext,
        store: StateStore,
        config: RunConfig,
        registry: OperatorRegistry,
        campaign: Box<dyn Campaign>,
        lock: L,
    ) -> Self {
        Self {
            ctx,
            store,
            config,
            registry,
            campaign,
            lock,
        }
    }

    /// Replace the run config, rebuilding the registry from it.
    pub fn with_config(mut self, config: RunConfig) -> Result<Self, EngineError> {
        self.registry = OperatorRegistry::from_config(&config)?;
        self.config = config;
        Ok(self)
    }

    pub fn with_registry(mut self, registry: OperatorRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn context(&self) -> &RunContext {
        &self.ctx
    }

    pub fn run_id(&self) -> &str {
        &self.ctx.run_id
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// The persisted run, located at the directory this engine opened.
    ///
    /// `workspace` and `root` come from the engine's context, not the row:
    /// the stored paths go stale when a workspace is moved or was recorded
    /// relative to another working directory.
    pub fn run(&self) -> Result<Run, EngineError> {
        let mut run = self.store.get_run(&self.ctx.run_id)?;
        run.workspace = self.ctx.workspace.display().to_string();
        run.root = self.ctx.root.display().to_string();
        Ok(run)
    }

    // ── Administrative operations ─────────────────────────────────────

    /// Stop dispatching and polling until resumed. Terminal runs are refused.
    pub fn pause_run(&self) -> Result<RunStatus, EngineError> {
        let _guard = self.lock.try_acquire()?;
        let status = self.store.get_run_status(&self.ctx.run_id)?;
        if status.is_terminal() {
            return Err(terminal_error(status, "cannot pause a finished run"));
        }
        if status != RunStatus::Paused {
            self.store
                .set_run_status(&self.ctx.run_id, RunStatus::Paused, None)?;
            tracing::info!(run_id = %self.ctx.run_id, "run paused");
        }
        Ok(RunStatus::Paused)
    }

    /// PAUSED → RUNNING. Other statuses are returned unchanged.
    pub fn resume_run(&self) -> Result<RunStatus, EngineError> {
        let _guard = self.lock.try_acquire()?;
        let status = self.store.get_run_status(&self.ctx.run_id)?;
        if status != RunStatus::Paused {
            return Ok(status);
        }
        self.store
            .set_run_status(&self.ctx.run_id, RunStatus::Running, None)?;
        tracing::info!(run_id = %self.ctx.run_id, "run resumed");
        Ok(RunStatus::Running)
    }

    /// Cancel the run and every non-terminal attempt and legacy run.
    /// Already-committed external work is not interrupted.
    pub fn cancel_run(&self, reason: Option<&str>) -> Result<RunStatus, EngineError> {
        let _guard = self.lock.try_acquire()?;
        let run_id = &self.ctx.run_id;
        let status = self.store.get_run_status(run_id)?;
        if status.is_terminal() {
            return Err(terminal_error(status, "cannot cancel a finished run"));
        }
        let reason = reason.unwrap_or("cancelled by operator request");

        for attempt in self.store.get_active_attempts(run_id)? {
            self.store.update_attempt(
                &attempt.attempt_id,
                &AttemptUpdate::status(AttemptStatus::Cancelled).with_reason(reason),
            )?;
        }
        for legacy in self.store.list_external_runs(run_id)? {
            if !legacy.is_terminal() {
                self.store.update_external_run(
                    &legacy.task_id,
                    &ExternalRunUpdate {
                        status: Some(AttemptStatus::Cancelled),
                        ..ExternalRunUpdate::default()
                    },
                )?;
            }
        }
        heal_task_statuses(&self.store, run_id)?;
        self.store
            .set_run_status(run_id, RunStatus::Cancelled, Some(reason))?;
        tracing::info!(run_id = %run_id, reason, "run cancelled");
        Ok(RunStatus::Cancelled)
    }

    /// Mark attempts stuck in CREATED without an external id for longer than
    /// `timeout` as FAILED_INIT, then heal task statuses. Returns how many.
    pub fn sweep_orphans(&self, timeout: Duration) -> Result<usize, EngineError> {
        let _guard = self.lock.try_acquire()?;
        let orphans = self
            .store
            .find_orphaned_attempts(&self.ctx.run_id, timeout)?;
        let ids: Vec<String> = orphans.into_iter().map(|a| a.attempt_id).collect();
        let swept = self.store.mark_attempts_failed_init(&ids, ORPHAN_REASON)?;
        if swept > 0 {
            heal_task_statuses(&self.store, &self.ctx.run_id)?;
            tracing::warn!(run_id = %self.ctx.run_id, swept, "orphaned attempts marked FAILED_INIT");
        }
        Ok(swept)
    }

    /// Record the out-of-band outcome of an externally coordinated task.
    pub fn complete_external(
        &self,
        task_id: &str,
        status: AttemptStatus,
        reason: Option<&str>,
    ) -> Result<(), EngineError> {
        let _guard = self.lock.try_acquire()?;
        let run_id = &self.ctx.run_id;
        let task = self.store.get_task(run_id, task_id)?;
        let Some(legacy) = self.store.get_external_run(task_id)? else {
            return Err(EngineError::NotExternal {
                task_id: task_id.to_string(),
            });
        };
        if task.kind != TaskKind::External && legacy.operator_type.is_some() {
            return Err(EngineError::NotExternal {
                task_id: task_id.to_string(),
            });
        }
        if !status.is_terminal() && status != AttemptStatus::Running {
            return Err(EngineError::InvalidStatus {
                value: status.to_string(),
                message: "external completion must be RUNNING or terminal".to_string(),
            });
        }

        let mut update = ExternalRunUpdate {
            status: Some(status),
            ..ExternalRunUpdate::default()
        };
        if let Some(reason) = reason {
            let mut data = legacy.operator_data.clone();
            data.insert("reason".to_string(), serde_json::json!(reason));
            update.operator_data = Some(data);
        }
        self.store.update_external_run(task_id, &update)?;
        heal_task_statuses(&self.store, run_id)?;
        tracing::info!(run_id = %run_id, task_id, status = %status, "external task updated");
        Ok(())
    }

    /// Remove a task with its attempts and legacy run.
    pub fn delete_task(&self, task_id: &str) -> Result<(), EngineError> {
        let _guard = self.lock.try_acquire()?;
        self.store.delete_task(&self.ctx.run_id, task_id)?;
        tracing::info!(run_id = %self.ctx.run_id, task_id, "task deleted");
        Ok(())
    }
}

fn terminal_error(status: RunStatus, message: &str) -> EngineError {
    EngineError::InvalidStatus {
        value: status.to_string(),
        message: message.to_string(),
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::engine_with_tasks;
    use super::*;
    use cadence_common::{Task, TaskStatus};
    use tempfile::tempdir;

    #[test]
    fn test_pause_resume_cycle() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let engine = engine_with_tasks(dir.path(), vec![Task::new("t1", "T1")], RunConfig::default())?;
        assert_eq!(engine.pause_run()?, RunStatus::Paused);
        assert_eq!(engine.pause_run()?, RunStatus::Paused);
        assert_eq!(engine.resume_run()?, RunStatus::Running);
        assert_eq!(engine.resume_run()?, RunStatus::Running);
        Ok(())
    }

    #[test]
    fn test_cancel_marks_active_attempts() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let engine = engine_with_tasks(dir.path(), vec![Task::new("t1", "T1")], RunConfig::default())?;
        let attempt = engine
            .store
            .create_attempt("r1", "t1", Some("hpc"), Some("hpc"), AttemptStatus::Submitted)?;

        assert_eq!(engine.cancel_run(Some("budget exhausted"))?, RunStatus::Cancelled);
        let attempt = engine.store.get_attempt(&attempt.attempt_id)?;
        assert_eq!(attempt.status, "CANCELLED");
        assert_eq!(engine.store.get_task("r1", "t1")?.status, TaskStatus::Cancelled);
        let run = engine.run()?;
        assert_eq!(run.status_reason.as_deref(), Some("budget exhausted"));

        assert!(matches!(
            engine.pause_run(),
            Err(EngineError::InvalidStatus { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_admin_operations_respect_the_lock() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let engine = engine_with_tasks(dir.path(), vec![Task::new("t1", "T1")], RunConfig::default())?;
        let _held = FileRunLock::new(engine.context().lock_path()).try_acquire()?;
        let err = engine.pause_run().unwrap_err();
        assert!(err.is_lock_contention());
        Ok(())
    }

    #[test]
    fn test_sweep_orphans() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let engine = engine_with_tasks(dir.path(), vec![Task::new("t1", "T1")], RunConfig::default())?;
        let attempt = engine
            .store
            .create_attempt("r1", "t1", Some("hpc"), Some("hpc"), AttemptStatus::Created)?;

        assert_eq!(engine.sweep_orphans(Duration::from_secs(3600))?, 0);
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(engine.sweep_orphans(Duration::ZERO)?, 1);
        let attempt = engine.store.get_attempt(&attempt.attempt_id)?;
        assert_eq!(attempt.status, "FAILED_INIT");
        assert_eq!(attempt.status_reason.as_deref(), Some(ORPHAN_REASON));
        assert_eq!(engine.store.get_task("r1", "t1")?.status, TaskStatus::Failed);
        Ok(())
    }

    #[test]
    fn test_complete_external() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let engine = engine_with_tasks(
            dir.path(),
            vec![
                Task::new("ext", "Vendor assay").with_kind(TaskKind::External),
                Task::new("t2", "T2"),
            ],
            RunConfig::default(),
        )?;
        engine
            .store
            .upsert_external_run("r1", "ext", None, AttemptStatus::WaitingExternal)?;

        assert!(matches!(
            engine.complete_external("t2", AttemptStatus::Completed, None),
            Err(EngineError::NotExternal { .. })
        ));
        assert!(matches!(
            engine.complete_external("ext", AttemptStatus::Created, None),
            Err(EngineError::InvalidStatus { .. })
        ));

        engine.complete_external("ext", AttemptStatus::Completed, Some("assay passed"))?;
        let legacy = engine.store.get_external_run("ext")?.unwrap();
        assert_eq!(legacy.status, "COMPLETED");
        assert_eq!(legacy.operator_data["reason"], "assay passed");
        assert_eq!(engine.store.get_task("r1", "ext")?.status, TaskStatus::Completed);
        Ok(())
    }

    #[test]
    fn test_delete_task() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let engine = engine_with_tasks(dir.path(), vec![Task::new("t1", "T1")], RunConfig::default())?;
        engine.delete_task("t1")?;
        assert!(!engine.store.task_exists("r1", "t1")?);
        assert!(matches!(
            engine.delete_task("t1"),
            Err(EngineError::Store(StoreError::NotFound { .. }))
        ));
        Ok(())
    }
}
