//! The tick: poll, plan, execute, analyze.
//!
//! A tick is re-entrant and idempotent: it reads everything it needs from
//! the store, so a crash at any point is repaired by the next tick.

use cadence_common::{RunStatus, Task, TaskOutcome};
use serde::Serialize;

use super::dispatch::{DispatchOutcome, dispatch_task};
use super::engine::RunEngine;
use super::limiter::ConcurrencyLimiter;
use super::reconcile::{PollReport, poll_run, tasks_with_active_work};
use crate::dag::{Plan, PlanSummary, plan_tasks};
use crate::errors::EngineError;
use crate::lock::RunLock;
use crate::operator::routing::route_task;

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TickReport {
    pub run_id: String,
    pub status: RunStatus,
    pub poll: PollReport,
    /// Tasks handed to an operator.
    pub dispatched: usize,
    /// Dispatches whose prepare or submit failed.
    pub dispatch_failures: usize,
    /// Tasks handed to the external coordination stub.
    pub external: usize,
    pub simulated: usize,
    /// Ready tasks left for a later tick for lack of a slot.
    pub postponed: usize,
    /// Tasks inserted by the campaign this tick.
    pub planned: usize,
    /// Buckets after the execute step.
    pub plan: PlanSummary,
}

impl TickReport {
    fn new(run_id: &str, status: RunStatus) -> Self {
        Self {
            run_id: run_id.to_string(),
            status,
            ..Self::default()
        }
    }
}

impl<L: RunLock> RunEngine<L> {
    /// Run one tick under the run lock and return the resulting run status.
    ///
    /// Fails with a lock-contention error (retryable) when another process
    /// holds the lock.
    pub fn step_run(&mut self) -> Result<TickReport, EngineError> {
        let _guard = self.lock.try_acquire()?;
        let run_id = self.ctx.run_id.clone();

        let status = self.store.get_run_status(&run_id)?;
        match status {
            RunStatus::Pending => {
                self.store.set_run_status(&run_id, RunStatus::Running, None)?;
                tracing::info!(run_id = %run_id, "run started");
            }
            RunStatus::Running => {}
            RunStatus::Paused | RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled => {
                tracing::debug!(run_id = %run_id, status = %status, "tick skipped");
                return Ok(TickReport::new(&run_id, status));
            }
        }
        let run = self.run()?;
        let mut report = TickReport::new(&run_id, RunStatus::Running);

        // Poll
        report.poll = poll_run(&self.store, &run, &self.registry)?;

        // Plan
        let plan = self.plan()?;

        // Execute
        let mut limiter = ConcurrencyLimiter::load(&self.store, &run_id, &self.config)?;
        for task in &plan.ready {
            let route = route_task(task, &self.config, &self.registry);
            if route.is_external() {
                let key = route.limiter_key();
                if !limiter.try_consume(key) {
                    let (active, _) = limiter.slots(key);
                    tracing::debug!(task_id = %task.task_id, operator_key = %key, active, "no slot; postponed");
                    report.postponed += 1;
                    continue;
                }
            }
            match dispatch_task(&self.store, &run, task, &route)? {
                DispatchOutcome::Submitted { .. } => report.dispatched += 1,
                DispatchOutcome::Failed { .. } => report.dispatch_failures += 1,
                DispatchOutcome::ExternalStub => report.external += 1,
                DispatchOutcome::Simulated => report.simulated += 1,
            }
        }

        // Analyze
        let plan = self.plan()?;
        report.plan = plan.summary();
        report.status = if plan.is_settled() {
            self.analyze(&plan, &mut report)?
        } else {
            RunStatus::Running
        };
        tracing::info!(
            run_id = %run_id,
            status = %report.status,
            dispatched = report.dispatched,
            simulated = report.simulated,
            postponed = report.postponed,
            "tick finished"
        );
        Ok(report)
    }

    fn plan(&self) -> Result<Plan, EngineError> {
        let tasks = self.store.list_tasks(&self.ctx.run_id)?;
        let active = tasks_with_active_work(&self.store, &self.ctx.run_id)?;
        Ok(plan_tasks(&tasks, &active))
    }

    /// Everything has settled: fail on a blocking failure, otherwise let the
    /// campaign fold in the outcomes and decide whether there is more work.
    fn analyze(&mut self, plan: &Plan, report: &mut TickReport) -> Result<RunStatus, EngineError> {
        let run_id = self.ctx.run_id.clone();
        if plan.has_blocking_failure() {
            let reason = format!("tasks failed: {}", plan.failed_blocking.join(", "));
            self.store
                .set_run_status(&run_id, RunStatus::Failed, Some(&reason))?;
            tracing::warn!(run_id = %run_id, reason = %reason, "run failed");
            return Ok(RunStatus::Failed);
        }

        let tasks = self.store.list_tasks(&run_id)?;
        let outcomes = self.outcomes(&tasks)?;
        let state = self.store.get_campaign_state(&run_id)?;
        let mut state = self
            .campaign
            .analyze(state, &outcomes)
            .map_err(EngineError::Campaign)?;
        let workflow = self
            .campaign
            .plan(&mut state)
            .map_err(EngineError::Campaign)?;
        self.store.set_campaign_state(&run_id, &state)?;

        match workflow.filter(|w| !w.is_empty()) {
            Some(workflow) => {
                report.planned = self.store.add_workflow(&run_id, &workflow)?;
                tracing::info!(run_id = %run_id, tasks = report.planned, iteration = state.iteration, "campaign planned more work");
                Ok(RunStatus::Running)
            }
            None => {
                self.store
                    .set_run_status(&run_id, RunStatus::Completed, None)?;
                tracing::info!(run_id = %run_id, "run completed");
                Ok(RunStatus::Completed)
            }
        }
    }

    fn outcomes(&self, tasks: &[Task]) -> Result<Vec<TaskOutcome>, EngineError> {
        tasks
            .iter()
            .map(|task| {
                let operator_data = match &task.current_attempt_id {
                    Some(id) => self.store.get_attempt(id)?.operator_data,
                    None => self
                        .store
                        .get_external_run(&task.task_id)?
                        .map(|legacy| legacy.operator_data)
                        .unwrap_or_default(),
                };
                Ok(TaskOutcome {
                    task_id: task.task_id.clone(),
                    status: task.status,
                    attempt_id: task.current_attempt_id.clone(),
                    operator_data,
                })
            })
            .collect()
    }
}
