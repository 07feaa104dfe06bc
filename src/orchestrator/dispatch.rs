//! Execute step: hand one ready task to its route.

use cadence_common::{AttemptStatus, OperatorError, Run, Task, TaskStatus};

use super::reconcile::{attach_results, is_finished};
use crate::errors::EngineError;
use crate::operator::Route;
use crate::store::{AttemptUpdate, StateStore};

/// What happened to one dispatched task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// An attempt was prepared and submitted.
    Submitted {
        attempt_id: String,
        status: AttemptStatus,
    },
    /// Prepare or submit failed; the attempt was marked FAILED.
    Failed { attempt_id: String, reason: String },
    /// A legacy external run is now waiting on out-of-band completion.
    ExternalStub,
    /// Completed in-process without an attempt.
    Simulated,
}

pub fn dispatch_task(
    store: &StateStore,
    run: &Run,
    task: &Task,
    route: &Route,
) -> Result<DispatchOutcome, EngineError> {
    match route {
        Route::Simulate => {
            store.set_task_status(&run.run_id, &task.task_id, TaskStatus::Completed)?;
            tracing::info!(task_id = %task.task_id, "task simulated");
            Ok(DispatchOutcome::Simulated)
        }
        Route::ExternalStub => {
            store.upsert_external_run(
                &run.run_id,
                &task.task_id,
                None,
                AttemptStatus::WaitingExternal,
            )?;
            store.set_task_status(&run.run_id, &task.task_id, TaskStatus::WaitingExternal)?;
            tracing::info!(task_id = %task.task_id, "task waiting on external coordination");
            Ok(DispatchOutcome::ExternalStub)
        }
        Route::Operator(operator) => {
            let attempt = store.create_attempt(
                &run.run_id,
                &task.task_id,
                Some(operator.operator_type()),
                Some(operator.operator_key()),
                AttemptStatus::Created,
            )?;
            store.set_task_status(&run.run_id, &task.task_id, TaskStatus::Pending)?;

            let submitted = operator
                .prepare_run(run, task, Some(&attempt.attempt_id))
                .and_then(|handle| operator.submit(handle));

            match submitted {
                Ok(mut handle) => {
                    if is_finished(handle.status) {
                        attach_results(operator.as_ref(), &mut handle)?;
                    }
                    store.update_attempt(&attempt.attempt_id, &AttemptUpdate::from_handle(&handle))?;
                    store.set_task_status(&run.run_id, &task.task_id, handle.status.task_status())?;
                    tracing::info!(
                        task_id = %task.task_id,
                        attempt_id = %attempt.attempt_id,
                        attempt_index = attempt.attempt_index,
                        operator_key = %operator.operator_key(),
                        status = %handle.status,
                        "task dispatched"
                    );
                    Ok(DispatchOutcome::Submitted {
                        attempt_id: attempt.attempt_id,
                        status: handle.status,
                    })
                }
                Err(e) => {
                    let reason = e.to_string();
                    store.update_attempt(
                        &attempt.attempt_id,
                        &AttemptUpdate::status(AttemptStatus::Failed).with_reason(&reason),
                    )?;
                    store.set_task_status(&run.run_id, &task.task_id, TaskStatus::Failed)?;
                    tracing::error!(
                        task_id = %task.task_id,
                        attempt_id = %attempt.attempt_id,
                        operator_key = %operator.operator_key(),
                        error = %e,
                        "dispatch failed"
                    );
                    if let OperatorError::PathSafety(violation) = e {
                        return Err(violation.into());
                    }
                    Ok(DispatchOutcome::Failed {
                        attempt_id: attempt.attempt_id,
                        reason,
                    })
                }
            }
        }
    }
}
