//! Poll step: advance in-flight attempts and heal task statuses.
//!
//! Every non-terminal attempt is checked against its operator; legacy
//! external runs are checked only for tasks that have never had an attempt.
//! Afterwards every task's status is re-derived from its current attempt
//! (or legacy run), so a crash between writes never leaves the two apart.

use std::collections::HashSet;

use cadence_common::{
    Attempt, AttemptStatus, LegacyExternalRun, Operator, OperatorHandle, Run,
};
use serde_json::json;

use crate::errors::{EngineError, recover_or_propagate};
use crate::operator::OperatorRegistry;
use crate::store::{AttemptUpdate, ExternalRunUpdate, StateStore};

/// What one poll step did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct PollReport {
    /// Operator status checks made.
    pub polled: usize,
    /// Checks that changed an attempt's status.
    pub transitions: usize,
    /// Tasks whose stored status was corrected.
    pub healed: usize,
}

pub fn poll_run(
    store: &StateStore,
    run: &Run,
    registry: &OperatorRegistry,
) -> Result<PollReport, EngineError> {
    let mut report = PollReport::default();

    for attempt in store.get_active_attempts(&run.run_id)? {
        let Some(operator) =
            registry.resolve(attempt.operator_key.as_deref(), attempt.operator_type.as_deref())
        else {
            tracing::debug!(task_id = %attempt.task_id, attempt_id = %attempt.attempt_id, "no operator for attempt; healing only");
            continue;
        };
        let Some(handle) = handle_from_attempt(run, &attempt, operator.as_ref()) else {
            tracing::warn!(attempt_id = %attempt.attempt_id, status = %attempt.status, "unrecognized attempt status; not polling");
            continue;
        };
        report.polled += 1;
        if poll_attempt(store, operator.as_ref(), &attempt, handle)? {
            report.transitions += 1;
        }
    }

    let with_attempts = store.task_ids_with_attempts(&run.run_id)?;
    for legacy in store.list_external_runs(&run.run_id)? {
        if legacy.is_terminal() || with_attempts.contains(&legacy.task_id) {
            continue;
        }
        let Some(operator) = registry.resolve(None, legacy.operator_type.as_deref()) else {
            continue;
        };
        let Some(handle) = handle_from_legacy(run, &legacy, operator.as_ref()) else {
            continue;
        };
        report.polled += 1;
        if poll_legacy(store, operator.as_ref(), &legacy, handle)? {
            report.transitions += 1;
        }
    }

    report.healed = heal_task_statuses(store, &run.run_id)?;
    Ok(report)
}

/// Check one attempt and persist what the operator reported.
/// Returns whether the status changed.
fn poll_attempt(
    store: &StateStore,
    operator: &dyn Operator,
    attempt: &Attempt,
    handle: OperatorHandle,
) -> Result<bool, EngineError> {
    let previous = handle.status;
    let checked = operator
        .check_status(handle)
        .map_err(EngineError::from);
    let Some(mut handle) = recover_or_propagate(checked, "status check")? else {
        return Ok(false);
    };

    let changed = handle.status != previous;
    if changed {
        tracing::info!(
            task_id = %attempt.task_id,
            attempt_id = %attempt.attempt_id,
            operator_key = %operator.operator_key(),
            from = %previous,
            to = %handle.status,
            "attempt status changed"
        );
    }
    if changed && is_finished(handle.status) {
        attach_results(operator, &mut handle)?;
    }
    store.update_attempt(&attempt.attempt_id, &AttemptUpdate::from_handle(&handle))?;
    Ok(changed)
}

fn poll_legacy(
    store: &StateStore,
    operator: &dyn Operator,
    legacy: &LegacyExternalRun,
    handle: OperatorHandle,
) -> Result<bool, EngineError> {
    let previous = handle.status;
    let checked = operator
        .check_status(handle)
        .map_err(EngineError::from);
    let Some(mut handle) = recover_or_propagate(checked, "legacy status check")? else {
        return Ok(false);
    };

    let changed = handle.status != previous;
    if changed {
        tracing::info!(
            task_id = %legacy.task_id,
            operator_type = %operator.operator_type(),
            from = %previous,
            to = %handle.status,
            "external run status changed"
        );
    }
    if changed && is_finished(handle.status) {
        attach_results(operator, &mut handle)?;
    }
    store.update_external_run(&legacy.task_id, &ExternalRunUpdate::from_handle(&handle))?;
    Ok(changed)
}

/// COMPLETED and FAILED are the statuses results are collected for.
pub(crate) fn is_finished(status: AttemptStatus) -> bool {
    matches!(status, AttemptStatus::Completed | AttemptStatus::Failed)
}

/// Collect results into `operator_data.results`. Collection failures are
/// logged and leave the handle as it was.
pub(crate) fn attach_results(
    operator: &dyn Operator,
    handle: &mut OperatorHandle,
) -> Result<(), EngineError> {
    let collected = operator
        .collect_results(handle)
        .map_err(EngineError::from);
    if let Some(result) = recover_or_propagate(collected, "result collection")? {
        handle.operator_data.insert(
            "results".to_string(),
            json!({ "data": result.data, "files": result.files }),
        );
    }
    Ok(())
}

/// Re-derive every task's status from its current attempt, or from its
/// legacy external run when it has no attempts. Returns how many changed.
pub fn heal_task_statuses(store: &StateStore, run_id: &str) -> Result<usize, EngineError> {
    let with_attempts = store.task_ids_with_attempts(run_id)?;
    let mut healed = 0;
    for task in store.list_tasks(run_id)? {
        let projected = match &task.current_attempt_id {
            Some(attempt_id) => match store.get_attempt(attempt_id) {
                Ok(attempt) => Some(attempt.task_status()),
                Err(e) => {
                    tracing::warn!(task_id = %task.task_id, attempt_id = %attempt_id, error = %e, "current attempt unreadable");
                    None
                }
            },
            None if !with_attempts.contains(&task.task_id) => store
                .get_external_run(&task.task_id)?
                .filter(|legacy| legacy.run_id == run_id)
                .map(|legacy| legacy.task_status()),
            None => None,
        };
        if let Some(status) = projected
            && status != task.status
        {
            tracing::debug!(task_id = %task.task_id, from = %task.status, to = %status, "task status healed");
            store.set_task_status(run_id, &task.task_id, status)?;
            healed += 1;
        }
    }
    Ok(healed)
}

/// Task ids holding a non-terminal attempt, or a non-terminal legacy
/// external run and no attempts.
pub fn tasks_with_active_work(
    store: &StateStore,
    run_id: &str,
) -> Result<HashSet<String>, EngineError> {
    let with_attempts = store.task_ids_with_attempts(run_id)?;
    let mut ids: HashSet<String> = store
        .get_active_attempts(run_id)?
        .into_iter()
        .map(|a| a.task_id)
        .collect();
    ids.extend(
        store
            .list_external_runs(run_id)?
            .into_iter()
            .filter(|legacy| !legacy.is_terminal() && !with_attempts.contains(&legacy.task_id))
            .map(|legacy| legacy.task_id),
    );
    Ok(ids)
}

fn handle_from_attempt(
    run: &Run,
    attempt: &Attempt,
    operator: &dyn Operator,
) -> Option<OperatorHandle> {
    let status = attempt.parsed_status()?;
    let mut handle = OperatorHandle::new(
        &run.root,
        &run.run_id,
        &attempt.task_id,
        attempt.operator_key.as_deref().unwrap_or(operator.operator_key()),
        attempt.operator_type.as_deref().unwrap_or(operator.operator_type()),
    );
    handle.attempt_id = Some(attempt.attempt_id.clone());
    handle.status = status;
    handle.external_id = attempt.external_id.clone();
    handle.operator_data = attempt.operator_data.clone();
    handle.relative_path = attempt.relative_path.clone();
    handle.status_reason = attempt.status_reason.clone();
    Some(handle)
}

fn handle_from_legacy(
    run: &Run,
    legacy: &LegacyExternalRun,
    operator: &dyn Operator,
) -> Option<OperatorHandle> {
    let status = legacy.parsed_status()?;
    let mut handle = OperatorHandle::new(
        &run.root,
        &run.run_id,
        &legacy.task_id,
        operator.operator_key(),
        legacy.operator_type.as_deref().unwrap_or(operator.operator_type()),
    );
    handle.status = status;
    handle.external_id = legacy.external_id.clone();
    handle.operator_data = legacy.operator_data.clone();
    handle.relative_path = legacy.relative_path.clone();
    Some(handle)
}
