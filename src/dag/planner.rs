//! Partition of a run's tasks by what the tick may do with them.

use std::collections::{HashMap, HashSet};

use cadence_common::{Task, TaskStatus};

/// Result of planning one tick.
#[derive(Debug, Clone, Default)]
pub struct Plan {
    /// Dispatchable now, in discovery order.
    pub ready: Vec<Task>,
    /// In flight, or waiting on a dependency that is not COMPLETED.
    pub active: Vec<String>,
    /// Subset of `active` held back only by dependencies.
    pub blocked: Vec<String>,
    pub completed: Vec<String>,
    pub failed_blocking: Vec<String>,
    pub failed_tolerated: Vec<String>,
}

impl Plan {
    /// Nothing ready and nothing in flight.
    pub fn is_settled(&self) -> bool {
        self.ready.is_empty() && self.active.is_empty()
    }

    pub fn has_blocking_failure(&self) -> bool {
        !self.failed_blocking.is_empty()
    }

    pub fn summary(&self) -> PlanSummary {
        PlanSummary {
            ready: self.ready.len(),
            active: self.active.len(),
            blocked: self.blocked.len(),
            completed: self.completed.len(),
            failed_blocking: self.failed_blocking.len(),
            failed_tolerated: self.failed_tolerated.len(),
        }
    }
}

/// Counts of each bucket, for reporting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct PlanSummary {
    pub ready: usize,
    pub active: usize,
    pub blocked: usize,
    pub completed: usize,
    pub failed_blocking: usize,
    pub failed_tolerated: usize,
}

/// Classify `tasks` given their healed statuses.
///
/// `with_active_attempt` names tasks holding a non-terminal attempt or legacy
/// run; a PENDING task in it is in flight, not ready. A dependency counts as
/// met only when it is exactly COMPLETED, so a failed dependency leaves its
/// dependents blocked rather than failed.
pub fn plan_tasks(tasks: &[Task], with_active_attempt: &HashSet<String>) -> Plan {
    let statuses: HashMap<&str, TaskStatus> = tasks
        .iter()
        .map(|t| (t.task_id.as_str(), t.status))
        .collect();

    let mut plan = Plan::default();
    for task in tasks {
        let id = task.task_id.clone();
        match task.status {
            TaskStatus::Completed | TaskStatus::Skipped => plan.completed.push(id),
            TaskStatus::Failed | TaskStatus::Cancelled => {
                if task.allow_failure {
                    plan.failed_tolerated.push(id);
                } else {
                    plan.failed_blocking.push(id);
                }
            }
            TaskStatus::Running | TaskStatus::WaitingExternal | TaskStatus::Unknown => {
                plan.active.push(id)
            }
            TaskStatus::Pending => {
                if with_active_attempt.contains(&task.task_id) {
                    plan.active.push(id);
                } else if dependencies_met(task, &statuses) {
                    plan.ready.push(task.clone());
                } else {
                    plan.blocked.push(id.clone());
                    plan.active.push(id);
                }
            }
        }
    }
    plan
}

fn dependencies_met(task: &Task, statuses: &HashMap<&str, TaskStatus>) -> bool {
    task.dependencies
        .iter()
        .all(|dep| statuses.get(dep.as_str()) == Some(&TaskStatus::Completed))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, deps: &[&str], status: TaskStatus) -> Task {
        let mut t = Task::new(id, id).with_dependencies(deps);
        t.status = status;
        t
    }

    fn ids(tasks: &[Task]) -> Vec<&str> {
        tasks.iter().map(|t| t.task_id.as_str()).collect()
    }

    #[test]
    fn test_empty_run_is_settled() {
        let plan = plan_tasks(&[], &HashSet::new());
        assert!(plan.is_settled());
        assert!(!plan.has_blocking_failure());
    }

    #[test]
    fn test_ready_requires_completed_dependencies() {
        let tasks = vec![
            task("t1", &[], TaskStatus::Pending),
            task("t2", &["t1"], TaskStatus::Pending),
            task("t3", &[], TaskStatus::Pending),
        ];
        let plan = plan_tasks(&tasks, &HashSet::new());
        assert_eq!(ids(&plan.ready), vec!["t1", "t3"]);
        assert_eq!(plan.blocked, vec!["t2"]);
        assert_eq!(plan.active, vec!["t2"]);
    }

    #[test]
    fn test_failed_dependency_blocks_forever() {
        let tasks = vec![
            task("t1", &[], TaskStatus::Failed),
            task("t2", &["t1"], TaskStatus::Pending),
        ];
        let plan = plan_tasks(&tasks, &HashSet::new());
        assert!(plan.ready.is_empty());
        assert_eq!(plan.active, vec!["t2"]);
        assert_eq!(plan.failed_blocking, vec!["t1"]);
        assert!(!plan.is_settled());
    }

    #[test]
    fn test_tolerated_failure_does_not_satisfy_dependents() {
        let mut t1 = task("t1", &[], TaskStatus::Failed);
        t1.allow_failure = true;
        let tasks = vec![t1, task("t2", &["t1"], TaskStatus::Pending)];
        let plan = plan_tasks(&tasks, &HashSet::new());
        assert_eq!(plan.failed_tolerated, vec!["t1"]);
        assert!(plan.failed_blocking.is_empty());
        assert_eq!(plan.blocked, vec!["t2"]);
    }

    #[test]
    fn test_skipped_dependency_is_not_completed() {
        let tasks = vec![
            task("t1", &[], TaskStatus::Skipped),
            task("t2", &["t1"], TaskStatus::Pending),
        ];
        let plan = plan_tasks(&tasks, &HashSet::new());
        assert_eq!(plan.completed, vec!["t1"]);
        assert_eq!(plan.blocked, vec!["t2"]);
    }

    #[test]
    fn test_pending_with_active_attempt_is_active() {
        let tasks = vec![task("t1", &[], TaskStatus::Pending)];
        let active: HashSet<String> = ["t1".to_string()].into_iter().collect();
        let plan = plan_tasks(&tasks, &active);
        assert!(plan.ready.is_empty());
        assert_eq!(plan.active, vec!["t1"]);
        assert!(plan.blocked.is_empty());
    }

    #[test]
    fn test_in_flight_and_unknown_statuses_are_active() {
        let tasks = vec![
            task("a", &[], TaskStatus::Running),
            task("b", &[], TaskStatus::WaitingExternal),
            task("c", &[], TaskStatus::Unknown),
            task("d", &[], TaskStatus::Completed),
            task("e", &[], TaskStatus::Cancelled),
        ];
        let plan = plan_tasks(&tasks, &HashSet::new());
        assert_eq!(plan.active, vec!["a", "b", "c"]);
        assert_eq!(plan.completed, vec!["d"]);
        assert_eq!(plan.failed_blocking, vec!["e"]);
        let summary = plan.summary();
        assert_eq!(summary.active, 3);
        assert_eq!(summary.failed_blocking, 1);
    }
}
