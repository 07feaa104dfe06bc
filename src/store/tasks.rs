//! Task rows: workflow insertion, reads, status healing, administrative delete.

use std::collections::HashMap;

use rusqlite::{OptionalExtension, params};

use super::{StateStore, from_json, now_ts, to_json};
use crate::dag::DagBuilder;
use crate::errors::{GraphError, StoreError};
use cadence_common::{Task, TaskKind, TaskStatus, Workflow};

const TASK_COLUMNS: &str = "task_id, name, kind, image, command, env, files, resources, \
     dependencies, operator_key, allow_failure, allow_dependency_failure, status, current_attempt_id";

impl StateStore {
    // ── Workflow insertion ────────────────────────────────────────────

    /// Upsert every task of `workflow` into the run.
    ///
    /// The merged graph (existing tasks with same-id replacements, plus new
    /// ones) is validated first; an unknown dependency or a cycle rejects the
    /// whole batch. Re-adding a task updates its definition but keeps its status and
    /// current attempt.
    pub fn add_workflow(&self, run_id: &str, workflow: &Workflow) -> Result<usize, StoreError> {
        let mut merged = self.list_tasks(run_id)?;
        let mut positions: HashMap<String, usize> = merged
            .iter()
            .enumerate()
            .map(|(i, t)| (t.task_id.clone(), i))
            .collect();
        let mut seen = std::collections::HashSet::new();
        for task in &workflow.tasks {
            if !seen.insert(task.task_id.as_str()) {
                return Err(GraphError::DuplicateTask(task.task_id.clone()).into());
            }
            match positions.get(&task.task_id) {
                Some(&i) => merged[i] = task.clone(),
                None => {
                    positions.insert(task.task_id.clone(), merged.len());
                    merged.push(task.clone());
                }
            }
        }
        DagBuilder::new(&merged).validate()?;

        let now = now_ts();
        let tx = self.conn().unchecked_transaction()?;
        for task in &workflow.tasks {
            tx.execute(
                "INSERT INTO tasks (run_id, task_id, name, kind, image, command, env, files,
                                    resources, dependencies, operator_key, allow_failure,
                                    allow_dependency_failure, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?15)
                 ON CONFLICT(run_id, task_id) DO UPDATE SET
                     name = excluded.name,
                     kind = excluded.kind,
                     image = excluded.image,
                     command = excluded.command,
                     env = excluded.env,
                     files = excluded.files,
                     resources = excluded.resources,
                     dependencies = excluded.dependencies,
                     operator_key = excluded.operator_key,
                     allow_failure = excluded.allow_failure,
                     allow_dependency_failure = excluded.allow_dependency_failure,
                     updated_at = excluded.updated_at",
                params![
                    run_id,
                    task.task_id,
                    task.name,
                    task.kind.as_str(),
                    task.image,
                    to_json("tasks.command", &task.command)?,
                    to_json("tasks.env", &task.env)?,
                    to_json("tasks.files", &task.files)?,
                    to_json("tasks.resources", &task.resources)?,
                    to_json("tasks.dependencies", &task.dependencies)?,
                    task.operator_key,
                    task.allow_failure,
                    task.allow_dependency_failure,
                    task.status.as_str(),
                    now,
                ],
            )?;
        }
        tx.commit()?;
        tracing::debug!(run_id, count = workflow.len(), "workflow added");
        Ok(workflow.len())
    }

    // ── Task reads ────────────────────────────────────────────────────

    /// Every task of the run in discovery (insertion) order.
    pub fn list_tasks(&self, run_id: &str) -> Result<Vec<Task>, StoreError> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {TASK_COLUMNS} FROM tasks WHERE run_id = ?1 ORDER BY rowid"
        ))?;
        let rows = stmt.query_map(params![run_id], TaskRow::from_row)?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row?.into_task()?);
        }
        Ok(tasks)
    }

    pub fn get_task(&self, run_id: &str, task_id: &str) -> Result<Task, StoreError> {
        let row = self
            .conn()
            .query_row(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE run_id = ?1 AND task_id = ?2"),
                params![run_id, task_id],
                TaskRow::from_row,
            )
            .optional()?;
        row.ok_or_else(|| StoreError::not_found("task", task_id))?
            .into_task()
    }

    pub fn task_exists(&self, run_id: &str, task_id: &str) -> Result<bool, StoreError> {
        let count: i64 = self.conn().query_row(
            "SELECT COUNT(*) FROM tasks WHERE run_id = ?1 AND task_id = ?2",
            params![run_id, task_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    // ── Task mutation ─────────────────────────────────────────────────

    pub fn set_task_status(
        &self,
        run_id: &str,
        task_id: &str,
        status: TaskStatus,
    ) -> Result<(), StoreError> {
        let changed = self.conn().execute(
            "UPDATE tasks SET status = ?1, updated_at = ?2 WHERE run_id = ?3 AND task_id = ?4",
            params![status.as_str(), now_ts(), run_id, task_id],
        )?;
        if changed == 0 {
            return Err(StoreError::not_found("task", task_id));
        }
        Ok(())
    }

    /// Delete a task together with its attempts and legacy external run.
    pub fn delete_task(&self, run_id: &str, task_id: &str) -> Result<(), StoreError> {
        let tx = self.conn().unchecked_transaction()?;
        tx.execute(
            "DELETE FROM attempts WHERE run_id = ?1 AND task_id = ?2",
            params![run_id, task_id],
        )?;
        tx.execute(
            "DELETE FROM external_runs WHERE run_id = ?1 AND task_id = ?2",
            params![run_id, task_id],
        )?;
        let removed = tx.execute(
            "DELETE FROM tasks WHERE run_id = ?1 AND task_id = ?2",
            params![run_id, task_id],
        )?;
        if removed == 0 {
            return Err(StoreError::not_found("task", task_id));
        }
        tx.commit()?;
        Ok(())
    }
}

// ── Internal row helpers ──────────────────────────────────────────────

/// Raw task columns before the JSON fields are decoded.
struct TaskRow {
    task_id: String,
    name: String,
    kind: String,
    image: Option<String>,
    command: String,
    env: String,
    files: String,
    resources: String,
    dependencies: String,
    operator_key: Option<String>,
    allow_failure: bool,
    allow_dependency_failure: bool,
    status: String,
    current_attempt_id: Option<String>,
}

impl TaskRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            task_id: row.get(0)?,
            name: row.get(1)?,
            kind: row.get(2)?,
            image: row.get(3)?,
            command: row.get(4)?,
            env: row.get(5)?,
            files: row.get(6)?,
            resources: row.get(7)?,
            dependencies: row.get(8)?,
            operator_key: row.get(9)?,
            allow_failure: row.get(10)?,
            allow_dependency_failure: row.get(11)?,
            status: row.get(12)?,
            current_attempt_id: row.get(13)?,
        })
    }

    fn into_task(self) -> Result<Task, StoreError> {
        let kind: TaskKind = self.kind.parse().map_err(|_| StoreError::InvalidValue {
            column: "tasks.kind",
            value: self.kind.clone(),
        })?;
        Ok(Task {
            kind,
            command: from_json("tasks.command", &self.command)?,
            env: from_json("tasks.env", &self.env)?,
            files: from_json("tasks.files", &self.files)?,
            resources: from_json("tasks.resources", &self.resources)?,
            dependencies: from_json("tasks.dependencies", &self.dependencies)?,
            status: TaskStatus::parse_lenient(&self.status),
            task_id: self.task_id,
            name: self.name,
            image: self.image,
            operator_key: self.operator_key,
            allow_failure: self.allow_failure,
            allow_dependency_failure: self.allow_dependency_failure,
            current_attempt_id: self.current_attempt_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use cadence_common::RunContext;

    fn store_with_run() -> Result<(StateStore, String)> {
        let store = StateStore::open_in_memory()?;
        let run = store.create_run(&RunContext::new("/ws", "r1"), &[], None)?;
        Ok((store, run.run_id))
    }

    #[test]
    fn test_add_workflow_preserves_discovery_order() -> Result<()> {
        let (store, run_id) = store_with_run()?;
        let wf = Workflow::new(vec![
            Task::new("c", "C"),
            Task::new("a", "A").with_dependencies(&["c"]),
            Task::new("b", "B").with_kind(TaskKind::Gate),
        ]);
        assert_eq!(store.add_workflow(&run_id, &wf)?, 3);

        let tasks = store.list_tasks(&run_id)?;
        let ids: Vec<&str> = tasks.iter().map(|t| t.task_id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
        assert_eq!(tasks[1].dependencies, vec!["c".to_string()]);
        assert_eq!(tasks[2].kind, TaskKind::Gate);
        assert_eq!(tasks[0].status, TaskStatus::Pending);
        Ok(())
    }

    #[test]
    fn test_upsert_keeps_status_and_order() -> Result<()> {
        let (store, run_id) = store_with_run()?;
        store.add_workflow(
            &run_id,
            &Workflow::new(vec![Task::new("a", "A"), Task::new("b", "B")]),
        )?;
        store.set_task_status(&run_id, "a", TaskStatus::Completed)?;

        let replanned = Task::new("a", "A v2").with_env("MODE", "fast");
        store.add_workflow(&run_id, &Workflow::new(vec![replanned, Task::new("c", "C")]))?;

        let tasks = store.list_tasks(&run_id)?;
        assert_eq!(tasks.len(), 3);
        assert_eq!(tasks[0].task_id, "a");
        assert_eq!(tasks[0].name, "A v2");
        assert_eq!(tasks[0].env.get("MODE").map(String::as_str), Some("fast"));
        assert_eq!(tasks[0].status, TaskStatus::Completed);
        Ok(())
    }

    #[test]
    fn test_cycle_rejects_whole_batch() -> Result<()> {
        let (store, run_id) = store_with_run()?;
        let wf = Workflow::new(vec![
            Task::new("a", "A").with_dependencies(&["b"]),
            Task::new("b", "B").with_dependencies(&["a"]),
        ]);
        let err = store.add_workflow(&run_id, &wf).unwrap_err();
        assert!(matches!(
            err,
            StoreError::InvalidWorkflow(GraphError::Cycle { .. })
        ));
        assert!(store.list_tasks(&run_id)?.is_empty());
        Ok(())
    }

    #[test]
    fn test_dependency_on_existing_task_is_valid() -> Result<()> {
        let (store, run_id) = store_with_run()?;
        store.add_workflow(&run_id, &Workflow::new(vec![Task::new("a", "A")]))?;
        store.add_workflow(
            &run_id,
            &Workflow::new(vec![Task::new("b", "B").with_dependencies(&["a"])]),
        )?;
        let err = store
            .add_workflow(
                &run_id,
                &Workflow::new(vec![Task::new("c", "C").with_dependencies(&["ghost"])]),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::InvalidWorkflow(GraphError::UnknownDependency { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_duplicate_ids_in_one_batch_rejected() -> Result<()> {
        let (store, run_id) = store_with_run()?;
        let wf = Workflow::new(vec![Task::new("a", "A"), Task::new("a", "A again")]);
        assert!(matches!(
            store.add_workflow(&run_id, &wf),
            Err(StoreError::InvalidWorkflow(GraphError::DuplicateTask(_)))
        ));
        Ok(())
    }

    #[test]
    fn test_set_status_on_missing_task_is_not_found() -> Result<()> {
        let (store, run_id) = store_with_run()?;
        assert!(matches!(
            store.set_task_status(&run_id, "ghost", TaskStatus::Completed),
            Err(StoreError::NotFound { entity: "task", .. })
        ));
        assert!(matches!(
            store.get_task(&run_id, "ghost"),
            Err(StoreError::NotFound { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_delete_task_cascades() -> Result<()> {
        let (store, run_id) = store_with_run()?;
        store.add_workflow(&run_id, &Workflow::new(vec![Task::new("a", "A")]))?;
        let attempt = store.create_attempt(
            &run_id,
            "a",
            Some("hpc"),
            Some("hpc"),
            cadence_common::AttemptStatus::Created,
        )?;
        store.delete_task(&run_id, "a")?;
        assert!(!store.task_exists(&run_id, "a")?);
        assert!(matches!(
            store.get_attempt(&attempt.attempt_id),
            Err(StoreError::NotFound { .. })
        ));
        assert!(matches!(
            store.delete_task(&run_id, "a"),
            Err(StoreError::NotFound { .. })
        ));
        Ok(())
    }
}
