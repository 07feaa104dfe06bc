//! Dependency validation for a run's tasks.
//!
//! The builder resolves every dependency id to a task in the same batch and
//! rejects cycles with a Kahn topological sort.

use cadence_common::Task;
use std::collections::{HashMap, HashSet};

use crate::errors::GraphError;

/// Index into the task list.
type TaskIndex = usize;

/// Edges of a batch, both directions, by task index.
struct Edges {
    /// index -> tasks that depend on it
    dependents: Vec<Vec<TaskIndex>>,
    /// index -> number of distinct dependencies
    in_degree: Vec<usize>,
}

/// Validator for a batch of tasks.
pub struct DagBuilder<'a> {
    tasks: &'a [Task],
}

impl<'a> DagBuilder<'a> {
    pub fn new(tasks: &'a [Task]) -> Self {
        Self { tasks }
    }

    /// Check that the batch forms a DAG:
    ///
    /// - task ids must be unique
    /// - every dependency must name a task in the batch
    /// - no cycles
    pub fn validate(self) -> Result<(), GraphError> {
        let edges = self.edges()?;
        self.validate_no_cycles(edges)
    }

    fn edges(&self) -> Result<Edges, GraphError> {
        let mut index_map: HashMap<&str, TaskIndex> = HashMap::with_capacity(self.tasks.len());
        for (i, task) in self.tasks.iter().enumerate() {
            if index_map.insert(task.task_id.as_str(), i).is_some() {
                return Err(GraphError::DuplicateTask(task.task_id.clone()));
            }
        }

        let mut dependents: Vec<Vec<TaskIndex>> = vec![Vec::new(); self.tasks.len()];
        let mut in_degree = vec![0; self.tasks.len()];
        for (to_idx, task) in self.tasks.iter().enumerate() {
            // Repeated dependency ids collapse to one edge.
            let mut seen = HashSet::new();
            for dep in &task.dependencies {
                if !seen.insert(dep.as_str()) {
                    continue;
                }
                let from_idx =
                    *index_map
                        .get(dep.as_str())
                        .ok_or_else(|| GraphError::UnknownDependency {
                            task: task.task_id.clone(),
                            dependency: dep.clone(),
                        })?;
                dependents[from_idx].push(to_idx);
                in_degree[to_idx] += 1;
            }
        }
        Ok(Edges {
            dependents,
            in_degree,
        })
    }

    /// Kahn's algorithm; whatever never reaches in-degree zero is on a cycle.
    fn validate_no_cycles(&self, edges: Edges) -> Result<(), GraphError> {
        let Edges {
            dependents,
            mut in_degree,
        } = edges;
        let mut queue: Vec<TaskIndex> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, deg)| *deg == 0)
            .map(|(i, _)| i)
            .collect();

        let mut processed = 0;
        while let Some(node) = queue.pop() {
            processed += 1;
            for &dependent in &dependents[node] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    queue.push(dependent);
                }
            }
        }

        if processed != self.tasks.len() {
            let mut tasks: Vec<String> = in_degree
                .iter()
                .enumerate()
                .filter(|&(_, deg)| *deg > 0)
                .map(|(i, _)| self.tasks[i].task_id.clone())
                .collect();
            tasks.sort();
            return Err(GraphError::Cycle { tasks });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, deps: &[&str]) -> Task {
        Task::new(id, id).with_dependencies(deps)
    }

    #[test]
    fn test_diamond_is_valid() {
        let tasks = vec![
            task("prep", &[]),
            task("sim", &["prep"]),
            task("fab", &["prep"]),
            task("report", &["sim", "fab"]),
        ];
        assert_eq!(DagBuilder::new(&tasks).validate(), Ok(()));
    }

    #[test]
    fn test_dependency_may_come_later_in_the_batch() {
        let tasks = vec![task("report", &["sim"]), task("sim", &["prep"]), task("prep", &[])];
        assert_eq!(DagBuilder::new(&tasks).validate(), Ok(()));
    }

    #[test]
    fn test_cycle_detection_names_involved_tasks() {
        let tasks = vec![
            task("a", &["c"]),
            task("b", &["a"]),
            task("c", &["b"]),
            task("free", &[]),
            task("after", &["c"]),
        ];
        assert_eq!(
            DagBuilder::new(&tasks).validate(),
            Err(GraphError::Cycle {
                tasks: vec!["a".into(), "after".into(), "b".into(), "c".into()]
            })
        );
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let tasks = vec![task("a", &["a"])];
        assert!(matches!(
            DagBuilder::new(&tasks).validate(),
            Err(GraphError::Cycle { .. })
        ));
    }

    #[test]
    fn test_missing_dependency() {
        let tasks = vec![task("a", &["nonexistent"])];
        let err = DagBuilder::new(&tasks).validate().unwrap_err();
        assert_eq!(
            err,
            GraphError::UnknownDependency {
                task: "a".to_string(),
                dependency: "nonexistent".to_string(),
            }
        );
        assert!(err.to_string().contains("nonexistent"));
    }

    #[test]
    fn test_duplicate_task_id() {
        let tasks = vec![task("a", &[]), task("a", &[])];
        assert_eq!(
            DagBuilder::new(&tasks).validate().unwrap_err(),
            GraphError::DuplicateTask("a".to_string())
        );
    }

    #[test]
    fn test_repeated_dependency_is_one_edge() {
        // Counted twice, "b" would never reach in-degree zero.
        let tasks = vec![task("a", &[]), task("b", &["a", "a"])];
        assert_eq!(DagBuilder::new(&tasks).validate(), Ok(()));
    }

    #[test]
    fn test_empty_batch() {
        assert_eq!(DagBuilder::new(&[]).validate(), Ok(()));
    }
}
