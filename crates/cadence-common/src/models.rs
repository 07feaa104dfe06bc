//! Runs, tasks, attempts and the on-disk layout of a run directory.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::status::{AttemptStatus, RunStatus, TaskStatus, project_task_status};

/// Task environment variable carrying an operator routing hint.
pub const OPERATOR_HINT_ENV: &str = "CADENCE_OPERATOR";

/// Directory under the workspace that holds one sub-directory per run.
pub const RUNS_DIR: &str = "runs";
/// Durable store file inside a run root.
pub const STORE_FILE: &str = "state-store";
/// Advisory lock sentinel inside a run root.
pub const LOCK_FILE: &str = "run.lock";
/// Concurrency / execution-mode configuration inside a run root.
pub const CONFIG_FILE: &str = "config";

/// Identity and filesystem layout of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunContext {
    pub workspace: PathBuf,
    pub run_id: String,
    pub root: PathBuf,
}

impl RunContext {
    /// Build the context for `run_id` under `workspace/runs/<run_id>`.
    pub fn new(workspace: impl Into<PathBuf>, run_id: impl Into<String>) -> Self {
        let workspace = workspace.into();
        let run_id = run_id.into();
        let root = workspace.join(RUNS_DIR).join(&run_id);
        Self {
            workspace,
            run_id,
            root,
        }
    }

    pub fn store_path(&self) -> PathBuf {
        self.root.join(STORE_FILE)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.root.join(LOCK_FILE)
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    /// Whether the run directory exists on disk.
    pub fn exists(&self) -> bool {
        self.root.is_dir()
    }

    /// Directory holding every run of `workspace`.
    pub fn runs_dir(workspace: &Path) -> PathBuf {
        workspace.join(RUNS_DIR)
    }
}

/// A persisted run row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Run {
    pub run_id: String,
    pub workspace: String,
    pub root: String,
    pub status: RunStatus,
    pub status_reason: Option<String>,
    pub tags: Vec<String>,
    pub description: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Kind of work a task represents. Drives the default operator routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Ordinary computational step, routed by key or the run's default mode.
    #[default]
    Compute,
    /// Human approval gate, routed to the human operator.
    Gate,
    /// Coordinated outside cadence; tracked through a legacy external run.
    External,
    /// Always completed in-process.
    Local,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Compute => "compute",
            Self::Gate => "gate",
            Self::External => "external",
            Self::Local => "local",
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "compute" | "" => Ok(Self::Compute),
            "gate" | "approval" => Ok(Self::Gate),
            "external" => Ok(Self::External),
            "local" => Ok(Self::Local),
            _ => Err(format!("Invalid task kind: {}", s)),
        }
    }
}

/// One unit of work in a run's dependency graph.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub task_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub kind: TaskKind,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub resources: BTreeMap<String, serde_json::Value>,
    /// Ids of tasks in the same run that must be COMPLETED first.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Explicit routing hint; wins over every other routing source.
    #[serde(default)]
    pub operator_key: Option<String>,
    #[serde(default)]
    pub allow_failure: bool,
    /// Persisted for compatibility; the planner does not act on it.
    #[serde(default)]
    pub allow_dependency_failure: bool,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub current_attempt_id: Option<String>,
}

impl Task {
    pub fn new(task_id: &str, name: &str) -> Self {
        Self {
            task_id: task_id.to_string(),
            name: name.to_string(),
            kind: TaskKind::default(),
            image: None,
            command: Vec::new(),
            env: BTreeMap::new(),
            files: Vec::new(),
            resources: BTreeMap::new(),
            dependencies: Vec::new(),
            operator_key: None,
            allow_failure: false,
            allow_dependency_failure: false,
            status: TaskStatus::Pending,
            current_attempt_id: None,
        }
    }

    pub fn with_dependencies(mut self, deps: &[&str]) -> Self {
        self.dependencies = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn with_kind(mut self, kind: TaskKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_operator_key(mut self, key: &str) -> Self {
        self.operator_key = Some(key.to_string());
        self
    }

    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_allow_failure(mut self, allow: bool) -> Self {
        self.allow_failure = allow;
        self
    }

    /// Operator hint carried in the task environment, if any.
    pub fn operator_hint(&self) -> Option<&str> {
        self.env
            .get(OPERATOR_HINT_ENV)
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
    }
}

/// A batch of tasks produced by a campaign plan.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Workflow {
    #[serde(default)]
    pub tasks: Vec<Task>,
}

impl Workflow {
    pub fn new(tasks: Vec<Task>) -> Self {
        Self { tasks }
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }
}

/// One execution record of a task against an operator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Attempt {
    pub attempt_id: String,
    pub task_id: String,
    pub run_id: String,
    pub attempt_index: u32,
    /// Raw persisted status; see [`Attempt::parsed_status`].
    pub status: String,
    pub operator_key: Option<String>,
    pub operator_type: Option<String>,
    pub external_id: Option<String>,
    pub operator_data: serde_json::Map<String, serde_json::Value>,
    pub relative_path: Option<String>,
    pub created_at: String,
    pub submitted_at: Option<String>,
    pub ended_at: Option<String>,
    pub status_reason: Option<String>,
}

impl Attempt {
    pub fn parsed_status(&self) -> Option<AttemptStatus> {
        self.status.parse().ok()
    }

    pub fn is_terminal(&self) -> bool {
        self.parsed_status().is_some_and(|s| s.is_terminal())
    }

    /// Task status this attempt projects to.
    pub fn task_status(&self) -> TaskStatus {
        project_task_status(&self.status)
    }
}

/// Pre-attempt execution record, one per task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LegacyExternalRun {
    pub task_id: String,
    pub run_id: String,
    pub operator_type: Option<String>,
    pub external_id: Option<String>,
    pub status: String,
    pub operator_data: serde_json::Map<String, serde_json::Value>,
    pub relative_path: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl LegacyExternalRun {
    pub fn parsed_status(&self) -> Option<AttemptStatus> {
        self.status.parse().ok()
    }

    pub fn is_terminal(&self) -> bool {
        self.parsed_status().is_some_and(|s| s.is_terminal())
    }

    pub fn task_status(&self) -> TaskStatus {
        project_task_status(&self.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_context_layout() {
        let ctx = RunContext::new("/data/ws", "20260101T000000Z-abcd1234");
        assert_eq!(
            ctx.root,
            PathBuf::from("/data/ws/runs/20260101T000000Z-abcd1234")
        );
        assert_eq!(ctx.store_path(), ctx.root.join("state-store"));
        assert_eq!(ctx.lock_path(), ctx.root.join("run.lock"));
        assert_eq!(ctx.config_path(), ctx.root.join("config"));
    }

    #[test]
    fn test_task_deserializes_with_defaults() {
        let task: Task = serde_json::from_str(r#"{"task_id": "t1"}"#).unwrap();
        assert_eq!(task.kind, TaskKind::Compute);
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.dependencies.is_empty());
        assert!(!task.allow_failure);
    }

    #[test]
    fn test_operator_hint_ignores_blank_values() {
        let task = Task::new("t1", "T1").with_env(OPERATOR_HINT_ENV, "  ");
        assert!(task.operator_hint().is_none());
        let task = Task::new("t1", "T1").with_env(OPERATOR_HINT_ENV, "hpc");
        assert_eq!(task.operator_hint(), Some("hpc"));
    }

    #[test]
    fn test_task_kind_parse() {
        assert_eq!("GATE".parse::<TaskKind>(), Ok(TaskKind::Gate));
        assert_eq!("approval".parse::<TaskKind>(), Ok(TaskKind::Gate));
        assert!("robot".parse::<TaskKind>().is_err());
    }
}
