//! Built-in execution backends and operator resolution.
//!
//! - [`signal`]: human, HPC and lab work coordinated through signal files
//! - [`local`]: completes in-process
//! - [`registry`]: key → operator map built from the run config
//! - [`routing`]: which route a task takes, and the lookup candidate chain
//!
//! Evidence for an attempt lives under `tasks/<task_id>/attempts/<attempt_id>/`
//! inside the run root; [`paths`] enforces that nothing escapes that root.

pub mod local;
pub mod manifest;
pub mod paths;
pub mod registry;
pub mod routing;
pub mod signal;

use std::path::{Path, PathBuf};

use cadence_common::{OperatorError, OperatorHandle, Run, Task};
use serde::Serialize;
use uuid::Uuid;

pub use local::LocalOperator;
pub use registry::OperatorRegistry;
pub use routing::{KeyResolution, Route, canonical_type, lookup_candidates, resolve_key};
pub use signal::{SignalFileOperator, SignalKind};

/// Request artifact written into every evidence directory.
pub const REQUEST_FILE: &str = "request.json";

#[derive(Debug, Serialize)]
struct RequestDocument<'a> {
    run_id: &'a str,
    task_id: &'a str,
    attempt_id: Option<&'a str>,
    operator_key: &'a str,
    operator_type: &'a str,
    name: &'a str,
    kind: &'a str,
    image: Option<&'a str>,
    command: &'a [String],
    env: &'a std::collections::BTreeMap<String, String>,
    files: &'a [String],
    resources: &'a std::collections::BTreeMap<String, serde_json::Value>,
    options: &'a serde_json::Map<String, serde_json::Value>,
    requested_at: String,
}

/// Allocate the evidence directory for a new handle and write `request.json`.
///
/// With an attempt id the directory is `tasks/<task>/attempts/<attempt>`;
/// without one a fresh `operators/<type>/<uuid>` directory is used.
pub(crate) fn prepare_evidence(
    run: &Run,
    task: &Task,
    attempt_id: Option<&str>,
    operator_key: &str,
    operator_type: &str,
    options: &serde_json::Map<String, serde_json::Value>,
) -> Result<OperatorHandle, OperatorError> {
    let root = PathBuf::from(&run.root);
    let relative = match attempt_id {
        Some(id) => paths::attempt_relative_dir(&root, &task.task_id, id)?,
        None => {
            paths::legacy_relative_dir(&root, operator_type, &Uuid::new_v4().to_string())?
        }
    };
    let dir = paths::create_dir_under_root(&root, &relative)?;

    let request = RequestDocument {
        run_id: &run.run_id,
        task_id: &task.task_id,
        attempt_id,
        operator_key,
        operator_type,
        name: &task.name,
        kind: task.kind.as_str(),
        image: task.image.as_deref(),
        command: &task.command,
        env: &task.env,
        files: &task.files,
        resources: &task.resources,
        options,
        requested_at: crate::store::now_ts(),
    };
    write_json(&dir.join(REQUEST_FILE), &request)?;

    let mut handle =
        OperatorHandle::new(&root, &run.run_id, &task.task_id, operator_key, operator_type);
    handle.attempt_id = attempt_id.map(str::to_string);
    handle.relative_path = Some(relative_string(&relative));
    Ok(handle)
}

/// The handle's evidence directory, re-checked against the run root.
pub(crate) fn evidence_dir(handle: &OperatorHandle) -> Result<Option<PathBuf>, OperatorError> {
    match &handle.relative_path {
        Some(rel) => Ok(Some(paths::resolve_under_root(
            &handle.run_root,
            Path::new(rel),
        )?)),
        None => Ok(None),
    }
}

pub(crate) fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), OperatorError> {
    let body = serde_json::to_string_pretty(value)?;
    std::fs::write(path, body).map_err(|e| OperatorError::io(path, e))
}

/// `/`-separated form stored in the database.
fn relative_string(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
pub(crate) mod test_support {
    use cadence_common::{Run, RunStatus};
    use std::path::Path;

    pub fn run_at(root: &Path) -> Run {
        Run {
            run_id: "r1".to_string(),
            workspace: root.display().to_string(),
            root: root.display().to_string(),
            status: RunStatus::Running,
            status_reason: None,
            tags: Vec::new(),
            description: None,
            created_at: crate::store::now_ts(),
            updated_at: crate::store::now_ts(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_prepare_evidence_writes_request() {
        let dir = tempdir().unwrap();
        let run = test_support::run_at(dir.path());
        let task = Task::new("t1", "Simulate").with_env("MESH", "fine");
        let handle =
            prepare_evidence(&run, &task, Some("a1"), "hpc", "hpc", &Default::default()).unwrap();

        assert_eq!(handle.relative_path.as_deref(), Some("tasks/t1/attempts/a1"));
        assert_eq!(handle.attempt_id.as_deref(), Some("a1"));
        let body = std::fs::read_to_string(dir.path().join("tasks/t1/attempts/a1/request.json"))
            .unwrap();
        let doc: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(doc["task_id"], "t1");
        assert_eq!(doc["env"]["MESH"], "fine");
    }

    #[test]
    fn test_prepare_without_attempt_uses_operator_dir() {
        let dir = tempdir().unwrap();
        let run = test_support::run_at(dir.path());
        let handle = prepare_evidence(
            &run,
            &Task::new("t1", "T1"),
            None,
            "lab",
            "experiment",
            &Default::default(),
        )
        .unwrap();
        let rel = handle.relative_path.unwrap();
        assert!(rel.starts_with("operators/experiment/"));
        assert!(dir.path().join(&rel).join(REQUEST_FILE).is_file());
    }

    #[test]
    fn test_unsafe_task_id_rejected_before_write() {
        let dir = tempdir().unwrap();
        let run = test_support::run_at(dir.path());
        let err = prepare_evidence(
            &run,
            &Task::new("../escape", "bad"),
            Some("a1"),
            "hpc",
            "hpc",
            &Default::default(),
        )
        .unwrap_err();
        assert!(matches!(err, OperatorError::PathSafety(_)));
        assert!(!dir.path().join("tasks").exists());
    }
}
