//! The contract every execution backend implements.
//!
//! An operator never runs inside the tick as a long computation: it writes
//! request artifacts, hands work off, and later answers status questions by
//! inspecting local state (signal files, job records).

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

use crate::models::{Run, Task};
use crate::status::AttemptStatus;

/// A path that would resolve outside the run root.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Unsafe path {candidate} (root {root}): {reason}")]
pub struct PathSafetyViolation {
    pub root: PathBuf,
    pub candidate: PathBuf,
    pub reason: String,
}

/// Failures raised by an operator call.
#[derive(Debug, Error)]
pub enum OperatorError {
    #[error("Prepare failed for task {task_id}: {message}")]
    Prepare { task_id: String, message: String },

    #[error("Submit failed for task {task_id}: {message}")]
    Submit { task_id: String, message: String },

    #[error("Status check failed for task {task_id}: {message}")]
    Status { task_id: String, message: String },

    #[error("Result collection failed for task {task_id}: {message}")]
    Collect { task_id: String, message: String },

    #[error(transparent)]
    PathSafety(#[from] PathSafetyViolation),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl OperatorError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// In-flight view of one attempt's external state.
#[derive(Debug, Clone, PartialEq)]
pub struct OperatorHandle {
    pub run_root: PathBuf,
    pub run_id: String,
    pub task_id: String,
    pub attempt_id: Option<String>,
    pub operator_key: String,
    pub operator_type: String,
    pub status: AttemptStatus,
    pub external_id: Option<String>,
    pub operator_data: serde_json::Map<String, serde_json::Value>,
    /// Evidence directory relative to `run_root`.
    pub relative_path: Option<String>,
    pub status_reason: Option<String>,
}

impl OperatorHandle {
    pub fn new(
        run_root: impl Into<PathBuf>,
        run_id: &str,
        task_id: &str,
        operator_key: &str,
        operator_type: &str,
    ) -> Self {
        Self {
            run_root: run_root.into(),
            run_id: run_id.to_string(),
            task_id: task_id.to_string(),
            attempt_id: None,
            operator_key: operator_key.to_string(),
            operator_type: operator_type.to_string(),
            status: AttemptStatus::Created,
            external_id: None,
            operator_data: serde_json::Map::new(),
            relative_path: None,
            status_reason: None,
        }
    }

    /// Absolute evidence directory, if one has been allocated.
    pub fn evidence_dir(&self) -> Option<PathBuf> {
        self.relative_path.as_ref().map(|p| self.run_root.join(p))
    }
}

/// One file in a result manifest.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileEntry {
    /// Path relative to the evidence directory, `/`-separated.
    pub path: String,
    pub size: u64,
    pub sha256: String,
}

/// Structured data plus the file manifest returned on collection.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct OperatorResult {
    pub data: serde_json::Map<String, serde_json::Value>,
    pub files: Vec<FileEntry>,
}

/// An execution backend.
///
/// `check_status` must not fail for work that simply is not finished yet;
/// malformed backend output is reported as a FAILED handle carrying the
/// parse error in `status_reason`.
pub trait Operator: Send + Sync {
    /// Registry key this instance is configured under.
    fn operator_key(&self) -> &str;

    /// Backend type name (`human`, `hpc`, `local`, ...).
    fn operator_type(&self) -> &str;

    /// Allocate the evidence directory and write request artifacts.
    /// Returns a handle in CREATED.
    fn prepare_run(
        &self,
        run: &Run,
        task: &Task,
        attempt_id: Option<&str>,
    ) -> Result<OperatorHandle, OperatorError>;

    /// Hand the work off. Idempotent once the handle is past CREATED.
    fn submit(&self, handle: OperatorHandle) -> Result<OperatorHandle, OperatorError>;

    fn check_status(&self, handle: OperatorHandle) -> Result<OperatorHandle, OperatorError>;

    /// Only meaningful once the handle is terminal.
    fn collect_results(&self, handle: &OperatorHandle) -> Result<OperatorResult, OperatorError>;
}
