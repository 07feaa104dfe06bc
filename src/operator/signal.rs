//! Operators coordinated through signal files in the evidence directory.
//!
//! `prepare_run` writes `request.json`. Whoever does the work (a person, a
//! batch scheduler wrapper, a lab system) answers by writing `status.json`:
//!
//! ```json
//! { "status": "COMPLETED", "reason": null, "external_id": "job-42", "data": {} }
//! ```
//!
//! Until that file appears the attempt keeps its current status.

use serde::Deserialize;

use cadence_common::{
    AttemptStatus, OperatorError, OperatorHandle, OperatorResult, Run, Task,
};

use super::{evidence_dir, manifest, prepare_evidence};

/// Signal file written by the party doing the work.
pub const STATUS_FILE: &str = "status.json";

/// The flavours of signal-file backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Human,
    Hpc,
    Experiment,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Human => "human",
            Self::Hpc => "hpc",
            Self::Experiment => "experiment",
        }
    }

    pub fn from_type(operator_type: &str) -> Option<Self> {
        match operator_type {
            "human" => Some(Self::Human),
            "hpc" => Some(Self::Hpc),
            "experiment" => Some(Self::Experiment),
            _ => None,
        }
    }

    /// Status right after a successful submit. A batch queue accepts the
    /// job; people and labs are simply waited on.
    fn submitted_status(&self) -> AttemptStatus {
        match self {
            Self::Hpc => AttemptStatus::Submitted,
            Self::Human | Self::Experiment => AttemptStatus::WaitingExternal,
        }
    }
}

#[derive(Debug, Deserialize)]
struct StatusSignal {
    status: String,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    external_id: Option<String>,
    #[serde(default)]
    data: Option<serde_json::Map<String, serde_json::Value>>,
}

pub struct SignalFileOperator {
    key: String,
    kind: SignalKind,
    options: serde_json::Map<String, serde_json::Value>,
}

impl SignalFileOperator {
    pub fn new(key: impl Into<String>, kind: SignalKind) -> Self {
        Self {
            key: key.into(),
            kind,
            options: serde_json::Map::new(),
        }
    }

    /// Options copied into every `request.json`.
    pub fn with_options(mut self, options: serde_json::Map<String, serde_json::Value>) -> Self {
        self.options = options;
        self
    }

    fn status_error(&self, handle: &OperatorHandle, message: String) -> OperatorError {
        OperatorError::Status {
            task_id: handle.task_id.clone(),
            message,
        }
    }
}

impl cadence_common::Operator for SignalFileOperator {
    fn operator_key(&self) -> &str {
        &self.key
    }

    fn operator_type(&self) -> &str {
        self.kind.as_str()
    }

    fn prepare_run(
        &self,
        run: &Run,
        task: &Task,
        attempt_id: Option<&str>,
    ) -> Result<OperatorHandle, OperatorError> {
        prepare_evidence(
            run,
            task,
            attempt_id,
            &self.key,
            self.kind.as_str(),
            &self.options,
        )
    }

    fn submit(&self, mut handle: OperatorHandle) -> Result<OperatorHandle, OperatorError> {
        if handle.status != AttemptStatus::Created {
            return Ok(handle);
        }
        if evidence_dir(&handle)?.is_none() {
            return Err(OperatorError::Submit {
                task_id: handle.task_id.clone(),
                message: "handle has no evidence directory".to_string(),
            });
        }
        if handle.external_id.is_none() {
            let suffix = handle
                .attempt_id
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            handle.external_id = Some(format!("{}-{}", self.kind.as_str(), suffix));
        }
        handle.status = self.kind.submitted_status();
        tracing::debug!(
            task_id = %handle.task_id,
            operator_key = %self.key,
            external_id = ?handle.external_id,
            "submitted via signal file"
        );
        Ok(handle)
    }

    fn check_status(&self, mut handle: OperatorHandle) -> Result<OperatorHandle, OperatorError> {
        if handle.status.is_terminal() {
            return Ok(handle);
        }
        let dir = evidence_dir(&handle)?
            .ok_or_else(|| self.status_error(&handle, "handle has no evidence directory".into()))?;
        let path = dir.join(STATUS_FILE);
        let body = match std::fs::read_to_string(&path) {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(handle),
            Err(e) => return Err(OperatorError::io(&path, e)),
        };

        let signal: StatusSignal = match serde_json::from_str(&body) {
            Ok(signal) => signal,
            Err(e) => {
                handle.status = AttemptStatus::Failed;
                handle.status_reason = Some(format!("malformed {}: {}", STATUS_FILE, e));
                return Ok(handle);
            }
        };
        let status = match signal.status.parse::<AttemptStatus>() {
            Ok(AttemptStatus::FailedInit) | Err(_) => {
                handle.status = AttemptStatus::Failed;
                handle.status_reason = Some(format!(
                    "unrecognized status '{}' in {}",
                    signal.status, STATUS_FILE
                ));
                return Ok(handle);
            }
            Ok(status) => status,
        };

        // CREATED in a signal file means the worker has not picked it up.
        if status != AttemptStatus::Created {
            handle.status = status;
        }
        if signal.reason.is_some() {
            handle.status_reason = signal.reason;
        }
        if signal.external_id.is_some() {
            handle.external_id = signal.external_id;
        }
        if let Some(data) = signal.data {
            handle.operator_data.extend(data);
        }
        Ok(handle)
    }

    fn collect_results(&self, handle: &OperatorHandle) -> Result<OperatorResult, OperatorError> {
        let dir = evidence_dir(handle)?.ok_or_else(|| OperatorError::Collect {
            task_id: handle.task_id.clone(),
            message: "handle has no evidence directory".to_string(),
        })?;
        Ok(OperatorResult {
            data: handle.operator_data.clone(),
            files: manifest::build_manifest(&dir)?,
        })
    }
}
