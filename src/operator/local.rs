//! In-process operator: the work is considered done the moment it is submitted.

use cadence_common::{AttemptStatus, OperatorError, OperatorHandle, OperatorResult, Run, Task};
use serde_json::json;

use super::{evidence_dir, manifest, prepare_evidence, write_json};

/// Result artifact written on submit.
pub const RESULT_FILE: &str = "result.json";

pub struct LocalOperator {
    key: String,
    options: serde_json::Map<String, serde_json::Value>,
}

impl LocalOperator {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            options: serde_json::Map::new(),
        }
    }

    pub fn with_options(mut self, options: serde_json::Map<String, serde_json::Value>) -> Self {
        self.options = options;
        self
    }
}

impl cadence_common::Operator for LocalOperator {
    fn operator_key(&self) -> &str {
        &self.key
    }

    fn operator_type(&self) -> &str {
        "local"
    }

    fn prepare_run(
        &self,
        run: &Run,
        task: &Task,
        attempt_id: Option<&str>,
    ) -> Result<OperatorHandle, OperatorError> {
        prepare_evidence(run, task, attempt_id, &self.key, "local", &self.options)
    }

    fn submit(&self, mut handle: OperatorHandle) -> Result<OperatorHandle, OperatorError> {
        if handle.status != AttemptStatus::Created {
            return Ok(handle);
        }
        let dir = evidence_dir(&handle)?.ok_or_else(|| OperatorError::Submit {
            task_id: handle.task_id.clone(),
            message: "handle has no evidence directory".to_string(),
        })?;
        let completed_at = crate::store::now_ts();
        write_json(
            &dir.join(RESULT_FILE),
            &json!({
                "task_id": handle.task_id,
                "attempt_id": handle.attempt_id,
                "completed_at": completed_at,
            }),
        )?;
        handle
            .operator_data
            .insert("completed_at".to_string(), json!(completed_at));
        handle.status = AttemptStatus::Completed;
        Ok(handle)
    }

    fn check_status(&self, handle: OperatorHandle) -> Result<OperatorHandle, OperatorError> {
        Ok(handle)
    }

    fn collect_results(&self, handle: &OperatorHandle) -> Result<OperatorResult, OperatorError> {
        let files = match evidence_dir(handle)? {
            Some(dir) => manifest::build_manifest(&dir)?,
            None => Vec::new(),
        };
        Ok(OperatorResult {
            data: handle.operator_data.clone(),
            files,
        })
    }
}
