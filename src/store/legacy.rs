//! Legacy external-run records (one per task, predating attempts).
//!
//! Still written for externally coordinated tasks and read for any task that
//! has no attempts.

use rusqlite::{OptionalExtension, params};

use super::attempts::TERMINAL_SQL;
use super::{StateStore, json_object, now_ts, to_json};
use crate::errors::StoreError;
use cadence_common::{AttemptStatus, LegacyExternalRun, OperatorHandle};

const EXTERNAL_RUN_COLUMNS: &str = "task_id, run_id, operator_type, external_id, status, \
     operator_data, relative_path, created_at, updated_at";

/// Partial update of a legacy external run. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExternalRunUpdate {
    pub status: Option<AttemptStatus>,
    pub external_id: Option<String>,
    pub operator_data: Option<serde_json::Map<String, serde_json::Value>>,
    pub relative_path: Option<String>,
}

impl ExternalRunUpdate {
    pub fn from_handle(handle: &OperatorHandle) -> Self {
        Self {
            status: Some(handle.status),
            external_id: handle.external_id.clone(),
            operator_data: Some(handle.operator_data.clone()),
            relative_path: handle.relative_path.clone(),
        }
    }
}

impl StateStore {
    /// Insert or replace the status of the task's external run.
    pub fn upsert_external_run(
        &self,
        run_id: &str,
        task_id: &str,
        operator_type: Option<&str>,
        status: AttemptStatus,
    ) -> Result<LegacyExternalRun, StoreError> {
        let now = now_ts();
        self.conn().execute(
            "INSERT INTO external_runs (task_id, run_id, operator_type, status, operator_data,
                                        created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, '{}', ?5, ?5)
             ON CONFLICT(task_id) DO UPDATE SET
                 run_id = excluded.run_id,
                 operator_type = COALESCE(excluded.operator_type, operator_type),
                 status = excluded.status,
                 updated_at = excluded.updated_at",
            params![task_id, run_id, operator_type, status.as_str(), now],
        )?;
        self.get_external_run(task_id)?
            .ok_or_else(|| StoreError::not_found("external run", task_id))
    }

    pub fn get_external_run(&self, task_id: &str) -> Result<Option<LegacyExternalRun>, StoreError> {
        let row = self
            .conn()
            .query_row(
                &format!("SELECT {EXTERNAL_RUN_COLUMNS} FROM external_runs WHERE task_id = ?1"),
                params![task_id],
                ExternalRunRow::from_row,
            )
            .optional()?;
        row.map(ExternalRunRow::into_external_run).transpose()
    }

    pub fn list_external_runs(&self, run_id: &str) -> Result<Vec<LegacyExternalRun>, StoreError> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT {EXTERNAL_RUN_COLUMNS} FROM external_runs WHERE run_id = ?1 ORDER BY rowid"
        ))?;
        let rows = stmt.query_map(params![run_id], ExternalRunRow::from_row)?;
        let mut runs = Vec::new();
        for row in rows {
            runs.push(row?.into_external_run()?);
        }
        Ok(runs)
    }

    pub fn update_external_run(
        &self,
        task_id: &str,
        update: &ExternalRunUpdate,
    ) -> Result<LegacyExternalRun, StoreError> {
        let operator_data = update
            .operator_data
            .as_ref()
            .map(|d| to_json("external_runs.operator_data", d))
            .transpose()?;
        let changed = self.conn().execute(
            "UPDATE external_runs SET
                 status = COALESCE(?1, status),
                 external_id = COALESCE(?2, external_id),
                 operator_data = COALESCE(?3, operator_data),
                 relative_path = COALESCE(?4, relative_path),
                 updated_at = ?5
             WHERE task_id = ?6",
            params![
                update.status.map(|s| s.as_str()),
                update.external_id,
                operator_data,
                update.relative_path,
                now_ts(),
                task_id,
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::not_found("external run", task_id));
        }
        self.get_external_run(task_id)?
            .ok_or_else(|| StoreError::not_found("external run", task_id))
    }

    /// Non-terminal external runs of the run.
    pub fn count_active_external_runs(&self, run_id: &str) -> Result<usize, StoreError> {
        let count: i64 = self.conn().query_row(
            &format!(
                "SELECT COUNT(*) FROM external_runs WHERE run_id = ?1 AND status NOT IN {TERMINAL_SQL}"
            ),
            params![run_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

// ── Internal row helpers ──────────────────────────────────────────────

struct ExternalRunRow {
    task_id: String,
    run_id: String,
    operator_type: Option<String>,
    external_id: Option<String>,
    status: String,
    operator_data: String,
    relative_path: Option<String>,
    created_at: String,
    updated_at: String,
}

impl ExternalRunRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            task_id: row.get(0)?,
            run_id: row.get(1)?,
            operator_type: row.get(2)?,
            external_id: row.get(3)?,
            status: row.get(4)?,
            operator_data: row.get(5)?,
            relative_path: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
        })
    }

    fn into_external_run(self) -> Result<LegacyExternalRun, StoreError> {
        Ok(LegacyExternalRun {
            operator_data: json_object("external_runs.operator_data", &self.operator_data)?,
            task_id: self.task_id,
            run_id: self.run_id,
            operator_type: self.operator_type,
            external_id: self.external_id,
            status: self.status,
            relative_path: self.relative_path,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}
