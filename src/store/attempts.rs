//! Attempt rows: one per dispatch of a task.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use rusqlite::{OptionalExtension, params};
use uuid::Uuid;

use super::{StateStore, format_ts, json_object, now_ts, to_json};
use crate::errors::StoreError;
use cadence_common::{Attempt, AttemptStatus, OperatorHandle};

/// SQL list of the terminal attempt statuses.
pub(crate) const TERMINAL_SQL: &str = "('COMPLETED', 'FAILED', 'FAILED_INIT', 'CANCELLED')";

const ATTEMPT_COLUMNS: &str = "attempt_id, task_id, run_id, attempt_index, status, operator_key, \
     operator_type, external_id, operator_data, relative_path, created_at, submitted_at, ended_at, \
     status_reason";

/// Partial update of an attempt. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttemptUpdate {
    pub status: Option<AttemptStatus>,
    pub external_id: Option<String>,
    pub operator_data: Option<serde_json::Map<String, serde_json::Value>>,
    pub relative_path: Option<String>,
    pub status_reason: Option<String>,
}

impl AttemptUpdate {
    pub fn status(status: AttemptStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.status_reason = Some(reason.into());
        self
    }

    /// Everything an operator reported on `handle`.
    pub fn from_handle(handle: &OperatorHandle) -> Self {
        Self {
            status: Some(handle.status),
            external_id: handle.external_id.clone(),
            operator_data: Some(handle.operator_data.clone()),
            relative_path: handle.relative_path.clone(),
            status_reason: handle.status_reason.clone(),
        }
    }
}

impl StateStore {
    // ── Attempt creation and update ───────────────────────────────────

    /// Record a new attempt for `task_id` and make it the task's current one.
    ///
    /// `attempt_index` is one past the task's highest existing index.
    pub fn create_attempt(
        &self,
        run_id: &str,
        task_id: &str,
        operator_type: Option<&str>,
        operator_key: Option<&str>,
        status: AttemptStatus,
    ) -> Result<Attempt, StoreError> {
        let tx = self.conn().unchecked_transaction()?;
        let exists: i64 = tx.query_row(
            "SELECT COUNT(*) FROM tasks WHERE run_id = ?1 AND task_id = ?2",
            params![run_id, task_id],
            |row| row.get(0),
        )?;
        if exists == 0 {
            return Err(StoreError::not_found("task", task_id));
        }

        let next_index: i64 = tx.query_row(
            "SELECT COALESCE(MAX(attempt_index), 0) + 1 FROM attempts
             WHERE run_id = ?1 AND task_id = ?2",
            params![run_id, task_id],
            |row| row.get(0),
        )?;
        let attempt_id = Uuid::new_v4().to_string();
        let now = now_ts();
        let submitted_at = (status != AttemptStatus::Created).then_some(now.as_str());
        let ended_at = status.is_terminal().then_some(now.as_str());

        tx.execute(
            "INSERT INTO attempts (attempt_id, task_id, run_id, attempt_index, status,
                                   operator_key, operator_type, operator_data,
                                   created_at, submitted_at, ended_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, '{}', ?8, ?9, ?10)",
            params![
                attempt_id,
                task_id,
                run_id,
                next_index,
                status.as_str(),
                operator_key,
                operator_type,
                now,
                submitted_at,
                ended_at,
            ],
        )?;
        tx.execute(
            "UPDATE tasks SET current_attempt_id = ?1, updated_at = ?2
             WHERE run_id = ?3 AND task_id = ?4",
            params![attempt_id, now, run_id, task_id],
        )?;
        tx.commit()?;

        tracing::debug!(run_id, task_id, attempt_id = %attempt_id, attempt_index = next_index, "attempt created");
        self.get_attempt(&attempt_id)
    }

    /// Apply a partial update. The first move away from CREATED stamps
    /// `submitted_at`; the first entry into a terminal status stamps `ended_at`.
    pub fn update_attempt(
        &self,
        attempt_id: &str,
        update: &AttemptUpdate,
    ) -> Result<Attempt, StoreError> {
        let operator_data = update
            .operator_data
            .as_ref()
            .map(|d| to_json("attempts.operator_data", d))
            .transpose()?;
        let changed = self.conn().execute(
            &format!(
                "UPDATE attempts SET
                     status = COALESCE(?1, status),
                     external_id = COALESCE(?2, external_id),
                     operator_data = COALESCE(?3, operator_data),
                     relative_path = COALESCE(?4, relative_path),
                     status_reason = COALESCE(?5, status_reason),
                     submitted_at = CASE
                         WHEN submitted_at IS NULL AND ?1 IS NOT NULL AND ?1 != 'CREATED' THEN ?6
                         ELSE submitted_at END,
                     ended_at = CASE
                         WHEN ended_at IS NULL AND ?1 IN {TERMINAL_SQL} THEN ?6
                         ELSE ended_at END
                 WHERE attempt_id = ?7"
            ),
            params![
                update.status.map(|s| s.as_str()),
                update.external_id,
                operator_data,
                update.relative_path,
                update.status_reason,
                now_ts(),
                attempt_id,
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::not_found("attempt", attempt_id));
        }
        self.get_attempt(attempt_id)
    }

    // ── Attempt reads ─────────────────────────────────────────────────

    pub fn get_attempt(&self, attempt_id: &str) -> Result<Attempt, StoreError> {
        let row = self
            .conn()
            .query_row(
                &format!("SELECT {ATTEMPT_COLUMNS} FROM attempts WHERE attempt_id = ?1"),
                params![attempt_id],
                AttemptRow::from_row,
            )
            .optional()?;
        row.ok_or_else(|| StoreError::not_found("attempt", attempt_id))?
            .into_attempt()
    }

    /// Attempts of one task by ascending index.
    pub fn list_attempts_for_task(
        &self,
        run_id: &str,
        task_id: &str,
    ) -> Result<Vec<Attempt>, StoreError> {
        self.query_attempts(
            &format!(
                "SELECT {ATTEMPT_COLUMNS} FROM attempts
                 WHERE run_id = ?1 AND task_id = ?2 ORDER BY attempt_index"
            ),
            params![run_id, task_id],
        )
    }

    /// Non-terminal attempts of the run, oldest first.
    pub fn get_active_attempts(&self, run_id: &str) -> Result<Vec<Attempt>, StoreError> {
        self.query_attempts(
            &format!(
                "SELECT {ATTEMPT_COLUMNS} FROM attempts
                 WHERE run_id = ?1 AND status NOT IN {TERMINAL_SQL}
                 ORDER BY created_at, rowid"
            ),
            params![run_id],
        )
    }

    /// Non-terminal attempt counts keyed by operator key; no key counts under `""`.
    pub fn count_active_attempts_by_operator(
        &self,
        run_id: &str,
    ) -> Result<HashMap<String, usize>, StoreError> {
        let mut stmt = self.conn().prepare(&format!(
            "SELECT COALESCE(operator_key, ''), COUNT(*) FROM attempts
             WHERE run_id = ?1 AND status NOT IN {TERMINAL_SQL}
             GROUP BY COALESCE(operator_key, '')"
        ))?;
        let rows = stmt.query_map(params![run_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        let mut counts = HashMap::new();
        for row in rows {
            let (key, count) = row?;
            counts.insert(key, count as usize);
        }
        Ok(counts)
    }

    pub fn count_active_attempts(&self, run_id: &str) -> Result<usize, StoreError> {
        let count: i64 = self.conn().query_row(
            &format!(
                "SELECT COUNT(*) FROM attempts WHERE run_id = ?1 AND status NOT IN {TERMINAL_SQL}"
            ),
            params![run_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Attempts stuck in CREATED with no external id for longer than `timeout`.
    pub fn find_orphaned_attempts(
        &self,
        run_id: &str,
        timeout: Duration,
    ) -> Result<Vec<Attempt>, StoreError> {
        let timeout = chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::MAX);
        let cutoff = chrono::Utc::now()
            .checked_sub_signed(timeout)
            .unwrap_or(chrono::DateTime::<chrono::Utc>::MIN_UTC);
        self.query_attempts(
            &format!(
                "SELECT {ATTEMPT_COLUMNS} FROM attempts
                 WHERE run_id = ?1 AND status = 'CREATED'
                   AND (external_id IS NULL OR external_id = '')
                   AND created_at < ?2
                 ORDER BY created_at, rowid"
            ),
            params![run_id, format_ts(cutoff)],
        )
    }

    /// Mark non-terminal attempts FAILED_INIT. Returns how many changed.
    pub fn mark_attempts_failed_init(
        &self,
        attempt_ids: &[String],
        reason: &str,
    ) -> Result<usize, StoreError> {
        if attempt_ids.is_empty() {
            return Ok(0);
        }
        let now = now_ts();
        let tx = self.conn().unchecked_transaction()?;
        let mut changed = 0;
        {
            let mut stmt = tx.prepare(&format!(
                "UPDATE attempts SET status = 'FAILED_INIT', status_reason = ?1,
                     ended_at = COALESCE(ended_at, ?2)
                 WHERE attempt_id = ?3 AND status NOT IN {TERMINAL_SQL}"
            ))?;
            for id in attempt_ids {
                changed += stmt.execute(params![reason, now, id])?;
            }
        }
        tx.commit()?;
        Ok(changed)
    }

    /// Ids of tasks in the run that have at least one attempt.
    pub fn task_ids_with_attempts(&self, run_id: &str) -> Result<HashSet<String>, StoreError> {
        let mut stmt = self
            .conn()
            .prepare("SELECT DISTINCT task_id FROM attempts WHERE run_id = ?1")?;
        let rows = stmt.query_map(params![run_id], |row| row.get::<_, String>(0))?;
        let mut ids = HashSet::new();
        for row in rows {
            ids.insert(row?);
        }
        Ok(ids)
    }

    fn query_attempts(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<Attempt>, StoreError> {
        let mut stmt = self.conn().prepare(sql)?;
        let rows = stmt.query_map(params, AttemptRow::from_row)?;
        let mut attempts = Vec::new();
        for row in rows {
            attempts.push(row?.into_attempt()?);
        }
        Ok(attempts)
    }
}

// ── Internal row helpers ──────────────────────────────────────────────

struct AttemptRow {
    attempt_id: String,
    task_id: String,
    run_id: String,
    attempt_index: i64,
    status: String,
    operator_key: Option<String>,
    operator_type: Option<String>,
    external_id: Option<String>,
    operator_data: String,
    relative_path: Option<String>,
    created_at: String,
    submitted_at: Option<String>,
    ended_at: Option<String>,
    status_reason: Option<String>,
}

impl AttemptRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            attempt_id: row.get(0)?,
            task_id: row.get(1)?,
            run_id: row.get(2)?,
            attempt_index: row.get(3)?,
            status: row.get(4)?,
            operator_key: row.get(5)?,
            operator_type: row.get(6)?,
            external_id: row.get(7)?,
            operator_data: row.get(8)?,
            relative_path: row.get(9)?,
            created_at: row.get(10)?,
            submitted_at: row.get(11)?,
            ended_at: row.get(12)?,
            status_reason: row.get(13)?,
        })
    }

    fn into_attempt(self) -> Result<Attempt, StoreError> {
        Ok(Attempt {
            operator_data: json_object("attempts.operator_data", &self.operator_data)?,
            attempt_index: u32::try_from(self.attempt_index).map_err(|_| {
                StoreError::InvalidValue {
                    column: "attempts.attempt_index",
                    value: self.attempt_index.to_string(),
                }
            })?,
            attempt_id: self.attempt_id,
            task_id: self.task_id,
            run_id: self.run_id,
            status: self.status,
            operator_key: self.operator_key,
            operator_type: self.operator_type,
            external_id: self.external_id,
            relative_path: self.relative_path,
            created_at: self.created_at,
            submitted_at: self.submitted_at,
            ended_at: self.ended_at,
            status_reason: self.status_reason,
        })
    }
}
