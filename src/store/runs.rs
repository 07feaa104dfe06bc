//! Run row: creation, status, campaign state.

use rusqlite::{OptionalExtension, params};

use super::{StateStore, from_json, now_ts, parse_run_status, to_json};
use crate::errors::StoreError;
use cadence_common::{CampaignState, Run, RunContext, RunStatus};

impl StateStore {
    // ── Run CRUD ──────────────────────────────────────────────────────

    /// Persist a new PENDING run.
    pub fn create_run(
        &self,
        ctx: &RunContext,
        tags: &[String],
        description: Option<&str>,
    ) -> Result<Run, StoreError> {
        let now = now_ts();
        self.conn().execute(
            "INSERT INTO runs (run_id, workspace, root, status, tags, description, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
            params![
                ctx.run_id,
                ctx.workspace.display().to_string(),
                ctx.root.display().to_string(),
                RunStatus::Pending.as_str(),
                to_json("runs.tags", &tags)?,
                description,
                now,
            ],
        )?;
        self.get_run(&ctx.run_id)
    }

    pub fn get_run(&self, run_id: &str) -> Result<Run, StoreError> {
        let row = self
            .conn()
            .query_row(
                "SELECT run_id, workspace, root, status, status_reason, tags, description,
                        created_at, updated_at
                 FROM runs WHERE run_id = ?1",
                params![run_id],
                |row| {
                    Ok(RunRow {
                        run_id: row.get(0)?,
                        workspace: row.get(1)?,
                        root: row.get(2)?,
                        status: row.get(3)?,
                        status_reason: row.get(4)?,
                        tags: row.get(5)?,
                        description: row.get(6)?,
                        created_at: row.get(7)?,
                        updated_at: row.get(8)?,
                    })
                },
            )
            .optional()?;
        row.ok_or_else(|| StoreError::not_found("run", run_id))?
            .into_run()
    }

    pub fn get_run_status(&self, run_id: &str) -> Result<RunStatus, StoreError> {
        let raw: Option<String> = self
            .conn()
            .query_row(
                "SELECT status FROM runs WHERE run_id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .optional()?;
        parse_run_status(&raw.ok_or_else(|| StoreError::not_found("run", run_id))?)
    }

    /// Set the run status. `reason` replaces any previous reason.
    pub fn set_run_status(
        &self,
        run_id: &str,
        status: RunStatus,
        reason: Option<&str>,
    ) -> Result<(), StoreError> {
        let changed = self.conn().execute(
            "UPDATE runs SET status = ?1, status_reason = ?2, updated_at = ?3 WHERE run_id = ?4",
            params![status.as_str(), reason, now_ts(), run_id],
        )?;
        if changed == 0 {
            return Err(StoreError::not_found("run", run_id));
        }
        Ok(())
    }

    // ── Campaign state ────────────────────────────────────────────────

    /// Campaign document for the run; default when never written.
    pub fn get_campaign_state(&self, run_id: &str) -> Result<CampaignState, StoreError> {
        let raw: Option<Option<String>> = self
            .conn()
            .query_row(
                "SELECT campaign_state FROM runs WHERE run_id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .optional()?;
        match raw.ok_or_else(|| StoreError::not_found("run", run_id))? {
            Some(json) if !json.trim().is_empty() => from_json("runs.campaign_state", &json),
            _ => Ok(CampaignState::default()),
        }
    }

    pub fn set_campaign_state(
        &self,
        run_id: &str,
        state: &CampaignState,
    ) -> Result<(), StoreError> {
        let changed = self.conn().execute(
            "UPDATE runs SET campaign_state = ?1, updated_at = ?2 WHERE run_id = ?3",
            params![to_json("runs.campaign_state", state)?, now_ts(), run_id],
        )?;
        if changed == 0 {
            return Err(StoreError::not_found("run", run_id));
        }
        Ok(())
    }
}

// ── Internal row helpers ──────────────────────────────────────────────

struct RunRow {
    run_id: String,
    workspace: String,
    root: String,
    status: String,
    status_reason: Option<String>,
    tags: String,
    description: Option<String>,
    created_at: String,
    updated_at: String,
}

impl RunRow {
    fn into_run(self) -> Result<Run, StoreError> {
        Ok(Run {
            status: parse_run_status(&self.status)?,
            tags: from_json("runs.tags", &self.tags)?,
            run_id: self.run_id,
            workspace: self.workspace,
            root: self.root,
            status_reason: self.status_reason,
            description: self.description,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}
