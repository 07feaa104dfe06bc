//! Durable run state backed by SQLite.
//!
//! One [`StateStore`] per run directory (`<root>/state-store`). The schema is
//! migrated on every open before any other call is allowed (see [`schema`]).
//! Method groups live in sibling files:
//!
//! - [`runs`]: run row, status, campaign state
//! - [`tasks`]: workflow insertion, task reads, status healing, delete
//! - [`attempts`]: attempt creation, partial updates, active/orphan queries
//! - [`legacy`]: pre-attempt external-run records
//!
//! Every write commits before returning. Mutations that span rows run in a
//! single transaction.

pub mod attempts;
pub mod legacy;
pub mod runs;
pub mod schema;
pub mod tasks;

use std::path::{Path, PathBuf};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OpenFlags, OptionalExtension, params};

use crate::errors::StoreError;
use cadence_common::RunStatus;

pub use attempts::AttemptUpdate;
pub use legacy::ExternalRunUpdate;

/// Milliseconds a writer waits on a locked database before failing.
const BUSY_TIMEOUT_MS: u32 = 5000;

pub struct StateStore {
    conn: Connection,
    path: Option<PathBuf>,
}

impl StateStore {
    /// Open (or create) the store at `path` and migrate it to the current schema.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let conn = Connection::open(path)?;
        let store = Self {
            conn,
            path: Some(path.to_path_buf()),
        };
        store.init()?;
        Ok(store)
    }

    /// Create an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn, path: None };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<(), StoreError> {
        // journal_mode answers with a row
        self.conn
            .query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        self.conn
            .busy_timeout(std::time::Duration::from_millis(u64::from(BUSY_TIMEOUT_MS)))?;
        self.conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        schema::migrate(&self.conn)?;
        Ok(())
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn schema_version(&self) -> Result<i64, StoreError> {
        Ok(schema::stored_version(&self.conn)?.unwrap_or(0))
    }

    /// Read a run's status without migrating or writing anything.
    ///
    /// Used by discovery scans that run outside the run lock; the answer is
    /// best-effort.
    pub fn peek_run_status(path: &Path, run_id: &str) -> Result<RunStatus, StoreError> {
        if !path.exists() {
            return Err(StoreError::not_found("store", path.display().to_string()));
        }
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(std::time::Duration::from_millis(u64::from(BUSY_TIMEOUT_MS)))?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT status FROM runs WHERE run_id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .optional()?;
        let raw = raw.ok_or_else(|| StoreError::not_found("run", run_id))?;
        parse_run_status(&raw)
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Shared helpers ────────────────────────────────────────────────────

/// Current time in the store's timestamp format.
///
/// Fixed-width UTC with microseconds, so string order is time order.
pub fn now_ts() -> String {
    format_ts(Utc::now())
}

pub fn format_ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_run_status(raw: &str) -> Result<RunStatus, StoreError> {
    raw.parse().map_err(|_| StoreError::InvalidValue {
        column: "runs.status",
        value: raw.to_string(),
    })
}

pub(crate) fn to_json<T: serde::Serialize>(
    column: &'static str,
    value: &T,
) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(StoreError::json(column))
}

pub(crate) fn from_json<T: serde::de::DeserializeOwned>(
    column: &'static str,
    raw: &str,
) -> Result<T, StoreError> {
    serde_json::from_str(raw).map_err(StoreError::json(column))
}

/// Parse a JSON object column; an empty string reads as `{}`.
pub(crate) fn json_object(
    column: &'static str,
    raw: &str,
) -> Result<serde_json::Map<String, serde_json::Value>, StoreError> {
    if raw.trim().is_empty() {
        return Ok(serde_json::Map::new());
    }
    from_json(column, raw)
}
