//! Store schema and the sequential migrations applied on every open.
//!
//! Versions:
//! - 1: runs, tasks, external_runs (one execution record per task)
//! - 2: attempts table, `tasks.current_attempt_id`, backfill from external_runs
//! - 3: `status_reason` on attempts and runs, `runs.campaign_state`
//!
//! Every step is additive and safe to re-run: tables and indexes use
//! `IF NOT EXISTS`, columns are introspected before `ALTER TABLE`, and the
//! backfill inserts deterministic ids with `INSERT OR IGNORE`.

use rusqlite::{Connection, OptionalExtension, params};
use uuid::Uuid;

use crate::errors::StoreError;
use cadence_common::AttemptStatus;

/// Schema version this build reads and writes.
pub const CURRENT_VERSION: i64 = 3;

/// Namespace for attempt ids derived from legacy external runs.
pub const BACKFILL_NAMESPACE: Uuid = Uuid::from_u128(0x6f1c2a4e_9b3d_4c57_8e21_5a0d3c9b7f14);

/// Deterministic id of the attempt backfilled for `(run_id, task_id)`.
pub fn backfill_attempt_id(run_id: &str, task_id: &str) -> String {
    Uuid::new_v5(&BACKFILL_NAMESPACE, format!("{}:{}", run_id, task_id).as_bytes()).to_string()
}

/// Bring `conn` to [`CURRENT_VERSION`], refusing versions this build does not know.
pub fn migrate(conn: &Connection) -> Result<i64, StoreError> {
    let recorded = stored_version(conn)?;
    let mut current = match recorded {
        Some(v) if v <= 0 || v > CURRENT_VERSION => {
            return Err(StoreError::SchemaVersionUnsupported {
                found: v,
                supported: CURRENT_VERSION,
            });
        }
        Some(v) => v,
        None => detect_unversioned(conn)?,
    };

    if current < 1 {
        let tx = conn.unchecked_transaction()?;
        create_base_tables(&tx)?;
        write_version(&tx, 1)?;
        tx.commit()?;
        current = 1;
    }

    if current < 2 {
        let tx = conn.unchecked_transaction()?;
        migrate_v1_to_v2(&tx)?;
        write_version(&tx, 2)?;
        tx.commit()?;
        current = 2;
        tracing::info!("store migrated to schema version 2");
    }

    if current < 3 {
        let tx = conn.unchecked_transaction()?;
        migrate_v2_to_v3(&tx)?;
        write_version(&tx, 3)?;
        tx.commit()?;
        current = 3;
    }

    // Only an unversioned store that already had the current shape lacks a row here.
    if recorded.is_none() && stored_version(conn)? != Some(current) {
        write_version(conn, current)?;
    }
    Ok(current)
}

/// Version recorded in `schema_version`, if the table and a row exist.
pub fn stored_version(conn: &Connection) -> Result<Option<i64>, StoreError> {
    if !table_exists(conn, "schema_version")? {
        return Ok(None);
    }
    let version = conn
        .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
            row.get::<_, Option<i64>>(0)
        })
        .optional()?
        .flatten();
    Ok(version)
}

/// Infer the generation of a store that never recorded a version.
fn detect_unversioned(conn: &Connection) -> Result<i64, StoreError> {
    if !table_exists(conn, "tasks")? {
        return Ok(0);
    }
    if !table_has_column(conn, "tasks", "current_attempt_id")?
        || !table_exists(conn, "attempts")?
    {
        return Ok(1);
    }
    if !table_has_column(conn, "attempts", "status_reason")? {
        return Ok(2);
    }
    Ok(CURRENT_VERSION)
}

fn write_version(conn: &Connection, version: i64) -> Result<(), StoreError> {
    conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);")?;
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute(
        "INSERT INTO schema_version (version) VALUES (?1)",
        params![version],
    )?;
    Ok(())
}

fn create_base_tables(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS runs (
            run_id TEXT PRIMARY KEY,
            workspace TEXT NOT NULL,
            root TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'PENDING',
            tags TEXT NOT NULL DEFAULT '[]',
            description TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS tasks (
            run_id TEXT NOT NULL,
            task_id TEXT NOT NULL,
            name TEXT NOT NULL DEFAULT '',
            kind TEXT NOT NULL DEFAULT 'compute',
            image TEXT,
            command TEXT NOT NULL DEFAULT '[]',
            env TEXT NOT NULL DEFAULT '{}',
            files TEXT NOT NULL DEFAULT '[]',
            resources TEXT NOT NULL DEFAULT '{}',
            dependencies TEXT NOT NULL DEFAULT '[]',
            operator_key TEXT,
            allow_failure INTEGER NOT NULL DEFAULT 0,
            allow_dependency_failure INTEGER NOT NULL DEFAULT 0,
            status TEXT NOT NULL DEFAULT 'PENDING',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (run_id, task_id)
        );

        CREATE TABLE IF NOT EXISTS external_runs (
            task_id TEXT PRIMARY KEY,
            run_id TEXT NOT NULL,
            operator_type TEXT,
            external_id TEXT,
            status TEXT NOT NULL,
            operator_data TEXT NOT NULL DEFAULT '{}',
            relative_path TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_tasks_run ON tasks(run_id);
        CREATE INDEX IF NOT EXISTS idx_external_runs_run ON external_runs(run_id);
        ",
    )?;
    Ok(())
}

fn migrate_v1_to_v2(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS attempts (
            attempt_id TEXT PRIMARY KEY,
            task_id TEXT NOT NULL,
            run_id TEXT NOT NULL,
            attempt_index INTEGER NOT NULL,
            status TEXT NOT NULL,
            operator_key TEXT,
            operator_type TEXT,
            external_id TEXT,
            operator_data TEXT NOT NULL DEFAULT '{}',
            relative_path TEXT,
            created_at TEXT NOT NULL,
            submitted_at TEXT,
            ended_at TEXT,
            UNIQUE (run_id, task_id, attempt_index)
        );

        CREATE INDEX IF NOT EXISTS idx_attempts_task ON attempts(run_id, task_id);
        CREATE INDEX IF NOT EXISTS idx_attempts_status ON attempts(status);
        ",
    )?;

    if !table_has_column(conn, "tasks", "current_attempt_id")? {
        conn.execute("ALTER TABLE tasks ADD COLUMN current_attempt_id TEXT", [])?;
    }

    backfill_attempts(conn)?;

    conn.execute(
        "UPDATE tasks SET current_attempt_id = (
             SELECT a.attempt_id FROM attempts a
             WHERE a.run_id = tasks.run_id AND a.task_id = tasks.task_id
             ORDER BY a.attempt_index DESC LIMIT 1
         )
         WHERE current_attempt_id IS NULL",
        [],
    )?;
    Ok(())
}

struct LegacyBackfillRow {
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

/// One attempt per legacy external run, keyed by a v5 uuid of `(run, task)`.
fn backfill_attempts(conn: &Connection) -> Result<usize, StoreError> {
    let rows: Vec<LegacyBackfillRow> = {
        let mut stmt = conn.prepare(
            "SELECT task_id, run_id, operator_type, external_id, status, operator_data,
                    relative_path, created_at, updated_at
             FROM external_runs ORDER BY rowid",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok(LegacyBackfillRow {
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
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };

    let mut inserted = 0;
    for row in rows {
        let parsed = row.status.parse::<AttemptStatus>().ok();
        let submitted_at = match parsed {
            Some(AttemptStatus::Created) => None,
            _ => Some(row.created_at.as_str()),
        };
        let ended_at = parsed
            .filter(AttemptStatus::is_terminal)
            .map(|_| row.updated_at.as_str());

        inserted += conn.execute(
            "INSERT OR IGNORE INTO attempts (
                 attempt_id, task_id, run_id, attempt_index, status, operator_key,
                 operator_type, external_id, operator_data, relative_path,
                 created_at, submitted_at, ended_at
             ) VALUES (?1, ?2, ?3, 1, ?4, NULL, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                backfill_attempt_id(&row.run_id, &row.task_id),
                row.task_id,
                row.run_id,
                row.status,
                row.operator_type,
                row.external_id,
                row.operator_data,
                row.relative_path,
                row.created_at,
                submitted_at,
                ended_at,
            ],
        )?;
    }
    if inserted > 0 {
        tracing::info!(count = inserted, "backfilled attempts from legacy external runs");
    }
    Ok(inserted)
}

fn migrate_v2_to_v3(conn: &Connection) -> Result<(), StoreError> {
    add_column_if_missing(conn, "attempts", "status_reason", "TEXT")?;
    add_column_if_missing(conn, "runs", "status_reason", "TEXT")?;
    add_column_if_missing(conn, "runs", "campaign_state", "TEXT")?;
    conn.execute_batch(
        "CREATE INDEX IF NOT EXISTS idx_attempts_run_status ON attempts(run_id, status);",
    )?;
    Ok(())
}

fn add_column_if_missing(
    conn: &Connection,
    table: &str,
    column: &str,
    decl: &str,
) -> Result<(), StoreError> {
    if !table_has_column(conn, table, column)? {
        conn.execute(
            &format!("ALTER TABLE {table} ADD COLUMN {column} {decl}"),
            [],
        )?;
    }
    Ok(())
}

pub(crate) fn table_exists(conn: &Connection, table: &str) -> Result<bool, StoreError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        params![table],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

pub(crate) fn table_has_column(
    conn: &Connection,
    table: &str,
    column: &str,
) -> Result<bool, StoreError> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
