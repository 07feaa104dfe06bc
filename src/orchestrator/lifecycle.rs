//! Creating, resuming and listing runs in a workspace.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;

use cadence_common::{Campaign, CampaignState, RunContext, RunStatus};

use crate::config::RunConfig;
use crate::errors::EngineError;
use crate::lock::{FileRunLock, RunLock};
use crate::store::StateStore;

/// Options for creating a run.
#[derive(Debug, Clone, Default)]
pub struct InitOptions {
    /// Use this id instead of generating one.
    pub run_id: Option<String>,
    pub tags: Vec<String>,
    pub description: Option<String>,
    /// Config file copied into the run as `config`.
    pub config_file: Option<PathBuf>,
}

/// Whether [`initialize_or_resume_run`] picked up an existing run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOrigin {
    Created,
    Resumed,
}

/// Last id issued by this process, as `unix_seconds << 32 | suffix`.
static LAST_RUN_KEY: AtomicU64 = AtomicU64::new(0);

/// Time-ordered run id: `YYYYMMDDTHHMMSSZ-<8 hex>`.
///
/// The suffix is the microsecond within the second (upper 20 bits) and a
/// tiebreak counter (lower 12 bits). Ids from one process strictly increase,
/// so lexical order is creation order.
pub fn generate_run_id() -> String {
    let now = Utc::now();
    let micros = u64::from(now.timestamp_subsec_micros().min(999_999));
    let secs = u64::try_from(now.timestamp()).unwrap_or(0);
    let candidate = (secs << 32) | (micros << 12);
    let previous = match LAST_RUN_KEY.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
        Some(candidate.max(last + 1))
    }) {
        Ok(previous) | Err(previous) => previous,
    };
    let key = candidate.max(previous + 1);

    let stamp = i64::try_from(key >> 32)
        .ok()
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
        .unwrap_or(now);
    format!("{}-{:08x}", stamp.format("%Y%m%dT%H%M%SZ"), key & 0xffff_ffff)
}

/// Create a run directory and store, persist the run as PENDING, and insert
/// the campaign's initial workflow (if it has one).
pub fn initialize_run(
    workspace: &Path,
    campaign: &mut dyn Campaign,
    options: &InitOptions,
) -> Result<RunContext, EngineError> {
    let run_id = options.run_id.clone().unwrap_or_else(generate_run_id);
    let ctx = RunContext::new(workspace, run_id);
    if ctx.store_path().exists() {
        return Err(EngineError::RunExists {
            run_id: ctx.run_id.clone(),
        });
    }
    std::fs::create_dir_all(&ctx.root).map_err(|source| EngineError::Io {
        path: ctx.root.clone(),
        source,
    })?;
    let _guard = FileRunLock::new(ctx.lock_path()).try_acquire()?;

    if let Some(config_file) = &options.config_file {
        // Validate before copying so a bad file never lands in the run.
        RunConfig::load(config_file)?;
        std::fs::copy(config_file, ctx.config_path()).map_err(|source| EngineError::Io {
            path: config_file.clone(),
            source,
        })?;
    }

    let store = StateStore::open(&ctx.store_path())?;
    store.create_run(&ctx, &options.tags, options.description.as_deref())?;

    let mut state = CampaignState::default();
    let workflow = campaign.plan(&mut state).map_err(EngineError::Campaign)?;
    if let Some(workflow) = workflow.filter(|w| !w.is_empty()) {
        let inserted = store.add_workflow(&ctx.run_id, &workflow)?;
        tracing::info!(run_id = %ctx.run_id, tasks = inserted, "initial workflow inserted");
    }
    store.set_campaign_state(&ctx.run_id, &state)?;

    tracing::info!(run_id = %ctx.run_id, root = %ctx.root.display(), "run created");
    Ok(ctx)
}

/// Resume the requested (or latest resumable) run, or create a new one.
///
/// With `options.run_id`: resume if its directory exists, else create it.
/// Without: resume the latest run if it is PENDING, RUNNING or PAUSED (or
/// whatever its status when `always_resume`); otherwise create a new run.
/// An unreadable latest run is logged and a new run is created.
pub fn initialize_or_resume_run(
    workspace: &Path,
    campaign: &mut dyn Campaign,
    options: &InitOptions,
    always_resume: bool,
) -> Result<(RunContext, RunOrigin), EngineError> {
    if let Some(run_id) = &options.run_id {
        let ctx = RunContext::new(workspace, run_id.clone());
        if ctx.exists() {
            tracing::info!(run_id = %run_id, "resuming run");
            return Ok((ctx, RunOrigin::Resumed));
        }
        return Ok((initialize_run(workspace, campaign, options)?, RunOrigin::Created));
    }

    if let Some(latest) = run_ids(workspace)?.into_iter().next() {
        let ctx = RunContext::new(workspace, latest);
        match StateStore::peek_run_status(&ctx.store_path(), &ctx.run_id) {
            Ok(status) if status.is_resumable() || always_resume => {
                tracing::info!(run_id = %ctx.run_id, status = %status, "resuming latest run");
                return Ok((ctx, RunOrigin::Resumed));
            }
            Ok(status) => {
                tracing::debug!(run_id = %ctx.run_id, status = %status, "latest run is finished");
            }
            Err(e) => {
                tracing::warn!(run_id = %ctx.run_id, error = %e, "cannot read latest run; starting a new one");
            }
        }
    }
    Ok((initialize_run(workspace, campaign, options)?, RunOrigin::Created))
}

/// Run directory names under `workspace`, newest first.
pub fn run_ids(workspace: &Path) -> Result<Vec<String>, EngineError> {
    let runs_dir = RunContext::runs_dir(workspace);
    if !runs_dir.is_dir() {
        return Ok(Vec::new());
    }
    let entries = std::fs::read_dir(&runs_dir).map_err(|source| EngineError::Io {
        path: runs_dir.clone(),
        source,
    })?;
    let mut ids: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
        .collect();
    ids.sort_unstable_by(|a, b| b.cmp(a));
    Ok(ids)
}

/// One line of `list_runs`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub status: Option<RunStatus>,
    /// Why the status could not be read.
    pub error: Option<String>,
}

/// Every run in the workspace, newest first, with a best-effort status.
pub fn list_runs(workspace: &Path) -> Result<Vec<RunSummary>, EngineError> {
    Ok(run_ids(workspace)?
        .into_iter()
        .map(|run_id| {
            let ctx = RunContext::new(workspace, run_id.clone());
            match StateStore::peek_run_status(&ctx.store_path(), &run_id) {
                Ok(status) => RunSummary {
                    run_id,
                    status: Some(status),
                    error: None,
                },
                Err(e) => RunSummary {
                    run_id,
                    status: None,
                    error: Some(e.to_string()),
                },
            }
        })
        .collect())
}
