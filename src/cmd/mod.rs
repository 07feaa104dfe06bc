//! CLI command implementations.
//!
//! | Module   | Commands handled                                         |
//! |----------|----------------------------------------------------------|
//! | `run`    | `Init`, `Run`, `Step`                                    |
//! | `status` | `Status`, `List`                                         |
//! | `admin`  | `Pause`, `Resume`, `Cancel`, `Sweep`, `External`, `DeleteTask` |

pub mod admin;
pub mod run;
pub mod status;

pub use admin::{cmd_cancel, cmd_delete_task, cmd_external, cmd_pause, cmd_resume, cmd_sweep};
pub use run::{InitArgs, RunArgs, cmd_init, cmd_run, cmd_step};
pub use status::{cmd_list, cmd_status};

use anyhow::{Context, Result};
use std::path::Path;

use cadence::campaign::WorkflowFileCampaign;
use cadence::orchestrator::RunEngine;
use cadence_common::RunContext;

/// Open an existing run with a campaign that plans nothing.
pub(crate) fn open_engine(workspace: &Path, run_id: &str) -> Result<RunEngine> {
    let ctx = RunContext::new(workspace, run_id);
    RunEngine::open(ctx, Box::new(WorkflowFileCampaign::empty()))
        .with_context(|| format!("Failed to open run '{}'", run_id))
}
