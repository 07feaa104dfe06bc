//! Shared domain types for the cadence orchestrator.
//!
//! Everything that crosses the boundary between the orchestration engine and
//! its collaborators lives here:
//!
//! - [`status`]: run, task and attempt lifecycle statuses plus the fixed
//!   attempt → task status projection
//! - [`models`]: runs, tasks, attempts, legacy external runs and the run
//!   directory layout
//! - [`operator`]: the `Operator` contract implemented by execution backends
//! - [`campaign`]: the `Campaign` contract supplying plan/analyze

pub mod campaign;
pub mod models;
pub mod operator;
pub mod status;

pub use campaign::{Campaign, CampaignState, TaskOutcome};
pub use models::{
    Attempt, LegacyExternalRun, OPERATOR_HINT_ENV, Run, RunContext, Task, TaskKind, Workflow,
};
pub use operator::{
    FileEntry, Operator, OperatorError, OperatorHandle, OperatorResult, PathSafetyViolation,
};
pub use status::{AttemptStatus, RunStatus, TaskStatus, project_task_status};
