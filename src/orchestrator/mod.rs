//! Run orchestration.
//!
//! [`RunEngine::step_run`] advances one run by one tick:
//!
//! 1. **poll**: check every in-flight attempt ([`reconcile`])
//! 2. **plan**: partition tasks by readiness ([`crate::dag::planner`])
//! 3. **execute**: dispatch ready tasks within the concurrency limits
//!    ([`limiter`], [`dispatch`])
//! 4. **analyze**: once everything has settled, fail the run or ask the
//!    campaign for more work
//!
//! [`lifecycle`] creates and resumes runs; [`driver`] loops ticks.

pub mod dispatch;
pub mod driver;
pub mod engine;
pub mod lifecycle;
pub mod limiter;
pub mod reconcile;
pub mod tick;

pub use dispatch::DispatchOutcome;
pub use driver::{DriveOptions, DriveOutcome, StopReason, drive_run};
pub use engine::RunEngine;
pub use lifecycle::{
    InitOptions, RunOrigin, RunSummary, generate_run_id, initialize_or_resume_run, initialize_run,
    list_runs,
};
pub use limiter::ConcurrencyLimiter;
pub use reconcile::PollReport;
pub use tick::TickReport;
