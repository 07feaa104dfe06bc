//! Task dependency graphs.
//!
//! - **Builder** validates a batch of tasks: unique ids, known dependencies,
//!   no cycles. Run at workflow insertion so a bad graph never reaches the store.
//! - **Planner** partitions a run's tasks every tick into ready, active,
//!   completed and failed buckets.
//!
//! ```
//! use cadence::dag::{DagBuilder, plan_tasks};
//! use cadence_common::Task;
//! use std::collections::HashSet;
//!
//! let tasks = vec![
//!     Task::new("prep", "Prepare inputs"),
//!     Task::new("sim", "Simulate").with_dependencies(&["prep"]),
//! ];
//! DagBuilder::new(&tasks).validate().unwrap();
//!
//! let plan = plan_tasks(&tasks, &HashSet::new());
//! assert_eq!(plan.ready.len(), 1);
//! assert_eq!(plan.blocked, vec!["sim"]);
//! ```

pub mod builder;
pub mod planner;

pub use builder::DagBuilder;
pub use planner::{Plan, PlanSummary, plan_tasks};
