//! Lifecycle statuses for runs, tasks and attempts.
//!
//! Statuses are persisted as upper-case strings (`"WAITING_EXTERNAL"`). Task
//! status is never set independently of execution state: it is healed every
//! tick from the status of the task's current attempt via
//! [`project_task_status`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    #[default]
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Paused => "PAUSED",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    /// Terminal runs are never ticked again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Statuses a driver picks back up when resuming the latest run.
    pub fn is_resumable(&self) -> bool {
        matches!(self, Self::Pending | Self::Running | Self::Paused)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(Self::Pending),
            "RUNNING" => Ok(Self::Running),
            "PAUSED" => Ok(Self::Paused),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "CANCELLED" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid run status: {}", s)),
        }
    }
}

/// Status of a task as seen by the dependency planner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    #[default]
    Pending,
    WaitingExternal,
    Running,
    Completed,
    Skipped,
    Failed,
    Cancelled,
    /// Projection of an attempt status this build does not recognize.
    Unknown,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::WaitingExternal => "WAITING_EXTERNAL",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Skipped => "SKIPPED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// Parse a persisted task status. Empty means "never set" and reads as
    /// pending; anything unrecognized reads as [`TaskStatus::Unknown`].
    pub fn parse_lenient(s: &str) -> Self {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Self::Pending;
        }
        trimmed.parse().unwrap_or(Self::Unknown)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(Self::Pending),
            // Older stores wrote the attempt status straight onto the task.
            "WAITING_EXTERNAL" | "SUBMITTED" => Ok(Self::WaitingExternal),
            "RUNNING" => Ok(Self::Running),
            "COMPLETED" => Ok(Self::Completed),
            "SKIPPED" => Ok(Self::Skipped),
            "FAILED" => Ok(Self::Failed),
            "CANCELLED" => Ok(Self::Cancelled),
            "UNKNOWN" => Ok(Self::Unknown),
            _ => Err(format!("Invalid task status: {}", s)),
        }
    }
}

/// Status of one execution attempt (and of a legacy external run).
///
/// ```text
/// CREATED ─► SUBMITTED ──────┐
///    │                       ▼
///    └────► WAITING_EXTERNAL ─► RUNNING ─► COMPLETED | FAILED
///
/// CANCELLED is reachable from any non-terminal state.
/// FAILED_INIT is only set by the orphan sweep.
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptStatus {
    #[default]
    Created,
    Submitted,
    Running,
    WaitingExternal,
    Completed,
    Failed,
    FailedInit,
    Cancelled,
}

impl AttemptStatus {
    /// Persisted names of the terminal statuses, for SQL `IN` clauses.
    pub const TERMINAL: [&'static str; 4] = ["COMPLETED", "FAILED", "FAILED_INIT", "CANCELLED"];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Submitted => "SUBMITTED",
            Self::Running => "RUNNING",
            Self::WaitingExternal => "WAITING_EXTERNAL",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::FailedInit => "FAILED_INIT",
            Self::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::FailedInit | Self::Cancelled
        )
    }

    /// Fixed projection onto the task status.
    pub fn task_status(&self) -> TaskStatus {
        match self {
            Self::Created => TaskStatus::Pending,
            Self::Submitted | Self::WaitingExternal => TaskStatus::WaitingExternal,
            Self::Running => TaskStatus::Running,
            Self::Completed => TaskStatus::Completed,
            Self::Failed | Self::FailedInit => TaskStatus::Failed,
            Self::Cancelled => TaskStatus::Cancelled,
        }
    }
}

impl fmt::Display for AttemptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AttemptStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "CREATED" => Ok(Self::Created),
            "SUBMITTED" => Ok(Self::Submitted),
            "RUNNING" => Ok(Self::Running),
            "WAITING_EXTERNAL" => Ok(Self::WaitingExternal),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "FAILED_INIT" => Ok(Self::FailedInit),
            "CANCELLED" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid attempt status: {}", s)),
        }
    }
}

/// Project a raw persisted attempt (or legacy run) status onto a task status.
/// Unrecognized values project to [`TaskStatus::Unknown`].
pub fn project_task_status(raw: &str) -> TaskStatus {
    raw.parse::<AttemptStatus>()
        .map(|s| s.task_status())
        .unwrap_or(TaskStatus::Unknown)
}
