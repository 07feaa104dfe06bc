//! The planning/analysis collaborator consulted when a run settles.

use serde::{Deserialize, Serialize};

use crate::models::Workflow;
use crate::status::TaskStatus;

/// Campaign-owned document persisted on the run between analyze steps.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CampaignState {
    /// Number of workflows planned so far.
    #[serde(default)]
    pub iteration: u32,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Final view of one task handed to `analyze`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskOutcome {
    pub task_id: String,
    pub status: TaskStatus,
    pub attempt_id: Option<String>,
    #[serde(default)]
    pub operator_data: serde_json::Map<String, serde_json::Value>,
}

/// Supplies new work once everything dispatched so far has settled.
pub trait Campaign: Send {
    /// Next batch of tasks, or `None` when the campaign is finished.
    fn plan(&mut self, state: &mut CampaignState) -> anyhow::Result<Option<Workflow>>;

    /// Fold the settled task outcomes into the campaign state.
    fn analyze(
        &mut self,
        state: CampaignState,
        results: &[TaskOutcome],
    ) -> anyhow::Result<CampaignState>;
}
