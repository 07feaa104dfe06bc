//! Reference campaign: one workflow, planned once.
//!
//! The workflow comes from a JSON file (`{ "tasks": [...] }`) or is given
//! inline. Planning happens on the first `plan` call only; the iteration
//! counter in [`CampaignState`] makes that survive restarts. `analyze`
//! records outcome counts in the state document.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use cadence_common::{Campaign, CampaignState, TaskOutcome, TaskStatus, Workflow};
use serde_json::json;

#[derive(Debug, Clone)]
enum Source {
    File(PathBuf),
    Inline(Workflow),
    Empty,
}

#[derive(Debug, Clone)]
pub struct WorkflowFileCampaign {
    source: Source,
}

impl WorkflowFileCampaign {
    pub fn from_file(path: impl Into<PathBuf>) -> Self {
        Self {
            source: Source::File(path.into()),
        }
    }

    pub fn from_workflow(workflow: Workflow) -> Self {
        Self {
            source: Source::Inline(workflow),
        }
    }

    /// A campaign with nothing to plan; used when resuming a run.
    pub fn empty() -> Self {
        Self {
            source: Source::Empty,
        }
    }

    /// Campaign for an optional workflow file.
    pub fn from_optional_file(path: Option<&Path>) -> Self {
        path.map_or_else(Self::empty, Self::from_file)
    }
}

/// Parse a workflow document.
pub fn load_workflow(path: &Path) -> Result<Workflow> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read workflow file {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse workflow file {}", path.display()))
}

impl Campaign for WorkflowFileCampaign {
    fn plan(&mut self, state: &mut CampaignState) -> Result<Option<Workflow>> {
        if state.iteration > 0 {
            return Ok(None);
        }
        let workflow = match &self.source {
            Source::File(path) => Some(load_workflow(path)?),
            Source::Inline(workflow) => Some(workflow.clone()),
            Source::Empty => None,
        };
        if workflow.is_some() {
            state.iteration = 1;
        }
        Ok(workflow)
    }

    fn analyze(&mut self, mut state: CampaignState, results: &[TaskOutcome]) -> Result<CampaignState> {
        let count = |pred: fn(&TaskStatus) -> bool| results.iter().filter(|r| pred(&r.status)).count();
        let summary = json!({
            "tasks": results.len(),
            "succeeded": count(TaskStatus::is_success),
            "failed": count(TaskStatus::is_failure),
        });
        match state.data.as_object_mut() {
            Some(data) => {
                data.insert("last_analysis".to_string(), summary);
            }
            None => state.data = json!({ "last_analysis": summary }),
        }
        Ok(state)
    }
}
