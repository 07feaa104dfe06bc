//! Choosing how a task executes.
//!
//! Key resolution, first match wins:
//! 1. `task.operator_key`
//! 2. the `CADENCE_OPERATOR` entry in the task environment
//! 3. the task kind: gates go to `human`, external tasks to the coordination stub
//! 4. `execution.default_mode` from the run config (`simulation` means none)
//!
//! A resolved key is then looked up in the registry through
//! [`lookup_candidates`]. Tasks of kind `local`, and tasks nothing resolves
//! for, are simulated.

use std::fmt;
use std::sync::Arc;

use cadence_common::{Operator, Task, TaskKind};

use super::registry::OperatorRegistry;
use crate::config::RunConfig;

/// Registry key gates are routed to.
pub const HUMAN_KEY: &str = "human";

/// Outcome of key resolution, before the registry is consulted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyResolution {
    Key(String),
    ExternalStub,
    Unrouted,
}

pub fn resolve_key(task: &Task, config: &RunConfig) -> KeyResolution {
    if let Some(key) = task
        .operator_key
        .as_deref()
        .map(str::trim)
        .filter(|k| !k.is_empty())
    {
        return KeyResolution::Key(key.to_string());
    }
    if let Some(hint) = task.operator_hint() {
        return KeyResolution::Key(hint.to_string());
    }
    match task.kind {
        TaskKind::Gate => return KeyResolution::Key(HUMAN_KEY.to_string()),
        TaskKind::External => return KeyResolution::ExternalStub,
        TaskKind::Compute | TaskKind::Local => {}
    }
    match config.default_operator_key() {
        Some(key) => KeyResolution::Key(key.to_string()),
        None => KeyResolution::Unrouted,
    }
}

/// Canonical built-in type for a legacy or alias type name.
pub fn canonical_type(name: &str) -> Option<&'static str> {
    match name.trim().to_ascii_lowercase().as_str() {
        "human" | "humanoperator" | "human_review" => Some("human"),
        "local" | "simulationoperator" | "simulation" => Some("local"),
        "hpc" | "hpcoperator" | "slurm" => Some("hpc"),
        "experiment" | "experimentoperator" | "lab" => Some("experiment"),
        _ => None,
    }
}

/// Registry keys to try, in order, for a stored key and/or legacy type name.
///
/// Exact key, legacy type as given, canonical form of either, then
/// lowercased forms. Duplicates are dropped.
pub fn lookup_candidates(key: Option<&str>, legacy_type: Option<&str>) -> Vec<String> {
    let given: Vec<&str> = [key, legacy_type]
        .into_iter()
        .flatten()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect();

    let mut candidates: Vec<String> = Vec::new();
    let mut push = |candidate: String| {
        if !candidates.contains(&candidate) {
            candidates.push(candidate);
        }
    };
    for name in &given {
        push(name.to_string());
    }
    for name in &given {
        if let Some(canonical) = canonical_type(name) {
            push(canonical.to_string());
        }
    }
    for name in &given {
        push(name.to_ascii_lowercase());
    }
    candidates
}

/// How a ready task will be executed this tick.
#[derive(Clone)]
pub enum Route {
    Operator(Arc<dyn Operator>),
    ExternalStub,
    Simulate,
}

impl Route {
    /// Routes that occupy a concurrency slot.
    pub fn is_external(&self) -> bool {
        !matches!(self, Self::Simulate)
    }

    /// Limiter bucket: the operator's registry key, or `""` for the stub.
    pub fn limiter_key(&self) -> &str {
        match self {
            Self::Operator(op) => op.operator_key(),
            Self::ExternalStub | Self::Simulate => "",
        }
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Operator(op) => f
                .debug_tuple("Operator")
                .field(&op.operator_key())
                .finish(),
            Self::ExternalStub => f.write_str("ExternalStub"),
            Self::Simulate => f.write_str("Simulate"),
        }
    }
}

/// Resolve the route for `task`.
pub fn route_task(task: &Task, config: &RunConfig, registry: &OperatorRegistry) -> Route {
    if task.kind == TaskKind::Local {
        return Route::Simulate;
    }
    match resolve_key(task, config) {
        KeyResolution::ExternalStub => Route::ExternalStub,
        KeyResolution::Unrouted => Route::Simulate,
        KeyResolution::Key(key) => match registry.resolve(Some(&key), None) {
            Some(op) => Route::Operator(op),
            None => {
                tracing::debug!(task_id = %task.task_id, operator_key = %key, "no operator registered; simulating");
                Route::Simulate
            }
        },
    }
}
