//! Per-tick concurrency slots for externally routed tasks.
//!
//! Two modes, picked from the run config:
//! - **per-operator** when `[operators]` is non-empty: every key has its own
//!   limit (`operators.<key>.max_concurrent`, else `execution.max_concurrent`)
//!   and its own active count. The `""` bucket (attempts with no key, and the
//!   external coordination stub) also counts active legacy external runs.
//! - **global** otherwise: one limit shared by every external task, counted
//!   against all active attempts plus active legacy runs.
//!
//! Active counts are read once per tick; consumption is tracked in memory.

use std::collections::HashMap;

use crate::config::RunConfig;
use crate::errors::StoreError;
use crate::store::StateStore;

#[derive(Debug, Clone)]
enum Mode {
    Global { limit: usize, active: usize },
    PerOperator {
        default_limit: usize,
        limits: HashMap<String, usize>,
        active: HashMap<String, usize>,
    },
}

#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    mode: Mode,
}

impl ConcurrencyLimiter {
    /// Read the current active counts for `run_id`.
    pub fn load(store: &StateStore, run_id: &str, config: &RunConfig) -> Result<Self, StoreError> {
        let legacy_active = store.count_active_external_runs(run_id)?;
        if config.has_structured_operators() {
            let by_operator = store.count_active_attempts_by_operator(run_id)?;
            Ok(Self::per_operator(config, by_operator, legacy_active))
        } else {
            let attempts_active = store.count_active_attempts(run_id)?;
            Ok(Self::global(
                config.execution.max_concurrent,
                attempts_active + legacy_active,
            ))
        }
    }

    pub fn global(limit: usize, active: usize) -> Self {
        Self {
            mode: Mode::Global { limit, active },
        }
    }

    pub fn per_operator(
        config: &RunConfig,
        mut active: HashMap<String, usize>,
        legacy_active: usize,
    ) -> Self {
        *active.entry(String::new()).or_default() += legacy_active;
        let limits = config
            .operators
            .keys()
            .map(|key| (key.clone(), config.limit_for(key)))
            .collect();
        Self {
            mode: Mode::PerOperator {
                default_limit: config.execution.max_concurrent,
                limits,
                active,
            },
        }
    }

    /// `(active_count, slots_available)` for `key`.
    pub fn slots(&self, key: &str) -> (usize, usize) {
        match &self.mode {
            Mode::Global { limit, active } => (*active, limit.saturating_sub(*active)),
            Mode::PerOperator {
                default_limit,
                limits,
                active,
            } => {
                let limit = limits.get(key).copied().unwrap_or(*default_limit);
                let count = active.get(key).copied().unwrap_or(0);
                (count, limit.saturating_sub(count))
            }
        }
    }

    /// Take a slot for `key` if one is free.
    pub fn try_consume(&mut self, key: &str) -> bool {
        if self.slots(key).1 == 0 {
            return false;
        }
        match &mut self.mode {
            Mode::Global { active, .. } => *active += 1,
            Mode::PerOperator { active, .. } => *active.entry(key.to_string()).or_default() += 1,
        }
        true
    }
}
