//! Per-run configuration read from `<run root>/config`.
//!
//! Layered as file → environment → CLI. A missing file yields defaults.
//!
//! ```toml
//! [execution]
//! default_mode = "hpc"      # operator key for tasks with no routing hint
//! max_concurrent = 4        # global slot limit
//!
//! [operators.hpc]
//! type = "hpc"
//! max_concurrent = 2
//!
//! [operators.hpc.options]
//! partition = "gpu"
//!
//! [driver]
//! poll_interval_secs = 5
//! lock_retry_secs = 2
//! orphan_timeout_secs = 3600
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::errors::ConfigError;

/// Env var overriding `execution.max_concurrent`.
pub const MAX_CONCURRENT_ENV: &str = "CADENCE_MAX_CONCURRENT";
/// Env var overriding `execution.default_mode`.
pub const DEFAULT_MODE_ENV: &str = "CADENCE_DEFAULT_MODE";

/// Default mode meaning "no operator": complete tasks in-process.
pub const SIMULATION_MODE: &str = "simulation";

/// Global concurrency limit when nothing is configured.
pub const DEFAULT_MAX_CONCURRENT: usize = 4;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionConfig {
    /// Operator key used when a task carries no routing hint.
    #[serde(default)]
    pub default_mode: Option<String>,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

fn default_max_concurrent() -> usize {
    DEFAULT_MAX_CONCURRENT
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            default_mode: None,
            max_concurrent: default_max_concurrent(),
        }
    }
}

/// One structured operator entry under `[operators.<key>]`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct OperatorConfig {
    /// Backend type; defaults to the key itself.
    #[serde(default, rename = "type")]
    pub operator_type: Option<String>,
    /// Slot limit for this key; inherits `execution.max_concurrent` when unset.
    #[serde(default)]
    pub max_concurrent: Option<usize>,
    #[serde(default)]
    pub options: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DriverConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_lock_retry_secs")]
    pub lock_retry_secs: u64,
    #[serde(default = "default_orphan_timeout_secs")]
    pub orphan_timeout_secs: u64,
}

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_lock_retry_secs() -> u64 {
    2
}

fn default_orphan_timeout_secs() -> u64 {
    3600
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            lock_retry_secs: default_lock_retry_secs(),
            orphan_timeout_secs: default_orphan_timeout_secs(),
        }
    }
}

impl DriverConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn lock_retry(&self) -> Duration {
        Duration::from_secs(self.lock_retry_secs)
    }

    pub fn orphan_timeout(&self) -> Duration {
        Duration::from_secs(self.orphan_timeout_secs)
    }
}

/// Whole run configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RunConfig {
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub operators: BTreeMap<String, OperatorConfig>,
    #[serde(default)]
    pub driver: DriverConfig,
}

impl RunConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source: Box::new(source),
        })
    }

    /// Load from `path`, or defaults if the file does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load with process environment overrides applied.
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load_or_default(path)?;
        config.apply_env_with(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Apply overrides from `lookup` (normally the process environment).
    pub fn apply_env_with<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(MAX_CONCURRENT_ENV) {
            self.execution.max_concurrent =
                raw.trim()
                    .parse()
                    .map_err(|_| ConfigError::InvalidOverride {
                        name: MAX_CONCURRENT_ENV,
                        value: raw.clone(),
                    })?;
        }
        if let Some(raw) = lookup(DEFAULT_MODE_ENV) {
            let trimmed = raw.trim();
            self.execution.default_mode = (!trimmed.is_empty()).then(|| trimmed.to_string());
        }
        Ok(())
    }

    /// CLI-level override for the global limit.
    pub fn with_max_concurrent(mut self, limit: Option<usize>) -> Self {
        if let Some(limit) = limit {
            self.execution.max_concurrent = limit;
        }
        self
    }

    /// Whether per-operator limits apply.
    pub fn has_structured_operators(&self) -> bool {
        !self.operators.is_empty()
    }

    /// Operator key for tasks with no explicit hint. `None` means simulation.
    pub fn default_operator_key(&self) -> Option<&str> {
        self.execution
            .default_mode
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty() && !m.eq_ignore_ascii_case(SIMULATION_MODE))
    }

    /// Slot limit for `key` in per-operator mode.
    pub fn limit_for(&self, key: &str) -> usize {
        self.operators
            .get(key)
            .and_then(|op| op.max_concurrent)
            .unwrap_or(self.execution.max_concurrent)
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        use anyhow::Context;
        let content = toml::to_string_pretty(self).context("Failed to serialize run config")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }
}
