//! Key → operator map, built once per engine from the run config.

use std::collections::HashMap;
use std::sync::Arc;

use cadence_common::Operator;

use super::local::LocalOperator;
use super::routing::{canonical_type, lookup_candidates};
use super::signal::{SignalFileOperator, SignalKind};
use crate::config::{OperatorConfig, RunConfig};
use crate::errors::ConfigError;

#[derive(Clone, Default)]
pub struct OperatorRegistry {
    operators: HashMap<String, Arc<dyn Operator>>,
}

impl OperatorRegistry {
    /// An empty registry. Every task routed to a key simulates.
    pub fn empty() -> Self {
        Self::default()
    }

    /// The built-in operators under their canonical keys:
    /// `human`, `hpc`, `experiment` (signal files) and `local`.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        for kind in [SignalKind::Human, SignalKind::Hpc, SignalKind::Experiment] {
            registry.insert(Arc::new(SignalFileOperator::new(kind.as_str(), kind)));
        }
        registry.insert(Arc::new(LocalOperator::new("local")));
        registry
    }

    /// Built-ins plus every `[operators.<key>]` entry of `config`.
    ///
    /// An entry's `type` (defaulting to its key) may be any canonical or
    /// legacy type name; anything else is rejected.
    pub fn from_config(config: &RunConfig) -> Result<Self, ConfigError> {
        let mut registry = Self::builtin();
        for (key, entry) in &config.operators {
            let operator = build_operator(key, entry)?;
            tracing::debug!(operator_key = %key, operator_type = %operator.operator_type(), "operator registered");
            registry.insert(operator);
        }
        Ok(registry)
    }

    /// Register (or replace) an operator under its own key.
    pub fn insert(&mut self, operator: Arc<dyn Operator>) {
        self.operators
            .insert(operator.operator_key().to_string(), operator);
    }

    pub fn with_operator(mut self, operator: Arc<dyn Operator>) -> Self {
        self.insert(operator);
        self
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn Operator>> {
        self.operators.get(key).cloned()
    }

    /// First registered candidate for a key and/or legacy type name.
    pub fn resolve(&self, key: Option<&str>, legacy_type: Option<&str>) -> Option<Arc<dyn Operator>> {
        lookup_candidates(key, legacy_type)
            .iter()
            .find_map(|candidate| self.get(candidate))
    }

    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.operators.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }
}

fn build_operator(key: &str, entry: &OperatorConfig) -> Result<Arc<dyn Operator>, ConfigError> {
    let declared = entry.operator_type.as_deref().unwrap_or(key);
    let options: serde_json::Map<String, serde_json::Value> = entry
        .options
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    let canonical = canonical_type(declared).ok_or_else(|| ConfigError::UnknownOperatorType {
        key: key.to_string(),
        operator_type: declared.to_string(),
    })?;
    let operator: Arc<dyn Operator> = match SignalKind::from_type(canonical) {
        Some(kind) => Arc::new(SignalFileOperator::new(key, kind).with_options(options)),
        None => Arc::new(LocalOperator::new(key).with_options(options)),
    };
    Ok(operator)
}
