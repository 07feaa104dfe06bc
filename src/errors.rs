//! Typed error hierarchy for the cadence orchestrator.
//!
//! Top-level enums per subsystem:
//! - `StoreError`: durable store and schema migration failures
//! - `GraphError`: workflow dependency validation failures
//! - `LockError`: run lock acquisition failures
//! - `ConfigError`: run configuration loading failures
//! - `EngineError`: everything a tick or lifecycle call can surface
//!
//! Operator and path-safety errors live in `cadence_common` because they
//! cross the operator contract.

use std::path::PathBuf;

use cadence_common::{OperatorError, PathSafetyViolation};
use thiserror::Error;

/// Errors from workflow graph validation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("Duplicate task id: {0}")]
    DuplicateTask(String),

    #[error("Unknown dependency '{dependency}' in task '{task}': no task with that id exists")]
    UnknownDependency { task: String, dependency: String },

    #[error("Cycle detected in task dependencies. Involved tasks: {tasks:?}")]
    Cycle { tasks: Vec<String> },
}

/// Errors from the durable store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("Store schema version {found} is not supported (this build supports up to {supported})")]
    SchemaVersionUnsupported { found: i64, supported: i64 },

    #[error("Invalid workflow: {0}")]
    InvalidWorkflow(#[from] GraphError),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Invalid JSON in column '{column}': {source}")]
    Json {
        column: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid value '{value}' in column '{column}'")]
    InvalidValue { column: &'static str, value: String },

    #[error("Failed to prepare store at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn json(column: &'static str) -> impl FnOnce(serde_json::Error) -> Self {
        move |source| Self::Json { column, source }
    }
}

/// Errors from the run lock.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("Run lock at {path} is held by another process")]
    Contention { path: PathBuf },

    #[error("Failed to open run lock at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl LockError {
    /// Whether the lock was simply held elsewhere; callers may retry.
    pub fn is_contention(&self) -> bool {
        matches!(self, Self::Contention { .. })
    }
}

/// Errors from loading a run configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: Box<toml::de::Error>,
    },

    #[error("Operator '{key}' has unknown type '{operator_type}'")]
    UnknownOperatorType { key: String, operator_type: String },

    #[error("Invalid value for {name}: {value}")]
    InvalidOverride { name: &'static str, value: String },
}

/// Errors surfaced by the engine (ticks, lifecycle, admin operations).
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Operator(#[from] OperatorError),

    #[error("Campaign error: {0}")]
    Campaign(#[source] anyhow::Error),

    #[error("Run {run_id} already exists")]
    RunExists { run_id: String },

    #[error("Task {task_id} is not tracked by an external run")]
    NotExternal { task_id: String },

    #[error("Invalid status '{value}': {message}")]
    InvalidStatus { value: String, message: String },

    #[error("Tick task panicked or was cancelled: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl From<PathSafetyViolation> for EngineError {
    fn from(v: PathSafetyViolation) -> Self {
        Self::Operator(OperatorError::PathSafety(v))
    }
}

impl From<GraphError> for EngineError {
    fn from(e: GraphError) -> Self {
        Self::Store(StoreError::InvalidWorkflow(e))
    }
}

/// Whether an error can be logged and skipped at a best-effort site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Recoverable,
    Fatal,
}

impl EngineError {
    pub fn classify(&self) -> ErrorClass {
        match self {
            Self::Operator(OperatorError::PathSafety(_)) => ErrorClass::Fatal,
            Self::Operator(_) => ErrorClass::Recoverable,
            Self::Lock(e) if e.is_contention() => ErrorClass::Recoverable,
            Self::Store(StoreError::Json { .. }) => ErrorClass::Recoverable,
            _ => ErrorClass::Fatal,
        }
    }

    pub fn is_lock_contention(&self) -> bool {
        matches!(self, Self::Lock(e) if e.is_contention())
    }
}

/// Log a recoverable error and continue with `None`; propagate a fatal one.
pub fn recover_or_propagate<T>(
    result: Result<T, EngineError>,
    context: &str,
) -> Result<Option<T>, EngineError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.classify() == ErrorClass::Recoverable => {
            tracing::warn!(error = %e, "{} failed; continuing", context);
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_error_not_found_carries_entity_and_id() {
        let err = StoreError::not_found("task", "t1");
        match &err {
            StoreError::NotFound { entity, id } => {
                assert_eq!(*entity, "task");
                assert_eq!(id, "t1");
            }
            _ => panic!("Expected NotFound"),
        }
        assert_eq!(err.to_string(), "task t1 not found");
    }

    #[test]
    fn schema_version_unsupported_mentions_both_versions() {
        let err = StoreError::SchemaVersionUnsupported {
            found: 9,
            supported: 3,
        };
        let msg = err.to_string();
        assert!(msg.contains('9'));
        assert!(msg.contains('3'));
    }

    #[test]
    fn lock_contention_is_distinguishable() {
        let err = LockError::Contention {
            path: PathBuf::from("/runs/r1/run.lock"),
        };
        assert!(err.is_contention());
        let io = LockError::Io {
            path: PathBuf::from("/runs/r1/run.lock"),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        };
        assert!(!io.is_contention());
    }

    #[test]
    fn engine_error_classification() {
        let op = EngineError::Operator(OperatorError::Submit {
            task_id: "t1".into(),
            message: "queue down".into(),
        });
        assert_eq!(op.classify(), ErrorClass::Recoverable);

        let unsafe_path: EngineError = PathSafetyViolation {
            root: PathBuf::from("/r"),
            candidate: PathBuf::from("/r/../x"),
            reason: "traversal".into(),
        }
        .into();
        assert_eq!(unsafe_path.classify(), ErrorClass::Fatal);

        let contention = EngineError::Lock(LockError::Contention {
            path: PathBuf::from("/r/run.lock"),
        });
        assert!(contention.is_lock_contention());
        assert_eq!(contention.classify(), ErrorClass::Recoverable);

        let schema = EngineError::Store(StoreError::SchemaVersionUnsupported {
            found: 0,
            supported: 3,
        });
        assert_eq!(schema.classify(), ErrorClass::Fatal);
    }

    #[test]
    fn recover_or_propagate_swallows_only_recoverable() {
        let recovered: Result<Option<()>, EngineError> = recover_or_propagate(
            Err(EngineError::Operator(OperatorError::Collect {
                task_id: "t1".into(),
                message: "missing".into(),
            })),
            "collect",
        );
        assert!(matches!(recovered, Ok(None)));

        let fatal: Result<Option<()>, EngineError> =
            recover_or_propagate(Err(StoreError::not_found("run", "r1").into()), "read");
        assert!(matches!(
            fatal,
            Err(EngineError::Store(StoreError::NotFound { .. }))
        ));
    }

    #[test]
    fn graph_error_converts_into_store_error() {
        let err: StoreError = GraphError::Cycle {
            tasks: vec!["a".into(), "b".into()],
        }
        .into();
        match &err {
            StoreError::InvalidWorkflow(GraphError::Cycle { tasks }) => assert_eq!(tasks.len(), 2),
            _ => panic!("Expected InvalidWorkflow(Cycle)"),
        }
    }
}
