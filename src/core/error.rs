//! Engine-level errors.

use thiserror::Error;
use uuid::Uuid;

use super::expression::ExpressionError;

/// Errors surfaced by the engine to its callers
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Pipeline not found: {0}")]
    PipelineNotFound(String),

    #[error("Execution not found: {0}")]
    ExecutionNotFound(Uuid),

    #[error("Pipeline execution not found: {0}")]
    PipelineExecutionNotFound(Uuid),

    #[error("Invalid pipeline definition: {0}")]
    InvalidDefinition(String),

    #[error("Invalid parameter '{name}': {reason}")]
    InvalidParam { name: String, reason: String },

    #[error("Step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    #[error("Dependency cycle detected between steps: {}", .0.join(", "))]
    DependencyCycle(Vec<String>),

    #[error("Event of {size} bytes exceeds the {limit} byte limit")]
    EventTooLarge { size: usize, limit: usize },

    #[error("Timed out waiting for pipeline execution {0}")]
    WaitTimeout(Uuid),

    #[error("Command bus is closed")]
    BusClosed,

    #[error(transparent)]
    Expression(#[from] ExpressionError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Index error: {0}")]
    Index(#[from] rusqlite::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Errors raised before anything is appended to the log
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::PipelineNotFound(_) | Self::InvalidParam { .. } | Self::InvalidDefinition(_)
        )
    }
}
