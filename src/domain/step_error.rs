//! Structured errors recorded against steps and pipelines.
//!
//! A `StepError` is the persisted form of every failure the engine observes.
//! It lives inside `StepExecution.output.errors`, and bubbles up to
//! `PipelineExecution.errors` when the failure is not absorbed locally.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Classification of a recorded error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad param type/value, unknown param, missing pipeline
    Validation,

    /// An expression referenced something that does not exist
    InputResolution,

    /// The step implementation returned an error
    Execution,

    /// A `throw` block matched
    Thrown,

    /// A nested pipeline failed or was canceled
    ChildPipeline,

    /// Planning failure (dependency cycle, bad for_each collection, ...)
    Internal,
}

/// An error recorded in the execution aggregate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepError {
    /// Classification
    pub kind: ErrorKind,

    /// HTTP-like status code (400 for validation, 500 for execution, ...)
    pub status: u16,

    /// Human-readable message
    pub message: String,

    /// Optional extra detail (stderr, nested errors, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,

    /// Full step name (`type.name`) the error belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_execution_id: Option<Uuid>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline_execution_id: Option<Uuid>,
}

impl StepError {
    /// Create an error that is not yet attached to a step
    pub fn new(kind: ErrorKind, status: u16, message: impl Into<String>) -> Self {
        Self {
            kind,
            status,
            message: message.into(),
            detail: None,
            step: None,
            step_execution_id: None,
            pipeline_execution_id: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, 400, message)
    }

    pub fn input_resolution(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InputResolution, 400, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, 500, message)
    }

    pub fn thrown(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Thrown, 500, message)
    }

    /// Attach extra detail
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Attach the step coordinates this error was raised for
    pub fn for_step(
        mut self,
        step: &str,
        pipeline_execution_id: Uuid,
        step_execution_id: Option<Uuid>,
    ) -> Self {
        self.step = Some(step.to_string());
        self.pipeline_execution_id = Some(pipeline_execution_id);
        self.step_execution_id = step_execution_id;
        self
    }

    /// The `output` value recorded for a step that failed with this error.
    ///
    /// Downstream `is_error()` / `error_message()` expressions read `errors`.
    pub fn as_output(&self) -> serde_json::Value {
        serde_json::json!({ "errors": [self] })
    }
}

impl std::fmt::Display for StepError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.step {
            Some(step) => write!(f, "{} ({}): {}", step, self.status, self.message),
            None => write!(f, "({}) {}", self.status, self.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_error_output_shape() {
        let pexec = Uuid::new_v4();
        let error = StepError::new(ErrorKind::Execution, 500, "boom").for_step(
            "transform.a",
            pexec,
            None,
        );

        let output = error.as_output();
        assert_eq!(output["errors"][0]["message"], "boom");
        assert_eq!(output["errors"][0]["status"], 500);
        assert_eq!(output["errors"][0]["kind"], "execution");
        assert_eq!(output["errors"][0]["step"], "transform.a");
    }

    #[test]
    fn test_display_includes_step() {
        let error = StepError::validation("missing param").for_step("http.x", Uuid::new_v4(), None);
        assert_eq!(error.to_string(), "http.x (400): missing param");
    }
}
