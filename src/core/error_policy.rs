//! Error policy: what happens to a failed step attempt.
//!
//! Precedence: a matching `throw` wins, then `retries`, then `ignore`,
//! otherwise the failure bubbles to the pipeline. Expressions see the failed
//! attempt's output (`{"errors": [...]}`) as `result`.

use std::time::Duration;

use serde_json::Value;
use tracing::warn;

use super::expression::Evaluator;
use super::pipeline::StepDefinition;
use crate::domain::{ErrorKind, StepError};

/// Outcome of applying a step's error policy
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorDecision {
    /// Fail with the throw message; never retried
    Throw(StepError),

    /// Queue another attempt after `delay`
    Retry { delay: Duration },

    /// Mark the attempt finished, keeping the error in its output
    Ignore,

    /// Record the failure against the pipeline
    Fail(StepError),
}

/// Applies `ErrorConfig` for one step
pub struct ErrorPolicy<'a> {
    step: &'a StepDefinition,
    evaluator: &'a Evaluator,
}

impl<'a> ErrorPolicy<'a> {
    pub fn new(step: &'a StepDefinition, evaluator: &'a Evaluator) -> Self {
        Self { step, evaluator }
    }

    /// Decide what to do after attempt number `attempt` (1-indexed) failed.
    ///
    /// `scope` is the step's expression context; `result` is added here.
    pub fn decide(&self, error: &StepError, attempt: u32, scope: &Value) -> ErrorDecision {
        let ctx = with_result(scope, error.as_output());

        match self.thrown(&ctx) {
            Ok(Some(thrown)) => return ErrorDecision::Throw(thrown),
            Ok(None) => {}
            Err(failure) => return ErrorDecision::Fail(failure),
        }

        let config = &self.step.error;

        // Input that could not be resolved will not resolve on a second try
        if error.kind != ErrorKind::InputResolution {
            if let Some(retries) = &config.retries {
                if retries.should_retry(attempt) {
                    match self.matches(retries.condition.as_deref(), &ctx) {
                        Ok(true) => {
                            return ErrorDecision::Retry {
                                delay: retries.delay_before_attempt(attempt + 1),
                            }
                        }
                        Ok(false) => {}
                        Err(failure) => return ErrorDecision::Fail(failure),
                    }
                }
            }
        }

        if config.ignore {
            match self.matches(config.condition.as_deref(), &ctx) {
                Ok(true) => return ErrorDecision::Ignore,
                Ok(false) => {}
                Err(failure) => return ErrorDecision::Fail(failure),
            }
        }

        ErrorDecision::Fail(error.clone())
    }

    /// `throw` entries evaluated against a successful output
    pub fn throw_on_success(&self, output: &Value, scope: &Value) -> Option<StepError> {
        if self.step.error.throw.is_empty() {
            return None;
        }
        let ctx = with_result(scope, output.clone());
        match self.thrown(&ctx) {
            Ok(thrown) => thrown,
            Err(failure) => Some(failure),
        }
    }

    /// First matching `throw`, with its message rendered
    fn thrown(&self, ctx: &Value) -> Result<Option<StepError>, StepError> {
        for throw in &self.step.error.throw {
            if !self.matches(Some(&throw.condition), ctx)? {
                continue;
            }

            let message = match self.evaluator.render(&throw.message, ctx) {
                Ok(Value::String(s)) => s,
                Ok(other) => other.to_string(),
                Err(e) => {
                    warn!(step = %self.step.full_name(), error = %e, "Failed to render throw message");
                    throw.message.clone()
                }
            };

            let mut thrown = StepError::thrown(message);
            thrown.step = Some(self.step.full_name());
            return Ok(Some(thrown));
        }
        Ok(None)
    }

    /// A missing condition always matches
    fn matches(&self, condition: Option<&str>, ctx: &Value) -> Result<bool, StepError> {
        let Some(condition) = condition else {
            return Ok(true);
        };
        self.evaluator.eval_bool(condition, ctx).map_err(|e| {
            let mut failure = StepError::internal(e.to_string());
            failure.step = Some(self.step.full_name());
            failure
        })
    }
}

fn with_result(scope: &Value, result: Value) -> Value {
    let mut ctx = match scope {
        Value::Object(map) => map.clone(),
        _ => serde_json::Map::new(),
    };
    ctx.insert("result".to_string(), result);
    Value::Object(ctx)
}
