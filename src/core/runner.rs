//! Step runner: invokes one attempt and turns its result into facts.
//!
//! Invocation runs without the execution lock held. Settling happens back
//! under the lock against a freshly replayed snapshot, and only builds the
//! payloads; the engine appends them.

use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::error_policy::{ErrorDecision, ErrorPolicy};
use super::event_store::generate_idempotency_key;
use super::expression::Evaluator;
use super::pipeline::StepDefinition;
use super::planner::Planner;
use crate::adapters::{StepFailure, StepRegistry};
use crate::domain::{ErrorKind, EventPayload, PipelineExecution, StepError, StepExecution};

impl From<StepFailure> for StepError {
    fn from(failure: StepFailure) -> Self {
        let error = StepError::new(ErrorKind::Execution, failure.status, failure.message);
        match failure.detail {
            Some(detail) => error.with_detail(detail),
            None => error,
        }
    }
}

/// Run one attempt of a (non-pipeline) step
pub async fn invoke(
    registry: &StepRegistry,
    step: &StepDefinition,
    attempt: &StepExecution,
    default_timeout: Duration,
) -> Result<Value, StepError> {
    if let Some(error) = &attempt.input_error {
        return Err(error.clone());
    }

    let Some(implementation) = registry.get(&step.step_type) else {
        return Err(StepError::validation(format!(
            "unknown step type '{}'",
            step.step_type
        )));
    };

    implementation.validate(&attempt.input)?;

    let timeout = step.timeout(default_timeout);
    debug!(step = %step.full_name(), ?timeout, "Invoking step");
    let output = implementation.run(&attempt.input, timeout).await?;
    Ok(output)
}

/// Builds the facts that settle a finished attempt
pub struct StepSettler<'a> {
    execution_id: Uuid,
    planner: &'a Planner<'a>,
    evaluator: &'a Evaluator,
}

impl<'a> StepSettler<'a> {
    pub fn new(execution_id: Uuid, planner: &'a Planner<'a>, evaluator: &'a Evaluator) -> Self {
        Self {
            execution_id,
            planner,
            evaluator,
        }
    }

    /// Facts recording `result` for `attempt`.
    ///
    /// Success yields `StepFinished` (with loop bookkeeping) unless a `throw`
    /// matches. Failure goes through the error policy and may also yield the
    /// next retry's `StepQueued`.
    pub fn settle(
        &self,
        pexec: &PipelineExecution,
        step: &StepDefinition,
        attempt: &StepExecution,
        result: Result<Value, StepError>,
    ) -> Vec<EventPayload> {
        let name = step.full_name();
        let end_time = Utc::now();
        let attach = |error: StepError| {
            let mut error = error;
            error.step = Some(name.clone());
            error.pipeline_execution_id = Some(pexec.id);
            error.step_execution_id = Some(attempt.id);
            error
        };
        let failed = |error: StepError, retrying: bool| EventPayload::StepFailed {
            pipeline_execution_id: pexec.id,
            step_execution_id: attempt.id,
            output: error.as_output(),
            error,
            end_time,
            retrying,
        };

        let scope = self
            .planner
            .step_scope(pexec, step, &attempt.for_each_key, attempt.loop_index, None)
            .unwrap_or_else(|_| json!({ "param": pexec.args }));
        let policy = ErrorPolicy::new(step, self.evaluator);

        let error = match result {
            Ok(output) => {
                if let Some(thrown) = policy.throw_on_success(&output, &scope) {
                    info!(step = %name, reason = %thrown.message, "Step output matched throw");
                    return vec![failed(attach(thrown), false)];
                }

                return match self.planner.loop_state(
                    pexec,
                    step,
                    &attempt.for_each_key,
                    attempt.loop_index,
                    &output,
                ) {
                    Ok(step_loop) => vec![EventPayload::StepFinished {
                        pipeline_execution_id: pexec.id,
                        step_execution_id: attempt.id,
                        output,
                        end_time,
                        step_loop,
                    }],
                    Err(error) => vec![failed(attach(error), false)],
                };
            }
            Err(error) => attach(error),
        };

        let attempt_number = attempt.retry_count + 1;
        match policy.decide(&error, attempt_number, &scope) {
            ErrorDecision::Throw(thrown) => {
                info!(step = %name, reason = %thrown.message, "Step failure matched throw");
                vec![failed(attach(thrown), false)]
            }
            ErrorDecision::Retry { delay } => {
                let retry_count = attempt.retry_count + 1;
                warn!(
                    step = %name,
                    attempt = attempt_number,
                    ?delay,
                    error = %error.message,
                    "Step failed, retrying"
                );
                vec![
                    failed(error, true),
                    EventPayload::StepQueued {
                        pipeline_execution_id: pexec.id,
                        step_name: name.clone(),
                        for_each_key: attempt.for_each_key.clone(),
                        step_execution_id: Uuid::new_v4(),
                        input: attempt.input.clone(),
                        input_error: None,
                        loop_index: attempt.loop_index,
                        retry_count,
                        delay_ms: delay.as_millis() as u64,
                        idempotency_key: generate_idempotency_key(
                            self.execution_id,
                            pexec.id,
                            &name,
                            &attempt.for_each_key,
                            attempt.loop_index,
                            retry_count + 1,
                        ),
                    },
                ]
            }
            ErrorDecision::Ignore => {
                info!(step = %name, error = %error.message, "Ignoring step failure");
                vec![EventPayload::StepFinished {
                    pipeline_execution_id: pexec.id,
                    step_execution_id: attempt.id,
                    output: error.as_output(),
                    end_time,
                    step_loop: None,
                }]
            }
            ErrorDecision::Fail(error) => {
                warn!(step = %name, error = %error.message, "Step failed");
                vec![failed(attach(error), false)]
            }
        }
    }
}
