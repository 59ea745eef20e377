//! `transform` step: echoes its resolved `value`.
//!
//! Useful for reshaping data between steps since all the work happens in
//! input templating.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{StepFailure, StepImplementation};

pub struct TransformStep;

#[async_trait]
impl StepImplementation for TransformStep {
    fn step_type(&self) -> &str {
        "transform"
    }

    fn validate(&self, input: &Value) -> Result<(), StepFailure> {
        match input {
            Value::Object(map) if map.contains_key("value") => Ok(()),
            _ => Err(StepFailure::invalid_input(
                "transform step requires a `value` input",
            )),
        }
    }

    async fn run(&self, input: &Value, _timeout: Duration) -> Result<Value, StepFailure> {
        Ok(json!({ "value": input["value"].clone() }))
    }
}
