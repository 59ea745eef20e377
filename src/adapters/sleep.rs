//! `sleep` step: waits `duration_ms` milliseconds.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{StepFailure, StepImplementation};

pub struct SleepStep;

fn duration_of(input: &Value) -> Result<Duration, StepFailure> {
    input
        .get("duration_ms")
        .and_then(Value::as_u64)
        .map(Duration::from_millis)
        .ok_or_else(|| {
            StepFailure::invalid_input("sleep step requires a non-negative integer `duration_ms`")
        })
}

#[async_trait]
impl StepImplementation for SleepStep {
    fn step_type(&self) -> &str {
        "sleep"
    }

    fn validate(&self, input: &Value) -> Result<(), StepFailure> {
        duration_of(input).map(|_| ())
    }

    async fn run(&self, input: &Value, timeout: Duration) -> Result<Value, StepFailure> {
        let duration = duration_of(input)?;
        if duration > timeout {
            tokio::time::sleep(timeout).await;
            return Err(StepFailure::timeout(timeout));
        }

        tokio::time::sleep(duration).await;
        Ok(json!({ "slept_ms": duration.as_millis() as u64 }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sleep_waits() {
        let started = std::time::Instant::now();
        let output = SleepStep
            .run(&json!({"duration_ms": 20}), Duration::from_secs(1))
            .await
            .unwrap();

        assert!(started.elapsed() >= Duration::from_millis(20));
        assert_eq!(output["slept_ms"], 20);
    }

    #[tokio::test]
    async fn test_sleep_times_out() {
        let err = SleepStep
            .run(&json!({"duration_ms": 5000}), Duration::from_millis(10))
            .await
            .unwrap_err();
        assert_eq!(err.status, 504);
    }

    #[test]
    fn test_sleep_validation() {
        assert!(SleepStep.validate(&json!({"duration_ms": "soon"})).is_err());
    }
}
