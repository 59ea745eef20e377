//! Shared helpers for the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use conduit::core::{Engine, EngineSettings, PipelineCatalog, PipelineDefinition};
use conduit::domain::{Execution, PipelineExecution};
use conduit::{StepFailure, StepImplementation, StepRegistry};
use serde_json::{json, Value};
use tempfile::TempDir;
use uuid::Uuid;

/// Always fails with the `status` given in its input (default 500)
pub struct FailStep;

#[async_trait]
impl StepImplementation for FailStep {
    fn step_type(&self) -> &str {
        "fail"
    }

    async fn run(&self, input: &Value, _timeout: Duration) -> Result<Value, StepFailure> {
        let status = input.get("status").and_then(Value::as_u64).unwrap_or(500) as u16;
        Err(StepFailure::new(status, "boom"))
    }
}

/// Fails until it has been called `failures` times, then echoes `value`
pub struct FlakyStep {
    pub failures: u32,
    pub calls: Arc<AtomicU32>,
}

#[async_trait]
impl StepImplementation for FlakyStep {
    fn step_type(&self) -> &str {
        "flaky"
    }

    async fn run(&self, input: &Value, _timeout: Duration) -> Result<Value, StepFailure> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            return Err(StepFailure::execution(format!("attempt {} failed", call)));
        }
        Ok(json!({ "value": input["value"].clone(), "calls": call }))
    }
}

/// Returns a string of `bytes` characters (default 20000)
pub struct BigStep;

#[async_trait]
impl StepImplementation for BigStep {
    fn step_type(&self) -> &str {
        "big"
    }

    async fn run(&self, input: &Value, _timeout: Duration) -> Result<Value, StepFailure> {
        let bytes = input.get("bytes").and_then(Value::as_u64).unwrap_or(20_000) as usize;
        Ok(json!({ "value": "x".repeat(bytes) }))
    }
}

pub fn test_settings() -> EngineSettings {
    EngineSettings {
        poll_interval: Duration::from_millis(10),
        wait_attempts: 1000,
        ..EngineSettings::default()
    }
}

pub fn catalog(yamls: &[&str]) -> PipelineCatalog {
    let mut catalog = PipelineCatalog::new();
    for yaml in yamls {
        catalog
            .insert(PipelineDefinition::from_yaml(yaml).unwrap())
            .unwrap();
    }
    catalog
}

pub fn registry() -> StepRegistry {
    let mut registry = StepRegistry::with_builtins();
    registry.register(FailStep);
    registry.register(BigStep);
    registry
}

pub async fn start_engine(temp: &TempDir, yamls: &[&str]) -> Engine {
    start_engine_with(temp, yamls, registry()).await
}

pub async fn start_engine_with(temp: &TempDir, yamls: &[&str], registry: StepRegistry) -> Engine {
    Engine::builder(temp.path().join("executions"))
        .catalog(catalog(yamls))
        .registry(registry)
        .settings(test_settings())
        .start()
        .await
        .unwrap()
}

/// Engine over the default test registry with custom settings
pub async fn start_engine_tuned(temp: &TempDir, yamls: &[&str], settings: EngineSettings) -> Engine {
    Engine::builder(temp.path().join("executions"))
        .catalog(catalog(yamls))
        .registry(registry())
        .settings(settings)
        .start()
        .await
        .unwrap()
}

/// Enqueue and wait for a terminal status
pub async fn run(
    engine: &Engine,
    pipeline: &str,
    args: Value,
) -> (Execution, Uuid) {
    let args = match args {
        Value::Object(map) => map,
        _ => serde_json::Map::new(),
    };
    let (execution_id, pipeline_execution_id) = engine.enqueue(pipeline, args).await.unwrap();
    let execution = engine
        .wait(execution_id, pipeline_execution_id)
        .await
        .unwrap();
    (execution, pipeline_execution_id)
}

/// Poll until `predicate` holds for the pipeline execution
pub async fn wait_until<F>(
    engine: &Engine,
    execution_id: Uuid,
    pipeline_execution_id: Uuid,
    predicate: F,
) -> Execution
where
    F: Fn(&PipelineExecution) -> bool,
{
    for _ in 0..500 {
        if let Ok(execution) = engine.get_execution(execution_id).await {
            if execution
                .pipeline_execution(pipeline_execution_id)
                .map(&predicate)
                .unwrap_or(false)
            {
                return execution;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached for {}", pipeline_execution_id);
}
