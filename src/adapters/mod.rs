//! Step implementations and external lookups.
//!
//! The engine treats a step as an opaque function from a resolved input to
//! an output. Each step type is a [`StepImplementation`] registered by name
//! in a [`StepRegistry`]; the engine never branches on the type string
//! beyond this dispatch.

pub mod command;
pub mod resolver;
pub mod sleep;
pub mod transform;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

pub use command::CommandStep;
pub use resolver::{ResolveError, Resolver, StaticResolver};
pub use sleep::SleepStep;
pub use transform::TransformStep;

/// Structured failure returned by a step implementation
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct StepFailure {
    /// HTTP-like status (400 bad input, 500 execution, 504 timeout)
    pub status: u16,

    pub message: String,

    /// Extra detail such as stderr
    pub detail: Option<String>,
}

impl StepFailure {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            detail: None,
        }
    }

    /// The resolved input does not fit the step type
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(400, message)
    }

    pub fn execution(message: impl Into<String>) -> Self {
        Self::new(500, message)
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new(504, format!("step timed out after {:?}", after))
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// One step type
#[async_trait]
pub trait StepImplementation: Send + Sync {
    /// Type name used in pipeline definitions (`transform`, `sleep`, ...)
    fn step_type(&self) -> &str;

    /// Check the resolved input before running
    fn validate(&self, _input: &Value) -> Result<(), StepFailure> {
        Ok(())
    }

    /// Run one attempt. The implementation enforces `timeout` itself.
    async fn run(&self, input: &Value, timeout: Duration) -> Result<Value, StepFailure>;
}

/// Step implementations keyed by type name
#[derive(Clone, Default)]
pub struct StepRegistry {
    implementations: HashMap<String, Arc<dyn StepImplementation>>,
}

impl StepRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with `transform`, `sleep` and `command`
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(TransformStep);
        registry.register(SleepStep);
        registry.register(CommandStep::new());
        registry
    }

    /// Register (or replace) an implementation under its own type name
    pub fn register<S: StepImplementation + 'static>(&mut self, step: S) -> &mut Self {
        self.implementations
            .insert(step.step_type().to_string(), Arc::new(step));
        self
    }

    pub fn get(&self, step_type: &str) -> Option<Arc<dyn StepImplementation>> {
        self.implementations.get(step_type).cloned()
    }

    pub fn contains(&self, step_type: &str) -> bool {
        self.implementations.contains_key(step_type)
    }
}

impl std::fmt::Debug for StepRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<_> = self.implementations.keys().collect();
        types.sort();
        f.debug_struct("StepRegistry").field("types", &types).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtins_registered() {
        let registry = StepRegistry::with_builtins();
        assert!(registry.contains("transform"));
        assert!(registry.contains("sleep"));
        assert!(registry.contains("command"));
        assert!(!registry.contains("pipeline"));
    }

    #[test]
    fn test_registry_dispatch_by_type() {
        let registry = StepRegistry::with_builtins();
        let transform = registry.get("transform").unwrap();

        let output = tokio_test::block_on(
            transform.run(&serde_json::json!({"value": "hi"}), Duration::from_secs(1)),
        )
        .unwrap();
        assert_eq!(output["value"], "hi");
        assert!(registry.get("http").is_none());
    }

    #[test]
    fn test_failure_statuses() {
        assert_eq!(StepFailure::invalid_input("x").status, 400);
        assert_eq!(StepFailure::execution("x").status, 500);
        assert_eq!(StepFailure::timeout(Duration::from_secs(1)).status, 504);
    }
}
