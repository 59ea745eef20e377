//! Core engine logic.
//!
//! This module contains:
//! - EventStore: Append-only per-execution log, plus the SQLite index
//! - Pipeline: Pipeline definitions, params and the dependency graph
//! - Planner: Decides what runs next from a pipeline execution snapshot
//! - ErrorPolicy / Runner: Step invocation and failure handling
//! - Bus / Guard: Command/event transport and per-execution serialization
//! - Engine: Handlers and the public facade

pub mod bus;
pub mod catalog;
pub mod engine;
pub mod error;
pub mod error_policy;
pub mod event_store;
pub mod expression;
pub mod guard;
pub mod index;
pub mod pipeline;
pub mod planner;
pub mod runner;

// Re-export commonly used types
pub use catalog::PipelineCatalog;
pub use engine::{Engine, EngineBuilder, EngineSettings};
pub use error::EngineError;
pub use error_policy::{ErrorDecision, ErrorPolicy};
pub use event_store::{generate_idempotency_key, hash_input, EventStore};
pub use expression::{Evaluator, ExpressionError};
pub use guard::ExecutionGuard;
pub use index::{ExecutionIndex, ExecutionSummary};
pub use pipeline::{
    BackoffStrategy, DependencyGraph, ErrorConfig, LoopConfig, OutputDefinition, OutputMerge,
    ParamDefinition, ParamType, PipelineDefinition, RetryConfig, StepDefinition, ThrowConfig,
};
pub use planner::{PlanAction, Planner, QueuedStep};
