//! conduit - Event-sourced workflow engine
//!
//! Runs declarative pipelines (steps, dependencies, fan-out, loops, retries,
//! nested pipelines) to completion, recording every decision in a
//! per-execution append-only log.
//!
//! # Architecture
//!
//! The system is built around event sourcing:
//! - Commands and facts are recorded as immutable log entries
//! - Current state is derived by replaying the log
//! - Planning is serialized per execution; step work runs concurrently
//!
//! # Modules
//!
//! - `adapters`: Step implementations and the resource resolver
//! - `core`: Engine components (EventStore, Planner, ErrorPolicy, Bus, Engine)
//! - `domain`: Data structures (Event, Execution, StepError)
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Run a pipeline
//! conduit run hello --arg who=world
//!
//! # Check execution status
//! conduit status <execution-id>
//!
//! # List recent executions
//! conduit list
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;

// Re-export main types at crate root for convenience
pub use adapters::{Resolver, StaticResolver, StepFailure, StepImplementation, StepRegistry};
pub use crate::core::{Engine, EngineBuilder, EngineError, EngineSettings, PipelineCatalog, PipelineDefinition};
pub use domain::{Event, EventPayload, Execution, PipelineExecution, PipelineStatus, StepError};
