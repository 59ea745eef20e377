//! Domain types for the conduit engine.
//!
//! This module contains the core data structures:
//! - Events: Immutable log entries (commands and facts)
//! - Execution: The aggregate rebuilt by replaying events
//! - StepError: Structured errors recorded against steps and pipelines

pub mod events;
pub mod execution;
pub mod step_error;

// Re-export commonly used types
pub use events::{Event, EventKind, EventPayload};
pub use execution::{
    CollectionKind, Execution, ForEachItem, ForEachPlan, ParentStep, PipelineExecution,
    PipelineStatus, StepExecution, StepExecutionStatus, StepLoop, StepStatusEntry,
    DEFAULT_FOR_EACH_KEY,
};
pub use step_error::{ErrorKind, StepError};
