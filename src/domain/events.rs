//! Event types for the event-sourced engine.
//!
//! Every command issued on the bus and every state change is recorded as an
//! immutable entry in the per-execution append-only log. Only `Fact` entries
//! change state when replayed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::execution::{CollectionKind, ForEachItem, ParentStep, StepLoop};
use super::step_error::StepError;

/// A single entry in the append-only event log.
///
/// Entries are the source of truth for execution state. The current state of
/// any execution can be reconstructed by replaying its entries in order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier for this entry
    pub id: Uuid,

    /// Position in the execution's log (assigned at append time, starts at 1)
    pub sequence: u64,

    /// When this entry was appended
    pub timestamp: DateTime<Utc>,

    /// The execution this entry belongs to
    pub execution_id: Uuid,

    /// Whether this records an issued command or a state change
    pub kind: EventKind,

    /// The command or fact itself
    pub payload: EventPayload,
}

impl Event {
    /// Create an unsequenced entry with the current timestamp
    pub fn new(execution_id: Uuid, payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            sequence: 0,
            timestamp: Utc::now(),
            execution_id,
            kind: payload.kind(),
            payload,
        }
    }

    /// Assign the log sequence number
    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }
}

/// Tag distinguishing issued commands from state-changing facts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Command,
    Fact,
}

/// Commands travel on the bus and are recorded for audit; facts mutate state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------
    /// Queue a (root or nested) pipeline execution
    PipelineQueue {
        pipeline_execution_id: Uuid,
        pipeline_name: String,
        #[serde(default)]
        args: Map<String, Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent: Option<ParentStep>,
    },

    /// Run a planning pass
    PipelinePlan { pipeline_execution_id: Uuid },

    /// Start a queued step execution
    StepStart {
        pipeline_execution_id: Uuid,
        step_execution_id: Uuid,
    },

    /// A child pipeline reached a terminal state; settle the parent step
    StepPipelineFinish {
        pipeline_execution_id: Uuid,
        step_execution_id: Uuid,
        child_pipeline_execution_id: Uuid,
    },

    PipelineCancel {
        pipeline_execution_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    PipelinePause { pipeline_execution_id: Uuid },

    PipelineResume { pipeline_execution_id: Uuid },

    // ------------------------------------------------------------------
    // Facts
    // ------------------------------------------------------------------
    PipelineQueued {
        pipeline_execution_id: Uuid,
        pipeline_name: String,
        #[serde(default)]
        args: Map<String, Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent: Option<ParentStep>,
    },

    /// Dependency graph resolved; lists every step full name
    PipelinePlanned {
        pipeline_execution_id: Uuid,
        steps: Vec<String>,
    },

    PipelineStarted { pipeline_execution_id: Uuid },

    /// The `for_each` collection of a step, fixed for the pipeline's lifetime
    StepForEachPlanned {
        pipeline_execution_id: Uuid,
        step_name: String,
        collection: CollectionKind,
        items: Vec<ForEachItem>,
    },

    StepSkipped {
        pipeline_execution_id: Uuid,
        step_name: String,
        for_each_key: String,
    },

    StepQueued {
        pipeline_execution_id: Uuid,
        step_name: String,
        for_each_key: String,
        step_execution_id: Uuid,
        #[serde(default)]
        input: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input_error: Option<StepError>,
        loop_index: u32,
        retry_count: u32,
        /// Backoff to wait before starting (retries only)
        delay_ms: u64,
        idempotency_key: String,
    },

    StepStarted {
        pipeline_execution_id: Uuid,
        step_execution_id: Uuid,
        start_time: DateTime<Utc>,
    },

    StepFinished {
        pipeline_execution_id: Uuid,
        step_execution_id: Uuid,
        output: Value,
        end_time: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        step_loop: Option<StepLoop>,
    },

    StepFailed {
        pipeline_execution_id: Uuid,
        step_execution_id: Uuid,
        error: StepError,
        output: Value,
        end_time: DateTime<Utc>,
        /// A retry was queued; the error does not bubble to the pipeline
        retrying: bool,
    },

    PipelinePaused { pipeline_execution_id: Uuid },

    PipelineResumed { pipeline_execution_id: Uuid },

    PipelineCanceled {
        pipeline_execution_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    PipelineFinished {
        pipeline_execution_id: Uuid,
        #[serde(default)]
        output: Map<String, Value>,
    },

    PipelineFailed {
        pipeline_execution_id: Uuid,
        /// Errors raised by the pipeline itself (validation, planning);
        /// step errors are already recorded by `StepFailed`
        #[serde(default)]
        errors: Vec<StepError>,
    },
}

impl EventPayload {
    /// Commands are recorded but never change state
    pub fn kind(&self) -> EventKind {
        match self {
            Self::PipelineQueue { .. }
            | Self::PipelinePlan { .. }
            | Self::StepStart { .. }
            | Self::StepPipelineFinish { .. }
            | Self::PipelineCancel { .. }
            | Self::PipelinePause { .. }
            | Self::PipelineResume { .. } => EventKind::Command,
            _ => EventKind::Fact,
        }
    }

    /// The pipeline execution every payload is addressed to
    pub fn pipeline_execution_id(&self) -> Uuid {
        match self {
            Self::PipelineQueue {
                pipeline_execution_id,
                ..
            }
            | Self::PipelinePlan {
                pipeline_execution_id,
            }
            | Self::StepStart {
                pipeline_execution_id,
                ..
            }
            | Self::StepPipelineFinish {
                pipeline_execution_id,
                ..
            }
            | Self::PipelineCancel {
                pipeline_execution_id,
                ..
            }
            | Self::PipelinePause {
                pipeline_execution_id,
            }
            | Self::PipelineResume {
                pipeline_execution_id,
            }
            | Self::PipelineQueued {
                pipeline_execution_id,
                ..
            }
            | Self::PipelinePlanned {
                pipeline_execution_id,
                ..
            }
            | Self::PipelineStarted {
                pipeline_execution_id,
            }
            | Self::StepForEachPlanned {
                pipeline_execution_id,
                ..
            }
            | Self::StepSkipped {
                pipeline_execution_id,
                ..
            }
            | Self::StepQueued {
                pipeline_execution_id,
                ..
            }
            | Self::StepStarted {
                pipeline_execution_id,
                ..
            }
            | Self::StepFinished {
                pipeline_execution_id,
                ..
            }
            | Self::StepFailed {
                pipeline_execution_id,
                ..
            }
            | Self::PipelinePaused {
                pipeline_execution_id,
            }
            | Self::PipelineResumed {
                pipeline_execution_id,
            }
            | Self::PipelineCanceled {
                pipeline_execution_id,
                ..
            }
            | Self::PipelineFinished {
                pipeline_execution_id,
                ..
            }
            | Self::PipelineFailed {
                pipeline_execution_id,
                ..
            } => *pipeline_execution_id,
        }
    }

    /// Short name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            Self::PipelineQueue { .. } => "pipeline_queue",
            Self::PipelinePlan { .. } => "pipeline_plan",
            Self::StepStart { .. } => "step_start",
            Self::StepPipelineFinish { .. } => "step_pipeline_finish",
            Self::PipelineCancel { .. } => "pipeline_cancel",
            Self::PipelinePause { .. } => "pipeline_pause",
            Self::PipelineResume { .. } => "pipeline_resume",
            Self::PipelineQueued { .. } => "pipeline_queued",
            Self::PipelinePlanned { .. } => "pipeline_planned",
            Self::PipelineStarted { .. } => "pipeline_started",
            Self::StepForEachPlanned { .. } => "step_for_each_planned",
            Self::StepSkipped { .. } => "step_skipped",
            Self::StepQueued { .. } => "step_queued",
            Self::StepStarted { .. } => "step_started",
            Self::StepFinished { .. } => "step_finished",
            Self::StepFailed { .. } => "step_failed",
            Self::PipelinePaused { .. } => "pipeline_paused",
            Self::PipelineResumed { .. } => "pipeline_resumed",
            Self::PipelineCanceled { .. } => "pipeline_canceled",
            Self::PipelineFinished { .. } => "pipeline_finished",
            Self::PipelineFailed { .. } => "pipeline_failed",
        }
    }
}
