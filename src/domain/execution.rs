//! Execution aggregate and its reconstruction from events.
//!
//! An `Execution` is one top-level invocation. It owns every pipeline
//! execution started underneath it (the root and all nested children). The
//! only way to change it is [`Execution::apply`], which is also the replay
//! path, so live application and reconstruction share one code path.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;
use uuid::Uuid;

use super::events::{Event, EventKind, EventPayload};
use super::step_error::StepError;

/// Key of the single entry of a step without `for_each`
pub const DEFAULT_FOR_EACH_KEY: &str = "0";

/// Root aggregate for one top-level run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    /// Unique identifier for this execution
    pub id: Uuid,

    /// When the first entry was appended
    pub created_at: DateTime<Utc>,

    /// Sequence number of the last applied entry
    pub last_sequence: u64,

    /// Every pipeline execution in this run, root and nested
    pub pipeline_executions: HashMap<Uuid, PipelineExecution>,

    /// Pipeline executions without a parent step, in queue order
    pub root_pipeline_ids: Vec<Uuid>,

    /// Idempotency keys of applied `StepQueued` facts
    #[serde(skip)]
    applied_keys: HashSet<String>,
}

impl Execution {
    /// Create an empty execution
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            created_at: Utc::now(),
            last_sequence: 0,
            pipeline_executions: HashMap::new(),
            root_pipeline_ids: Vec::new(),
            applied_keys: HashSet::new(),
        }
    }

    /// Reconstruct execution state from its log
    pub fn from_events(events: &[Event]) -> Option<Self> {
        let first_event = events.first()?;

        let mut execution = Self::new(first_event.execution_id);
        execution.created_at = first_event.timestamp;

        for event in events {
            execution.apply(event);
        }

        Some(execution)
    }

    /// Look up a pipeline execution
    pub fn pipeline_execution(&self, id: Uuid) -> Option<&PipelineExecution> {
        self.pipeline_executions.get(&id)
    }

    /// The first root pipeline execution (the one `enqueue` created)
    pub fn root(&self) -> Option<&PipelineExecution> {
        self.root_pipeline_ids
            .first()
            .and_then(|id| self.pipeline_executions.get(id))
    }

    /// Child pipeline executions started by steps of `parent`
    pub fn children_of(&self, parent: Uuid) -> Vec<&PipelineExecution> {
        self.pipeline_executions
            .values()
            .filter(|p| {
                p.parent
                    .as_ref()
                    .map(|ps| ps.pipeline_execution_id == parent)
                    .unwrap_or(false)
            })
            .collect()
    }

    /// Apply a single entry to the aggregate.
    ///
    /// Commands are ignored. Facts that would move a pipeline backwards, or
    /// that repeat an already applied step transition, are ignored too, which
    /// makes at-least-once delivery safe.
    pub fn apply(&mut self, event: &Event) {
        if event.sequence > self.last_sequence {
            self.last_sequence = event.sequence;
        }

        if event.kind == EventKind::Command {
            return;
        }

        let timestamp = event.timestamp;
        let pexec_id = event.payload.pipeline_execution_id();

        if let EventPayload::PipelineQueued {
            pipeline_name,
            args,
            parent,
            ..
        } = &event.payload
        {
            if self.pipeline_executions.contains_key(&pexec_id) {
                return;
            }
            let pexec = PipelineExecution::new(
                pexec_id,
                pipeline_name.clone(),
                args.clone(),
                parent.clone(),
                timestamp,
            );
            if parent.is_none() {
                self.root_pipeline_ids.push(pexec_id);
            }
            self.pipeline_executions.insert(pexec_id, pexec);
            return;
        }

        if let EventPayload::StepQueued {
            idempotency_key, ..
        } = &event.payload
        {
            if !self.applied_keys.insert(idempotency_key.clone()) {
                debug!(%idempotency_key, "Ignoring duplicate step_queued");
                return;
            }
        }

        let Some(pexec) = self.pipeline_executions.get_mut(&pexec_id) else {
            debug!(%pexec_id, event = event.payload.name(), "Fact for unknown pipeline execution");
            return;
        };

        pexec.apply(&event.payload, timestamp);
    }
}

/// Status of a pipeline execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    /// Command received, args not yet planned
    Queued,

    /// Dependency graph resolved
    Planned,

    /// At least one step queued or running
    Started,

    /// Planning suspended; in-flight steps finish
    Paused,

    Finished,

    Failed,

    Canceled,
}

impl PipelineStatus {
    /// Finished, failed and canceled are final
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Failed | Self::Canceled)
    }

    /// Forward-only transition table
    pub fn can_transition_to(self, next: PipelineStatus) -> bool {
        use PipelineStatus::*;

        if self.is_terminal() {
            return false;
        }

        match (self, next) {
            (_, Canceled) => true,
            (Queued, Planned) | (Queued, Failed) => true,
            (Planned, Started) | (Planned, Finished) | (Planned, Failed) => true,
            (Planned, Paused) | (Started, Paused) => true,
            (Started, Finished) | (Started, Failed) => true,
            (Paused, Started) => true,
            (Paused, Failed) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Planned => "planned",
            Self::Started => "started",
            Self::Paused => "paused",
            Self::Finished => "finished",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }
}

impl std::fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The step (in the parent pipeline) that started a nested pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentStep {
    pub pipeline_execution_id: Uuid,
    pub step_execution_id: Uuid,
}

/// Shape of a resolved `for_each` collection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionKind {
    /// Keys are "0".."n-1"; outputs are exposed as an array
    List,

    /// Keys are the map keys; outputs are exposed as an object
    Map,
}

/// One element of a resolved `for_each` collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForEachItem {
    pub key: String,
    pub value: Value,
}

/// A step's `for_each` expansion, computed once
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForEachPlan {
    pub collection: CollectionKind,
    pub items: Vec<ForEachItem>,
}

/// One invocation of a pipeline definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineExecution {
    pub id: Uuid,

    pub pipeline_name: String,

    /// Resolved input parameters
    pub args: Map<String, Value>,

    pub status: PipelineStatus,

    /// A `PipelinePlanned` fact has been applied
    pub planned: bool,

    /// Full names of every step in the definition (set when planned)
    pub planned_steps: Vec<String>,

    /// Resolved `for_each` collections keyed by step full name
    pub for_each: HashMap<String, ForEachPlan>,

    /// step full name -> for_each key -> entry
    pub step_status: HashMap<String, BTreeMap<String, StepStatusEntry>>,

    pub pipeline_output: Map<String, Value>,

    /// Errors not absorbed by `ignore` or a successful retry
    pub errors: Vec<StepError>,

    /// Set for nested executions
    pub parent: Option<ParentStep>,

    pub queued_at: DateTime<Utc>,

    pub started_at: Option<DateTime<Utc>>,

    pub ended_at: Option<DateTime<Utc>>,

    /// step execution id -> (step full name, for_each key)
    #[serde(skip)]
    locations: HashMap<Uuid, (String, String)>,
}

impl PipelineExecution {
    pub fn new(
        id: Uuid,
        pipeline_name: String,
        args: Map<String, Value>,
        parent: Option<ParentStep>,
        queued_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            pipeline_name,
            args,
            status: PipelineStatus::Queued,
            planned: false,
            planned_steps: Vec::new(),
            for_each: HashMap::new(),
            step_status: HashMap::new(),
            pipeline_output: Map::new(),
            errors: Vec::new(),
            parent,
            queued_at,
            started_at: None,
            ended_at: None,
            locations: HashMap::new(),
        }
    }

    fn transition(&mut self, next: PipelineStatus, timestamp: DateTime<Utc>) -> bool {
        if !self.status.can_transition_to(next) {
            debug!(
                pipeline_execution_id = %self.id,
                from = %self.status,
                to = %next,
                "Ignoring invalid pipeline transition"
            );
            return false;
        }
        self.status = next;
        if next == PipelineStatus::Started && self.started_at.is_none() {
            self.started_at = Some(timestamp);
        }
        if next.is_terminal() {
            self.ended_at = Some(timestamp);
        }
        true
    }

    fn entry_mut(&mut self, step_name: &str, for_each_key: &str) -> &mut StepStatusEntry {
        self.step_status
            .entry(step_name.to_string())
            .or_default()
            .entry(for_each_key.to_string())
            .or_insert_with(|| StepStatusEntry::new(for_each_key))
    }

    fn apply(&mut self, payload: &EventPayload, timestamp: DateTime<Utc>) {
        match payload {
            EventPayload::PipelinePlanned { steps, .. } => {
                if self.transition(PipelineStatus::Planned, timestamp) {
                    self.planned = true;
                    self.planned_steps = steps.clone();
                }
            }
            EventPayload::PipelineStarted { .. } => {
                self.transition(PipelineStatus::Started, timestamp);
            }
            EventPayload::StepForEachPlanned {
                step_name,
                collection,
                items,
                ..
            } => {
                // cardinality is fixed by the first resolution
                if self.for_each.contains_key(step_name) {
                    return;
                }
                self.for_each.insert(
                    step_name.clone(),
                    ForEachPlan {
                        collection: *collection,
                        items: items.clone(),
                    },
                );
                for item in items {
                    self.entry_mut(step_name, &item.key);
                }
            }
            EventPayload::StepSkipped {
                step_name,
                for_each_key,
                ..
            } => {
                self.entry_mut(step_name, for_each_key).skipped = true;
            }
            EventPayload::StepQueued {
                step_name,
                for_each_key,
                step_execution_id,
                input,
                input_error,
                loop_index,
                retry_count,
                delay_ms,
                ..
            } => {
                let step_execution = StepExecution {
                    id: *step_execution_id,
                    step_name: step_name.clone(),
                    for_each_key: for_each_key.clone(),
                    input: input.clone(),
                    input_error: input_error.clone(),
                    output: None,
                    error: None,
                    status: StepExecutionStatus::Queued,
                    queued_at: timestamp,
                    start_time: None,
                    end_time: None,
                    loop_index: *loop_index,
                    step_loop: None,
                    retry_count: *retry_count,
                    delay_ms: *delay_ms,
                };
                self.entry_mut(step_name, for_each_key)
                    .step_executions
                    .push(step_execution);
                self.locations.insert(
                    *step_execution_id,
                    (step_name.clone(), for_each_key.clone()),
                );
            }
            EventPayload::StepStarted {
                step_execution_id,
                start_time,
                ..
            } => {
                if let Some(exec) = self.step_execution_mut(*step_execution_id) {
                    if exec.status == StepExecutionStatus::Queued {
                        exec.status = StepExecutionStatus::Started;
                        exec.start_time = Some(*start_time);
                    }
                }
            }
            EventPayload::StepFinished {
                step_execution_id,
                output,
                end_time,
                step_loop,
                ..
            } => {
                let Some((step_name, key)) = self.locations.get(step_execution_id).cloned() else {
                    return;
                };
                let entry = self.entry_mut(&step_name, &key);
                let Some(exec) = entry.execution_mut(*step_execution_id) else {
                    return;
                };
                if exec.status.is_terminal() {
                    return;
                }
                exec.status = StepExecutionStatus::Finished;
                exec.output = Some(output.clone());
                exec.end_time = Some(*end_time);
                exec.step_loop = step_loop.clone();
                entry.finished.insert(*step_execution_id);
            }
            EventPayload::StepFailed {
                step_execution_id,
                error,
                output,
                end_time,
                retrying,
                ..
            } => {
                let Some((step_name, key)) = self.locations.get(step_execution_id).cloned() else {
                    return;
                };
                let entry = self.entry_mut(&step_name, &key);
                let Some(exec) = entry.execution_mut(*step_execution_id) else {
                    return;
                };
                if exec.status.is_terminal() {
                    return;
                }
                exec.status = StepExecutionStatus::Failed;
                exec.output = Some(output.clone());
                exec.error = Some(error.clone());
                exec.end_time = Some(*end_time);
                entry.failed.insert(*step_execution_id);
                if !retrying {
                    self.errors.push(error.clone());
                }
            }
            EventPayload::PipelinePaused { .. } => {
                self.transition(PipelineStatus::Paused, timestamp);
            }
            EventPayload::PipelineResumed { .. } => {
                if self.status == PipelineStatus::Paused {
                    self.transition(PipelineStatus::Started, timestamp);
                }
            }
            EventPayload::PipelineCanceled { .. } => {
                self.transition(PipelineStatus::Canceled, timestamp);
            }
            EventPayload::PipelineFinished { output, .. } => {
                if self.transition(PipelineStatus::Finished, timestamp) {
                    self.pipeline_output = output.clone();
                }
            }
            EventPayload::PipelineFailed { errors, .. } => {
                if self.transition(PipelineStatus::Failed, timestamp) {
                    self.errors.extend(errors.iter().cloned());
                }
            }
            _ => {}
        }
    }

    /// Look up a step execution by id
    pub fn step_execution(&self, id: Uuid) -> Option<&StepExecution> {
        let (step_name, key) = self.locations.get(&id)?;
        self.step_status
            .get(step_name)?
            .get(key)?
            .step_executions
            .iter()
            .find(|e| e.id == id)
    }

    fn step_execution_mut(&mut self, id: Uuid) -> Option<&mut StepExecution> {
        let (step_name, key) = self.locations.get(&id)?.clone();
        self.step_status
            .get_mut(&step_name)?
            .get_mut(&key)?
            .execution_mut(id)
    }

    /// Entries of a step, keyed by for_each key
    pub fn entries(&self, step_name: &str) -> Option<&BTreeMap<String, StepStatusEntry>> {
        self.step_status.get(step_name)
    }

    /// Whether the planner has already expanded this step
    pub fn is_step_resolved(&self, step_name: &str) -> bool {
        self.for_each.contains_key(step_name)
            || self
                .step_status
                .get(step_name)
                .map(|entries| !entries.is_empty())
                .unwrap_or(false)
    }

    /// Resolved and every entry terminal
    pub fn is_step_terminal(&self, step_name: &str) -> bool {
        if !self.is_step_resolved(step_name) {
            return false;
        }
        self.step_status
            .get(step_name)
            .map(|entries| entries.values().all(|e| e.is_terminal()))
            .unwrap_or(true)
    }

    /// Whether any step execution is queued or running
    pub fn has_in_flight_steps(&self) -> bool {
        self.step_status
            .values()
            .flat_map(|entries| entries.values())
            .any(|e| e.is_in_flight())
    }

    /// Step executions still waiting to start
    pub fn queued_step_executions(&self) -> Vec<&StepExecution> {
        self.step_status
            .values()
            .flat_map(|entries| entries.values())
            .flat_map(|e| e.step_executions.iter())
            .filter(|e| e.status == StepExecutionStatus::Queued)
            .collect()
    }

    /// Every planned step has been expanded and reached a terminal status.
    ///
    /// A failed pipeline whose failure kept downstream steps from being
    /// evaluated is *not* complete: those steps have no entry at all.
    pub fn is_complete(&self) -> bool {
        self.planned
            && self
                .planned_steps
                .iter()
                .all(|name| self.is_step_terminal(name))
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether a failure has been recorded that nothing absorbed
    pub fn has_failures(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// Bookkeeping for one step name at one `for_each` index
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepStatusEntry {
    /// "0" when the step has no `for_each`
    pub for_each_key: String,

    /// Every physical attempt, in order (loop iterations and retries)
    pub step_executions: Vec<StepExecution>,

    /// The `if` condition evaluated to false
    pub skipped: bool,

    /// Ids of failed attempts
    pub failed: BTreeSet<Uuid>,

    /// Ids of finished attempts
    pub finished: BTreeSet<Uuid>,
}

impl StepStatusEntry {
    pub fn new(for_each_key: &str) -> Self {
        Self {
            for_each_key: for_each_key.to_string(),
            ..Default::default()
        }
    }

    fn execution_mut(&mut self, id: Uuid) -> Option<&mut StepExecution> {
        self.step_executions.iter_mut().find(|e| e.id == id)
    }

    /// The most recent attempt
    pub fn last(&self) -> Option<&StepExecution> {
        self.step_executions.last()
    }

    /// The latest attempt is queued or running
    pub fn is_in_flight(&self) -> bool {
        self.last().map(|e| !e.status.is_terminal()).unwrap_or(false)
    }

    /// A loop iteration is still owed after the latest finished attempt
    pub fn loop_pending(&self) -> bool {
        match self.last() {
            Some(last) if last.status == StepExecutionStatus::Finished => last
                .step_loop
                .as_ref()
                .map(|l| !l.loop_completed)
                .unwrap_or(false),
            _ => false,
        }
    }

    /// Skipped, or the latest attempt settled with no loop iteration owed
    pub fn is_terminal(&self) -> bool {
        if self.skipped {
            return true;
        }
        match self.last() {
            Some(last) => last.status.is_terminal() && !self.loop_pending(),
            None => false,
        }
    }

    /// The latest attempt failed (and nothing was re-queued after it)
    pub fn is_failed(&self) -> bool {
        self.last()
            .map(|e| e.status == StepExecutionStatus::Failed)
            .unwrap_or(false)
    }

    /// The output downstream steps see: the latest attempt's output
    pub fn output(&self) -> Value {
        if self.skipped {
            return Value::Null;
        }
        self.last()
            .and_then(|e| e.output.clone())
            .unwrap_or(Value::Null)
    }
}

/// Status of one step attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepExecutionStatus {
    Queued,
    Started,
    Finished,
    Failed,
}

impl StepExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Failed)
    }
}

/// Loop bookkeeping recorded when an attempt finishes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepLoop {
    /// Index to use for the *next* iteration; held once `loop_completed`
    pub index: u32,
    pub loop_completed: bool,
}

/// One physical attempt of a step at one for_each key and loop iteration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecution {
    pub id: Uuid,

    pub step_name: String,

    pub for_each_key: String,

    /// Fully resolved input
    pub input: Value,

    /// Input could not be resolved; the attempt fails without running
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_error: Option<StepError>,

    pub output: Option<Value>,

    pub error: Option<StepError>,

    pub status: StepExecutionStatus,

    pub queued_at: DateTime<Utc>,

    pub start_time: Option<DateTime<Utc>>,

    pub end_time: Option<DateTime<Utc>>,

    /// Loop iteration this attempt runs
    pub loop_index: u32,

    pub step_loop: Option<StepLoop>,

    pub retry_count: u32,

    /// Backoff waited before this attempt
    pub delay_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::StepError;

    fn fact(execution_id: Uuid, payload: EventPayload) -> Event {
        Event::new(execution_id, payload)
    }

    fn queued(pexec: Uuid, step: &str, key: &str, id: Uuid, idem: &str) -> EventPayload {
        EventPayload::StepQueued {
            pipeline_execution_id: pexec,
            step_name: step.to_string(),
            for_each_key: key.to_string(),
            step_execution_id: id,
            input: Value::Null,
            input_error: None,
            loop_index: 0,
            retry_count: 0,
            delay_ms: 0,
            idempotency_key: idem.to_string(),
        }
    }

    fn base_events(execution_id: Uuid, pexec: Uuid) -> Vec<Event> {
        vec![
            fact(
                execution_id,
                EventPayload::PipelineQueued {
                    pipeline_execution_id: pexec,
                    pipeline_name: "demo".to_string(),
                    args: Map::new(),
                    parent: None,
                },
            ),
            fact(
                execution_id,
                EventPayload::PipelinePlanned {
                    pipeline_execution_id: pexec,
                    steps: vec!["transform.a".to_string()],
                },
            ),
            fact(
                execution_id,
                EventPayload::PipelineStarted {
                    pipeline_execution_id: pexec,
                },
            ),
        ]
    }

    #[test]
    fn test_execution_from_events() {
        let execution_id = Uuid::new_v4();
        let pexec = Uuid::new_v4();
        let step_exec = Uuid::new_v4();

        let mut events = base_events(execution_id, pexec);
        events.push(fact(execution_id, queued(pexec, "transform.a", "0", step_exec, "k1")));
        events.push(fact(
            execution_id,
            EventPayload::StepStarted {
                pipeline_execution_id: pexec,
                step_execution_id: step_exec,
                start_time: Utc::now(),
            },
        ));
        events.push(fact(
            execution_id,
            EventPayload::StepFinished {
                pipeline_execution_id: pexec,
                step_execution_id: step_exec,
                output: serde_json::json!({"value": 1}),
                end_time: Utc::now(),
                step_loop: None,
            },
        ));
        events.push(fact(
            execution_id,
            EventPayload::PipelineFinished {
                pipeline_execution_id: pexec,
                output: Map::new(),
            },
        ));

        let execution = Execution::from_events(&events).unwrap();
        assert_eq!(execution.root_pipeline_ids, vec![pexec]);

        let pipeline = execution.pipeline_execution(pexec).unwrap();
        assert_eq!(pipeline.status, PipelineStatus::Finished);
        assert!(pipeline.is_complete());

        let entry = &pipeline.step_status["transform.a"]["0"];
        assert_eq!(entry.step_executions.len(), 1);
        assert!(entry.finished.contains(&step_exec));
        assert_eq!(entry.output()["value"], 1);
    }

    #[test]
    fn test_duplicate_step_queued_is_ignored() {
        let execution_id = Uuid::new_v4();
        let pexec = Uuid::new_v4();

        let mut events = base_events(execution_id, pexec);
        events.push(fact(execution_id, queued(pexec, "transform.a", "0", Uuid::new_v4(), "same")));
        events.push(fact(execution_id, queued(pexec, "transform.a", "0", Uuid::new_v4(), "same")));

        let execution = Execution::from_events(&events).unwrap();
        let pipeline = execution.pipeline_execution(pexec).unwrap();
        assert_eq!(pipeline.step_status["transform.a"]["0"].step_executions.len(), 1);
    }

    #[test]
    fn test_retrying_failure_does_not_bubble() {
        let execution_id = Uuid::new_v4();
        let pexec = Uuid::new_v4();
        let first = Uuid::new_v4();

        let mut events = base_events(execution_id, pexec);
        events.push(fact(execution_id, queued(pexec, "transform.a", "0", first, "k1")));
        events.push(fact(
            execution_id,
            EventPayload::StepFailed {
                pipeline_execution_id: pexec,
                step_execution_id: first,
                error: StepError::internal("boom"),
                output: Value::Null,
                end_time: Utc::now(),
                retrying: true,
            },
        ));

        let execution = Execution::from_events(&events).unwrap();
        let pipeline = execution.pipeline_execution(pexec).unwrap();
        assert!(pipeline.errors.is_empty());
        assert!(pipeline.step_status["transform.a"]["0"].is_failed());
    }

    #[test]
    fn test_terminal_status_is_final() {
        let execution_id = Uuid::new_v4();
        let pexec = Uuid::new_v4();

        let mut events = base_events(execution_id, pexec);
        events.push(fact(
            execution_id,
            EventPayload::PipelineCanceled {
                pipeline_execution_id: pexec,
                reason: None,
            },
        ));
        events.push(fact(
            execution_id,
            EventPayload::PipelineFinished {
                pipeline_execution_id: pexec,
                output: Map::new(),
            },
        ));

        let execution = Execution::from_events(&events).unwrap();
        assert_eq!(
            execution.pipeline_execution(pexec).unwrap().status,
            PipelineStatus::Canceled
        );
    }

    #[test]
    fn test_for_each_cardinality_is_fixed() {
        let execution_id = Uuid::new_v4();
        let pexec = Uuid::new_v4();
        let items = |n: usize| {
            (0..n)
                .map(|i| ForEachItem {
                    key: i.to_string(),
                    value: Value::from(i),
                })
                .collect::<Vec<_>>()
        };

        let mut events = base_events(execution_id, pexec);
        for n in [3, 5] {
            events.push(fact(
                execution_id,
                EventPayload::StepForEachPlanned {
                    pipeline_execution_id: pexec,
                    step_name: "transform.a".to_string(),
                    collection: CollectionKind::List,
                    items: items(n),
                },
            ));
        }

        let execution = Execution::from_events(&events).unwrap();
        let pipeline = execution.pipeline_execution(pexec).unwrap();
        assert_eq!(pipeline.step_status["transform.a"].len(), 3);
        assert_eq!(pipeline.for_each["transform.a"].items.len(), 3);
    }

    #[test]
    fn test_status_transitions() {
        use PipelineStatus::*;

        assert!(Queued.can_transition_to(Planned));
        assert!(Started.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Started));
        assert!(Queued.can_transition_to(Canceled));
        assert!(!Finished.can_transition_to(Failed));
        assert!(!Started.can_transition_to(Queued));
        assert!(!Queued.can_transition_to(Started));
    }
}
