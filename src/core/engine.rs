//! The engine: command handlers, event reactions and the public facade.
//!
//! Commands are recorded in the log when issued and then delivered on the
//! bus. Command handlers replay the execution under its guard, decide,
//! append facts and publish them. Fact reactions issue the next command:
//!
//! ```text
//! PipelineQueue -> PipelineQueued -> PipelinePlan -> StepQueued -> StepStart
//!   -> StepFinished / StepFailed -> PipelinePlan -> ... -> PipelineFinished
//! ```
//!
//! Step implementations and retry backoff run with no lock held.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::bus::{Bus, Handler, Message};
use super::catalog::PipelineCatalog;
use super::error::EngineError;
use super::event_store::{generate_idempotency_key, EventStore, DEFAULT_MAX_EVENT_BYTES};
use super::expression::Evaluator;
use super::guard::ExecutionGuard;
use super::index::{ExecutionIndex, ExecutionSummary};
use super::pipeline::PipelineDefinition;
use super::planner::{PlanAction, Planner, QueuedStep};
use super::runner::{invoke, StepSettler};
use crate::adapters::{Resolver, StaticResolver, StepRegistry};
use crate::domain::{
    ErrorKind, Event, EventPayload, Execution, ParentStep, PipelineStatus, StepError,
    StepExecution, StepExecutionStatus,
};

/// Runtime settings handed to the engine at construction
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Entries larger than this are rejected at append time
    pub max_event_bytes: usize,

    /// Default delay between polls in [`Engine::wait`]
    pub poll_interval: Duration,

    /// Default number of polls in [`Engine::wait`]
    pub wait_attempts: u32,

    /// Timeout passed to steps that do not set `timeout_seconds`
    pub default_step_timeout: Duration,

    /// Planning passes per `PipelinePlan` command before the pipeline fails
    pub max_plan_passes: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            max_event_bytes: DEFAULT_MAX_EVENT_BYTES,
            poll_interval: Duration::from_millis(100),
            wait_attempts: 600,
            default_step_timeout: Duration::from_secs(300),
            max_plan_passes: 1000,
        }
    }
}

/// Builder for [`Engine`]
pub struct EngineBuilder {
    events_dir: PathBuf,
    catalog: PipelineCatalog,
    registry: StepRegistry,
    resolver: Arc<dyn Resolver>,
    index: Option<ExecutionIndex>,
    settings: EngineSettings,
}

impl EngineBuilder {
    /// Engine storing its logs under `events_dir`, with the built-in steps
    pub fn new(events_dir: impl Into<PathBuf>) -> Self {
        Self {
            events_dir: events_dir.into(),
            catalog: PipelineCatalog::new(),
            registry: StepRegistry::with_builtins(),
            resolver: Arc::new(StaticResolver::new()),
            index: None,
            settings: EngineSettings::default(),
        }
    }

    pub fn catalog(mut self, catalog: PipelineCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn registry(mut self, registry: StepRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn resolver(mut self, resolver: impl Resolver + 'static) -> Self {
        self.resolver = Arc::new(resolver);
        self
    }

    pub fn index(mut self, index: ExecutionIndex) -> Self {
        self.index = Some(index);
        self
    }

    pub fn settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Open the store and start the bus dispatcher
    pub async fn start(self) -> Result<Engine, EngineError> {
        let store = EventStore::open(self.events_dir, self.settings.max_event_bytes).await?;
        let (bus, rx) = Bus::channel();

        let inner = Arc::new(EngineInner {
            store,
            index: self.index,
            catalog: self.catalog,
            registry: self.registry,
            resolver: self.resolver,
            evaluator: Evaluator::new(),
            guard: ExecutionGuard::new(),
            bus,
            settings: self.settings,
        });
        Bus::dispatch(rx, Arc::downgrade(&inner));

        Ok(Engine { inner })
    }
}

/// Event-sourced pipeline engine
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn builder(events_dir: impl Into<PathBuf>) -> EngineBuilder {
        EngineBuilder::new(events_dir)
    }

    pub fn catalog(&self) -> &PipelineCatalog {
        &self.inner.catalog
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.inner.settings
    }

    /// Validate args and queue a new root pipeline execution.
    ///
    /// Validation failures are returned before anything is recorded.
    #[instrument(skip(self, args))]
    pub async fn enqueue(
        &self,
        pipeline_name: &str,
        args: Map<String, Value>,
    ) -> Result<(Uuid, Uuid), EngineError> {
        let inner = &self.inner;
        let definition = inner
            .catalog
            .get(pipeline_name)
            .ok_or_else(|| EngineError::PipelineNotFound(pipeline_name.to_string()))?;
        definition.resolve_args(&args, inner.resolver.as_ref())?;

        let execution_id = Uuid::new_v4();
        let pipeline_execution_id = Uuid::new_v4();

        let command = inner
            .store
            .append(
                execution_id,
                EventPayload::PipelineQueue {
                    pipeline_execution_id,
                    pipeline_name: pipeline_name.to_string(),
                    args,
                    parent: None,
                },
            )
            .await?;

        if let Some(index) = &inner.index {
            index.insert(execution_id, pipeline_name, PipelineStatus::Queued)?;
        }
        inner.bus.send(Message::Command(command))?;

        info!(%execution_id, %pipeline_execution_id, "Enqueued pipeline");
        Ok((execution_id, pipeline_execution_id))
    }

    /// Replay an execution's log into its aggregate
    pub async fn get_execution(&self, execution_id: Uuid) -> Result<Execution, EngineError> {
        let events = self.inner.store.replay(execution_id).await?;
        Execution::from_events(&events).ok_or(EngineError::ExecutionNotFound(execution_id))
    }

    /// Raw log entries of an execution
    pub async fn events(&self, execution_id: Uuid) -> Result<Vec<Event>, EngineError> {
        self.inner.store.replay(execution_id).await
    }

    /// Stop queuing new steps; in-flight steps finish. Cascades to children.
    #[instrument(skip(self))]
    pub async fn cancel(
        &self,
        execution_id: Uuid,
        pipeline_execution_id: Uuid,
        reason: Option<String>,
    ) -> Result<(), EngineError> {
        self.require(execution_id, pipeline_execution_id).await?;
        self.inner
            .issue(
                execution_id,
                EventPayload::PipelineCancel {
                    pipeline_execution_id,
                    reason,
                },
            )
            .await
    }

    /// Suspend planning of a pipeline execution
    #[instrument(skip(self))]
    pub async fn pause(
        &self,
        execution_id: Uuid,
        pipeline_execution_id: Uuid,
    ) -> Result<(), EngineError> {
        self.require(execution_id, pipeline_execution_id).await?;
        self.inner
            .issue(
                execution_id,
                EventPayload::PipelinePause {
                    pipeline_execution_id,
                },
            )
            .await
    }

    /// Resume a paused pipeline execution
    #[instrument(skip(self))]
    pub async fn resume(
        &self,
        execution_id: Uuid,
        pipeline_execution_id: Uuid,
    ) -> Result<(), EngineError> {
        self.require(execution_id, pipeline_execution_id).await?;
        self.inner
            .issue(
                execution_id,
                EventPayload::PipelineResume {
                    pipeline_execution_id,
                },
            )
            .await
    }

    async fn require(
        &self,
        execution_id: Uuid,
        pipeline_execution_id: Uuid,
    ) -> Result<(), EngineError> {
        let execution = self.get_execution(execution_id).await?;
        if execution.pipeline_execution(pipeline_execution_id).is_none() {
            return Err(EngineError::PipelineExecutionNotFound(pipeline_execution_id));
        }
        Ok(())
    }

    /// Poll until the pipeline execution is terminal, using the configured
    /// interval and attempts
    pub async fn wait(
        &self,
        execution_id: Uuid,
        pipeline_execution_id: Uuid,
    ) -> Result<Execution, EngineError> {
        let settings = &self.inner.settings;
        self.wait_for_completion(
            execution_id,
            pipeline_execution_id,
            settings.poll_interval,
            settings.wait_attempts,
        )
        .await
    }

    /// Poll the replayed aggregate until the pipeline execution is terminal
    #[instrument(skip(self))]
    pub async fn wait_for_completion(
        &self,
        execution_id: Uuid,
        pipeline_execution_id: Uuid,
        poll_interval: Duration,
        attempts: u32,
    ) -> Result<Execution, EngineError> {
        for _ in 0..attempts.max(1) {
            match self.get_execution(execution_id).await {
                Ok(execution) => {
                    let done = execution
                        .pipeline_execution(pipeline_execution_id)
                        .map(|p| p.is_terminal())
                        .unwrap_or(false);
                    if done {
                        return Ok(execution);
                    }
                }
                Err(EngineError::ExecutionNotFound(_)) => {}
                Err(e) => return Err(e),
            }
            tokio::time::sleep(poll_interval).await;
        }

        Err(EngineError::WaitTimeout(pipeline_execution_id))
    }

    /// Most recent executions first
    pub async fn list_executions(&self, limit: usize) -> Result<Vec<ExecutionSummary>, EngineError> {
        if let Some(index) = &self.inner.index {
            return index.list(limit);
        }

        let mut summaries = Vec::new();
        for execution_id in self.inner.store.list_executions().await? {
            let Ok(execution) = self.get_execution(execution_id).await else {
                continue;
            };
            if let Some(root) = execution.root() {
                summaries.push(ExecutionSummary {
                    execution_id,
                    pipeline_name: root.pipeline_name.clone(),
                    status: root.status.to_string(),
                    created_at: execution.created_at,
                    updated_at: root.ended_at.unwrap_or(execution.created_at),
                });
            }
        }
        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        summaries.truncate(limit);
        Ok(summaries)
    }
}

struct EngineInner {
    store: EventStore,
    index: Option<ExecutionIndex>,
    catalog: PipelineCatalog,
    registry: StepRegistry,
    resolver: Arc<dyn Resolver>,
    evaluator: Evaluator,
    guard: ExecutionGuard,
    bus: Bus,
    settings: EngineSettings,
}

#[async_trait]
impl Handler for EngineInner {
    async fn handle(&self, message: Message) {
        let event = message.event();
        let result = match &message {
            Message::Command(event) => self.handle_command(event).await,
            Message::Event(event) => self.handle_fact(event).await,
        };

        if let Err(e) = result {
            error!(
                execution_id = %event.execution_id,
                event = event.payload.name(),
                error = %e,
                "Handler failed"
            );
        }
    }
}

impl EngineInner {
    /// Record a command and deliver it
    async fn issue(&self, execution_id: Uuid, payload: EventPayload) -> Result<(), EngineError> {
        let event = self.store.append(execution_id, payload).await?;
        self.bus.send(Message::Command(event))
    }

    /// Append a fact and apply it to the local snapshot
    async fn append(
        &self,
        execution: &mut Execution,
        payload: EventPayload,
    ) -> Result<Event, EngineError> {
        let event = self.store.append(execution.id, payload).await?;
        execution.apply(&event);
        Ok(event)
    }

    fn publish(&self, events: Vec<Event>) -> Result<(), EngineError> {
        for event in events {
            self.bus.send(Message::Event(event))?;
        }
        Ok(())
    }

    /// Append `PipelineFailed` carrying one pipeline-level error
    async fn fail_pipeline(
        &self,
        execution: &mut Execution,
        pipeline_execution_id: Uuid,
        mut failure: StepError,
    ) -> Result<Event, EngineError> {
        failure.pipeline_execution_id = Some(pipeline_execution_id);
        self.append(
            execution,
            EventPayload::PipelineFailed {
                pipeline_execution_id,
                errors: vec![failure],
            },
        )
        .await
    }

    async fn load(&self, execution_id: Uuid) -> Result<Execution, EngineError> {
        let events = self.store.replay(execution_id).await?;
        Ok(Execution::from_events(&events).unwrap_or_else(|| Execution::new(execution_id)))
    }

    fn definition(&self, name: &str) -> Result<Arc<PipelineDefinition>, EngineError> {
        self.catalog
            .get(name)
            .ok_or_else(|| EngineError::PipelineNotFound(name.to_string()))
    }

    async fn handle_command(&self, event: &Event) -> Result<(), EngineError> {
        let execution_id = event.execution_id;
        debug!(%execution_id, command = event.payload.name(), "Handling command");

        match &event.payload {
            EventPayload::PipelineQueue {
                pipeline_execution_id,
                pipeline_name,
                args,
                parent,
            } => {
                self.queue_pipeline(
                    execution_id,
                    *pipeline_execution_id,
                    pipeline_name,
                    args,
                    parent.clone(),
                )
                .await
            }
            EventPayload::PipelinePlan {
                pipeline_execution_id,
            } => self.plan_pipeline(execution_id, *pipeline_execution_id).await,
            EventPayload::StepStart {
                pipeline_execution_id,
                step_execution_id,
            } => {
                self.start_step(execution_id, *pipeline_execution_id, *step_execution_id)
                    .await
            }
            EventPayload::StepPipelineFinish {
                pipeline_execution_id,
                step_execution_id,
                child_pipeline_execution_id,
            } => {
                self.finish_pipeline_step(
                    execution_id,
                    *pipeline_execution_id,
                    *step_execution_id,
                    *child_pipeline_execution_id,
                )
                .await
            }
            EventPayload::PipelineCancel {
                pipeline_execution_id,
                reason,
            } => {
                self.cancel_pipeline(execution_id, *pipeline_execution_id, reason.clone())
                    .await
            }
            EventPayload::PipelinePause {
                pipeline_execution_id,
            } => self.pause_pipeline(execution_id, *pipeline_execution_id).await,
            EventPayload::PipelineResume {
                pipeline_execution_id,
            } => self.resume_pipeline(execution_id, *pipeline_execution_id).await,
            _ => Ok(()),
        }
    }

    async fn handle_fact(&self, event: &Event) -> Result<(), EngineError> {
        let execution_id = event.execution_id;

        match &event.payload {
            EventPayload::PipelineQueued {
                pipeline_execution_id,
                ..
            } => {
                self.issue(
                    execution_id,
                    EventPayload::PipelinePlan {
                        pipeline_execution_id: *pipeline_execution_id,
                    },
                )
                .await
            }
            EventPayload::StepQueued {
                pipeline_execution_id,
                step_execution_id,
                ..
            } => {
                self.issue(
                    execution_id,
                    EventPayload::StepStart {
                        pipeline_execution_id: *pipeline_execution_id,
                        step_execution_id: *step_execution_id,
                    },
                )
                .await
            }
            EventPayload::StepFinished {
                pipeline_execution_id,
                ..
            }
            | EventPayload::StepFailed {
                pipeline_execution_id,
                retrying: false,
                ..
            } => {
                self.issue(
                    execution_id,
                    EventPayload::PipelinePlan {
                        pipeline_execution_id: *pipeline_execution_id,
                    },
                )
                .await
            }
            EventPayload::PipelineResumed {
                pipeline_execution_id,
            } => self.restart_queued(execution_id, *pipeline_execution_id).await,
            EventPayload::PipelineStarted {
                pipeline_execution_id,
            } => {
                self.pipeline_started(execution_id, *pipeline_execution_id)
                    .await
            }
            EventPayload::PipelineFinished {
                pipeline_execution_id,
                ..
            }
            | EventPayload::PipelineFailed {
                pipeline_execution_id,
                ..
            }
            | EventPayload::PipelineCanceled {
                pipeline_execution_id,
                ..
            } => {
                self.pipeline_closed(execution_id, *pipeline_execution_id)
                    .await
            }
            _ => Ok(()),
        }
    }

    async fn queue_pipeline(
        &self,
        execution_id: Uuid,
        pipeline_execution_id: Uuid,
        pipeline_name: &str,
        args: &Map<String, Value>,
        parent: Option<ParentStep>,
    ) -> Result<(), EngineError> {
        let _lock = self.guard.lock(execution_id).await;
        let mut execution = self.load(execution_id).await?;
        if execution.pipeline_execution(pipeline_execution_id).is_some() {
            debug!(%pipeline_execution_id, "Pipeline execution already queued");
            return Ok(());
        }

        let resolved = self
            .definition(pipeline_name)
            .and_then(|d| d.resolve_args(args, self.resolver.as_ref()));

        let queued_args = match &resolved {
            Ok(resolved) => resolved.clone(),
            Err(_) => args.clone(),
        };
        let mut appended = vec![
            self.append(
                &mut execution,
                EventPayload::PipelineQueued {
                    pipeline_execution_id,
                    pipeline_name: pipeline_name.to_string(),
                    args: queued_args,
                    parent,
                },
            )
            .await?,
        ];

        if let Err(e) = resolved {
            warn!(%pipeline_execution_id, pipeline = pipeline_name, error = %e, "Rejecting pipeline args");
            appended.push(
                self.fail_pipeline(
                    &mut execution,
                    pipeline_execution_id,
                    StepError::validation(e.to_string()),
                )
                .await?,
            );
        }

        self.publish(appended)
    }

    async fn plan_pipeline(
        &self,
        execution_id: Uuid,
        pipeline_execution_id: Uuid,
    ) -> Result<(), EngineError> {
        let _lock = self.guard.lock(execution_id).await;
        let mut execution = self.load(execution_id).await?;

        let (status, pipeline_name) = match execution.pipeline_execution(pipeline_execution_id) {
            Some(p) if !p.is_terminal() => (p.status, p.pipeline_name.clone()),
            _ => return Ok(()),
        };

        let definition = match self.definition(&pipeline_name) {
            Ok(definition) => definition,
            Err(e) => {
                let failed = self
                    .fail_pipeline(
                        &mut execution,
                        pipeline_execution_id,
                        StepError::validation(e.to_string()),
                    )
                    .await?;
                return self.publish(vec![failed]);
            }
        };

        let mut payloads = Vec::new();
        if status == PipelineStatus::Queued {
            payloads.push(EventPayload::PipelinePlanned {
                pipeline_execution_id,
                steps: definition.step_names(),
            });
        }

        let planner = Planner::new(&definition, &self.evaluator, self.resolver.as_ref());
        let mut appended = Vec::new();
        let mut passes = 0;
        loop {
            if !payloads.is_empty() {
                if let Err(e) = self
                    .append_planned(&mut execution, pipeline_execution_id, payloads, &mut appended)
                    .await
                {
                    self.publish(appended)?;
                    return Err(e);
                }
            }

            let Some(pexec) = execution.pipeline_execution(pipeline_execution_id) else {
                break;
            };
            let actions = planner.plan(pexec);
            if actions.is_empty() {
                break;
            }

            passes += 1;
            if passes > self.settings.max_plan_passes {
                warn!(%pipeline_execution_id, passes, "Planning did not settle");
                appended.push(
                    self.fail_pipeline(
                        &mut execution,
                        pipeline_execution_id,
                        StepError::internal(format!(
                            "planning did not settle after {} passes",
                            self.settings.max_plan_passes
                        ))
                        .for_step(&definition.name, pipeline_execution_id, None),
                    )
                    .await?,
                );
                break;
            }

            let mut needs_start = pexec.status == PipelineStatus::Planned;
            payloads = Vec::with_capacity(actions.len() + 1);

            for action in actions {
                match action {
                    PlanAction::ResolveForEach {
                        step,
                        collection,
                        items,
                    } => {
                        debug!(%pipeline_execution_id, %step, count = items.len(), "Resolved for_each");
                        payloads.push(EventPayload::StepForEachPlanned {
                            pipeline_execution_id,
                            step_name: step,
                            collection,
                            items,
                        });
                    }
                    PlanAction::Skip { step, for_each_key } => {
                        debug!(%pipeline_execution_id, %step, %for_each_key, "Skipping step");
                        payloads.push(EventPayload::StepSkipped {
                            pipeline_execution_id,
                            step_name: step,
                            for_each_key,
                        });
                    }
                    PlanAction::Queue(queued) => {
                        if needs_start {
                            payloads.push(EventPayload::PipelineStarted {
                                pipeline_execution_id,
                            });
                            needs_start = false;
                        }
                        payloads.push(step_queued(execution_id, pipeline_execution_id, queued));
                    }
                    PlanAction::Finish { output } => {
                        info!(%execution_id, %pipeline_execution_id, "Pipeline finished");
                        payloads.push(EventPayload::PipelineFinished {
                            pipeline_execution_id,
                            output,
                        });
                    }
                    PlanAction::Fail { errors } => {
                        warn!(%execution_id, %pipeline_execution_id, "Pipeline failed");
                        payloads.push(EventPayload::PipelineFailed {
                            pipeline_execution_id,
                            errors,
                        });
                    }
                }
            }
        }

        self.publish(appended)
    }

    /// Append one planning pass.
    ///
    /// An entry over the size limit fails the pipeline instead of leaving it
    /// half planned.
    async fn append_planned(
        &self,
        execution: &mut Execution,
        pipeline_execution_id: Uuid,
        payloads: Vec<EventPayload>,
        appended: &mut Vec<Event>,
    ) -> Result<(), EngineError> {
        for payload in payloads {
            let name = payload.name();
            match self.append(execution, payload).await {
                Ok(event) => appended.push(event),
                Err(EngineError::EventTooLarge { size, limit }) => {
                    warn!(%pipeline_execution_id, event = name, size, limit, "Planning entry too large");
                    let failure = StepError::internal(format!(
                        "{} entry of {} bytes exceeds the {} byte limit",
                        name, size, limit
                    ));
                    appended.push(
                        self.fail_pipeline(execution, pipeline_execution_id, failure)
                            .await?,
                    );
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// The attempt, if it may start now
    fn startable(
        execution: &Execution,
        pipeline_execution_id: Uuid,
        step_execution_id: Uuid,
    ) -> Option<&StepExecution> {
        let pexec = execution.pipeline_execution(pipeline_execution_id)?;
        if pexec.is_terminal() || pexec.status == PipelineStatus::Paused {
            return None;
        }
        pexec
            .step_execution(step_execution_id)
            .filter(|attempt| attempt.status == StepExecutionStatus::Queued)
    }

    async fn start_step(
        &self,
        execution_id: Uuid,
        pipeline_execution_id: Uuid,
        step_execution_id: Uuid,
    ) -> Result<(), EngineError> {
        let delay_ms = {
            let _lock = self.guard.lock(execution_id).await;
            let execution = self.load(execution_id).await?;
            match Self::startable(&execution, pipeline_execution_id, step_execution_id) {
                Some(attempt) => attempt.delay_ms,
                None => return Ok(()),
            }
        };

        if delay_ms > 0 {
            debug!(%step_execution_id, delay_ms, "Waiting before retry");
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }

        let (definition, attempt) = {
            let _lock = self.guard.lock(execution_id).await;
            let mut execution = self.load(execution_id).await?;
            let Some(attempt) =
                Self::startable(&execution, pipeline_execution_id, step_execution_id).cloned()
            else {
                return Ok(());
            };
            let pipeline_name = execution
                .pipeline_execution(pipeline_execution_id)
                .map(|p| p.pipeline_name.clone())
                .unwrap_or_default();
            let definition = self.definition(&pipeline_name)?;
            let step = definition.get_step(&attempt.step_name).ok_or_else(|| {
                EngineError::Internal(format!("step '{}' not in definition", attempt.step_name))
            })?;

            let started = self
                .append(
                    &mut execution,
                    EventPayload::StepStarted {
                        pipeline_execution_id,
                        step_execution_id,
                        start_time: Utc::now(),
                    },
                )
                .await?;
            self.publish(vec![started])?;

            if step.is_pipeline_step() && attempt.input_error.is_none() {
                let child_pipeline_execution_id = Uuid::new_v4();
                let child_name = step.pipeline.clone().unwrap_or_default();
                info!(
                    %pipeline_execution_id,
                    step = %attempt.step_name,
                    child = %child_pipeline_execution_id,
                    pipeline = %child_name,
                    "Starting nested pipeline"
                );
                return self
                    .issue(
                        execution_id,
                        EventPayload::PipelineQueue {
                            pipeline_execution_id: child_pipeline_execution_id,
                            pipeline_name: child_name,
                            args: attempt.input.as_object().cloned().unwrap_or_default(),
                            parent: Some(ParentStep {
                                pipeline_execution_id,
                                step_execution_id,
                            }),
                        },
                    )
                    .await;
            }

            (definition, attempt)
        };

        let result = match definition.get_step(&attempt.step_name) {
            Some(step) => {
                invoke(
                    &self.registry,
                    step,
                    &attempt,
                    self.settings.default_step_timeout,
                )
                .await
            }
            None => Err(StepError::internal("step vanished from definition")),
        };

        let _lock = self.guard.lock(execution_id).await;
        let mut execution = self.load(execution_id).await?;
        let appended = self
            .settle(
                &mut execution,
                &definition,
                pipeline_execution_id,
                step_execution_id,
                result,
            )
            .await?;
        self.publish(appended)
    }

    /// Facts settling one attempt, empty when it is already settled
    fn settle_payloads(
        &self,
        execution: &Execution,
        definition: &PipelineDefinition,
        pipeline_execution_id: Uuid,
        step_execution_id: Uuid,
        result: Result<Value, StepError>,
    ) -> Result<Vec<EventPayload>, EngineError> {
        let Some(pexec) = execution.pipeline_execution(pipeline_execution_id) else {
            return Ok(Vec::new());
        };
        let Some(attempt) = pexec.step_execution(step_execution_id) else {
            return Ok(Vec::new());
        };
        if attempt.status.is_terminal() {
            debug!(%step_execution_id, "Attempt already settled");
            return Ok(Vec::new());
        }
        let Some(step) = definition.get_step(&attempt.step_name) else {
            return Err(EngineError::Internal(format!(
                "step '{}' not in definition",
                attempt.step_name
            )));
        };

        let planner = Planner::new(definition, &self.evaluator, self.resolver.as_ref());
        Ok(StepSettler::new(execution.id, &planner, &self.evaluator)
            .settle(pexec, step, attempt, result))
    }

    /// Append the facts settling one attempt; caller holds the guard.
    ///
    /// A result too large for the log settles the attempt as an internal
    /// failure instead, so the step's error policy still decides the outcome.
    async fn settle(
        &self,
        execution: &mut Execution,
        definition: &PipelineDefinition,
        pipeline_execution_id: Uuid,
        step_execution_id: Uuid,
        result: Result<Value, StepError>,
    ) -> Result<Vec<Event>, EngineError> {
        let payloads = self.settle_payloads(
            execution,
            definition,
            pipeline_execution_id,
            step_execution_id,
            result,
        )?;

        let mut appended = Vec::with_capacity(payloads.len());
        let mut payloads = payloads.into_iter();
        let Some(first) = payloads.next() else {
            return Ok(appended);
        };
        match self.append(execution, first).await {
            Ok(event) => appended.push(event),
            Err(EngineError::EventTooLarge { size, limit }) => {
                warn!(%step_execution_id, size, limit, "Step result too large for the log");
                let failure = StepError::internal(format!(
                    "step result of {} bytes exceeds the {} byte limit",
                    size, limit
                ));
                payloads = self
                    .settle_payloads(
                        execution,
                        definition,
                        pipeline_execution_id,
                        step_execution_id,
                        Err(failure),
                    )?
                    .into_iter();
            }
            Err(e) => return Err(e),
        }

        for payload in payloads {
            appended.push(self.append(execution, payload).await?);
        }
        Ok(appended)
    }

    async fn finish_pipeline_step(
        &self,
        execution_id: Uuid,
        pipeline_execution_id: Uuid,
        step_execution_id: Uuid,
        child_pipeline_execution_id: Uuid,
    ) -> Result<(), EngineError> {
        let _lock = self.guard.lock(execution_id).await;
        let mut execution = self.load(execution_id).await?;

        let Some(child) = execution.pipeline_execution(child_pipeline_execution_id) else {
            return Ok(());
        };
        let result = match child.status {
            PipelineStatus::Finished => Ok(Value::Object(child.pipeline_output.clone())),
            PipelineStatus::Failed => {
                let detail = child
                    .errors
                    .iter()
                    .map(|e| e.to_string())
                    .collect::<Vec<_>>()
                    .join("; ");
                Err(StepError::new(
                    ErrorKind::ChildPipeline,
                    500,
                    format!("pipeline '{}' failed", child.pipeline_name),
                )
                .with_detail(detail))
            }
            PipelineStatus::Canceled => Err(StepError::new(
                ErrorKind::ChildPipeline,
                500,
                format!("pipeline '{}' was canceled", child.pipeline_name),
            )),
            _ => return Ok(()),
        };

        let Some(parent_name) = execution
            .pipeline_execution(pipeline_execution_id)
            .map(|p| p.pipeline_name.clone())
        else {
            return Ok(());
        };
        let definition = self.definition(&parent_name)?;

        let appended = self
            .settle(
                &mut execution,
                &definition,
                pipeline_execution_id,
                step_execution_id,
                result,
            )
            .await?;
        self.publish(appended)
    }

    async fn cancel_pipeline(
        &self,
        execution_id: Uuid,
        pipeline_execution_id: Uuid,
        reason: Option<String>,
    ) -> Result<(), EngineError> {
        let _lock = self.guard.lock(execution_id).await;
        let mut execution = self.load(execution_id).await?;

        match execution.pipeline_execution(pipeline_execution_id) {
            Some(p) if !p.is_terminal() => {}
            _ => return Ok(()),
        }
        let children: Vec<Uuid> = execution
            .children_of(pipeline_execution_id)
            .into_iter()
            .filter(|c| !c.is_terminal())
            .map(|c| c.id)
            .collect();

        info!(%execution_id, %pipeline_execution_id, ?reason, "Canceling pipeline");
        let canceled = self
            .append(
                &mut execution,
                EventPayload::PipelineCanceled {
                    pipeline_execution_id,
                    reason: reason.clone(),
                },
            )
            .await?;
        self.publish(vec![canceled])?;

        for child in children {
            self.issue(
                execution_id,
                EventPayload::PipelineCancel {
                    pipeline_execution_id: child,
                    reason: Some(
                        reason
                            .clone()
                            .unwrap_or_else(|| "parent pipeline canceled".to_string()),
                    ),
                },
            )
            .await?;
        }
        Ok(())
    }

    async fn pause_pipeline(
        &self,
        execution_id: Uuid,
        pipeline_execution_id: Uuid,
    ) -> Result<(), EngineError> {
        let _lock = self.guard.lock(execution_id).await;
        let mut execution = self.load(execution_id).await?;

        let can_pause = execution
            .pipeline_execution(pipeline_execution_id)
            .map(|p| p.status.can_transition_to(PipelineStatus::Paused))
            .unwrap_or(false);
        if !can_pause {
            return Ok(());
        }

        info!(%execution_id, %pipeline_execution_id, "Pausing pipeline");
        let paused = self
            .append(
                &mut execution,
                EventPayload::PipelinePaused {
                    pipeline_execution_id,
                },
            )
            .await?;
        self.publish(vec![paused])
    }

    async fn resume_pipeline(
        &self,
        execution_id: Uuid,
        pipeline_execution_id: Uuid,
    ) -> Result<(), EngineError> {
        let _lock = self.guard.lock(execution_id).await;
        let mut execution = self.load(execution_id).await?;

        let paused = execution
            .pipeline_execution(pipeline_execution_id)
            .map(|p| p.status == PipelineStatus::Paused)
            .unwrap_or(false);
        if !paused {
            return Ok(());
        }

        info!(%execution_id, %pipeline_execution_id, "Resuming pipeline");
        let resumed = self
            .append(
                &mut execution,
                EventPayload::PipelineResumed {
                    pipeline_execution_id,
                },
            )
            .await?;
        self.publish(vec![resumed])
    }

    /// After a resume: start attempts left queued, then plan
    async fn restart_queued(
        &self,
        execution_id: Uuid,
        pipeline_execution_id: Uuid,
    ) -> Result<(), EngineError> {
        let queued: Vec<Uuid> = {
            let _lock = self.guard.lock(execution_id).await;
            let execution = self.load(execution_id).await?;
            execution
                .pipeline_execution(pipeline_execution_id)
                .map(|p| p.queued_step_executions().iter().map(|e| e.id).collect())
                .unwrap_or_default()
        };

        for step_execution_id in queued {
            self.issue(
                execution_id,
                EventPayload::StepStart {
                    pipeline_execution_id,
                    step_execution_id,
                },
            )
            .await?;
        }

        self.issue(
            execution_id,
            EventPayload::PipelinePlan {
                pipeline_execution_id,
            },
        )
        .await
    }

    /// Mark a started root execution in the index
    async fn pipeline_started(
        &self,
        execution_id: Uuid,
        pipeline_execution_id: Uuid,
    ) -> Result<(), EngineError> {
        let Some(index) = &self.index else {
            return Ok(());
        };

        // Under the guard, so a later close always lands last
        let _lock = self.guard.lock(execution_id).await;
        let execution = self.load(execution_id).await?;
        match execution.pipeline_execution(pipeline_execution_id) {
            Some(p) if p.parent.is_none() && p.status == PipelineStatus::Started => {
                index.update_status(execution_id, p.status)?;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// A pipeline execution reached a terminal state
    async fn pipeline_closed(
        &self,
        execution_id: Uuid,
        pipeline_execution_id: Uuid,
    ) -> Result<(), EngineError> {
        let (parent, status) = {
            let _lock = self.guard.lock(execution_id).await;
            let execution = self.load(execution_id).await?;
            match execution.pipeline_execution(pipeline_execution_id) {
                Some(p) => (p.parent.clone(), p.status),
                None => return Ok(()),
            }
        };

        match parent {
            Some(parent) => {
                self.issue(
                    execution_id,
                    EventPayload::StepPipelineFinish {
                        pipeline_execution_id: parent.pipeline_execution_id,
                        step_execution_id: parent.step_execution_id,
                        child_pipeline_execution_id: pipeline_execution_id,
                    },
                )
                .await
            }
            None => {
                info!(%execution_id, %pipeline_execution_id, %status, "Execution closed");
                if let Some(index) = &self.index {
                    index.update_status(execution_id, status)?;
                }
                self.guard.release(execution_id).await;
                Ok(())
            }
        }
    }
}

/// Turn a planner decision into its `StepQueued` fact
fn step_queued(execution_id: Uuid, pipeline_execution_id: Uuid, queued: QueuedStep) -> EventPayload {
    let step_execution_id = Uuid::new_v4();
    let input_error = queued.input_error.map(|mut error| {
        error.step_execution_id = Some(step_execution_id);
        error
    });

    EventPayload::StepQueued {
        pipeline_execution_id,
        idempotency_key: generate_idempotency_key(
            execution_id,
            pipeline_execution_id,
            &queued.step,
            &queued.for_each_key,
            queued.loop_index,
            1,
        ),
        step_name: queued.step,
        for_each_key: queued.for_each_key,
        step_execution_id,
        input: queued.input,
        input_error,
        loop_index: queued.loop_index,
        retry_count: 0,
        delay_ms: 0,
    }
}
