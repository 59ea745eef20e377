//! Planner: decides what a pipeline execution does next.
//!
//! The planner is a pure function of a `PipelineExecution` snapshot and its
//! definition. It never appends anything itself; the engine turns the
//! returned actions into facts, applies them and plans again until no action
//! is left. Planning the same snapshot twice yields the same decisions.

use serde_json::{json, Map, Value};
use tracing::debug;

use super::expression::Evaluator;
use super::pipeline::{OutputMerge, PipelineDefinition, StepDefinition};
use crate::adapters::Resolver;
use crate::domain::{
    CollectionKind, ForEachItem, PipelineExecution, PipelineStatus, StepError, StepLoop,
    DEFAULT_FOR_EACH_KEY,
};

/// One planning decision
#[derive(Debug, Clone, PartialEq)]
pub enum PlanAction {
    /// Fix the `for_each` collection of a step
    ResolveForEach {
        step: String,
        collection: CollectionKind,
        items: Vec<ForEachItem>,
    },

    /// The step's `if` is false at this key
    Skip { step: String, for_each_key: String },

    /// Queue an attempt
    Queue(QueuedStep),

    /// Every step is done; close the pipeline with its outputs
    Finish { output: Map<String, Value> },

    /// Close the pipeline as failed with these extra errors
    Fail { errors: Vec<StepError> },
}

/// A step attempt ready to be queued
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedStep {
    pub step: String,
    pub for_each_key: String,
    pub input: Value,
    /// Input could not be resolved; the attempt fails without running
    pub input_error: Option<StepError>,
    pub loop_index: u32,
}

/// Planner over one pipeline definition
pub struct Planner<'a> {
    definition: &'a PipelineDefinition,
    evaluator: &'a Evaluator,
    resolver: &'a dyn Resolver,
}

impl<'a> Planner<'a> {
    pub fn new(
        definition: &'a PipelineDefinition,
        evaluator: &'a Evaluator,
        resolver: &'a dyn Resolver,
    ) -> Self {
        Self {
            definition,
            evaluator,
            resolver,
        }
    }

    /// Compute the next actions for `pexec`
    pub fn plan(&self, pexec: &PipelineExecution) -> Vec<PlanAction> {
        if pexec.is_terminal()
            || matches!(pexec.status, PipelineStatus::Queued | PipelineStatus::Paused)
        {
            return Vec::new();
        }

        // An unabsorbed failure stops all new work
        if pexec.has_failures() {
            if pexec.has_in_flight_steps() {
                return Vec::new();
            }
            return vec![PlanAction::Fail { errors: Vec::new() }];
        }

        let outputs = self.step_outputs(pexec);
        let mut actions = Vec::new();

        for step in &self.definition.steps {
            let name = step.full_name();

            if pexec.is_step_resolved(&name) {
                self.plan_entries(pexec, step, &outputs, &mut actions);
                continue;
            }

            let ready = step
                .dependencies()
                .iter()
                .all(|dep| pexec.is_step_terminal(dep));
            if !ready {
                continue;
            }

            match &step.for_each {
                Some(expression) => match self.resolve_for_each(pexec, step, expression, &outputs) {
                    Ok((collection, items)) => actions.push(PlanAction::ResolveForEach {
                        step: name,
                        collection,
                        items,
                    }),
                    Err(error) => return vec![PlanAction::Fail { errors: vec![error] }],
                },
                None => actions.push(self.plan_first_attempt(
                    pexec,
                    step,
                    DEFAULT_FOR_EACH_KEY,
                    None,
                    &outputs,
                )),
            }
        }

        if !actions.is_empty() {
            return actions;
        }

        let all_terminal = self
            .definition
            .steps
            .iter()
            .all(|s| pexec.is_step_terminal(&s.full_name()));
        if all_terminal {
            return vec![self.finish(pexec, &outputs)];
        }

        if !pexec.has_in_flight_steps() {
            return vec![PlanAction::Fail {
                errors: vec![StepError::internal("no runnable steps remain")
                    .for_step(&self.definition.name, pexec.id, None)],
            }];
        }

        Vec::new()
    }

    /// Actions for a step whose entries already exist
    fn plan_entries(
        &self,
        pexec: &PipelineExecution,
        step: &StepDefinition,
        outputs: &Value,
        actions: &mut Vec<PlanAction>,
    ) {
        let name = step.full_name();
        let Some(entries) = pexec.entries(&name) else {
            return;
        };

        for (key, entry) in entries {
            if entry.skipped || entry.is_in_flight() {
                continue;
            }
            let item = for_each_item(pexec, &name, key);

            if entry.step_executions.is_empty() {
                actions.push(self.plan_first_attempt(pexec, step, key, item, outputs));
            } else if entry.loop_pending() {
                let Some(last) = entry.last() else {
                    continue;
                };
                let index = last.step_loop.as_ref().map(|l| l.index).unwrap_or(0);
                debug!(step = %name, key = %key, index, "Queueing next loop iteration");
                actions.push(PlanAction::Queue(self.queued(
                    pexec,
                    step,
                    key,
                    item,
                    index,
                    last.output.as_ref(),
                    outputs,
                )));
            }
        }
    }

    /// Evaluate `if` and either skip or queue loop iteration 0
    fn plan_first_attempt(
        &self,
        pexec: &PipelineExecution,
        step: &StepDefinition,
        key: &str,
        item: Option<&ForEachItem>,
        outputs: &Value,
    ) -> PlanAction {
        if let Some(condition) = &step.condition {
            let decision = self
                .scope(pexec, step, item, 0, None, outputs)
                .and_then(|ctx| {
                    self.evaluator
                        .eval_bool(condition, &ctx)
                        .map_err(|e| self.input_error(pexec, step, e))
                });

            match decision {
                Ok(false) => {
                    return PlanAction::Skip {
                        step: step.full_name(),
                        for_each_key: key.to_string(),
                    }
                }
                Ok(true) => {}
                Err(error) => {
                    return PlanAction::Queue(QueuedStep {
                        step: step.full_name(),
                        for_each_key: key.to_string(),
                        input: Value::Null,
                        input_error: Some(error),
                        loop_index: 0,
                    })
                }
            }
        }

        PlanAction::Queue(self.queued(pexec, step, key, item, 0, None, outputs))
    }

    /// Resolve the input of one attempt
    #[allow(clippy::too_many_arguments)]
    fn queued(
        &self,
        pexec: &PipelineExecution,
        step: &StepDefinition,
        key: &str,
        item: Option<&ForEachItem>,
        loop_index: u32,
        previous: Option<&Value>,
        outputs: &Value,
    ) -> QueuedStep {
        let template = Value::Object(input_template(step, loop_index));
        let rendered = self
            .scope(pexec, step, item, loop_index, previous, outputs)
            .and_then(|ctx| {
                self.evaluator
                    .render_value(&template, &ctx)
                    .map_err(|e| self.input_error(pexec, step, e))
            });

        let (input, input_error) = match rendered {
            Ok(input) => (input, None),
            Err(error) => (Value::Null, Some(error)),
        };

        QueuedStep {
            step: step.full_name(),
            for_each_key: key.to_string(),
            input,
            input_error,
            loop_index,
        }
    }

    fn input_error(
        &self,
        pexec: &PipelineExecution,
        step: &StepDefinition,
        error: impl std::fmt::Display,
    ) -> StepError {
        StepError::input_resolution(error.to_string()).for_step(&step.full_name(), pexec.id, None)
    }

    fn resolve_for_each(
        &self,
        pexec: &PipelineExecution,
        step: &StepDefinition,
        expression: &str,
        outputs: &Value,
    ) -> Result<(CollectionKind, Vec<ForEachItem>), StepError> {
        let internal = |message: String| {
            StepError::internal(message).for_step(&step.full_name(), pexec.id, None)
        };

        let ctx = self.scope(pexec, step, None, 0, None, outputs)?;
        let value = self
            .evaluator
            .eval_value(expression, &ctx)
            .map_err(|e| internal(e.to_string()))?;

        match value {
            Value::Array(values) => Ok((
                CollectionKind::List,
                values
                    .into_iter()
                    .enumerate()
                    .map(|(i, value)| ForEachItem {
                        key: i.to_string(),
                        value,
                    })
                    .collect(),
            )),
            Value::Object(map) => Ok((
                CollectionKind::Map,
                map.into_iter()
                    .map(|(key, value)| ForEachItem { key, value })
                    .collect(),
            )),
            other => Err(internal(format!(
                "for_each `{}` must evaluate to a list or map, got {}",
                expression, other
            ))),
        }
    }

    /// Evaluate declared outputs and close the pipeline
    fn finish(&self, pexec: &PipelineExecution, outputs: &Value) -> PlanAction {
        let ctx = json!({ "param": pexec.args, "step": outputs });
        let mut output = Map::new();

        for declared in &self.definition.outputs {
            let value = if declared.value.contains("{{") {
                self.evaluator.render(&declared.value, &ctx)
            } else {
                self.evaluator.eval_value(&declared.value, &ctx)
            };

            let value = match value {
                Ok(value) => value,
                Err(e) => {
                    return PlanAction::Fail {
                        errors: vec![StepError::internal(format!(
                            "output '{}': {}",
                            declared.name, e
                        ))
                        .for_step(&self.definition.name, pexec.id, None)],
                    }
                }
            };

            if output.contains_key(&declared.name)
                && self.definition.output_merge == OutputMerge::Error
            {
                return PlanAction::Fail {
                    errors: vec![StepError::internal(format!(
                        "output '{}' is defined more than once",
                        declared.name
                    ))
                    .for_step(&self.definition.name, pexec.id, None)],
                };
            }
            output.insert(declared.name.clone(), value);
        }

        PlanAction::Finish { output }
    }

    /// Evaluate a loop's `until` after a successful attempt.
    ///
    /// `None` when the step has no loop. Otherwise the index is advanced
    /// unless the condition holds, in which case it is kept as is.
    pub fn loop_state(
        &self,
        pexec: &PipelineExecution,
        step: &StepDefinition,
        for_each_key: &str,
        loop_index: u32,
        output: &Value,
    ) -> Result<Option<StepLoop>, StepError> {
        let Some(loop_config) = &step.loop_config else {
            return Ok(None);
        };

        let ctx = self.step_scope(pexec, step, for_each_key, loop_index, Some(output))?;
        let completed = self
            .evaluator
            .eval_bool(&loop_config.until, &ctx)
            .map_err(|e| StepError::internal(e.to_string()).for_step(&step.full_name(), pexec.id, None))?;

        Ok(Some(if completed {
            StepLoop {
                index: loop_index,
                loop_completed: true,
            }
        } else {
            StepLoop {
                index: loop_index + 1,
                loop_completed: false,
            }
        }))
    }

    /// Expression context for one attempt of a step
    pub fn step_scope(
        &self,
        pexec: &PipelineExecution,
        step: &StepDefinition,
        for_each_key: &str,
        loop_index: u32,
        result: Option<&Value>,
    ) -> Result<Value, StepError> {
        let outputs = self.step_outputs(pexec);
        let item = for_each_item(pexec, &step.full_name(), for_each_key);
        self.scope(pexec, step, item, loop_index, result, &outputs)
    }

    fn scope(
        &self,
        pexec: &PipelineExecution,
        step: &StepDefinition,
        item: Option<&ForEachItem>,
        loop_index: u32,
        result: Option<&Value>,
        outputs: &Value,
    ) -> Result<Value, StepError> {
        let mut ctx = Map::new();
        ctx.insert("param".to_string(), Value::Object(pexec.args.clone()));
        ctx.insert("step".to_string(), outputs.clone());
        ctx.insert("loop".to_string(), json!({ "index": loop_index }));
        if let Some(item) = item {
            ctx.insert(
                "each".to_string(),
                json!({ "key": item.key, "value": item.value }),
            );
        }
        if let Some(result) = result {
            ctx.insert("result".to_string(), result.clone());
        }

        for reference in step.resource_references() {
            let value = self
                .resolver
                .resolve(&reference)
                .map_err(|e| self.input_error(pexec, step, e))?;
            insert_path(&mut ctx, &reference, value);
        }

        Ok(Value::Object(ctx))
    }

    /// `{type: {name: output}}` for every expanded step.
    ///
    /// A `for_each` step exposes a list (or map) of its entries' outputs.
    pub fn step_outputs(&self, pexec: &PipelineExecution) -> Value {
        let mut by_type = Map::new();

        for step in &self.definition.steps {
            let name = step.full_name();
            let Some(entries) = pexec.entries(&name) else {
                if let Some(plan) = pexec.for_each.get(&name) {
                    // Empty collection
                    let empty = match plan.collection {
                        CollectionKind::List => Value::Array(Vec::new()),
                        CollectionKind::Map => Value::Object(Map::new()),
                    };
                    insert_output(&mut by_type, step, empty);
                }
                continue;
            };

            let output = match pexec.for_each.get(&name) {
                Some(plan) => match plan.collection {
                    CollectionKind::List => Value::Array(
                        plan.items
                            .iter()
                            .map(|i| entries.get(&i.key).map(|e| e.output()).unwrap_or_default())
                            .collect(),
                    ),
                    CollectionKind::Map => Value::Object(
                        plan.items
                            .iter()
                            .map(|i| {
                                let output = entries.get(&i.key).map(|e| e.output()).unwrap_or_default();
                                (i.key.clone(), output)
                            })
                            .collect(),
                    ),
                },
                None => entries
                    .get(DEFAULT_FOR_EACH_KEY)
                    .map(|e| e.output())
                    .unwrap_or_default(),
            };
            insert_output(&mut by_type, step, output);
        }

        Value::Object(by_type)
    }
}

fn insert_output(by_type: &mut Map<String, Value>, step: &StepDefinition, output: Value) {
    if let Value::Object(names) = by_type
        .entry(step.step_type.clone())
        .or_insert_with(|| Value::Object(Map::new()))
    {
        names.insert(step.name.clone(), output);
    }
}

fn for_each_item<'p>(
    pexec: &'p PipelineExecution,
    step_name: &str,
    key: &str,
) -> Option<&'p ForEachItem> {
    pexec
        .for_each
        .get(step_name)
        .and_then(|plan| plan.items.iter().find(|i| i.key == key))
}

/// Input templates for an attempt; loop overrides apply after iteration 0
fn input_template(step: &StepDefinition, loop_index: u32) -> Map<String, Value> {
    let mut template = if step.is_pipeline_step() {
        step.args.clone()
    } else {
        step.input.clone()
    };

    if loop_index > 0 {
        if let Some(loop_config) = &step.loop_config {
            for (key, value) in &loop_config.input {
                template.insert(key.clone(), value.clone());
            }
        }
    }

    template
}

/// Set `root.a.b` inside a context map
fn insert_path(ctx: &mut Map<String, Value>, reference: &str, value: Value) {
    let mut segments: Vec<&str> = reference.split('.').collect();
    let Some(last) = segments.pop() else {
        return;
    };

    let mut node = ctx;
    for segment in segments {
        let child = node
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        node = match child {
            Value::Object(map) => map,
            _ => return,
        };
    }
    node.insert(last.to_string(), value);
}
