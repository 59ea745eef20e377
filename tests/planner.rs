//! Planner Integration Tests
//!
//! Drives the planner against aggregates built from facts, without the bus.

use chrono::Utc;
use conduit::adapters::StaticResolver;
use conduit::core::{
    generate_idempotency_key, EngineError, Evaluator, PipelineDefinition, PlanAction, Planner,
};
use conduit::domain::{
    ErrorKind, Event, EventPayload, Execution, PipelineExecution, PipelineStatus, StepError,
};
use serde_json::{json, Map, Value};
use uuid::Uuid;

/// An aggregate plus the facts a planning pass would append
struct Harness {
    execution: Execution,
    pexec_id: Uuid,
    sequence: u64,
}

impl Harness {
    fn new(definition: &PipelineDefinition, args: Value) -> Self {
        let mut harness = Self {
            execution: Execution::new(Uuid::new_v4()),
            pexec_id: Uuid::new_v4(),
            sequence: 0,
        };
        let args = args.as_object().cloned().unwrap_or_default();
        harness.apply(EventPayload::PipelineQueued {
            pipeline_execution_id: harness.pexec_id,
            pipeline_name: definition.name.clone(),
            args,
            parent: None,
        });
        harness.apply(EventPayload::PipelinePlanned {
            pipeline_execution_id: harness.pexec_id,
            steps: definition.step_names(),
        });
        harness.apply(EventPayload::PipelineStarted {
            pipeline_execution_id: harness.pexec_id,
        });
        harness
    }

    fn apply(&mut self, payload: EventPayload) {
        self.sequence += 1;
        let event = Event::new(self.execution.id, payload).with_sequence(self.sequence);
        self.execution.apply(&event);
    }

    fn pexec(&self) -> &PipelineExecution {
        self.execution.pipeline_execution(self.pexec_id).unwrap()
    }

    /// Apply planner actions the way the engine does; returns queued ids
    fn accept(&mut self, actions: Vec<PlanAction>) -> Vec<Uuid> {
        let mut queued = Vec::new();
        for action in actions {
            let payload = match action {
                PlanAction::ResolveForEach {
                    step,
                    collection,
                    items,
                } => EventPayload::StepForEachPlanned {
                    pipeline_execution_id: self.pexec_id,
                    step_name: step,
                    collection,
                    items,
                },
                PlanAction::Skip { step, for_each_key } => EventPayload::StepSkipped {
                    pipeline_execution_id: self.pexec_id,
                    step_name: step,
                    for_each_key,
                },
                PlanAction::Queue(q) => {
                    let id = Uuid::new_v4();
                    queued.push(id);
                    EventPayload::StepQueued {
                        pipeline_execution_id: self.pexec_id,
                        idempotency_key: generate_idempotency_key(
                            self.execution.id,
                            self.pexec_id,
                            &q.step,
                            &q.for_each_key,
                            q.loop_index,
                            1,
                        ),
                        step_name: q.step,
                        for_each_key: q.for_each_key,
                        step_execution_id: id,
                        input: q.input,
                        input_error: q.input_error,
                        loop_index: q.loop_index,
                        retry_count: 0,
                        delay_ms: 0,
                    }
                }
                PlanAction::Finish { output } => EventPayload::PipelineFinished {
                    pipeline_execution_id: self.pexec_id,
                    output,
                },
                PlanAction::Fail { errors } => EventPayload::PipelineFailed {
                    pipeline_execution_id: self.pexec_id,
                    errors,
                },
            };
            self.apply(payload);
        }
        queued
    }

    fn finish(&mut self, step_execution_id: Uuid, output: Value) {
        self.apply(EventPayload::StepFinished {
            pipeline_execution_id: self.pexec_id,
            step_execution_id,
            output,
            end_time: Utc::now(),
            step_loop: None,
        });
    }

    fn fail(&mut self, step_execution_id: Uuid) {
        let error = StepError::new(ErrorKind::Execution, 500, "boom");
        self.apply(EventPayload::StepFailed {
            pipeline_execution_id: self.pexec_id,
            step_execution_id,
            output: error.as_output(),
            error,
            end_time: Utc::now(),
            retrying: false,
        });
    }
}

fn definition(yaml: &str) -> PipelineDefinition {
    let definition = PipelineDefinition::from_yaml(yaml).unwrap();
    definition.validate().unwrap();
    definition
}

const FAN_OUT: &str = r#"
name: fan_out
steps:
  - type: transform
    name: a
    for_each: '["x", "y", "z"]'
    input:
      value: "{{ each.value }}"
  - type: transform
    name: b
    depends_on: [transform.a]
    input:
      value: "{{ step.transform.a[1].value }}"
outputs:
  - name: middle
    value: step.transform.b.value
"#;

#[test]
fn test_fan_out_resolves_once_and_queues_each_key() {
    let definition = definition(FAN_OUT);
    let evaluator = Evaluator::new();
    let resolver = StaticResolver::new();
    let planner = Planner::new(&definition, &evaluator, &resolver);
    let mut harness = Harness::new(&definition, json!({}));

    let actions = planner.plan(harness.pexec());
    assert_eq!(actions.len(), 1);
    assert!(matches!(&actions[0], PlanAction::ResolveForEach { items, .. } if items.len() == 3));
    harness.accept(actions);

    // the same snapshot always gives the same decisions
    let first = planner.plan(harness.pexec());
    let second = planner.plan(harness.pexec());
    assert_eq!(first.len(), 3);
    assert_eq!(first, second);

    let queued = harness.accept(first);
    assert!(planner.plan(harness.pexec()).is_empty());

    // a late, different collection does not change cardinality
    harness.apply(EventPayload::StepForEachPlanned {
        pipeline_execution_id: harness.pexec_id,
        step_name: "transform.a".to_string(),
        collection: conduit::domain::CollectionKind::List,
        items: Vec::new(),
    });
    assert_eq!(harness.pexec().entries("transform.a").unwrap().len(), 3);

    // completion order does not matter
    for (id, value) in queued.iter().rev().zip(["z", "y", "x"]) {
        harness.finish(*id, json!({ "value": value }));
    }

    let actions = planner.plan(harness.pexec());
    assert_eq!(actions.len(), 1);
    match &actions[0] {
        PlanAction::Queue(q) => {
            assert_eq!(q.step, "transform.b");
            assert_eq!(q.input, json!({"value": "y"}));
        }
        other => panic!("expected queue, got {:?}", other),
    }
    let queued_b = harness.accept(actions);
    harness.finish(queued_b[0], json!({"value": "y"}));

    let actions = planner.plan(harness.pexec());
    assert_eq!(
        actions,
        vec![PlanAction::Finish {
            output: json!({"middle": "y"}).as_object().unwrap().clone()
        }]
    );
    harness.accept(actions);
    assert_eq!(harness.pexec().status, PipelineStatus::Finished);
    assert!(harness.pexec().is_complete());
}

#[test]
fn test_failure_blocks_downstream() {
    let yaml = r#"
name: chain
steps:
  - type: transform
    name: a
    input:
      value: 1
  - type: transform
    name: side
    input:
      value: 2
  - type: transform
    name: b
    depends_on: [transform.a]
    input:
      value: 3
"#;
    let definition = definition(yaml);
    let evaluator = Evaluator::new();
    let resolver = StaticResolver::new();
    let planner = Planner::new(&definition, &evaluator, &resolver);
    let mut harness = Harness::new(&definition, json!({}));

    let queued = harness.accept(planner.plan(harness.pexec()));
    assert_eq!(queued.len(), 2);

    harness.fail(queued[0]);
    // the sibling is still running, so the pipeline waits
    assert!(planner.plan(harness.pexec()).is_empty());

    harness.finish(queued[1], json!({"value": 2}));
    let actions = planner.plan(harness.pexec());
    assert_eq!(actions, vec![PlanAction::Fail { errors: Vec::new() }]);
    harness.accept(actions);

    let pexec = harness.pexec();
    assert_eq!(pexec.status, PipelineStatus::Failed);
    assert!(pexec.entries("transform.b").is_none());
    assert!(!pexec.is_complete());
    assert_eq!(pexec.errors.len(), 1);
}

#[test]
fn test_for_each_over_scalar_fails_pipeline() {
    let yaml = r#"
name: scalar
steps:
  - type: transform
    name: a
    for_each: "42"
    input:
      value: 1
"#;
    let definition = definition(yaml);
    let evaluator = Evaluator::new();
    let resolver = StaticResolver::new();
    let planner = Planner::new(&definition, &evaluator, &resolver);
    let harness = Harness::new(&definition, json!({}));

    match planner.plan(harness.pexec()).as_slice() {
        [PlanAction::Fail { errors }] => {
            assert_eq!(errors.len(), 1);
            assert_eq!(errors[0].kind, ErrorKind::Internal);
            assert_eq!(errors[0].step.as_deref(), Some("transform.a"));
        }
        other => panic!("expected failure, got {:?}", other),
    }
}

#[test]
fn test_nothing_planned_while_paused() {
    let definition = definition(FAN_OUT);
    let evaluator = Evaluator::new();
    let resolver = StaticResolver::new();
    let planner = Planner::new(&definition, &evaluator, &resolver);
    let mut harness = Harness::new(&definition, json!({}));

    harness.apply(EventPayload::PipelinePaused {
        pipeline_execution_id: harness.pexec_id,
    });
    assert!(planner.plan(harness.pexec()).is_empty());

    harness.apply(EventPayload::PipelineResumed {
        pipeline_execution_id: harness.pexec_id,
    });
    assert_eq!(planner.plan(harness.pexec()).len(), 1);
}

#[test]
fn test_resource_references_resolve_into_input() {
    let yaml = r#"
name: uses_token
steps:
  - type: transform
    name: auth
    input:
      value: "Bearer {{ credential.github.default.token }}"
"#;
    let definition = definition(yaml);
    let evaluator = Evaluator::new();

    let mut resolver = StaticResolver::new();
    resolver.insert("credential.github.default", json!({"token": "t0k"}));
    let planner = Planner::new(&definition, &evaluator, &resolver);
    let harness = Harness::new(&definition, json!({}));

    match planner.plan(harness.pexec()).as_slice() {
        [PlanAction::Queue(q)] => {
            assert!(q.input_error.is_none());
            assert_eq!(q.input, json!({"value": "Bearer t0k"}));
        }
        other => panic!("expected queue, got {:?}", other),
    }

    // unknown resource: the attempt is queued with an input error
    let empty = StaticResolver::new();
    let planner = Planner::new(&definition, &evaluator, &empty);
    match planner.plan(harness.pexec()).as_slice() {
        [PlanAction::Queue(q)] => {
            let error = q.input_error.as_ref().unwrap();
            assert_eq!(error.kind, ErrorKind::InputResolution);
            assert_eq!(q.input, Value::Null);
        }
        other => panic!("expected queue, got {:?}", other),
    }
}

#[test]
fn test_params_flow_into_input_and_condition() {
    let yaml = r#"
name: params
params:
  - name: greeting
    type: string
    default: hi
  - name: loud
    type: bool
    default: false
steps:
  - type: transform
    name: say
    input:
      value: "{{ param.greeting }} there"
  - type: transform
    name: shout
    if: param.loud
    input:
      value: "{{ param.greeting | upper }}"
"#;
    let definition = definition(yaml);
    let evaluator = Evaluator::new();
    let resolver = StaticResolver::new();
    let planner = Planner::new(&definition, &evaluator, &resolver);

    let args = definition.resolve_args(&Map::new(), &resolver).unwrap();
    let harness = Harness::new(&definition, Value::Object(args));

    let actions = planner.plan(harness.pexec());
    assert_eq!(actions.len(), 2);
    assert!(matches!(&actions[0], PlanAction::Queue(q) if q.input == json!({"value": "hi there"})));
    assert!(matches!(&actions[1], PlanAction::Skip { step, .. } if step == "transform.shout"));
}

#[test]
fn test_definition_rejects_cycles_and_unknown_steps() {
    let cyclic = r#"
name: cyclic
steps:
  - type: transform
    name: a
    depends_on: [transform.b]
    input:
      value: 1
  - type: transform
    name: b
    input:
      value: "{{ step.transform.a.value }}"
"#;
    let definition = PipelineDefinition::from_yaml(cyclic).unwrap();
    assert!(matches!(
        definition.validate(),
        Err(EngineError::DependencyCycle(_))
    ));

    let dangling = r#"
name: dangling
steps:
  - type: transform
    name: a
    depends_on: [transform.ghost]
    input:
      value: 1
"#;
    let definition = PipelineDefinition::from_yaml(dangling).unwrap();
    assert!(matches!(
        definition.validate(),
        Err(EngineError::UnknownDependency { .. })
    ));
}
