//! Pipeline definitions and loading.
//!
//! Pipelines are declared in YAML (or built in code) and consist of steps
//! with explicit and inferred dependencies, optional `for_each` fan-out,
//! `loop` re-execution, an `if` guard and an error policy.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::error::EngineError;
use super::expression::{references, template_strings};
use crate::adapters::Resolver;

/// Step type that invokes another pipeline
pub const PIPELINE_STEP_TYPE: &str = "pipeline";

/// A complete pipeline definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDefinition {
    /// Pipeline name (used by `enqueue` and nested pipeline steps)
    pub name: String,

    /// Human-readable description
    #[serde(default)]
    pub description: Option<String>,

    /// Declared input parameters
    #[serde(default)]
    pub params: Vec<ParamDefinition>,

    /// Steps; order only breaks ties, dependencies decide scheduling
    pub steps: Vec<StepDefinition>,

    /// Values evaluated against step outputs once every step is done
    #[serde(default)]
    pub outputs: Vec<OutputDefinition>,

    /// What to do when two outputs share a name
    #[serde(default)]
    pub output_merge: OutputMerge,
}

impl PipelineDefinition {
    /// Load a pipeline from a YAML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pipeline file: {}", path.display()))?;

        Self::from_yaml(&content)
            .with_context(|| format!("Failed to load pipeline file: {}", path.display()))
    }

    /// Parse a pipeline from YAML content
    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse pipeline YAML")
    }

    /// Validate the pipeline definition
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.name.is_empty() {
            return Err(EngineError::InvalidDefinition(
                "pipeline name cannot be empty".to_string(),
            ));
        }

        let mut seen = BTreeSet::new();
        for (i, step) in self.steps.iter().enumerate() {
            if step.name.is_empty() || step.step_type.is_empty() {
                return Err(EngineError::InvalidDefinition(format!(
                    "step {} in '{}' needs both a type and a name",
                    i, self.name
                )));
            }
            if !seen.insert(step.full_name()) {
                return Err(EngineError::InvalidDefinition(format!(
                    "duplicate step '{}' in '{}'",
                    step.full_name(),
                    self.name
                )));
            }
            if step.is_pipeline_step() && step.pipeline.is_none() {
                return Err(EngineError::InvalidDefinition(format!(
                    "pipeline step '{}' does not name a pipeline",
                    step.full_name()
                )));
            }
            if let Some(retries) = &step.error.retries {
                if retries.max_attempts == 0 {
                    return Err(EngineError::InvalidDefinition(format!(
                        "step '{}' has retries.max_attempts = 0",
                        step.full_name()
                    )));
                }
            }
        }

        let mut params = BTreeSet::new();
        for param in &self.params {
            if !params.insert(param.name.as_str()) {
                return Err(EngineError::InvalidDefinition(format!(
                    "duplicate param '{}' in '{}'",
                    param.name, self.name
                )));
            }
        }

        DependencyGraph::build(self)?.check_cycles()
    }

    /// Get a step by full name (`type.name`)
    pub fn get_step(&self, full_name: &str) -> Option<&StepDefinition> {
        self.steps.iter().find(|s| s.full_name() == full_name)
    }

    /// Full names of all steps, in declaration order
    pub fn step_names(&self) -> Vec<String> {
        self.steps.iter().map(|s| s.full_name()).collect()
    }

    /// Validate caller-supplied args against the declared params.
    ///
    /// Applies defaults, rejects unknown/missing/mistyped values, and replaces
    /// resource-typed params with the value the resolver returns.
    pub fn resolve_args(
        &self,
        args: &Map<String, Value>,
        resolver: &dyn Resolver,
    ) -> Result<Map<String, Value>, EngineError> {
        for name in args.keys() {
            if !self.params.iter().any(|p| &p.name == name) {
                return Err(EngineError::InvalidParam {
                    name: name.clone(),
                    reason: format!("unknown parameter for pipeline '{}'", self.name),
                });
            }
        }

        let mut resolved = Map::new();
        for param in &self.params {
            let value = match args.get(&param.name).or(param.default.as_ref()) {
                Some(value) => value.clone(),
                None if param.optional => continue,
                None => {
                    return Err(EngineError::InvalidParam {
                        name: param.name.clone(),
                        reason: "missing required parameter".to_string(),
                    })
                }
            };

            resolved.insert(param.name.clone(), param.check(value, resolver)?);
        }

        Ok(resolved)
    }
}

/// Duplicate output names policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputMerge {
    /// Later outputs override earlier ones
    #[default]
    LastWins,

    /// A clash fails the pipeline
    Error,
}

/// A declared pipeline output
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputDefinition {
    pub name: String,

    /// Expression evaluated against params and step outputs
    pub value: String,
}

/// A declared input parameter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamDefinition {
    pub name: String,

    #[serde(rename = "type", default)]
    pub param_type: ParamType,

    #[serde(default)]
    pub default: Option<Value>,

    #[serde(default)]
    pub optional: bool,

    /// Allowed values
    #[serde(rename = "enum", default, skip_serializing_if = "Vec::is_empty")]
    pub enum_values: Vec<Value>,
}

impl ParamDefinition {
    fn invalid(&self, reason: impl Into<String>) -> EngineError {
        EngineError::InvalidParam {
            name: self.name.clone(),
            reason: reason.into(),
        }
    }

    /// Type-check (and for resource types, resolve) one value
    fn check(&self, value: Value, resolver: &dyn Resolver) -> Result<Value, EngineError> {
        if !self.param_type.accepts(&value) {
            return Err(self.invalid(format!(
                "expected {}, got {}",
                self.param_type,
                json_type_name(&value)
            )));
        }

        if !self.enum_values.is_empty() && !self.enum_values.contains(&value) {
            return Err(self.invalid(format!("{} is not one of the allowed values", value)));
        }

        match &self.param_type {
            ParamType::Connection(kind) => {
                let name = value.as_str().unwrap_or_default();
                resolver
                    .resolve(&format!("connection.{}.{}", kind, name))
                    .map_err(|e| self.invalid(e.to_string()))
            }
            ParamType::Notifier => {
                let name = value.as_str().unwrap_or_default();
                resolver
                    .resolve(&format!("notifier.{}", name))
                    .map_err(|e| self.invalid(e.to_string()))
            }
            _ => Ok(value),
        }
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "map",
    }
}

/// Parameter type
///
/// Written as a string: `string`, `number`, `bool`, `list`, `map`, `any`,
/// `notifier`, or `connection.<kind>`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ParamType {
    String,
    Number,
    Bool,
    List,
    Map,
    #[default]
    Any,
    /// Name of a connection of the given kind
    Connection(String),
    /// Name of a notifier
    Notifier,
}

impl ParamType {
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            Self::String | Self::Connection(_) | Self::Notifier => value.is_string(),
            Self::Number => value.is_number(),
            Self::Bool => value.is_boolean(),
            Self::List => value.is_array(),
            Self::Map => value.is_object(),
            Self::Any => true,
        }
    }
}

impl TryFrom<String> for ParamType {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "string" => Ok(Self::String),
            "number" => Ok(Self::Number),
            "bool" => Ok(Self::Bool),
            "list" => Ok(Self::List),
            "map" => Ok(Self::Map),
            "any" => Ok(Self::Any),
            "notifier" => Ok(Self::Notifier),
            other => match other.strip_prefix("connection.") {
                Some(kind) if !kind.is_empty() => Ok(Self::Connection(kind.to_string())),
                _ => Err(format!("unknown param type '{}'", other)),
            },
        }
    }
}

impl From<ParamType> for String {
    fn from(value: ParamType) -> Self {
        value.to_string()
    }
}

impl std::fmt::Display for ParamType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::String => f.write_str("string"),
            Self::Number => f.write_str("number"),
            Self::Bool => f.write_str("bool"),
            Self::List => f.write_str("list"),
            Self::Map => f.write_str("map"),
            Self::Any => f.write_str("any"),
            Self::Notifier => f.write_str("notifier"),
            Self::Connection(kind) => write!(f, "connection.{}", kind),
        }
    }
}

/// A single step in a pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Step type (dispatched to the step registry, or `pipeline`)
    #[serde(rename = "type")]
    pub step_type: String,

    /// Step name (unique per type within the pipeline)
    pub name: String,

    /// Explicit dependencies, as full names (`transform.a`)
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Collection expression; one entry per element
    #[serde(default)]
    pub for_each: Option<String>,

    #[serde(rename = "loop", default)]
    pub loop_config: Option<LoopConfig>,

    /// Guard expression; false marks the step skipped
    #[serde(rename = "if", default)]
    pub condition: Option<String>,

    /// Input templates
    #[serde(default)]
    pub input: Map<String, Value>,

    /// Nested pipeline name (for `pipeline` steps)
    #[serde(default)]
    pub pipeline: Option<String>,

    /// Nested pipeline args (for `pipeline` steps)
    #[serde(default)]
    pub args: Map<String, Value>,

    #[serde(default)]
    pub error: ErrorConfig,

    /// Passed to the step implementation, which enforces it
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

impl StepDefinition {
    /// Minimal step, mostly useful for building definitions in code
    pub fn new(step_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            step_type: step_type.into(),
            name: name.into(),
            depends_on: Vec::new(),
            for_each: None,
            loop_config: None,
            condition: None,
            input: Map::new(),
            pipeline: None,
            args: Map::new(),
            error: ErrorConfig::default(),
            timeout_seconds: None,
        }
    }

    /// `type.name`, the key used in `step_status` and expressions
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.step_type, self.name)
    }

    pub fn is_pipeline_step(&self) -> bool {
        self.step_type == PIPELINE_STEP_TYPE
    }

    /// Get the effective timeout for this step
    pub fn timeout(&self, default: Duration) -> Duration {
        self.timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or(default)
    }

    /// Every text the planner evaluates before the step runs
    fn planning_texts(&self) -> Vec<&str> {
        let mut texts = Vec::new();
        if let Some(for_each) = &self.for_each {
            texts.push(for_each.as_str());
        }
        if let Some(condition) = &self.condition {
            texts.push(condition.as_str());
        }
        for value in self.input.values().chain(self.args.values()) {
            template_strings(value, &mut texts);
        }
        if let Some(loop_config) = &self.loop_config {
            for value in loop_config.input.values() {
                template_strings(value, &mut texts);
            }
        }
        texts
    }

    /// Explicit dependencies plus those inferred from `step.<type>.<name>`
    /// references in expressions and templates
    pub fn dependencies(&self) -> BTreeSet<String> {
        let own = self.full_name();
        let mut deps: BTreeSet<String> = self.depends_on.iter().cloned().collect();
        for text in self.planning_texts() {
            deps.extend(references(text, "step", 2));
        }
        deps.remove(&own);
        deps
    }

    /// `credential.*`, `connection.*` and `notifier.*` references
    pub fn resource_references(&self) -> Vec<String> {
        let mut refs = Vec::new();
        for text in self.planning_texts() {
            for (root, depth) in [("credential", 2), ("connection", 2), ("notifier", 1)] {
                for r in references(text, root, depth) {
                    let reference = format!("{}.{}", root, r);
                    if !refs.contains(&reference) {
                        refs.push(reference);
                    }
                }
            }
        }
        refs
    }
}

/// Re-execute a step until a condition holds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopConfig {
    /// Evaluated after each successful attempt with `result` and `loop.index`
    pub until: String,

    /// Overrides merged over `input` for iterations after the first
    #[serde(default)]
    pub input: Map<String, Value>,
}

/// Failure handling for a step
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorConfig {
    /// Mark the step finished on failure and keep the error in its output
    #[serde(default)]
    pub ignore: bool,

    /// Gates `ignore`; evaluated with `result`
    #[serde(rename = "if", default)]
    pub condition: Option<String>,

    #[serde(default)]
    pub retries: Option<RetryConfig>,

    /// Evaluated in order; first match fails the pipeline, never retried
    #[serde(default)]
    pub throw: Vec<ThrowConfig>,
}

/// Throw a pipeline-level error when a condition holds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThrowConfig {
    #[serde(rename = "if")]
    pub condition: String,

    /// Template for the pipeline error message
    pub message: String,
}

/// Backoff strategy between attempts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    #[default]
    Constant,
    Linear,
    Exponential,
}

/// Retry policy for failed steps
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of attempts (including first try)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default)]
    pub strategy: BackoffStrategy,

    /// Base delay in milliseconds
    #[serde(default = "default_base_interval")]
    pub base_interval_ms: u64,

    /// Cap on any single delay
    #[serde(default)]
    pub max_interval_ms: Option<u64>,

    /// Only retry failures matching this expression
    #[serde(rename = "if", default)]
    pub condition: Option<String>,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_base_interval() -> u64 {
    1000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            strategy: BackoffStrategy::default(),
            base_interval_ms: default_base_interval(),
            max_interval_ms: None,
            condition: None,
        }
    }
}

impl RetryConfig {
    /// Delay before attempt `attempt` (1-indexed; the first attempt has none)
    pub fn delay_before_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }

        let base = self.base_interval_ms;
        let delay = match self.strategy {
            BackoffStrategy::Constant => base,
            BackoffStrategy::Linear => base.saturating_mul(u64::from(attempt - 1)),
            BackoffStrategy::Exponential => {
                let factor = 1u64.checked_shl(attempt - 2).unwrap_or(u64::MAX);
                base.saturating_mul(factor)
            }
        };

        let capped = match self.max_interval_ms {
            Some(max) => delay.min(max),
            None => delay,
        };
        Duration::from_millis(capped)
    }

    /// Check if another attempt is allowed after `attempt` attempts
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Step dependency graph as an arena of step indices
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    names: Vec<String>,
    /// `deps[i]` are the indices step `i` waits for
    deps: Vec<Vec<usize>>,
}

impl DependencyGraph {
    /// Build the graph; unknown dependencies are an error
    pub fn build(definition: &PipelineDefinition) -> Result<Self, EngineError> {
        let names = definition.step_names();
        let index: HashMap<&str, usize> = names
            .iter()
            .enumerate()
            .map(|(i, n)| (n.as_str(), i))
            .collect();

        let mut deps = Vec::with_capacity(names.len());
        for step in &definition.steps {
            let mut edges = Vec::new();
            for dep in step.dependencies() {
                match index.get(dep.as_str()) {
                    Some(&i) => edges.push(i),
                    None => {
                        return Err(EngineError::UnknownDependency {
                            step: step.full_name(),
                            dependency: dep,
                        })
                    }
                }
            }
            deps.push(edges);
        }

        Ok(Self { names, deps })
    }

    /// Kahn's algorithm; reports the steps left on a cycle
    pub fn check_cycles(&self) -> Result<(), EngineError> {
        let n = self.names.len();
        let mut remaining: Vec<usize> = self.deps.iter().map(|d| d.len()).collect();
        let mut dependents = vec![Vec::new(); n];
        for (i, edges) in self.deps.iter().enumerate() {
            for &d in edges {
                dependents[d].push(i);
            }
        }

        let mut ready: VecDeque<usize> = (0..n).filter(|&i| remaining[i] == 0).collect();
        let mut visited = 0;
        while let Some(i) = ready.pop_front() {
            visited += 1;
            for &j in &dependents[i] {
                remaining[j] -= 1;
                if remaining[j] == 0 {
                    ready.push_back(j);
                }
            }
        }

        if visited == n {
            return Ok(());
        }

        let cyclic = (0..n)
            .filter(|&i| remaining[i] > 0)
            .map(|i| self.names[i].clone())
            .collect();
        Err(EngineError::DependencyCycle(cyclic))
    }

    /// Full names of the steps `step` waits for
    pub fn dependencies_of(&self, step: &str) -> Vec<&str> {
        self.names
            .iter()
            .position(|n| n == step)
            .map(|i| self.deps[i].iter().map(|&d| self.names[d].as_str()).collect())
            .unwrap_or_default()
    }
}
