//! Expression and template evaluation using minijinja.
//!
//! Step definitions carry two kinds of dynamic text:
//! - Expressions (`if`, `for_each`, `loop.until`, `throw.if`, outputs), written
//!   bare (`step.transform.a.value > 2`) or wrapped in `{{ }}`
//! - Templates (string leaves of `input`/`args`), rendered with `{{ }}` blocks
//!
//! Undefined references are errors, so a template that points at a missing
//! attribute of a prior output fails input resolution instead of rendering
//! an empty string.

use minijinja::{Environment, UndefinedBehavior, Value};
use serde_json::Value as Json;
use thiserror::Error;

/// Failure to compile or evaluate an expression
#[derive(Debug, Clone, Error)]
#[error("Failed to evaluate `{expression}`: {message}")]
pub struct ExpressionError {
    pub expression: String,
    pub message: String,
}

impl ExpressionError {
    fn new(expression: &str, error: impl std::fmt::Display) -> Self {
        Self {
            expression: expression.to_string(),
            message: error.to_string(),
        }
    }
}

/// Evaluator with the engine's helper functions registered
pub struct Evaluator {
    env: Environment<'static>,
}

impl Default for Evaluator {
    fn default() -> Self {
        Self::new()
    }
}

impl Evaluator {
    /// Create an evaluator with strict undefined handling
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);

        env.add_function("is_error", is_error);
        env.add_function("error_message", error_message);

        Self { env }
    }

    /// Evaluate an expression to a JSON value
    pub fn eval_value(&self, expression: &str, context: &Json) -> Result<Json, ExpressionError> {
        let source = strip_braces(expression);
        let compiled = self
            .env
            .compile_expression(source)
            .map_err(|e| ExpressionError::new(expression, e))?;
        let value = compiled
            .eval(context)
            .map_err(|e| ExpressionError::new(expression, e))?;

        to_json(expression, &value)
    }

    /// Evaluate an expression for truthiness
    pub fn eval_bool(&self, expression: &str, context: &Json) -> Result<bool, ExpressionError> {
        let source = strip_braces(expression);
        let compiled = self
            .env
            .compile_expression(source)
            .map_err(|e| ExpressionError::new(expression, e))?;
        let value = compiled
            .eval(context)
            .map_err(|e| ExpressionError::new(expression, e))?;

        // Strict mode only rejects undefined values used in an operation
        if value.is_undefined() {
            return Err(ExpressionError::new(expression, "expression is undefined"));
        }
        Ok(value.is_true())
    }

    /// Render one template string.
    ///
    /// A string that is exactly one `{{ expr }}` block keeps the expression's
    /// type (lists stay lists); anything else renders to a string.
    pub fn render(&self, template: &str, context: &Json) -> Result<Json, ExpressionError> {
        if !contains_template_syntax(template) {
            return Ok(Json::String(template.to_string()));
        }

        if is_single_expression(template) {
            return self.eval_value(template, context);
        }

        self.env
            .render_str(template, context)
            .map(Json::String)
            .map_err(|e| ExpressionError::new(template, e))
    }

    /// Render a nested structure (object or array) recursively
    pub fn render_value(&self, value: &Json, context: &Json) -> Result<Json, ExpressionError> {
        match value {
            Json::String(s) => self.render(s, context),
            Json::Object(map) => {
                let mut result = serde_json::Map::new();
                for (k, v) in map {
                    result.insert(k.clone(), self.render_value(v, context)?);
                }
                Ok(Json::Object(result))
            }
            Json::Array(items) => {
                let rendered: Result<Vec<_>, _> = items
                    .iter()
                    .map(|v| self.render_value(v, context))
                    .collect();
                Ok(Json::Array(rendered?))
            }
            _ => Ok(value.clone()),
        }
    }
}

fn to_json(expression: &str, value: &Value) -> Result<Json, ExpressionError> {
    if value.is_undefined() {
        return Err(ExpressionError::new(expression, "expression is undefined"));
    }
    serde_json::to_value(value).map_err(|e| ExpressionError::new(expression, e))
}

/// `errors` array of a step output, if any
fn errors_of(value: &Value) -> Vec<Json> {
    serde_json::to_value(value)
        .ok()
        .and_then(|json| json.get("errors").and_then(|e| e.as_array().cloned()))
        .unwrap_or_default()
}

/// `is_error(step.http.x)`: the output carries at least one error
fn is_error(value: Value) -> bool {
    !errors_of(&value).is_empty()
}

/// `error_message(step.http.x)`: message of the first error, or ""
fn error_message(value: Value) -> String {
    errors_of(&value)
        .first()
        .and_then(|e| e.get("message"))
        .and_then(|m| m.as_str())
        .unwrap_or_default()
        .to_string()
}

/// Check if a string contains template syntax
fn contains_template_syntax(s: &str) -> bool {
    (s.contains("{{") && s.contains("}}")) || (s.contains("{%") && s.contains("%}"))
}

fn is_single_expression(s: &str) -> bool {
    let trimmed = s.trim();
    trimmed.starts_with("{{")
        && trimmed.ends_with("}}")
        && trimmed.matches("{{").count() == 1
        && trimmed.matches("}}").count() == 1
}

fn strip_braces(expression: &str) -> &str {
    let trimmed = expression.trim();
    if is_single_expression(trimmed) {
        trimmed[2..trimmed.len() - 2].trim()
    } else {
        trimmed
    }
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Find `root.a.b` style references in `text`, returning the `depth`
/// segments after `root` joined with dots, deduplicated in order.
///
/// `references("{{ step.transform.a.value }}", "step", 2)` yields
/// `["transform.a"]`.
pub fn references(text: &str, root: &str, depth: usize) -> Vec<String> {
    let prefix = format!("{}.", root);
    let bytes = text.as_bytes();
    let mut found: Vec<String> = Vec::new();
    let mut start = 0;

    while let Some(pos) = text[start..].find(&prefix) {
        let at = start + pos;
        start = at + prefix.len();

        if at > 0 {
            let prev = bytes[at - 1] as char;
            if is_ident_char(prev) || prev == '.' {
                continue;
            }
        }

        let mut segments = Vec::with_capacity(depth);
        let mut rest = &text[at + prefix.len()..];
        for i in 0..depth {
            let len = rest.find(|c: char| !is_ident_char(c)).unwrap_or(rest.len());
            if len == 0 {
                break;
            }
            segments.push(&rest[..len]);
            rest = &rest[len..];
            if i + 1 < depth {
                match rest.strip_prefix('.') {
                    Some(r) => rest = r,
                    None => break,
                }
            }
        }

        if segments.len() == depth {
            let reference = segments.join(".");
            if !found.contains(&reference) {
                found.push(reference);
            }
        }
    }

    found
}

/// Collect every string leaf of a JSON value
pub fn template_strings<'a>(value: &'a Json, out: &mut Vec<&'a str>) {
    match value {
        Json::String(s) => out.push(s),
        Json::Array(items) => items.iter().for_each(|v| template_strings(v, out)),
        Json::Object(map) => map.values().for_each(|v| template_strings(v, out)),
        _ => {}
    }
}
