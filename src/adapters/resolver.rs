//! Credential, connection and notifier lookup.
//!
//! References are dotted paths: `credential.<type>.<name>`,
//! `connection.<type>.<name>` and `notifier.<name>`. The engine receives a
//! resolver at construction time and only reads from it.

use std::path::Path;

use anyhow::Context;
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ResolveError {
    #[error("{0} not found")]
    NotFound(String),
}

/// Read-only lookup of named resources
pub trait Resolver: Send + Sync {
    fn resolve(&self, reference: &str) -> Result<Value, ResolveError>;
}

/// Resolver backed by an in-memory tree
///
/// ```yaml
/// credential:
///   github:
///     default: { token: "..." }
/// notifier:
///   admins: { channel: "#ops" }
/// ```
#[derive(Debug, Clone, Default)]
pub struct StaticResolver {
    tree: Map<String, Value>,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a resource tree from a YAML file
    pub fn from_yaml_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read resources file: {}", path.display()))?;
        let tree: Map<String, Value> = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse resources file: {}", path.display()))?;
        Ok(Self { tree })
    }

    /// Set the value at a dotted reference, creating parents as needed
    pub fn insert(&mut self, reference: &str, value: Value) {
        let mut segments: Vec<&str> = reference.split('.').collect();
        let Some(last) = segments.pop() else {
            return;
        };

        let mut node = &mut self.tree;
        for segment in segments {
            let child = node
                .entry(segment.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !child.is_object() {
                *child = Value::Object(Map::new());
            }
            node = match child {
                Value::Object(map) => map,
                _ => return,
            };
        }
        node.insert(last.to_string(), value);
    }
}

impl Resolver for StaticResolver {
    fn resolve(&self, reference: &str) -> Result<Value, ResolveError> {
        let mut segments = reference.split('.');
        let first = segments.next().unwrap_or_default();
        let mut current = self
            .tree
            .get(first)
            .ok_or_else(|| ResolveError::NotFound(reference.to_string()))?;

        for segment in segments {
            current = current
                .get(segment)
                .ok_or_else(|| ResolveError::NotFound(reference.to_string()))?;
        }

        Ok(current.clone())
    }
}
