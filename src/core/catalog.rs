//! Pipeline definition lookup.
//!
//! The catalog is built up front and handed to the engine; the engine only
//! reads from it while executions run.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::debug;

use super::error::EngineError;
use super::pipeline::PipelineDefinition;

/// Validated pipeline definitions keyed by name
#[derive(Debug, Clone, Default)]
pub struct PipelineCatalog {
    pipelines: HashMap<String, Arc<PipelineDefinition>>,
}

impl PipelineCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every `*.yaml` / `*.yml` file in a directory
    pub fn load_dir(dir: &Path) -> Result<Self> {
        let mut catalog = Self::new();
        if !dir.exists() {
            return Ok(catalog);
        }

        let entries = std::fs::read_dir(dir)
            .with_context(|| format!("Failed to read pipelines directory: {}", dir.display()))?;

        for entry in entries {
            let path = entry?.path();
            let is_yaml = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e == "yaml" || e == "yml")
                .unwrap_or(false);
            if !is_yaml {
                continue;
            }

            let definition = PipelineDefinition::from_file(&path)?;
            debug!(pipeline = %definition.name, path = %path.display(), "Loaded pipeline");
            catalog
                .insert(definition)
                .with_context(|| format!("Invalid pipeline: {}", path.display()))?;
        }

        Ok(catalog)
    }

    /// Validate and add a definition, replacing any with the same name
    pub fn insert(&mut self, definition: PipelineDefinition) -> Result<(), EngineError> {
        definition.validate()?;
        self.pipelines
            .insert(definition.name.clone(), Arc::new(definition));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<PipelineDefinition>> {
        self.pipelines.get(name).cloned()
    }

    /// Pipeline names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.pipelines.keys().map(String::as_str).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }
}
