//! Command-line interface for conduit.
//!
//! Provides commands for running pipelines, checking status, listing
//! executions, canceling and validating definitions. The engine runs
//! in-process, so `run` drives the execution to a terminal state before
//! returning.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::adapters::StaticResolver;
use crate::config::{self, ResolvedConfig};
use crate::core::{Engine, ExecutionIndex, PipelineCatalog};
use crate::domain::{Execution, PipelineExecution, PipelineStatus};

/// conduit - Event-sourced workflow engine
#[derive(Parser, Debug)]
#[command(name = "conduit")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a pipeline to completion
    Run {
        /// Pipeline name (as declared in the pipelines directory)
        pipeline_name: String,

        /// Pipeline argument as key=value (value parsed as JSON when possible)
        #[arg(short, long = "arg", value_parser = parse_arg)]
        args: Vec<(String, Value)>,

        /// Print the full pipeline output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the status of an execution
    Status {
        /// Execution ID (UUID)
        execution_id: String,
    },

    /// List recent executions
    List {
        /// Maximum number of executions to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Cancel a pipeline execution and its nested pipelines
    Cancel {
        execution_id: String,
        pipeline_execution_id: String,

        #[arg(short, long)]
        reason: Option<String>,
    },

    /// Check a pipeline definition without running it
    Validate {
        pipeline_name: String,
    },

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Run {
                pipeline_name,
                args,
                json,
            } => run_pipeline(&pipeline_name, args, json).await,
            Commands::Status { execution_id } => show_status(&execution_id).await,
            Commands::List { limit } => list_executions(limit).await,
            Commands::Cancel {
                execution_id,
                pipeline_execution_id,
                reason,
            } => cancel(&execution_id, &pipeline_execution_id, reason).await,
            Commands::Validate { pipeline_name } => validate(&pipeline_name),
            Commands::Config => show_config(),
        }
    }
}

fn parse_arg(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", raw))?;
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

fn parse_id(raw: &str, what: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).with_context(|| format!("Invalid {}: {}", what, raw))
}

fn load_catalog(cfg: &ResolvedConfig) -> Result<PipelineCatalog> {
    PipelineCatalog::load_dir(&cfg.pipelines)
        .with_context(|| format!("Failed to load pipelines from {}", cfg.pipelines.display()))
}

/// Build an engine over the configured state directory
async fn open_engine() -> Result<Engine> {
    let cfg = config::config()?;
    let catalog = load_catalog(cfg)?;
    let resolver = match &cfg.resources {
        Some(path) => StaticResolver::from_yaml_file(path)?,
        None => StaticResolver::new(),
    };

    std::fs::create_dir_all(&cfg.home)
        .with_context(|| format!("Failed to create {}", cfg.home.display()))?;
    let index = ExecutionIndex::open(&cfg.index_path())?;

    let engine = Engine::builder(cfg.executions_dir())
        .catalog(catalog)
        .resolver(resolver)
        .index(index)
        .settings(cfg.engine.clone())
        .start()
        .await?;
    Ok(engine)
}

/// Run a pipeline and wait for it
async fn run_pipeline(pipeline_name: &str, args: Vec<(String, Value)>, json: bool) -> Result<()> {
    let engine = open_engine().await?;
    let args: Map<String, Value> = args.into_iter().collect();

    let (execution_id, pipeline_execution_id) = engine.enqueue(pipeline_name, args).await?;
    eprintln!("[Execution {} started]", execution_id);

    let execution = engine.wait(execution_id, pipeline_execution_id).await?;
    let pexec = execution
        .pipeline_execution(pipeline_execution_id)
        .context("Pipeline execution missing from log")?;

    match pexec.status {
        PipelineStatus::Finished => {
            if json {
                println!("{}", serde_json::to_string_pretty(&pexec.pipeline_output)?);
            } else {
                for (name, value) in &pexec.pipeline_output {
                    println!("{}: {}", name, value);
                }
            }
            eprintln!("\n[Execution {} finished]", execution_id);
        }
        PipelineStatus::Failed => {
            for error in &pexec.errors {
                eprintln!("  error: {}", error);
            }
            eprintln!("\n[Execution {} failed]", execution_id);
            std::process::exit(1);
        }
        status => {
            eprintln!("\n[Execution {} in state: {}]", execution_id, status);
        }
    }

    Ok(())
}

/// Show the status of an execution
async fn show_status(execution_id: &str) -> Result<()> {
    let execution_id = parse_id(execution_id, "execution ID")?;
    let engine = open_engine().await?;
    let execution = engine.get_execution(execution_id).await?;

    println!("Execution ID: {}", execution.id);
    println!("Created: {}", execution.created_at);
    for root in execution.root_pipeline_ids.iter() {
        print_pipeline(&execution, *root, 0);
    }

    Ok(())
}

fn print_pipeline(execution: &Execution, pipeline_execution_id: Uuid, depth: usize) {
    let Some(pexec) = execution.pipeline_execution(pipeline_execution_id) else {
        return;
    };
    let pad = "  ".repeat(depth);
    print_pipeline_header(pexec, &pad);

    for step in &pexec.planned_steps {
        let Some(entries) = pexec.entries(step) else {
            println!("{}  {}: not started", pad, step);
            continue;
        };
        for (key, entry) in entries {
            let status = entry
                .last()
                .map(|e| format!("{:?}", e.status).to_lowercase())
                .unwrap_or_else(|| "skipped".to_string());
            println!(
                "{}  {}[{}]: {} ({} attempt(s))",
                pad,
                step,
                key,
                status,
                entry.step_executions.len()
            );
        }
    }

    for child in execution.children_of(pipeline_execution_id) {
        print_pipeline(execution, child.id, depth + 1);
    }
}

fn print_pipeline_header(pexec: &PipelineExecution, pad: &str) {
    println!(
        "\n{}Pipeline: {} ({})  status: {}",
        pad, pexec.pipeline_name, pexec.id, pexec.status
    );
    for error in &pexec.errors {
        println!("{}  error: {}", pad, error);
    }
}

/// List recent executions
async fn list_executions(limit: usize) -> Result<()> {
    let engine = open_engine().await?;
    let executions = engine.list_executions(limit).await?;

    if executions.is_empty() {
        println!("No executions found");
        return Ok(());
    }

    println!("{:<38} {:<20} {:<10} {}", "EXECUTION ID", "PIPELINE", "STATUS", "CREATED");
    println!("{}", "-".repeat(95));

    for summary in executions {
        println!(
            "{:<38} {:<20} {:<10} {}",
            summary.execution_id,
            summary.pipeline_name,
            summary.status,
            summary.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }

    Ok(())
}

async fn cancel(
    execution_id: &str,
    pipeline_execution_id: &str,
    reason: Option<String>,
) -> Result<()> {
    let execution_id = parse_id(execution_id, "execution ID")?;
    let pipeline_execution_id = parse_id(pipeline_execution_id, "pipeline execution ID")?;
    let engine = open_engine().await?;

    engine
        .cancel(execution_id, pipeline_execution_id, reason)
        .await?;
    let execution = engine.wait(execution_id, pipeline_execution_id).await?;
    let status = execution
        .pipeline_execution(pipeline_execution_id)
        .map(|p| p.status.to_string())
        .unwrap_or_default();
    eprintln!("[Pipeline execution {}: {}]", pipeline_execution_id, status);

    Ok(())
}

/// Load the catalog and report on one pipeline
fn validate(pipeline_name: &str) -> Result<()> {
    let cfg = config::config()?;
    let catalog = load_catalog(cfg)?;
    let definition = catalog.get(pipeline_name).with_context(|| {
        format!(
            "Pipeline '{}' not found in {}",
            pipeline_name,
            cfg.pipelines.display()
        )
    })?;

    println!("Pipeline '{}' is valid", definition.name);
    for step in &definition.steps {
        let deps = step.dependencies();
        if deps.is_empty() {
            println!("  {}", step.full_name());
        } else {
            let deps: Vec<&str> = deps.iter().map(String::as_str).collect();
            println!("  {} <- {}", step.full_name(), deps.join(", "));
        }
    }

    Ok(())
}

/// Show the resolved configuration (for debugging)
fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!("Config file: {}", cfg
        .config_file
        .as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "(none - using defaults)".to_string()));
    println!();
    println!("Paths:");
    println!("  Home (engine state): {}", cfg.home.display());
    println!("  Executions:          {}", cfg.executions_dir().display());
    println!("  Index:               {}", cfg.index_path().display());
    println!("  Pipelines:           {}", cfg.pipelines.display());
    if let Some(resources) = &cfg.resources {
        println!("  Resources:           {}", resources.display());
    }
    println!();
    println!("Engine:");
    println!("  Max event size:   {} bytes", cfg.engine.max_event_bytes);
    println!("  Poll interval:    {:?}", cfg.engine.poll_interval);
    println!("  Wait attempts:    {}", cfg.engine.wait_attempts);
    println!("  Step timeout:     {:?}", cfg.engine.default_step_timeout);

    Ok(())
}
