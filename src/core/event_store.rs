//! Append-only event store with file-based persistence.
//!
//! Each execution gets its own directory holding `events.jsonl`, one JSON
//! entry per line. Appends take an exclusive file lock and are assigned a
//! strictly increasing per-execution sequence number.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fs2::FileExt;
use sha2::{Digest, Sha256};
use tokio::fs::{self, File};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use super::error::EngineError;
use crate::domain::{Event, EventPayload};

/// Default cap on one serialized entry
pub const DEFAULT_MAX_EVENT_BYTES: usize = 1024 * 1024;

/// File-based event store using JSONL format
pub struct EventStore {
    /// Directory containing one subdirectory per execution
    base_dir: PathBuf,

    /// Entries larger than this are rejected
    max_event_bytes: usize,

    /// Last assigned sequence per execution (loaded lazily from disk)
    sequences: Mutex<HashMap<Uuid, Arc<Mutex<Option<u64>>>>>,
}

impl EventStore {
    /// Open a store rooted at `base_dir`, creating it if needed
    pub async fn open(base_dir: impl Into<PathBuf>, max_event_bytes: usize) -> Result<Self, EngineError> {
        let base_dir = base_dir.into();
        fs::create_dir_all(&base_dir).await?;

        Ok(Self {
            base_dir,
            max_event_bytes,
            sequences: Mutex::new(HashMap::new()),
        })
    }

    /// Get the base directory for all executions
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Get the path to an execution's events file
    pub fn events_path(&self, execution_id: Uuid) -> PathBuf {
        self.base_dir
            .join(execution_id.to_string())
            .join("events.jsonl")
    }

    /// Whether any entry has been recorded for an execution
    pub fn exists(&self, execution_id: Uuid) -> bool {
        self.events_path(execution_id).exists()
    }

    async fn sequence_slot(&self, execution_id: Uuid) -> Arc<Mutex<Option<u64>>> {
        let mut sequences = self.sequences.lock().await;
        sequences
            .entry(execution_id)
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    /// Append an entry to an execution's log.
    ///
    /// Returns the entry with its sequence number assigned. Oversized entries
    /// are rejected before anything is written.
    pub async fn append(
        &self,
        execution_id: Uuid,
        payload: EventPayload,
    ) -> Result<Event, EngineError> {
        let slot = self.sequence_slot(execution_id).await;
        let mut last = slot.lock().await;

        let previous = match *last {
            Some(sequence) => sequence,
            None => read_events(&self.events_path(execution_id), u64::MAX)
                .await?
                .last()
                .map(|e| e.sequence)
                .unwrap_or(0),
        };

        let event = Event::new(execution_id, payload).with_sequence(previous + 1);
        let json = serde_json::to_string(&event)?;
        if json.len() > self.max_event_bytes {
            warn!(
                %execution_id,
                event = event.payload.name(),
                size = json.len(),
                "Rejecting oversized event"
            );
            return Err(EngineError::EventTooLarge {
                size: json.len(),
                limit: self.max_event_bytes,
            });
        }

        let path = self.events_path(execution_id);
        tokio::task::spawn_blocking(move || write_line(&path, &json))
            .await
            .map_err(|e| EngineError::Internal(format!("append task failed: {}", e)))??;

        *last = Some(event.sequence);
        debug!(
            %execution_id,
            sequence = event.sequence,
            event = event.payload.name(),
            "Appended event"
        );

        Ok(event)
    }

    /// Replay all entries of an execution in order
    pub async fn replay(&self, execution_id: Uuid) -> Result<Vec<Event>, EngineError> {
        self.replay_until(execution_id, u64::MAX).await
    }

    /// Replay entries with `sequence <= max_sequence`.
    ///
    /// Waits for an in-progress append to the same execution, so a reader
    /// never sees a partially written line.
    pub async fn replay_until(
        &self,
        execution_id: Uuid,
        max_sequence: u64,
    ) -> Result<Vec<Event>, EngineError> {
        let slot = self.sequence_slot(execution_id).await;
        let _appending = slot.lock().await;
        read_events(&self.events_path(execution_id), max_sequence).await
    }

    /// List all execution ids with a log in the base directory
    pub async fn list_executions(&self) -> Result<Vec<Uuid>, EngineError> {
        if !self.base_dir.exists() {
            return Ok(Vec::new());
        }

        let mut executions = Vec::new();
        let mut entries = fs::read_dir(&self.base_dir).await?;

        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    if let Ok(uuid) = Uuid::parse_str(name) {
                        executions.push(uuid);
                    }
                }
            }
        }

        Ok(executions)
    }
}

async fn read_events(path: &Path, max_sequence: u64) -> Result<Vec<Event>, EngineError> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let file = File::open(path).await?;
    let reader = BufReader::new(file);
    let mut lines = reader.lines();
    let mut events = Vec::new();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let event: Event = serde_json::from_str(&line)?;
        if event.sequence > max_sequence {
            break;
        }
        events.push(event);
    }

    Ok(events)
}

/// Append one line under an exclusive lock
fn write_line(path: &Path, json: &str) -> std::io::Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }

    let mut line = String::with_capacity(json.len() + 1);
    line.push_str(json);
    line.push('\n');

    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.lock_exclusive()?;
    file.write_all(line.as_bytes())?;
    file.flush()?;

    // Lock is released when file is dropped
    Ok(())
}

/// Idempotency key for one queued attempt of a step
pub fn generate_idempotency_key(
    execution_id: Uuid,
    pipeline_execution_id: Uuid,
    step_name: &str,
    for_each_key: &str,
    loop_index: u32,
    attempt: u32,
) -> String {
    hash_input(&format!(
        "{}:{}:{}:{}:{}:{}",
        execution_id, pipeline_execution_id, step_name, for_each_key, loop_index, attempt
    ))
}

/// Hash input content (first 16 chars of SHA256)
pub fn hash_input(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let result = hasher.finalize();
    hex::encode(&result[..8])
}
