//! Lightweight execution index.
//!
//! Records start time, pipeline name and status of each root pipeline
//! execution so executions can be listed without replaying every log.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::EngineError;
use crate::domain::PipelineStatus;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS executions (
    execution_id   TEXT PRIMARY KEY,
    pipeline_name  TEXT NOT NULL,
    status         TEXT NOT NULL,
    created_at     TEXT NOT NULL,
    updated_at     TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_executions_created ON executions(created_at);
";

/// One row of the index
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub execution_id: Uuid,
    pub pipeline_name: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// SQLite-backed index; thread-safe via an internal `Mutex<Connection>`
pub struct ExecutionIndex {
    conn: Mutex<Connection>,
}

impl ExecutionIndex {
    /// Open (or create) the index database at `path`
    pub fn open(path: &Path) -> Result<Self, EngineError> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(SCHEMA)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory index (for testing)
    pub fn open_in_memory() -> Result<Self, EngineError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, EngineError> {
        self.conn
            .lock()
            .map_err(|_| EngineError::Internal("execution index lock poisoned".to_string()))
    }

    /// Record a newly enqueued execution
    pub fn insert(
        &self,
        execution_id: Uuid,
        pipeline_name: &str,
        status: PipelineStatus,
    ) -> Result<(), EngineError> {
        let now = Utc::now().to_rfc3339();
        self.conn()?.execute(
            "INSERT OR IGNORE INTO executions (execution_id, pipeline_name, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![execution_id.to_string(), pipeline_name, status.as_str(), now, now],
        )?;
        Ok(())
    }

    /// Update the status of an execution
    pub fn update_status(
        &self,
        execution_id: Uuid,
        status: PipelineStatus,
    ) -> Result<(), EngineError> {
        self.conn()?.execute(
            "UPDATE executions SET status = ?1, updated_at = ?2 WHERE execution_id = ?3",
            params![status.as_str(), Utc::now().to_rfc3339(), execution_id.to_string()],
        )?;
        Ok(())
    }

    pub fn get(&self, execution_id: Uuid) -> Result<Option<ExecutionSummary>, EngineError> {
        let row = self
            .conn()?
            .query_row(
                "SELECT execution_id, pipeline_name, status, created_at, updated_at
                 FROM executions WHERE execution_id = ?1",
                params![execution_id.to_string()],
                read_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Most recent executions first
    pub fn list(&self, limit: usize) -> Result<Vec<ExecutionSummary>, EngineError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT execution_id, pipeline_name, status, created_at, updated_at
             FROM executions ORDER BY created_at DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], read_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ExecutionSummary> {
    let id: String = row.get(0)?;
    Ok(ExecutionSummary {
        execution_id: Uuid::parse_str(&id).unwrap_or_default(),
        pipeline_name: row.get(1)?,
        status: row.get(2)?,
        created_at: parse_dt(&row.get::<_, String>(3)?),
        updated_at: parse_dt(&row.get::<_, String>(4)?),
    })
}

fn parse_dt(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_update_list() {
        let index = ExecutionIndex::open_in_memory().unwrap();
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        index.insert(first, "alpha", PipelineStatus::Queued).unwrap();
        index.insert(second, "beta", PipelineStatus::Queued).unwrap();
        index.update_status(first, PipelineStatus::Finished).unwrap();

        let row = index.get(first).unwrap().unwrap();
        assert_eq!(row.pipeline_name, "alpha");
        assert_eq!(row.status, "finished");

        assert_eq!(index.list(10).unwrap().len(), 2);
        assert_eq!(index.list(1).unwrap().len(), 1);
        assert!(index.get(Uuid::new_v4()).unwrap().is_none());
    }

    #[test]
    fn test_open_on_disk() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("index").join("executions.db");

        let index = ExecutionIndex::open(&path).unwrap();
        index.insert(Uuid::new_v4(), "alpha", PipelineStatus::Queued).unwrap();
        drop(index);

        let reopened = ExecutionIndex::open(&path).unwrap();
        assert_eq!(reopened.list(10).unwrap().len(), 1);
    }
}
