//! Per-execution serialization.
//!
//! Planning and bookkeeping for one execution (replay, decide, append) run
//! under that execution's lock. Different executions never contend, and step
//! implementations run with no lock held.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

/// Keyed mutex, one lock per execution id, created on demand
#[derive(Debug, Clone, Default)]
pub struct ExecutionGuard {
    locks: Arc<Mutex<HashMap<Uuid, Arc<Mutex<()>>>>>,
}

impl ExecutionGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the execution's lock; released when the guard drops
    pub async fn lock(&self, execution_id: Uuid) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(execution_id)
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Drop the lock of a finished execution if nobody holds it
    pub async fn release(&self, execution_id: Uuid) {
        let mut locks = self.locks.lock().await;
        if let Some(lock) = locks.get(&execution_id) {
            if Arc::strong_count(lock) == 1 {
                locks.remove(&execution_id);
            }
        }
    }
}
