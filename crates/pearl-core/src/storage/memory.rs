//! In-memory repositories for tests and ephemeral runs.

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::agent::execution::AgentExecution;
use crate::context::snapshot::ContextSnapshot;

use super::{ExecutionRepository, SnapshotRepository};

/// Stores everything in process. Can be told to fail, to exercise the
/// loop's degraded-persistence paths.
#[derive(Default)]
pub struct MemoryStore {
    executions: Mutex<Vec<AgentExecution>>,
    snapshots: Mutex<Vec<ContextSnapshot>>,
    fail_snapshots: Mutex<bool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent snapshot appends fail.
    pub fn fail_snapshots(&self, fail: bool) {
        *self.fail_snapshots.lock() = fail;
    }

    pub fn executions(&self) -> Vec<AgentExecution> {
        self.executions.lock().clone()
    }

    /// Snapshots for one execution, in append order.
    pub fn snapshots(&self, execution_id: &str) -> Vec<ContextSnapshot> {
        self.snapshots
            .lock()
            .iter()
            .filter(|s| s.execution_id == execution_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ExecutionRepository for MemoryStore {
    async fn create(&self, execution: &AgentExecution) -> anyhow::Result<()> {
        self.executions.lock().push(execution.clone());
        Ok(())
    }

    async fn finish(&self, execution: &AgentExecution) -> anyhow::Result<()> {
        let mut executions = self.executions.lock();
        match executions.iter_mut().find(|e| e.id == execution.id) {
            Some(stored) => *stored = execution.clone(),
            None => executions.push(execution.clone()),
        }
        Ok(())
    }
}

#[async_trait]
impl SnapshotRepository for MemoryStore {
    async fn append(&self, snapshot: &ContextSnapshot) -> anyhow::Result<()> {
        if *self.fail_snapshots.lock() {
            anyhow::bail!("snapshot store unavailable")
        }
        self.snapshots.lock().push(snapshot.clone());
        Ok(())
    }
}
