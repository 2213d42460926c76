//! Persistence layer.
//!
//! The loop only depends on the repository traits here; the concrete
//! technology is swappable. Bundled implementations:
//! - `sqlite` — durable local storage (executions, snapshots)
//! - `memory` — in-process store for tests and ephemeral runs

pub mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::{Database, SqliteStore};

use async_trait::async_trait;

use crate::agent::execution::AgentExecution;
use crate::context::snapshot::ContextSnapshot;

/// Durable storage for execution records.
#[async_trait]
pub trait ExecutionRepository: Send + Sync {
    /// Persist a newly created execution.
    async fn create(&self, execution: &AgentExecution) -> anyhow::Result<()>;

    /// Persist terminal state (status, final answer, title, iterations).
    async fn finish(&self, execution: &AgentExecution) -> anyhow::Result<()>;
}

/// Durable, append-only storage for context snapshots.
#[async_trait]
pub trait SnapshotRepository: Send + Sync {
    async fn append(&self, snapshot: &ContextSnapshot) -> anyhow::Result<()>;
}
