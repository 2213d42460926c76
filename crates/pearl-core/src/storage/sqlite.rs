//! SQLite-backed repositories.
//!
//! Local durable storage for execution records and the append-only
//! snapshot sequence. Timestamps are RFC3339 strings; snapshot payloads
//! are stored as JSON text for full fidelity.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection};

use crate::agent::execution::{AgentExecution, ExecutionStatus};
use crate::context::snapshot::{ContextSnapshot, SnapshotPhase};
use crate::planner::PlanType;

use super::{ExecutionRepository, SnapshotRepository};

/// Connection wrapper owning schema migration.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path).context("open sqlite database")?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory sqlite database")?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    fn migrate(&self) -> Result<()> {
        self.conn.lock().execute_batch(
            "CREATE TABLE IF NOT EXISTS executions (
                 id TEXT PRIMARY KEY,
                 organization_id TEXT NOT NULL,
                 plan_type TEXT NOT NULL,
                 question TEXT NOT NULL,
                 started_at TEXT NOT NULL,
                 finished_at TEXT,
                 status TEXT,
                 iterations INTEGER NOT NULL DEFAULT 0,
                 final_answer TEXT,
                 title TEXT
             );
             CREATE TABLE IF NOT EXISTS snapshots (
                 id TEXT PRIMARY KEY,
                 execution_id TEXT NOT NULL,
                 seq INTEGER NOT NULL,
                 phase TEXT NOT NULL,
                 iteration INTEGER NOT NULL,
                 taken_at TEXT NOT NULL,
                 payload TEXT NOT NULL,
                 UNIQUE(execution_id, seq)
             );
             CREATE INDEX IF NOT EXISTS idx_snapshots_execution
                 ON snapshots(execution_id, seq);",
        )?;
        Ok(())
    }
}

/// Repository implementation over a shared [`Database`].
#[derive(Clone)]
pub struct SqliteStore {
    db: Arc<Database>,
}

impl SqliteStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Load one execution record (used by audit tooling and tests).
    pub fn get_execution(&self, id: &str) -> Result<Option<AgentExecution>> {
        let conn = self.db.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, organization_id, plan_type, question, started_at, finished_at,
                    status, iterations, final_answer, title
             FROM executions WHERE id = ?1",
        )?;
        let mut rows = stmt.query_map([id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, Option<String>>(6)?,
                row.get::<_, i64>(7)?,
                row.get::<_, Option<String>>(8)?,
                row.get::<_, Option<String>>(9)?,
            ))
        })?;

        let Some(row) = rows.next() else {
            return Ok(None);
        };
        let (id, organization_id, plan_type, question, started_at, finished_at, status, iterations, final_answer, title) =
            row?;

        Ok(Some(AgentExecution {
            id,
            organization_id,
            plan_type: parse_plan_type(&plan_type)?,
            question,
            started_at: parse_timestamp(&started_at)?,
            finished_at: finished_at.as_deref().map(parse_timestamp).transpose()?,
            status: status.as_deref().map(parse_status).transpose()?,
            iterations: iterations as u32,
            final_answer,
            title,
        }))
    }

    /// Snapshots for one execution in sequence order.
    pub fn load_snapshots(&self, execution_id: &str) -> Result<Vec<ContextSnapshot>> {
        let conn = self.db.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, execution_id, seq, phase, iteration, taken_at, payload
             FROM snapshots WHERE execution_id = ?1 ORDER BY seq",
        )?;
        let rows = stmt.query_map([execution_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
            ))
        })?;

        let mut snapshots = Vec::new();
        for row in rows {
            let (id, execution_id, seq, phase, iteration, taken_at, payload) = row?;
            snapshots.push(ContextSnapshot {
                id,
                execution_id,
                seq: seq as u64,
                phase: parse_phase(&phase)?,
                iteration: iteration as u32,
                taken_at: parse_timestamp(&taken_at)?,
                payload: serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null),
            });
        }
        Ok(snapshots)
    }
}

#[async_trait]
impl ExecutionRepository for SqliteStore {
    async fn create(&self, execution: &AgentExecution) -> Result<()> {
        let conn = self.db.conn.lock();
        conn.execute(
            "INSERT INTO executions
                 (id, organization_id, plan_type, question, started_at, iterations)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                execution.id,
                execution.organization_id,
                plan_type_str(execution.plan_type),
                execution.question,
                execution.started_at.to_rfc3339(),
                execution.iterations as i64,
            ],
        )?;
        Ok(())
    }

    async fn finish(&self, execution: &AgentExecution) -> Result<()> {
        let conn = self.db.conn.lock();
        conn.execute(
            "UPDATE executions
             SET finished_at = ?1, status = ?2, iterations = ?3,
                 final_answer = ?4, title = ?5
             WHERE id = ?6",
            params![
                execution.finished_at.map(|t| t.to_rfc3339()),
                execution.status.map(|s| s.as_str()),
                execution.iterations as i64,
                execution.final_answer,
                execution.title,
                execution.id,
            ],
        )?;
        Ok(())
    }
}

#[async_trait]
impl SnapshotRepository for SqliteStore {
    async fn append(&self, snapshot: &ContextSnapshot) -> Result<()> {
        let conn = self.db.conn.lock();
        conn.execute(
            "INSERT INTO snapshots
                 (id, execution_id, seq, phase, iteration, taken_at, payload)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                snapshot.id,
                snapshot.execution_id,
                snapshot.seq as i64,
                snapshot.phase.as_str(),
                snapshot.iteration as i64,
                snapshot.taken_at.to_rfc3339(),
                snapshot.payload.to_string(),
            ],
        )?;
        Ok(())
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .with_context(|| format!("invalid timestamp: {raw}"))
}

fn plan_type_str(plan_type: PlanType) -> &'static str {
    match plan_type {
        PlanType::Research => "research",
        PlanType::Action => "action",
    }
}

fn parse_plan_type(raw: &str) -> Result<PlanType> {
    match raw {
        "research" => Ok(PlanType::Research),
        "action" => Ok(PlanType::Action),
        other => anyhow::bail!("unknown plan type: {other}"),
    }
}

fn parse_status(raw: &str) -> Result<ExecutionStatus> {
    match raw {
        "success" => Ok(ExecutionStatus::Success),
        "error" => Ok(ExecutionStatus::Error),
        "stopped" => Ok(ExecutionStatus::Stopped),
        other => anyhow::bail!("unknown execution status: {other}"),
    }
}

fn parse_phase(raw: &str) -> Result<SnapshotPhase> {
    match raw {
        "initial" => Ok(SnapshotPhase::Initial),
        "pre_tool" => Ok(SnapshotPhase::PreTool),
        "post_tool" => Ok(SnapshotPhase::PostTool),
        "final" => Ok(SnapshotPhase::Final),
        other => anyhow::bail!("unknown snapshot phase: {other}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> SqliteStore {
        SqliteStore::new(Arc::new(Database::in_memory().unwrap()))
    }

    #[tokio::test]
    async fn survives_reopen_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pearl.db");

        let execution = AgentExecution::new("org_1", PlanType::Action, "build the model");
        {
            let store = SqliteStore::new(Arc::new(Database::new(&path).unwrap()));
            store.create(&execution).await.unwrap();
        }

        let reopened = SqliteStore::new(Arc::new(Database::new(&path).unwrap()));
        let loaded = reopened.get_execution(&execution.id).unwrap().unwrap();
        assert_eq!(loaded.plan_type, PlanType::Action);
        assert_eq!(loaded.question, "build the model");
        assert!(loaded.status.is_none());
    }

    #[tokio::test]
    async fn execution_round_trip() {
        let store = store();
        let mut execution = AgentExecution::new("org_1", PlanType::Research, "trend?");
        store.create(&execution).await.unwrap();

        execution.iterations = 4;
        execution.title = Some("Revenue trend".to_string());
        execution.finish(ExecutionStatus::Success, Some("up 12%".to_string()));
        store.finish(&execution).await.unwrap();

        let loaded = store.get_execution(&execution.id).unwrap().unwrap();
        assert_eq!(loaded.status, Some(ExecutionStatus::Success));
        assert_eq!(loaded.iterations, 4);
        assert_eq!(loaded.final_answer.as_deref(), Some("up 12%"));
        assert_eq!(loaded.title.as_deref(), Some("Revenue trend"));
    }

    #[tokio::test]
    async fn snapshots_preserve_order_and_payload() {
        let store = store();
        for (seq, phase) in [
            (1, SnapshotPhase::Initial),
            (2, SnapshotPhase::PreTool),
            (3, SnapshotPhase::Final),
        ] {
            store
                .append(&ContextSnapshot {
                    id: format!("snap_{seq}"),
                    execution_id: "exec_1".to_string(),
                    seq,
                    phase,
                    iteration: 1,
                    taken_at: Utc::now(),
                    payload: json!({"seq": seq}),
                })
                .await
                .unwrap();
        }

        let snapshots = store.load_snapshots("exec_1").unwrap();
        assert_eq!(snapshots.len(), 3);
        assert_eq!(snapshots[0].phase, SnapshotPhase::Initial);
        assert_eq!(snapshots[2].phase, SnapshotPhase::Final);
        assert_eq!(snapshots[1].payload["seq"], 2);
    }

    #[tokio::test]
    async fn duplicate_sequence_numbers_are_rejected() {
        let store = store();
        let snapshot = ContextSnapshot {
            id: "snap_a".to_string(),
            execution_id: "exec_1".to_string(),
            seq: 1,
            phase: SnapshotPhase::Initial,
            iteration: 0,
            taken_at: Utc::now(),
            payload: json!({}),
        };
        store.append(&snapshot).await.unwrap();

        let duplicate = ContextSnapshot {
            id: "snap_b".to_string(),
            ..snapshot
        };
        assert!(store.append(&duplicate).await.is_err());
    }
}
