//! Context assembly for the planner.
//!
//! The [`ContextHub`] produces a complete, self-consistent [`PlannerInput`]
//! on demand and records phase-tagged snapshots. Static context (schema
//! excerpt, file list) is computed once per execution and shared read-only;
//! warm context (recent messages, resources, observation history) is
//! rebuilt fresh every iteration. A failing warm section is omitted rather
//! than failing the whole build — a best-effort plan beats a stalled run.

pub mod snapshot;

pub use snapshot::{ContextSnapshot, SnapshotPhase};

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::storage::SnapshotRepository;

/// One prior conversation message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

/// A data resource visible to the planner (dataset, connection, report).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    pub id: String,
    pub kind: String,
    pub name: String,
}

/// An uploaded or generated file visible to the planner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub id: String,
    pub name: String,
}

/// Normalized digest of a completed tool call, folded into future inputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub tool_name: String,
    pub success: bool,
    pub summary: String,
    /// Salient data excerpt; opaque to the loop.
    pub excerpt: Value,
    pub recorded_at: DateTime<Utc>,
}

/// Everything the planner is given for one decision. Rebuilt fresh each
/// iteration; never mutated in place.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PlannerInput {
    pub instructions: String,
    pub history_summary: Option<String>,
    pub recent_messages: Vec<Message>,
    pub resources: Vec<ResourceDescriptor>,
    pub files: Vec<FileDescriptor>,
    pub schema_excerpt: Option<String>,
    pub observations: Vec<Observation>,
    /// Warm sections that failed to build and were omitted.
    pub degraded_sections: Vec<String>,
}

/// Warm-context capability: listings that change while a run is live.
#[async_trait]
pub trait ResourceLister: Send + Sync {
    async fn history_summary(&self, organization_id: &str) -> anyhow::Result<Option<String>>;
    async fn recent_messages(&self, organization_id: &str) -> anyhow::Result<Vec<Message>>;
    async fn list_resources(&self, organization_id: &str) -> anyhow::Result<Vec<ResourceDescriptor>>;
}

/// Static-context capability: stable for the lifetime of one execution.
#[async_trait]
pub trait SchemaSource: Send + Sync {
    async fn schema_excerpt(&self, organization_id: &str) -> anyhow::Result<Option<String>>;
    async fn list_files(&self, organization_id: &str) -> anyhow::Result<Vec<FileDescriptor>>;
}

/// Context that does not change within an execution.
#[derive(Debug, Clone)]
pub struct StaticContext {
    pub instructions: String,
    pub schema_excerpt: Option<String>,
    pub files: Vec<FileDescriptor>,
    /// Static sections that failed to compute and were omitted.
    pub degraded_sections: Vec<String>,
}

/// Per-iteration context: everything that may change while a run is live.
#[derive(Debug, Clone, Default)]
pub struct WarmContext {
    pub history_summary: Option<String>,
    pub recent_messages: Vec<Message>,
    pub resources: Vec<ResourceDescriptor>,
    /// Warm sections that failed to build and were omitted.
    pub degraded_sections: Vec<String>,
}

/// Assembles planner input and records snapshots for one execution.
pub struct ContextHub {
    execution_id: String,
    organization_id: String,
    instructions: String,
    resources: Arc<dyn ResourceLister>,
    schema: Arc<dyn SchemaSource>,
    snapshots: Arc<dyn SnapshotRepository>,
    static_ctx: Option<Arc<StaticContext>>,
    observations: Vec<Observation>,
    last_input: Option<PlannerInput>,
    snapshot_seq: u64,
    audit_degraded: bool,
}

impl ContextHub {
    pub fn new(
        execution_id: impl Into<String>,
        organization_id: impl Into<String>,
        instructions: impl Into<String>,
        resources: Arc<dyn ResourceLister>,
        schema: Arc<dyn SchemaSource>,
        snapshots: Arc<dyn SnapshotRepository>,
    ) -> Self {
        Self {
            execution_id: execution_id.into(),
            organization_id: organization_id.into(),
            instructions: instructions.into(),
            resources,
            schema,
            snapshots,
            static_ctx: None,
            observations: Vec::new(),
            last_input: None,
            snapshot_seq: 0,
            audit_degraded: false,
        }
    }

    /// Compute-once static context. Subsequent calls return the cached
    /// value; failed sections are omitted and recorded, not fatal.
    pub async fn build_static(&mut self) -> Arc<StaticContext> {
        if let Some(ctx) = &self.static_ctx {
            return ctx.clone();
        }

        let mut degraded = Vec::new();

        let schema_excerpt = match self.schema.schema_excerpt(&self.organization_id).await {
            Ok(excerpt) => excerpt,
            Err(error) => {
                tracing::warn!(%error, "schema excerpt unavailable, omitting section");
                degraded.push("schema_excerpt".to_string());
                None
            }
        };

        let files = match self.schema.list_files(&self.organization_id).await {
            Ok(files) => files,
            Err(error) => {
                tracing::warn!(%error, "file listing unavailable, omitting section");
                degraded.push("files".to_string());
                Vec::new()
            }
        };

        let ctx = Arc::new(StaticContext {
            instructions: self.instructions.clone(),
            schema_excerpt,
            files,
            degraded_sections: degraded,
        });
        self.static_ctx = Some(ctx.clone());
        ctx
    }

    /// Recompute the per-iteration context. Always fresh — resource state
    /// and recent messages can change between iterations. A failing
    /// section degrades (omitted + recorded), never fails the build.
    pub async fn build_warm(&self) -> WarmContext {
        let mut degraded = Vec::new();

        let history_summary = match self.resources.history_summary(&self.organization_id).await {
            Ok(summary) => summary,
            Err(error) => {
                tracing::warn!(%error, "history summary unavailable, omitting section");
                degraded.push("history_summary".to_string());
                None
            }
        };

        let recent_messages = match self.resources.recent_messages(&self.organization_id).await {
            Ok(messages) => messages,
            Err(error) => {
                tracing::warn!(%error, "recent messages unavailable, omitting section");
                degraded.push("recent_messages".to_string());
                Vec::new()
            }
        };

        let resources = match self.resources.list_resources(&self.organization_id).await {
            Ok(resources) => resources,
            Err(error) => {
                tracing::warn!(%error, "resource listing unavailable, omitting section");
                degraded.push("resources".to_string());
                Vec::new()
            }
        };

        WarmContext {
            history_summary,
            recent_messages,
            resources,
            degraded_sections: degraded,
        }
    }

    /// Build a fresh [`PlannerInput`]: cached static context plus warm
    /// context recomputed now. Reflects every observation recorded so far.
    pub async fn build_input(&mut self) -> PlannerInput {
        let static_ctx = self.build_static().await;
        let warm = self.build_warm().await;

        let mut degraded = static_ctx.degraded_sections.clone();
        degraded.extend(warm.degraded_sections);

        let input = PlannerInput {
            instructions: static_ctx.instructions.clone(),
            history_summary: warm.history_summary,
            recent_messages: warm.recent_messages,
            resources: warm.resources,
            files: static_ctx.files.clone(),
            schema_excerpt: static_ctx.schema_excerpt.clone(),
            observations: self.observations.clone(),
            degraded_sections: degraded,
        };
        self.last_input = Some(input.clone());
        input
    }

    /// Append one observation; folded into every subsequent input.
    pub fn push_observation(&mut self, observation: Observation) {
        self.observations.push(observation);
    }

    pub fn observations(&self) -> &[Observation] {
        &self.observations
    }

    /// Serialize current context plus metadata and append it to the
    /// snapshot sequence. Persistence failure is non-fatal: it is logged
    /// and flagged as degraded audit, and the loop continues.
    pub async fn snapshot(&mut self, phase: SnapshotPhase, iteration: u32) -> ContextSnapshot {
        self.snapshot_seq += 1;

        let payload = match &self.last_input {
            Some(input) => serde_json::to_value(input).unwrap_or(Value::Null),
            None => self.skeleton_payload(),
        };

        let snapshot = ContextSnapshot {
            id: Uuid::new_v4().to_string(),
            execution_id: self.execution_id.clone(),
            seq: self.snapshot_seq,
            phase,
            iteration,
            taken_at: Utc::now(),
            payload,
        };

        if let Err(error) = self.snapshots.append(&snapshot).await {
            tracing::warn!(
                execution_id = %self.execution_id,
                phase = phase.as_str(),
                %error,
                "snapshot persistence failed, audit trail degraded"
            );
            self.audit_degraded = true;
        }
        snapshot
    }

    /// Whether any snapshot failed to persist during this execution.
    pub fn audit_degraded(&self) -> bool {
        self.audit_degraded
    }

    /// Payload for snapshots taken before the first full input build.
    fn skeleton_payload(&self) -> Value {
        match &self.static_ctx {
            Some(static_ctx) => serde_json::json!({
                "instructions": static_ctx.instructions,
                "schema_excerpt": static_ctx.schema_excerpt,
                "files": static_ctx.files,
                "observations": self.observations,
            }),
            None => serde_json::json!({ "instructions": self.instructions }),
        }
    }
}
