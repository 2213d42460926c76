//! Canonical event protocol for the agent loop.
//!
//! `AgentEvent` is the single source of truth for everything the orchestrator
//! emits. Transport layers (SSE server, TUI, log sinks) consume these events
//! and map them to their own presentation format. Every variant carries the
//! `result_id` of the execution that produced it so multiple concurrent
//! executions can be multiplexed over one transport.
//!
//! Delivery happens through [`EventBus`], which feeds two channels from a
//! single emission point: a pull-based primary stream and a broadcast
//! fan-out for legacy consumers.

mod bus;

pub use bus::EventBus;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::agent::blocks::Block;
use crate::agent::execution::ExecutionStatus;
use crate::planner::decision::{DecisionMetrics, PlannerDecision};

/// Events emitted by the agent orchestrator.
///
/// Wire names follow the dotted `category.event` convention; each variant
/// serializes with a `type` tag and a flat JSON payload.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum AgentEvent {
    // ── Run lifecycle ──────────────────────────────────────────────────
    /// An execution started.
    #[serde(rename = "run.started")]
    RunStarted { result_id: String },

    /// An execution reached a terminal state. Emitted exactly once per run.
    #[serde(rename = "run.finished")]
    RunFinished {
        result_id: String,
        status: ExecutionStatus,
        iterations: u32,
    },

    /// Loop state transition (planning, tool execution, finalizing, ...).
    #[serde(rename = "result.update")]
    ResultUpdate {
        result_id: String,
        state: String,
        iteration: u32,
    },

    // ── Transcript blocks ──────────────────────────────────────────────
    /// A transcript block was created or updated in place.
    #[serde(rename = "block.upsert")]
    BlockUpsert { result_id: String, block: Block },

    /// Incremental text appended to a block.
    #[serde(rename = "block.delta.text")]
    BlockDeltaText {
        result_id: String,
        block_id: String,
        delta: String,
    },

    /// Incremental artifact payload attached to a block (charts, tables).
    #[serde(rename = "block.delta.artifact")]
    BlockDeltaArtifact {
        result_id: String,
        block_id: String,
        artifact: serde_json::Value,
    },

    // ── Planner ────────────────────────────────────────────────────────
    /// Raw text delta from the decision stream.
    #[serde(rename = "planner.tokens")]
    PlannerTokens { result_id: String, delta: String },

    /// A syntactically complete fragment that is not yet a valid decision.
    #[serde(rename = "planner.decision.partial")]
    PlannerDecisionPartial {
        result_id: String,
        fragment: serde_json::Value,
    },

    /// The authoritative decision for this iteration, with timing metrics.
    #[serde(rename = "planner.decision.final")]
    PlannerDecisionFinal {
        result_id: String,
        decision: PlannerDecision,
        metrics: DecisionMetrics,
    },

    /// The planner produced no valid decision and will be retried.
    #[serde(rename = "planner.retry")]
    PlannerRetry {
        result_id: String,
        attempt: u32,
        error: String,
    },

    // ── Tool lifecycle ─────────────────────────────────────────────────
    /// A tool call began executing. Emitted once per logical call,
    /// before the first attempt.
    #[serde(rename = "tool.started")]
    ToolStarted {
        result_id: String,
        tool_id: String,
        tool_name: String,
    },

    /// Handler-reported stage update.
    #[serde(rename = "tool.progress")]
    ToolProgress {
        result_id: String,
        tool_id: String,
        stage: String,
    },

    /// Incremental answer fragment from a long-running tool.
    #[serde(rename = "tool.partial")]
    ToolPartial {
        result_id: String,
        tool_id: String,
        delta: String,
    },

    /// Terminal success for a tool call, with the winning attempt number.
    #[serde(rename = "tool.finished")]
    ToolFinished {
        result_id: String,
        tool_id: String,
        tool_name: String,
        attempt: u32,
        duration_ms: u64,
        summary: String,
    },

    /// Terminal failure for a tool call (validation failure, exhausted
    /// retries, or a non-retryable error).
    #[serde(rename = "tool.error")]
    ToolError {
        result_id: String,
        tool_id: String,
        tool_name: String,
        error: String,
    },

    // ── Domain artifacts (raised by tool handlers) ─────────────────────
    /// A query record was created by a tool.
    #[serde(rename = "query.created")]
    QueryCreated {
        result_id: String,
        tool_id: String,
        query_id: String,
    },

    /// A visualization was created by a tool.
    #[serde(rename = "visualization.created")]
    VisualizationCreated {
        result_id: String,
        tool_id: String,
        visualization_id: String,
    },

    /// An existing visualization was updated by a tool.
    #[serde(rename = "visualization.updated")]
    VisualizationUpdated {
        result_id: String,
        tool_id: String,
        visualization_id: String,
    },

    /// A data model build finished.
    #[serde(rename = "data_model.completed")]
    DataModelCompleted {
        result_id: String,
        tool_id: String,
        model_id: String,
    },

    // ── Completion lifecycle ───────────────────────────────────────────
    /// The completion pipeline for this execution started.
    #[serde(rename = "completion.started")]
    CompletionStarted { result_id: String },

    /// The completion pipeline finished. Emitted exactly once per run,
    /// on every terminal path.
    #[serde(rename = "completion.finished")]
    CompletionFinished {
        result_id: String,
        status: ExecutionStatus,
        final_answer: Option<String>,
    },

    /// A fatal condition terminated the run early. Always followed by
    /// `completion.finished`.
    #[serde(rename = "completion.error")]
    CompletionError { result_id: String, error: String },

    // ── Instruction suggestions (best-effort, downstream) ──────────────
    #[serde(rename = "instructions.suggest.started")]
    InstructionsSuggestStarted { result_id: String },

    #[serde(rename = "instructions.suggest.completed")]
    InstructionsSuggestCompleted {
        result_id: String,
        suggestions: Vec<String>,
    },

    #[serde(rename = "instructions.suggest.failed")]
    InstructionsSuggestFailed { result_id: String, error: String },
}

impl AgentEvent {
    /// Execution id this event belongs to.
    pub fn result_id(&self) -> &str {
        match self {
            Self::RunStarted { result_id }
            | Self::RunFinished { result_id, .. }
            | Self::ResultUpdate { result_id, .. }
            | Self::BlockUpsert { result_id, .. }
            | Self::BlockDeltaText { result_id, .. }
            | Self::BlockDeltaArtifact { result_id, .. }
            | Self::PlannerTokens { result_id, .. }
            | Self::PlannerDecisionPartial { result_id, .. }
            | Self::PlannerDecisionFinal { result_id, .. }
            | Self::PlannerRetry { result_id, .. }
            | Self::ToolStarted { result_id, .. }
            | Self::ToolProgress { result_id, .. }
            | Self::ToolPartial { result_id, .. }
            | Self::ToolFinished { result_id, .. }
            | Self::ToolError { result_id, .. }
            | Self::QueryCreated { result_id, .. }
            | Self::VisualizationCreated { result_id, .. }
            | Self::VisualizationUpdated { result_id, .. }
            | Self::DataModelCompleted { result_id, .. }
            | Self::CompletionStarted { result_id }
            | Self::CompletionFinished { result_id, .. }
            | Self::CompletionError { result_id, .. }
            | Self::InstructionsSuggestStarted { result_id }
            | Self::InstructionsSuggestCompleted { result_id, .. }
            | Self::InstructionsSuggestFailed { result_id, .. } => result_id,
        }
    }

    /// Wire name of this event (the serialized `type` tag).
    pub fn wire_name(&self) -> &'static str {
        match self {
            Self::RunStarted { .. } => "run.started",
            Self::RunFinished { .. } => "run.finished",
            Self::ResultUpdate { .. } => "result.update",
            Self::BlockUpsert { .. } => "block.upsert",
            Self::BlockDeltaText { .. } => "block.delta.text",
            Self::BlockDeltaArtifact { .. } => "block.delta.artifact",
            Self::PlannerTokens { .. } => "planner.tokens",
            Self::PlannerDecisionPartial { .. } => "planner.decision.partial",
            Self::PlannerDecisionFinal { .. } => "planner.decision.final",
            Self::PlannerRetry { .. } => "planner.retry",
            Self::ToolStarted { .. } => "tool.started",
            Self::ToolProgress { .. } => "tool.progress",
            Self::ToolPartial { .. } => "tool.partial",
            Self::ToolFinished { .. } => "tool.finished",
            Self::ToolError { .. } => "tool.error",
            Self::QueryCreated { .. } => "query.created",
            Self::VisualizationCreated { .. } => "visualization.created",
            Self::VisualizationUpdated { .. } => "visualization.updated",
            Self::DataModelCompleted { .. } => "data_model.completed",
            Self::CompletionStarted { .. } => "completion.started",
            Self::CompletionFinished { .. } => "completion.finished",
            Self::CompletionError { .. } => "completion.error",
            Self::InstructionsSuggestStarted { .. } => "instructions.suggest.started",
            Self::InstructionsSuggestCompleted { .. } => "instructions.suggest.completed",
            Self::InstructionsSuggestFailed { .. } => "instructions.suggest.failed",
        }
    }
}

/// Adapt the primary receiver into a `Stream` for SSE-style transports.
pub fn event_stream(
    rx: mpsc::UnboundedReceiver<AgentEvent>,
) -> impl futures::Stream<Item = AgentEvent> {
    UnboundedReceiverStream::new(rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn event_stream_yields_in_order() {
        let (bus, rx) = EventBus::new();
        bus.emit(AgentEvent::RunStarted {
            result_id: "a".to_string(),
        });
        bus.emit(AgentEvent::CompletionStarted {
            result_id: "a".to_string(),
        });
        drop(bus);

        let names: Vec<_> = event_stream(rx)
            .map(|e| e.wire_name().to_string())
            .collect()
            .await;
        assert_eq!(names, vec!["run.started", "completion.started"]);
    }

    #[test]
    fn serializes_with_dotted_type_tag() {
        let event = AgentEvent::RunStarted {
            result_id: "exec_1".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "run.started");
        assert_eq!(json["result_id"], "exec_1");
    }

    #[test]
    fn tool_finished_carries_attempt() {
        let event = AgentEvent::ToolFinished {
            result_id: "exec_1".to_string(),
            tool_id: "call_1".to_string(),
            tool_name: "query_db".to_string(),
            attempt: 2,
            duration_ms: 40,
            summary: "12 rows".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "tool.finished");
        assert_eq!(json["attempt"], 2);
    }

    #[test]
    fn wire_name_matches_serde_tag() {
        let event = AgentEvent::CompletionFinished {
            result_id: "exec_1".to_string(),
            status: ExecutionStatus::Success,
            final_answer: Some("done".to_string()),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], event.wire_name());
    }
}
