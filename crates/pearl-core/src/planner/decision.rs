//! Planner decision types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The capability scope a run operates under. Controls which tools the
/// planner may select (see `ToolRegistry::validate_for_plan_type`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanType {
    /// Read-only investigation: queries, inspection, summarization.
    Research,
    /// Side-effecting work: writing models, publishing visualizations.
    Action,
}

/// One authoritative decision per iteration: either finish with an answer
/// or invoke a tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "plan_type", rename_all = "snake_case")]
pub enum PlannerDecision {
    AnalysisComplete {
        final_answer: String,
    },
    Action {
        tool_name: String,
        #[serde(default)]
        tool_arguments: Value,
        #[serde(default)]
        reasoning: String,
    },
}

impl PlannerDecision {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::AnalysisComplete { .. })
    }
}

/// Timing and volume metrics attached to a final decision.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DecisionMetrics {
    /// Milliseconds from request to the first non-empty delta.
    pub first_token_ms: Option<u64>,
    /// Total wall time of the decision stream.
    pub thinking_ms: u64,
    /// Number of non-empty deltas consumed.
    pub fragments: usize,
    /// Total characters streamed.
    pub chars: usize,
}
