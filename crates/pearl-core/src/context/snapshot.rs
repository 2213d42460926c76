//! Point-in-time captures of planner context.
//!
//! Snapshots are immutable, phase-tagged, and form an append-only sequence
//! per execution, so "what did the planner see when it decided X" can be
//! answered after the fact and a run can be reconstructed from storage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Where in the iteration lifecycle a snapshot was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotPhase {
    /// Loop start, before the first planning pass.
    Initial,
    /// Immediately before handing input to the planner.
    PreTool,
    /// After a tool observation was recorded.
    PostTool,
    /// At or after loop termination. Exactly one per execution.
    Final,
}

impl SnapshotPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initial => "initial",
            Self::PreTool => "pre_tool",
            Self::PostTool => "post_tool",
            Self::Final => "final",
        }
    }

    /// Coarse ordering rank used to assert phase monotonicity.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Initial => 0,
            Self::PreTool | Self::PostTool => 1,
            Self::Final => 2,
        }
    }
}

/// One immutable capture of everything the planner was given.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub id: String,
    pub execution_id: String,
    /// Strictly increasing per execution.
    pub seq: u64,
    pub phase: SnapshotPhase,
    /// Iteration index; 0 for `initial` and execution-level `final`.
    pub iteration: u32,
    pub taken_at: DateTime<Utc>,
    /// Serialized union of static and warm context.
    pub payload: Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_wire_names() {
        assert_eq!(SnapshotPhase::PreTool.as_str(), "pre_tool");
        assert_eq!(
            serde_json::to_value(SnapshotPhase::PostTool).unwrap(),
            "post_tool"
        );
    }

    #[test]
    fn phase_ranks_are_monotone() {
        assert!(SnapshotPhase::Initial.rank() < SnapshotPhase::PreTool.rank());
        assert!(SnapshotPhase::PostTool.rank() < SnapshotPhase::Final.rank());
    }
}
