//! Execution records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::planner::PlanType;

/// Terminal status of one run of the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    Error,
    Stopped,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::Stopped => "stopped",
        }
    }
}

/// One run of the loop for a single user request. Owned exclusively by the
/// orchestrator: created at loop start, closed exactly once at loop end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentExecution {
    pub id: String,
    pub organization_id: String,
    pub plan_type: PlanType,
    pub question: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: Option<ExecutionStatus>,
    pub iterations: u32,
    pub final_answer: Option<String>,
    pub title: Option<String>,
}

impl AgentExecution {
    pub fn new(
        organization_id: impl Into<String>,
        plan_type: PlanType,
        question: impl Into<String>,
    ) -> Self {
        Self {
            id: format!("exec_{}", Uuid::new_v4()),
            organization_id: organization_id.into(),
            plan_type,
            question: question.into(),
            started_at: Utc::now(),
            finished_at: None,
            status: None,
            iterations: 0,
            final_answer: None,
            title: None,
        }
    }

    /// Close the record. Idempotent on accident: the first terminal status
    /// wins.
    pub fn finish(&mut self, status: ExecutionStatus, final_answer: Option<String>) {
        if self.status.is_some() {
            return;
        }
        self.status = Some(status);
        self.final_answer = final_answer;
        self.finished_at = Some(Utc::now());
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_some()
    }
}
