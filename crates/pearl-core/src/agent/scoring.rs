//! Best-effort scoring around the planner.
//!
//! Early scoring races the decision stream: it starts when planning starts,
//! never gates the decision, and is discarded if still pending once its
//! result is wanted (a short grace window at most). Late scoring reuses the
//! same scorer during finalization to decide whether to run the
//! instruction-suggestion pass. Failures are logged, never propagated.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::context::PlannerInput;

/// Heuristic result used for optional instruction suggestions.
#[derive(Debug, Clone, Copy)]
pub struct ScoringOutcome {
    /// 0.0 (struggling) .. 1.0 (smooth run).
    pub score: f32,
    pub suggest_instructions: bool,
}

/// Pre-computes heuristics concurrently with the planner.
#[async_trait]
pub trait Scorer: Send + Sync {
    async fn score(&self, input: &PlannerInput) -> anyhow::Result<ScoringOutcome>;
}

/// Downstream sink for instruction suggestions.
#[async_trait]
pub trait SuggestionSink: Send + Sync {
    async fn submit(&self, execution_id: &str, suggestions: Vec<String>) -> anyhow::Result<()>;
}

/// Default scorer: penalizes failed observations and degraded context.
pub struct HeuristicScorer;

#[async_trait]
impl Scorer for HeuristicScorer {
    async fn score(&self, input: &PlannerInput) -> anyhow::Result<ScoringOutcome> {
        let total = input.observations.len();
        let failed = input.observations.iter().filter(|o| !o.success).count();

        let mut score = 1.0f32;
        if total > 0 {
            score -= failed as f32 / total as f32 * 0.6;
        }
        score -= input.degraded_sections.len() as f32 * 0.1;
        let score = score.clamp(0.0, 1.0);

        Ok(ScoringOutcome {
            score,
            suggest_instructions: score < 0.7,
        })
    }
}

/// Suggestions derived from what went wrong during the run.
pub fn suggestions_from(input: &PlannerInput) -> Vec<String> {
    let mut suggestions = Vec::new();

    if input.schema_excerpt.is_none() {
        suggestions.push(
            "Document the warehouse schema so the planner can target tables directly".to_string(),
        );
    }
    for section in &input.degraded_sections {
        suggestions.push(format!(
            "Context section '{section}' was unavailable; check the upstream listing"
        ));
    }

    let mut failing: Vec<&str> = input
        .observations
        .iter()
        .filter(|o| !o.success)
        .map(|o| o.tool_name.as_str())
        .collect();
    failing.dedup();
    for tool in failing {
        suggestions.push(format!(
            "Add instructions for recovering when '{tool}' fails"
        ));
    }

    suggestions
}

/// A spawned scoring computation that can be awaited with a grace window.
pub struct ScoringTask {
    handle: tokio::task::JoinHandle<Option<ScoringOutcome>>,
}

impl ScoringTask {
    /// Start scoring in the background. Never blocks the caller.
    pub fn spawn(scorer: Arc<dyn Scorer>, input: PlannerInput) -> Self {
        let handle = tokio::spawn(async move {
            match scorer.score(&input).await {
                Ok(outcome) => Some(outcome),
                Err(error) => {
                    tracing::warn!(%error, "scoring failed");
                    None
                }
            }
        });
        Self { handle }
    }

    /// Wait at most `grace` for the result; a late or failed computation
    /// is discarded.
    pub async fn take(self, grace: Duration) -> Option<ScoringOutcome> {
        match tokio::time::timeout(grace, self.handle).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(join_error)) => {
                tracing::warn!(%join_error, "scoring task panicked");
                None
            }
            Err(_) => {
                tracing::debug!("scoring still pending after grace window, discarding");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Observation;
    use chrono::Utc;
    use serde_json::json;

    fn failed_observation(tool: &str) -> Observation {
        Observation {
            tool_name: tool.to_string(),
            success: false,
            summary: "boom".to_string(),
            excerpt: json!(null),
            recorded_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn clean_run_scores_high() {
        let outcome = HeuristicScorer
            .score(&PlannerInput::default())
            .await
            .unwrap();
        assert!(outcome.score > 0.9);
        assert!(!outcome.suggest_instructions);
    }

    #[tokio::test]
    async fn failures_lower_score_and_trigger_suggestions() {
        let input = PlannerInput {
            observations: vec![failed_observation("query_db")],
            degraded_sections: vec!["resources".to_string()],
            ..Default::default()
        };
        let outcome = HeuristicScorer.score(&input).await.unwrap();
        assert!(outcome.score < 0.7);
        assert!(outcome.suggest_instructions);

        let suggestions = suggestions_from(&input);
        assert!(suggestions.iter().any(|s| s.contains("query_db")));
        assert!(suggestions.iter().any(|s| s.contains("resources")));
    }

    #[tokio::test]
    async fn slow_scorer_is_discarded_after_grace() {
        struct Slow;

        #[async_trait]
        impl Scorer for Slow {
            async fn score(&self, _input: &PlannerInput) -> anyhow::Result<ScoringOutcome> {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(ScoringOutcome {
                    score: 1.0,
                    suggest_instructions: false,
                })
            }
        }

        let task = ScoringTask::spawn(Arc::new(Slow), PlannerInput::default());
        let outcome = task.take(Duration::from_millis(20)).await;
        assert!(outcome.is_none());
    }

    #[tokio::test]
    async fn fast_scorer_lands_within_grace() {
        let task = ScoringTask::spawn(Arc::new(HeuristicScorer), PlannerInput::default());
        let outcome = task.take(Duration::from_millis(200)).await;
        assert!(outcome.is_some());
    }
}
