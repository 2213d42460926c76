//! Decision streaming for the agent loop.
//!
//! The [`Planner`] consumes chunks from a [`GenerationStream`] (the opaque
//! stand-in for an LLM provider) and drives the incremental parser until a
//! schema-valid [`PlannerDecision`] is assembled. Along the way it emits
//! `planner.tokens`, `planner.decision.partial`, and block text deltas; the
//! authoritative `planner.decision.final` is emitted exactly once, with
//! timing metrics attached.

pub mod decision;
pub mod incremental;

pub use decision::{DecisionMetrics, PlanType, PlannerDecision};

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::context::PlannerInput;
use crate::events::{AgentEvent, EventBus};
use incremental::{IncrementalDecisionParser, ParseOutcome};

/// Default inactivity ceiling: abort a stream that goes quiet.
const STREAM_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(120);

/// One chunk from the underlying generator.
#[derive(Debug, Clone)]
pub enum GenerationChunk {
    /// A text fragment (possibly partial JSON).
    Delta(String),
    /// Keep-alive with no content. Ignored.
    Heartbeat,
    /// The generator failed mid-stream.
    Error(String),
}

/// Streaming text/structured-output generation capability.
///
/// Implementations wrap a concrete LLM provider; the loop only sees the
/// chunk channel.
#[async_trait]
pub trait GenerationStream: Send + Sync {
    async fn generate(
        &self,
        input: &PlannerInput,
    ) -> anyhow::Result<mpsc::UnboundedReceiver<GenerationChunk>>;
}

/// Why a decision could not be produced.
#[derive(Debug)]
pub enum PlannerError {
    /// Stream ended, errored, or stalled without a valid final decision.
    /// Retryable by the orchestrator up to a bound.
    InvalidOutput(String),
    /// External stop observed while waiting on the stream.
    Stopped,
}

/// A final decision plus its stream metrics.
#[derive(Debug, Clone)]
pub struct FinalDecision {
    pub decision: PlannerDecision,
    pub metrics: DecisionMetrics,
}

/// Turns a [`PlannerInput`] into a [`PlannerDecision`], streaming along
/// the way.
pub struct Planner {
    generator: Arc<dyn GenerationStream>,
    inactivity_timeout: Duration,
}

impl Planner {
    pub fn new(generator: Arc<dyn GenerationStream>) -> Self {
        Self {
            generator,
            inactivity_timeout: STREAM_INACTIVITY_TIMEOUT,
        }
    }

    pub fn with_inactivity_timeout(mut self, timeout: Duration) -> Self {
        self.inactivity_timeout = timeout;
        self
    }

    /// Stream one decision.
    ///
    /// Emits `planner.tokens` and `block.delta.text` (against `block_id`)
    /// per fragment, `planner.decision.partial` for complete-but-invalid
    /// fragments, and `planner.decision.final` once a valid decision is
    /// assembled.
    pub async fn decide(
        &self,
        input: &PlannerInput,
        bus: &EventBus,
        result_id: &str,
        block_id: &str,
        cancellation: &CancellationToken,
    ) -> Result<FinalDecision, PlannerError> {
        let started = Instant::now();
        let mut rx = self
            .generator
            .generate(input)
            .await
            .map_err(|e| PlannerError::InvalidOutput(format!("generator failed: {e}")))?;

        let mut parser = IncrementalDecisionParser::new();
        let mut metrics = DecisionMetrics::default();

        loop {
            let chunk = tokio::select! {
                _ = cancellation.cancelled() => return Err(PlannerError::Stopped),
                recv = tokio::time::timeout(self.inactivity_timeout, rx.recv()) => match recv {
                    Err(_) => {
                        return Err(PlannerError::InvalidOutput(format!(
                            "decision stream inactive for {}s",
                            self.inactivity_timeout.as_secs()
                        )))
                    }
                    Ok(None) => break,
                    Ok(Some(chunk)) => chunk,
                },
            };

            match chunk {
                GenerationChunk::Heartbeat => continue,
                GenerationChunk::Delta(delta) if delta.is_empty() => continue,
                GenerationChunk::Delta(delta) => {
                    if metrics.first_token_ms.is_none() {
                        metrics.first_token_ms = Some(started.elapsed().as_millis() as u64);
                    }
                    metrics.fragments += 1;
                    metrics.chars += delta.len();

                    bus.emit(AgentEvent::PlannerTokens {
                        result_id: result_id.to_string(),
                        delta: delta.clone(),
                    });
                    bus.emit(AgentEvent::BlockDeltaText {
                        result_id: result_id.to_string(),
                        block_id: block_id.to_string(),
                        delta: delta.clone(),
                    });

                    match parser.push(&delta) {
                        ParseOutcome::Pending => {}
                        ParseOutcome::Candidate(fragment) => {
                            bus.emit(AgentEvent::PlannerDecisionPartial {
                                result_id: result_id.to_string(),
                                fragment,
                            });
                        }
                        ParseOutcome::Decision(decision) => {
                            return Ok(self.finalize(
                                decision, metrics, started, bus, result_id,
                            ));
                        }
                    }
                }
                GenerationChunk::Error(message) => {
                    return Err(PlannerError::InvalidOutput(format!(
                        "generator error: {message}"
                    )));
                }
            }
        }

        // Stream closed: one last parse of whatever is buffered.
        match parser.finish() {
            Some(decision) => Ok(self.finalize(decision, metrics, started, bus, result_id)),
            None => Err(PlannerError::InvalidOutput(
                "stream ended without a valid decision".to_string(),
            )),
        }
    }

    fn finalize(
        &self,
        decision: PlannerDecision,
        mut metrics: DecisionMetrics,
        started: Instant,
        bus: &EventBus,
        result_id: &str,
    ) -> FinalDecision {
        metrics.thinking_ms = started.elapsed().as_millis() as u64;
        bus.emit(AgentEvent::PlannerDecisionFinal {
            result_id: result_id.to_string(),
            decision: decision.clone(),
            metrics: metrics.clone(),
        });
        FinalDecision { decision, metrics }
    }
}
