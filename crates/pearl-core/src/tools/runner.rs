//! Tool execution with bounded attempts and bounded time.
//!
//! The runner executes a resolved handler under a [`RetryPolicy`] and
//! [`TimeoutPolicy`], forwards handler signals onto the event stream, and
//! normalizes every outcome — success, exhausted retries, timeout,
//! cancellation — into one uniform [`ToolResult`] so the orchestrator never
//! branches on tool-specific shapes.
//!
//! Event contract per logical call: one `tool.started`, zero or more
//! `tool.progress` / `tool.partial` / domain events, exactly one terminal
//! `tool.finished` or `tool.error`.

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::ToolError;
use crate::events::{AgentEvent, EventBus};
use crate::tools::policy::{RetryPolicy, TimeoutPolicy};
use crate::tools::registry::{ToolContext, ToolHandler, ToolSignal};

const DEFAULT_SUMMARY_BUDGET: usize = 30_000;

/// Lifecycle of one attempt: `Pending` → `Running` → terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Pending,
    Running,
    Success,
    Error,
    Timeout,
    Cancelled,
}

/// One attempt to run a tool. A single logical call produces 1..N of these
/// under its retry policy.
#[derive(Debug, Clone, Serialize)]
pub struct ToolExecution {
    pub tool_name: String,
    pub arguments: Value,
    pub status: AttemptStatus,
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub summary: String,
    pub payload: Option<Value>,
}

impl ToolExecution {
    fn begin(tool_name: String, arguments: Value, attempt: u32) -> Self {
        Self {
            tool_name,
            arguments,
            status: AttemptStatus::Pending,
            attempt,
            started_at: Utc::now(),
            duration_ms: 0,
            summary: String::new(),
            payload: None,
        }
    }
}

/// Uniform result shape handed to the orchestrator.
#[derive(Debug, Clone, Serialize)]
pub struct ToolResult {
    pub success: bool,
    pub summary: String,
    pub payload: Value,
}

/// Everything the orchestrator needs after a logical tool call.
#[derive(Debug)]
pub struct ToolRun {
    pub result: ToolResult,
    pub attempts: Vec<ToolExecution>,
    /// External stop observed while the call was in flight.
    pub cancelled: bool,
}

/// Executes tool handlers under retry/timeout discipline.
pub struct ToolRunner {
    summary_budget: usize,
}

impl Default for ToolRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRunner {
    pub fn new() -> Self {
        Self {
            summary_budget: DEFAULT_SUMMARY_BUDGET,
        }
    }

    pub fn with_summary_budget(mut self, chars: usize) -> Self {
        self.summary_budget = chars;
        self
    }

    /// Run one logical tool call.
    ///
    /// `base_ctx` carries the per-call runtime context (execution id, org,
    /// cancellation token); the runner derives a per-attempt context from
    /// it with the attempt number and signal channel filled in.
    #[allow(clippy::too_many_arguments)]
    pub async fn run(
        &self,
        handler: Arc<dyn ToolHandler>,
        arguments: Value,
        retry: RetryPolicy,
        timeout: TimeoutPolicy,
        base_ctx: ToolContext,
        tool_id: &str,
        block_id: &str,
        bus: &EventBus,
    ) -> ToolRun {
        let tool_name = handler.name().to_string();
        let result_id = base_ctx.execution_id.clone();
        let cancellation = base_ctx.cancellation.clone();

        bus.emit(AgentEvent::ToolStarted {
            result_id: result_id.clone(),
            tool_id: tool_id.to_string(),
            tool_name: tool_name.clone(),
        });

        let (signal_tx, signal_rx) = mpsc::unbounded_channel::<ToolSignal>();
        let forwarder = spawn_signal_forwarder(
            signal_rx,
            bus.clone(),
            result_id.clone(),
            tool_id.to_string(),
            block_id.to_string(),
        );

        let mut attempts: Vec<ToolExecution> = Vec::new();
        let mut cancelled = false;
        let mut last_error = String::new();

        'attempts: for attempt in 1..=retry.max_attempts.max(1) {
            if let Some(delay) = retry.delay_before(attempt) {
                tokio::select! {
                    biased;
                    _ = cancellation.cancelled() => {
                        cancelled = true;
                        break 'attempts;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            let attempt_token = cancellation.child_token();
            let ctx = base_ctx
                .clone()
                .with_cancellation(attempt_token.clone())
                .with_signals(signal_tx.clone())
                .with_attempt(attempt);

            let mut record = ToolExecution::begin(tool_name.clone(), arguments.clone(), attempt);
            record.status = AttemptStatus::Running;
            let started = Instant::now();

            let outcome = tokio::select! {
                biased;
                _ = cancellation.cancelled() => {
                    attempt_token.cancel();
                    Err(None)
                }
                attempt_result = tokio::time::timeout(
                    timeout.per_attempt(),
                    handler.execute(arguments.clone(), &ctx),
                ) => match attempt_result {
                    Ok(Ok(outcome)) => Ok(outcome),
                    Ok(Err(error)) => Err(Some(error)),
                    Err(_elapsed) => {
                        // Signal the handler cooperatively even though the
                        // future has already been dropped at the deadline.
                        attempt_token.cancel();
                        Err(Some(ToolError::Timeout))
                    }
                },
            };

            record.duration_ms = started.elapsed().as_millis() as u64;

            match outcome {
                Ok(outcome) => {
                    let summary = truncate(&outcome.summary, self.summary_budget);
                    record.status = AttemptStatus::Success;
                    record.summary = summary.clone();
                    record.payload = Some(outcome.payload.clone());
                    let duration_ms = record.duration_ms;
                    attempts.push(record);

                    // The context holds a sender clone; both must go before
                    // the forwarder can observe channel close.
                    drop(ctx);
                    drop(signal_tx);
                    let _ = forwarder.await;

                    bus.emit(AgentEvent::ToolFinished {
                        result_id,
                        tool_id: tool_id.to_string(),
                        tool_name,
                        attempt,
                        duration_ms,
                        summary: summary.clone(),
                    });
                    return ToolRun {
                        result: ToolResult {
                            success: true,
                            summary,
                            payload: outcome.payload,
                        },
                        attempts,
                        cancelled: false,
                    };
                }
                Err(None) => {
                    record.status = AttemptStatus::Cancelled;
                    record.summary = "cancelled by external stop".to_string();
                    attempts.push(record);
                    cancelled = true;
                    break 'attempts;
                }
                Err(Some(error)) => {
                    record.status = match error {
                        ToolError::Timeout => AttemptStatus::Timeout,
                        _ => AttemptStatus::Error,
                    };
                    last_error = error.to_string();
                    tracing::warn!(
                        tool = %tool_name,
                        attempt,
                        error = %last_error,
                        retryable = error.is_retryable(),
                        "tool attempt failed"
                    );
                    record.summary = truncate(&last_error, self.summary_budget);
                    attempts.push(record);

                    if !error.is_retryable() {
                        break 'attempts;
                    }
                }
            }
        }

        drop(signal_tx);
        let _ = forwarder.await;

        let summary = if cancelled {
            "cancelled by external stop".to_string()
        } else {
            truncate(&last_error, self.summary_budget)
        };

        bus.emit(AgentEvent::ToolError {
            result_id,
            tool_id: tool_id.to_string(),
            tool_name,
            error: summary.clone(),
        });

        ToolRun {
            result: ToolResult {
                success: false,
                summary,
                payload: Value::Null,
            },
            attempts,
            cancelled,
        }
    }
}

/// Forward handler signals to the event stream until the channel closes.
fn spawn_signal_forwarder(
    mut rx: mpsc::UnboundedReceiver<ToolSignal>,
    bus: EventBus,
    result_id: String,
    tool_id: String,
    block_id: String,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(signal) = rx.recv().await {
            let event = match signal {
                ToolSignal::Progress { stage } => AgentEvent::ToolProgress {
                    result_id: result_id.clone(),
                    tool_id: tool_id.clone(),
                    stage,
                },
                ToolSignal::Partial { delta } => AgentEvent::ToolPartial {
                    result_id: result_id.clone(),
                    tool_id: tool_id.clone(),
                    delta,
                },
                ToolSignal::QueryCreated { query_id } => AgentEvent::QueryCreated {
                    result_id: result_id.clone(),
                    tool_id: tool_id.clone(),
                    query_id,
                },
                ToolSignal::VisualizationCreated { visualization_id } => {
                    AgentEvent::VisualizationCreated {
                        result_id: result_id.clone(),
                        tool_id: tool_id.clone(),
                        visualization_id,
                    }
                }
                ToolSignal::VisualizationUpdated { visualization_id } => {
                    AgentEvent::VisualizationUpdated {
                        result_id: result_id.clone(),
                        tool_id: tool_id.clone(),
                        visualization_id,
                    }
                }
                ToolSignal::DataModelCompleted { model_id } => AgentEvent::DataModelCompleted {
                    result_id: result_id.clone(),
                    tool_id: tool_id.clone(),
                    model_id,
                },
                ToolSignal::Artifact { artifact } => AgentEvent::BlockDeltaArtifact {
                    result_id: result_id.clone(),
                    block_id: block_id.clone(),
                    artifact,
                },
            };
            bus.emit(event);
        }
    })
}

/// Cap a summary at `budget` characters, breaking on a line boundary.
fn truncate(text: &str, budget: usize) -> String {
    if text.len() <= budget {
        return text.to_string();
    }
    let mut boundary = budget;
    while boundary > 0 && !text.is_char_boundary(boundary) {
        boundary -= 1;
    }
    let truncated = &text[..boundary];
    let break_point = truncated.rfind('\n').unwrap_or(boundary);
    let clean = &text[..break_point];
    format!(
        "{}\n\n[... truncated: {} chars -> {} chars ...]",
        clean,
        text.len(),
        clean.len()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::policy::Backoff;
    use crate::tools::registry::{ToolCapability, ToolOutcome};
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    /// Sleeps `slow_ms` on attempt 1, then succeeds quickly.
    struct SlowFirstAttempt {
        slow_ms: u64,
    }

    #[async_trait]
    impl ToolHandler for SlowFirstAttempt {
        fn name(&self) -> &str {
            "slow_first"
        }
        fn description(&self) -> &str {
            "slow on attempt 1"
        }
        fn input_schema(&self) -> Value {
            json!({"type": "object"})
        }
        fn capability(&self) -> ToolCapability {
            ToolCapability::Research
        }
        async fn execute(
            &self,
            _arguments: Value,
            ctx: &ToolContext,
        ) -> Result<ToolOutcome, ToolError> {
            if ctx.attempt == 1 {
                tokio::time::sleep(Duration::from_millis(self.slow_ms)).await;
            }
            Ok(ToolOutcome::new("done", json!({"rows": 3})))
        }
    }

    struct FailWith(fn() -> ToolError);

    #[async_trait]
    impl ToolHandler for FailWith {
        fn name(&self) -> &str {
            "failing"
        }
        fn description(&self) -> &str {
            "always fails"
        }
        fn input_schema(&self) -> Value {
            json!({"type": "object"})
        }
        fn capability(&self) -> ToolCapability {
            ToolCapability::Research
        }
        async fn execute(
            &self,
            _arguments: Value,
            _ctx: &ToolContext,
        ) -> Result<ToolOutcome, ToolError> {
            Err((self.0)())
        }
    }

    struct Chatty;

    #[async_trait]
    impl ToolHandler for Chatty {
        fn name(&self) -> &str {
            "chatty"
        }
        fn description(&self) -> &str {
            "signals progress"
        }
        fn input_schema(&self) -> Value {
            json!({"type": "object"})
        }
        fn capability(&self) -> ToolCapability {
            ToolCapability::Research
        }
        async fn execute(
            &self,
            _arguments: Value,
            ctx: &ToolContext,
        ) -> Result<ToolOutcome, ToolError> {
            ctx.progress("compiling sql");
            ctx.partial("partial rows");
            ctx.signal(ToolSignal::QueryCreated {
                query_id: "q_1".to_string(),
            });
            ctx.signal(ToolSignal::VisualizationCreated {
                visualization_id: "viz_1".to_string(),
            });
            ctx.signal(ToolSignal::Artifact {
                artifact: json!({"kind": "bar_chart"}),
            });
            Ok(ToolOutcome::new("3 rows", json!({"rows": 3})))
        }
    }

    struct Hanging;

    #[async_trait]
    impl ToolHandler for Hanging {
        fn name(&self) -> &str {
            "hanging"
        }
        fn description(&self) -> &str {
            "waits for cancellation"
        }
        fn input_schema(&self) -> Value {
            json!({"type": "object"})
        }
        fn capability(&self) -> ToolCapability {
            ToolCapability::Research
        }
        async fn execute(
            &self,
            _arguments: Value,
            ctx: &ToolContext,
        ) -> Result<ToolOutcome, ToolError> {
            ctx.cancellation.cancelled().await;
            Err(ToolError::Fatal("observed cancellation".to_string()))
        }
    }

    fn no_backoff(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff: Backoff::None,
            jitter: false,
        }
    }

    fn short_timeout(ms: u64) -> TimeoutPolicy {
        TimeoutPolicy { per_attempt_ms: ms }
    }

    async fn drain(mut rx: mpsc::UnboundedReceiver<AgentEvent>) -> Vec<AgentEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn success_on_first_attempt() {
        let (bus, rx) = EventBus::new();
        let run = ToolRunner::new()
            .run(
                Arc::new(Chatty),
                json!({}),
                no_backoff(3),
                short_timeout(1_000),
                ToolContext::new("exec", "org"),
                "call_1",
                "blk_1",
                &bus,
            )
            .await;

        assert!(run.result.success);
        assert_eq!(run.attempts.len(), 1);
        assert_eq!(run.attempts[0].status, AttemptStatus::Success);

        let events = drain(rx).await;
        let names: Vec<_> = events.iter().map(|e| e.wire_name()).collect();
        assert_eq!(names.iter().filter(|n| **n == "tool.started").count(), 1);
        assert_eq!(names.iter().filter(|n| **n == "tool.finished").count(), 1);
        assert!(names.contains(&"tool.progress"));
        assert!(names.contains(&"tool.partial"));
        assert!(names.contains(&"query.created"));
        assert!(names.contains(&"visualization.created"));
        assert!(names.contains(&"block.delta.artifact"));
    }

    #[tokio::test]
    async fn timeout_consumes_attempt_then_retry_succeeds() {
        let (bus, rx) = EventBus::new();
        let run = ToolRunner::new()
            .run(
                Arc::new(SlowFirstAttempt { slow_ms: 500 }),
                json!({}),
                no_backoff(3),
                short_timeout(50),
                ToolContext::new("exec", "org"),
                "call_1",
                "blk_1",
                &bus,
            )
            .await;

        assert!(run.result.success);
        assert_eq!(run.attempts.len(), 2);
        assert_eq!(run.attempts[0].status, AttemptStatus::Timeout);
        assert_eq!(run.attempts[1].status, AttemptStatus::Success);
        assert_eq!(run.attempts[1].attempt, 2);

        let events = drain(rx).await;
        let finished: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                AgentEvent::ToolFinished { attempt, .. } => Some(*attempt),
                _ => None,
            })
            .collect();
        assert_eq!(finished, vec![2]);
        assert!(!events.iter().any(|e| e.wire_name() == "tool.error"));
    }

    #[tokio::test]
    async fn non_retryable_error_terminates_on_first_attempt() {
        let (bus, rx) = EventBus::new();
        let run = ToolRunner::new()
            .run(
                Arc::new(FailWith(|| ToolError::InvalidArguments("bad sql".into()))),
                json!({}),
                no_backoff(3),
                short_timeout(1_000),
                ToolContext::new("exec", "org"),
                "call_1",
                "blk_1",
                &bus,
            )
            .await;

        assert!(!run.result.success);
        assert_eq!(run.attempts.len(), 1);

        let events = drain(rx).await;
        assert_eq!(
            events
                .iter()
                .filter(|e| e.wire_name() == "tool.error")
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn retryable_errors_exhaust_all_attempts() {
        let (bus, rx) = EventBus::new();
        let run = ToolRunner::new()
            .run(
                Arc::new(FailWith(|| ToolError::Transient("connection reset".into()))),
                json!({}),
                no_backoff(3),
                short_timeout(1_000),
                ToolContext::new("exec", "org"),
                "call_1",
                "blk_1",
                &bus,
            )
            .await;

        assert!(!run.result.success);
        assert_eq!(run.attempts.len(), 3);
        assert!(run.attempts.iter().all(|a| a.status == AttemptStatus::Error));

        let events = drain(rx).await;
        assert_eq!(
            events
                .iter()
                .filter(|e| e.wire_name() == "tool.error")
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn external_stop_marks_attempt_cancelled() {
        let (bus, _rx) = EventBus::new();
        let token = CancellationToken::new();
        let ctx = ToolContext::new("exec", "org").with_cancellation(token.clone());

        let stopper = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            stopper.cancel();
        });

        let run = ToolRunner::new()
            .run(
                Arc::new(Hanging),
                json!({}),
                no_backoff(3),
                short_timeout(5_000),
                ctx,
                "call_1",
                "blk_1",
                &bus,
            )
            .await;

        assert!(run.cancelled);
        assert!(!run.result.success);
        assert_eq!(run.attempts.len(), 1);
        assert_eq!(run.attempts[0].status, AttemptStatus::Cancelled);
    }

    #[test]
    fn truncate_breaks_on_line_boundary() {
        let text = "line one\nline two\nline three";
        let truncated = truncate(text, 12);
        assert!(truncated.starts_with("line one"));
        assert!(truncated.contains("truncated"));
    }
}
