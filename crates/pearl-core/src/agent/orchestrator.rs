//! The agent orchestrator — the single canonical agent loop.
//!
//! `AgentOrchestrator` wires the context hub, planner, tool registry, and
//! tool runner into one iterative cycle: build input, take a snapshot,
//! stream a decision, validate and execute the chosen tool, record the
//! observation, and repeat until the planner declares analysis complete or
//! a guard fires. Every state change streams as an [`AgentEvent`].
//!
//! ```text
//!  Init → Planning → ActionSelected → ToolExecuting → ObservationRecorded
//!           ↑                                               │
//!           └───────────────────────────────────────────────┘
//!         Planning → AnalysisComplete → Finalizing → Done | Aborted
//! ```
//!
//! Iterations are strictly sequential; the only concurrency inside one
//! iteration is the early-scoring task racing the decision stream and the
//! runner's progress forwarding.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::context::{
    ContextHub, Observation, PlannerInput, ResourceLister, SchemaSource, SnapshotPhase,
};
use crate::error::AgentError;
use crate::events::{AgentEvent, EventBus};
use crate::planner::{GenerationStream, PlanType, Planner, PlannerDecision, PlannerError};
use crate::storage::{ExecutionRepository, SnapshotRepository};
use crate::tools::{ToolContext, ToolRegistry, ToolRunner};

use super::blocks::{Block, Transcript};
use super::execution::{AgentExecution, ExecutionStatus};
use super::guards::{GuardConfig, LoopGuards};
use super::scoring::{suggestions_from, Scorer, ScoringOutcome, ScoringTask, SuggestionSink};

const TITLE_BUDGET: usize = 64;

/// Loop states, broadcast as `result.update` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopState {
    Init,
    Planning,
    ActionSelected,
    ToolExecuting,
    ObservationRecorded,
    AnalysisComplete,
    Finalizing,
    Done,
    Aborted,
}

impl LoopState {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Planning => "planning",
            Self::ActionSelected => "action_selected",
            Self::ToolExecuting => "tool_executing",
            Self::ObservationRecorded => "observation_recorded",
            Self::AnalysisComplete => "analysis_complete",
            Self::Finalizing => "finalizing",
            Self::Done => "done",
            Self::Aborted => "aborted",
        }
    }
}

/// Configuration for one orchestrator run.
#[derive(Clone)]
pub struct OrchestratorConfig {
    pub organization_id: String,
    pub plan_type: PlanType,
    /// System instructions handed to the context hub.
    pub instructions: String,
    /// Hard iteration ceiling.
    pub max_iterations: u32,
    pub guards: GuardConfig,
    /// How long to wait for a pending scoring task.
    pub scoring_grace: Duration,
    /// Planner stream inactivity ceiling.
    pub planner_inactivity_timeout: Duration,
    /// Character budget for tool summaries.
    pub summary_budget_chars: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            organization_id: String::new(),
            plan_type: PlanType::Research,
            instructions: String::new(),
            max_iterations: 30,
            guards: GuardConfig::default(),
            scoring_grace: Duration::from_millis(150),
            planner_inactivity_timeout: Duration::from_secs(120),
            summary_budget_chars: 30_000,
        }
    }
}

impl OrchestratorConfig {
    /// Derive a run config from the crate-level [`AgentConfig`].
    ///
    /// [`AgentConfig`]: crate::config::AgentConfig
    pub fn from_agent_config(
        organization_id: impl Into<String>,
        plan_type: PlanType,
        instructions: impl Into<String>,
        config: &crate::config::AgentConfig,
    ) -> Self {
        Self {
            organization_id: organization_id.into(),
            plan_type,
            instructions: instructions.into(),
            max_iterations: config.max_iterations,
            guards: config.guards,
            scoring_grace: config.scoring_grace(),
            planner_inactivity_timeout: config.planner_inactivity_timeout(),
            summary_budget_chars: config.tools.summary_budget_chars,
        }
    }
}

/// Shared services the orchestrator needs. All collaborators are traits;
/// nothing here is mutated by the loop.
pub struct OrchestratorServices {
    pub generator: Arc<dyn GenerationStream>,
    pub registry: Arc<ToolRegistry>,
    pub resources: Arc<dyn ResourceLister>,
    pub schema: Arc<dyn SchemaSource>,
    pub executions: Arc<dyn ExecutionRepository>,
    pub snapshots: Arc<dyn SnapshotRepository>,
    pub scorer: Option<Arc<dyn Scorer>>,
    pub suggestions: Option<Arc<dyn SuggestionSink>>,
}

/// Control handle returned alongside the primary event stream.
pub struct OrchestratorHandle {
    stop: CancellationToken,
    fanout: broadcast::Sender<AgentEvent>,
}

impl OrchestratorHandle {
    /// Request cancellation. Observed by the running tool attempt and the
    /// planner stream consumer; the loop transitions to `Aborted` with a
    /// best-effort final snapshot.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// Legacy fan-out subscription. Receives the same events, in the same
    /// order, as the primary stream.
    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.fanout.subscribe()
    }
}

/// The orchestrator — runs the complete agent loop for one request.
pub struct AgentOrchestrator {
    services: OrchestratorServices,
    config: OrchestratorConfig,
}

impl AgentOrchestrator {
    pub fn new(services: OrchestratorServices, config: OrchestratorConfig) -> Self {
        Self { services, config }
    }

    /// Start the loop.
    ///
    /// Returns `(event_receiver, handle)`. The loop runs as a spawned task
    /// and emits [`AgentEvent`]s for every state change; the handle carries
    /// the stop signal and the broadcast subscription.
    pub fn run(
        self,
        question: String,
    ) -> (mpsc::UnboundedReceiver<AgentEvent>, OrchestratorHandle) {
        let (bus, event_rx) = EventBus::new();
        let stop = CancellationToken::new();
        let handle = OrchestratorHandle {
            stop: stop.clone(),
            fanout: bus.fanout_handle(),
        };

        tokio::spawn(async move {
            self.run_inner(question, bus, stop).await;
        });

        (event_rx, handle)
    }

    async fn run_inner(self, question: String, bus: EventBus, stop: CancellationToken) {
        let OrchestratorServices {
            generator,
            registry,
            resources,
            schema,
            executions,
            snapshots,
            scorer,
            suggestions,
        } = self.services;
        let config = self.config;

        let mut execution =
            AgentExecution::new(&config.organization_id, config.plan_type, &question);
        let result_id = execution.id.clone();

        if let Err(error) = executions.create(&execution).await {
            tracing::warn!(%error, execution_id = %result_id, "failed to persist execution record");
        }

        bus.emit(AgentEvent::RunStarted {
            result_id: result_id.clone(),
        });
        bus.emit(AgentEvent::CompletionStarted {
            result_id: result_id.clone(),
        });
        emit_state(&bus, &result_id, LoopState::Init, 0);

        let mut hub = ContextHub::new(
            result_id.clone(),
            &config.organization_id,
            &config.instructions,
            resources,
            schema,
            snapshots,
        );
        hub.build_static().await;
        hub.snapshot(SnapshotPhase::Initial, 0).await;

        let planner = Planner::new(generator)
            .with_inactivity_timeout(config.planner_inactivity_timeout);
        let runner = ToolRunner::new().with_summary_budget(config.summary_budget_chars);
        let mut guards = LoopGuards::new(config.guards);
        let mut transcript = Transcript::new();

        let mut status: Option<ExecutionStatus> = None;
        let mut final_answer: Option<String> = None;
        let mut abort_error: Option<String> = None;
        let mut last_input: Option<PlannerInput> = None;
        let mut last_scoring: Option<ScoringOutcome> = None;

        'iterations: for iteration in 1..=config.max_iterations {
            if stop.is_cancelled() {
                status = Some(ExecutionStatus::Stopped);
                break;
            }

            execution.iterations = iteration;
            emit_state(&bus, &result_id, LoopState::Planning, iteration);

            let input = hub.build_input().await;
            hub.snapshot(SnapshotPhase::PreTool, iteration).await;
            last_input = Some(input.clone());

            // Early scoring races the decision stream; it never gates it.
            let early_scoring = scorer
                .as_ref()
                .map(|s| ScoringTask::spawn(s.clone(), input.clone()));

            let reasoning_block_id = format!("blk_{iteration}_reasoning");
            let block = transcript.upsert(Block::reasoning(&reasoning_block_id, ""));
            bus.emit(AgentEvent::BlockUpsert {
                result_id: result_id.clone(),
                block,
            });

            let decided = planner
                .decide(&input, &bus, &result_id, &reasoning_block_id, &stop)
                .await;

            if let Some(task) = early_scoring {
                if let Some(outcome) = task.take(config.scoring_grace).await {
                    last_scoring = Some(outcome);
                }
            }

            let final_decision = match decided {
                Err(PlannerError::Stopped) => {
                    status = Some(ExecutionStatus::Stopped);
                    break;
                }
                Err(PlannerError::InvalidOutput(message)) => {
                    tracing::warn!(iteration, %message, "invalid planner output");
                    bus.emit(AgentEvent::PlannerRetry {
                        result_id: result_id.clone(),
                        attempt: guards.invalid_streak() + 1,
                        error: message,
                    });
                    if let Some(trip) = guards.record_invalid_decision() {
                        abort_error =
                            Some(AgentError::CircuitBreakerTripped(trip.describe()).to_string());
                        status = Some(ExecutionStatus::Error);
                        break;
                    }
                    continue;
                }
                Ok(final_decision) => final_decision,
            };
            guards.record_valid_decision();

            match final_decision.decision {
                PlannerDecision::AnalysisComplete { final_answer: answer } => {
                    emit_state(&bus, &result_id, LoopState::AnalysisComplete, iteration);
                    let block = transcript
                        .upsert(Block::content(format!("blk_{iteration}_answer"), &answer));
                    bus.emit(AgentEvent::BlockUpsert {
                        result_id: result_id.clone(),
                        block,
                    });
                    final_answer = Some(answer);
                    status = Some(ExecutionStatus::Success);
                    break 'iterations;
                }
                PlannerDecision::Action {
                    tool_name,
                    tool_arguments,
                    reasoning,
                } => {
                    if !reasoning.is_empty() {
                        let block =
                            transcript.upsert(Block::reasoning(&reasoning_block_id, &reasoning));
                        bus.emit(AgentEvent::BlockUpsert {
                            result_id: result_id.clone(),
                            block,
                        });
                    }
                    emit_state(&bus, &result_id, LoopState::ActionSelected, iteration);

                    let tool_id = format!("call_{}", Uuid::new_v4());

                    // Per-tool breaker: the tool stays disabled for the
                    // rest of the run, but the run itself continues.
                    if guards.is_tool_disabled(&tool_name) {
                        let error = format!("tool '{tool_name}' disabled by circuit breaker");
                        reject_tool(
                            &bus, &mut hub, &result_id, &tool_id, &tool_name, &error, iteration,
                        )
                        .await;
                        continue;
                    }

                    // Validation happens before the runner is ever invoked;
                    // a disallowed tool never executes even once.
                    if let Err(validation) = registry.validate_for_plan_type(
                        &tool_name,
                        config.plan_type,
                        &config.organization_id,
                    ) {
                        let error = validation.to_string();
                        reject_tool(
                            &bus, &mut hub, &result_id, &tool_id, &tool_name, &error, iteration,
                        )
                        .await;
                        if guards.record_tool_failure(&tool_name).is_some() {
                            tracing::warn!(tool = %tool_name, "tool disabled after repeated rejections");
                        }
                        continue;
                    }

                    let handler = match registry.resolve(&tool_name) {
                        Ok(handler) => handler,
                        Err(error) => {
                            // Unreachable after validation, but never panic
                            // the loop over a registry race.
                            let error = error.to_string();
                            reject_tool(
                                &bus, &mut hub, &result_id, &tool_id, &tool_name, &error,
                                iteration,
                            )
                            .await;
                            continue;
                        }
                    };

                    emit_state(&bus, &result_id, LoopState::ToolExecuting, iteration);
                    let tool_block_id = format!("blk_{tool_id}");
                    let block = transcript.upsert(Block::tool_call(
                        &tool_block_id,
                        &tool_id,
                        &tool_name,
                        "running",
                    ));
                    bus.emit(AgentEvent::BlockUpsert {
                        result_id: result_id.clone(),
                        block,
                    });

                    let retry = registry.retry_policy_for(handler.as_ref());
                    let timeout = registry.timeout_policy_for(handler.as_ref());
                    // Rich runtime context is injected per call, never held
                    // as orchestrator-global state.
                    let ctx = ToolContext::new(&result_id, &config.organization_id)
                        .with_cancellation(stop.clone());

                    let run = runner
                        .run(
                            handler,
                            tool_arguments.clone(),
                            retry,
                            timeout,
                            ctx,
                            &tool_id,
                            &tool_block_id,
                            &bus,
                        )
                        .await;

                    emit_state(&bus, &result_id, LoopState::ObservationRecorded, iteration);
                    hub.push_observation(Observation {
                        tool_name: tool_name.clone(),
                        success: run.result.success,
                        summary: run.result.summary.clone(),
                        excerpt: run.result.payload.clone(),
                        recorded_at: Utc::now(),
                    });
                    hub.snapshot(SnapshotPhase::PostTool, iteration).await;

                    let block_status = if run.cancelled {
                        "cancelled"
                    } else if run.result.success {
                        "success"
                    } else {
                        "error"
                    };
                    let block = transcript.upsert(Block::tool_call(
                        &tool_block_id,
                        &tool_id,
                        format!("{tool_name}: {}", run.result.summary),
                        block_status,
                    ));
                    bus.emit(AgentEvent::BlockUpsert {
                        result_id: result_id.clone(),
                        block,
                    });

                    if run.cancelled {
                        status = Some(ExecutionStatus::Stopped);
                        break 'iterations;
                    }

                    if run.result.success {
                        if let Some(trip) = guards.record_tool_success(&tool_name, &tool_arguments)
                        {
                            abort_error = Some(
                                AgentError::CircuitBreakerTripped(trip.describe()).to_string(),
                            );
                            status = Some(ExecutionStatus::Error);
                            break 'iterations;
                        }
                    } else if let Some(trip) = guards.record_tool_failure(&tool_name) {
                        tracing::warn!(trip = %trip.describe(), "per-tool breaker tripped");
                    }
                }
            }
        }

        // Iteration ceiling: force finalization with a best-effort answer
        // rather than looping forever.
        let status = status.unwrap_or_else(|| {
            abort_error = Some(format!(
                "iteration ceiling of {} reached without a final answer",
                config.max_iterations
            ));
            ExecutionStatus::Error
        });

        if final_answer.is_none() && status != ExecutionStatus::Stopped {
            final_answer = Some(best_effort_answer(
                hub.observations(),
                abort_error.as_deref(),
            ));
        }

        emit_state(&bus, &result_id, LoopState::Finalizing, execution.iterations);
        hub.snapshot(SnapshotPhase::Final, execution.iterations).await;
        if hub.audit_degraded() {
            tracing::warn!(execution_id = %result_id, "audit trail degraded: one or more snapshots failed to persist");
        }

        execution.title = Some(derive_title(&question));

        // Late scoring + optional suggestion pass. Best-effort: failures
        // are logged, never propagated.
        let outcome = match (&scorer, &last_input) {
            (Some(scorer), Some(input)) => ScoringTask::spawn(scorer.clone(), input.clone())
                .take(config.scoring_grace)
                .await
                .or(last_scoring),
            _ => last_scoring,
        };
        if let (Some(outcome), Some(sink), Some(input)) = (outcome, &suggestions, &last_input) {
            if outcome.suggest_instructions {
                bus.emit(AgentEvent::InstructionsSuggestStarted {
                    result_id: result_id.clone(),
                });
                let proposed = suggestions_from(input);
                match sink.submit(&result_id, proposed.clone()).await {
                    Ok(()) => bus.emit(AgentEvent::InstructionsSuggestCompleted {
                        result_id: result_id.clone(),
                        suggestions: proposed,
                    }),
                    Err(error) => {
                        tracing::warn!(%error, "suggestion sink failed");
                        bus.emit(AgentEvent::InstructionsSuggestFailed {
                            result_id: result_id.clone(),
                            error: error.to_string(),
                        });
                    }
                }
            }
        }

        execution.finish(status, final_answer.clone());
        if let Err(error) = executions.finish(&execution).await {
            tracing::warn!(%error, execution_id = %result_id, "failed to persist terminal execution state");
        }

        let terminal = if status == ExecutionStatus::Success {
            LoopState::Done
        } else {
            LoopState::Aborted
        };
        emit_state(&bus, &result_id, terminal, execution.iterations);

        if let Some(error) = abort_error {
            bus.emit(AgentEvent::CompletionError {
                result_id: result_id.clone(),
                error,
            });
        }
        bus.emit(AgentEvent::RunFinished {
            result_id: result_id.clone(),
            status,
            iterations: execution.iterations,
        });
        bus.emit(AgentEvent::CompletionFinished {
            result_id,
            status,
            final_answer,
        });
    }
}

fn emit_state(bus: &EventBus, result_id: &str, state: LoopState, iteration: u32) {
    bus.emit(AgentEvent::ResultUpdate {
        result_id: result_id.to_string(),
        state: state.as_str().to_string(),
        iteration,
    });
}

/// Emit `tool.error` for a call that never reached the runner, and record
/// the failure as an observation so the planner sees it next iteration.
async fn reject_tool(
    bus: &EventBus,
    hub: &mut ContextHub,
    result_id: &str,
    tool_id: &str,
    tool_name: &str,
    error: &str,
    iteration: u32,
) {
    bus.emit(AgentEvent::ToolError {
        result_id: result_id.to_string(),
        tool_id: tool_id.to_string(),
        tool_name: tool_name.to_string(),
        error: error.to_string(),
    });
    hub.push_observation(Observation {
        tool_name: tool_name.to_string(),
        success: false,
        summary: error.to_string(),
        excerpt: serde_json::Value::Null,
        recorded_at: Utc::now(),
    });
    hub.snapshot(SnapshotPhase::PostTool, iteration).await;
}

/// Compose a partial answer from whatever the run learned.
fn best_effort_answer(observations: &[Observation], reason: Option<&str>) -> String {
    let mut answer = String::from("The analysis could not be completed");
    if let Some(reason) = reason {
        answer.push_str(&format!(" ({reason})"));
    }
    answer.push('.');

    if let Some(last_success) = observations.iter().rev().find(|o| o.success) {
        answer.push_str(&format!(
            " Last successful step: {} — {}",
            last_success.tool_name, last_success.summary
        ));
    }
    answer
}

/// Derive a short session title from the question.
fn derive_title(question: &str) -> String {
    let first_line = question.lines().next().unwrap_or("").trim();
    if first_line.len() <= TITLE_BUDGET {
        return first_line.to_string();
    }
    let mut boundary = TITLE_BUDGET;
    while boundary > 0 && !first_line.is_char_boundary(boundary) {
        boundary -= 1;
    }
    format!("{}…", &first_line[..boundary].trim_end())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{FileDescriptor, Message, ResourceDescriptor};
    use crate::error::ToolError;
    use crate::planner::GenerationChunk;
    use crate::storage::MemoryStore;
    use crate::tools::{ToolCapability, ToolHandler, ToolOutcome};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::{json, Value};
    use std::collections::VecDeque;

    /// Replays one chunk script per planning pass.
    struct ScriptedGenerator {
        scripts: Mutex<VecDeque<Vec<GenerationChunk>>>,
    }

    impl ScriptedGenerator {
        fn new(scripts: Vec<Vec<GenerationChunk>>) -> Self {
            Self {
                scripts: Mutex::new(scripts.into()),
            }
        }
    }

    #[async_trait]
    impl GenerationStream for ScriptedGenerator {
        async fn generate(
            &self,
            _input: &PlannerInput,
        ) -> anyhow::Result<mpsc::UnboundedReceiver<GenerationChunk>> {
            let script = self.scripts.lock().pop_front().unwrap_or_default();
            let (tx, rx) = mpsc::unbounded_channel();
            for chunk in script {
                let _ = tx.send(chunk);
            }
            Ok(rx)
        }
    }

    fn action_script(tool: &str, args: Value) -> Vec<GenerationChunk> {
        vec![GenerationChunk::Delta(
            json!({"plan_type": "action", "tool_name": tool, "tool_arguments": args})
                .to_string(),
        )]
    }

    fn complete_script(answer: &str) -> Vec<GenerationChunk> {
        vec![GenerationChunk::Delta(
            json!({"plan_type": "analysis_complete", "final_answer": answer}).to_string(),
        )]
    }

    fn garbage_script() -> Vec<GenerationChunk> {
        vec![GenerationChunk::Delta("not json at all".to_string())]
    }

    struct EchoTool;

    #[async_trait]
    impl ToolHandler for EchoTool {
        fn name(&self) -> &str {
            "query_db"
        }
        fn description(&self) -> &str {
            "run a query"
        }
        fn input_schema(&self) -> Value {
            json!({"type": "object"})
        }
        fn capability(&self) -> ToolCapability {
            ToolCapability::Research
        }
        async fn execute(
            &self,
            arguments: Value,
            _ctx: &crate::tools::ToolContext,
        ) -> Result<ToolOutcome, ToolError> {
            Ok(ToolOutcome::new("1 row", json!({"echo": arguments})))
        }
    }

    struct HangingTool;

    #[async_trait]
    impl ToolHandler for HangingTool {
        fn name(&self) -> &str {
            "slow_export"
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
            ctx: &crate::tools::ToolContext,
        ) -> Result<ToolOutcome, ToolError> {
            ctx.cancellation.cancelled().await;
            Err(ToolError::Fatal("cancelled".to_string()))
        }
    }

    struct StubLister;

    #[async_trait]
    impl ResourceLister for StubLister {
        async fn history_summary(&self, _org: &str) -> anyhow::Result<Option<String>> {
            Ok(None)
        }
        async fn recent_messages(&self, _org: &str) -> anyhow::Result<Vec<Message>> {
            Ok(Vec::new())
        }
        async fn list_resources(&self, _org: &str) -> anyhow::Result<Vec<ResourceDescriptor>> {
            Ok(Vec::new())
        }
    }

    struct StubSchema;

    #[async_trait]
    impl SchemaSource for StubSchema {
        async fn schema_excerpt(&self, _org: &str) -> anyhow::Result<Option<String>> {
            Ok(Some("orders(id, total)".to_string()))
        }
        async fn list_files(&self, _org: &str) -> anyhow::Result<Vec<FileDescriptor>> {
            Ok(Vec::new())
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        config: OrchestratorConfig,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                store: Arc::new(MemoryStore::new()),
                config: OrchestratorConfig {
                    organization_id: "org_1".to_string(),
                    plan_type: PlanType::Research,
                    instructions: "answer with data".to_string(),
                    max_iterations: 10,
                    scoring_grace: Duration::from_millis(50),
                    planner_inactivity_timeout: Duration::from_secs(5),
                    ..Default::default()
                },
            }
        }

        fn orchestrator(
            &self,
            scripts: Vec<Vec<GenerationChunk>>,
            tools: Vec<Arc<dyn ToolHandler>>,
        ) -> AgentOrchestrator {
            let mut registry = ToolRegistry::new().with_defaults(
                crate::tools::RetryPolicy::none(),
                crate::tools::TimeoutPolicy { per_attempt_ms: 2_000 },
            );
            for tool in tools {
                registry.register(tool);
            }

            AgentOrchestrator::new(
                OrchestratorServices {
                    generator: Arc::new(ScriptedGenerator::new(scripts)),
                    registry: Arc::new(registry),
                    resources: Arc::new(StubLister),
                    schema: Arc::new(StubSchema),
                    executions: self.store.clone(),
                    snapshots: self.store.clone(),
                    scorer: None,
                    suggestions: None,
                },
                self.config.clone(),
            )
        }
    }

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "warn".into()),
            )
            .with_test_writer()
            .try_init();
    }

    /// Collect events until the terminal `completion.finished`.
    async fn collect(mut rx: mpsc::UnboundedReceiver<AgentEvent>) -> Vec<AgentEvent> {
        init_tracing();
        let mut events = Vec::new();
        loop {
            let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
                .await
                .expect("run did not terminate")
                .expect("stream closed before completion.finished");
            let done = event.wire_name() == "completion.finished";
            events.push(event);
            if done {
                return events;
            }
        }
    }

    fn count(events: &[AgentEvent], name: &str) -> usize {
        events.iter().filter(|e| e.wire_name() == name).count()
    }

    fn finished_status(events: &[AgentEvent]) -> ExecutionStatus {
        events
            .iter()
            .find_map(|e| match e {
                AgentEvent::RunFinished { status, .. } => Some(*status),
                _ => None,
            })
            .expect("no run.finished event")
    }

    fn snapshot_phases(store: &MemoryStore, events: &[AgentEvent]) -> Vec<SnapshotPhase> {
        let result_id = events[0].result_id().to_string();
        store
            .snapshots(&result_id)
            .iter()
            .map(|s| s.phase)
            .collect()
    }

    // The planner answers immediately, without any tool call.
    #[tokio::test]
    async fn immediate_analysis_complete() {
        let fixture = Fixture::new();
        let orchestrator = fixture.orchestrator(
            vec![complete_script("Revenue grew 12% QoQ.")],
            vec![Arc::new(EchoTool)],
        );
        let (rx, _handle) = orchestrator.run("how did revenue trend?".to_string());
        let events = collect(rx).await;

        assert_eq!(finished_status(&events), ExecutionStatus::Success);
        assert_eq!(count(&events, "run.finished"), 1);
        assert_eq!(count(&events, "completion.finished"), 1);
        assert_eq!(count(&events, "tool.started"), 0);

        let phases = snapshot_phases(&fixture.store, &events);
        assert_eq!(
            phases,
            vec![
                SnapshotPhase::Initial,
                SnapshotPhase::PreTool,
                SnapshotPhase::Final
            ]
        );

        let executions = fixture.store.executions();
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].status, Some(ExecutionStatus::Success));
        assert_eq!(
            executions[0].final_answer.as_deref(),
            Some("Revenue grew 12% QoQ.")
        );
        assert_eq!(executions[0].iterations, 1);
    }

    // One tool round trip, then completion.
    #[tokio::test]
    async fn tool_call_then_completion() {
        let fixture = Fixture::new();
        let orchestrator = fixture.orchestrator(
            vec![
                action_script("query_db", json!({"sql": "select count(*) from orders"})),
                complete_script("There are 42 orders."),
            ],
            vec![Arc::new(EchoTool)],
        );
        let (rx, _handle) = orchestrator.run("how many orders?".to_string());
        let events = collect(rx).await;

        assert_eq!(finished_status(&events), ExecutionStatus::Success);
        assert_eq!(count(&events, "tool.started"), 1);
        assert_eq!(count(&events, "tool.finished"), 1);
        assert_eq!(count(&events, "tool.error"), 0);

        let phases = snapshot_phases(&fixture.store, &events);
        assert_eq!(
            phases,
            vec![
                SnapshotPhase::Initial,
                SnapshotPhase::PreTool,
                SnapshotPhase::PostTool,
                SnapshotPhase::PreTool,
                SnapshotPhase::Final
            ]
        );
    }

    // A tool missing from the catalog is rejected without executing and
    // the loop proceeds to the next planning pass.
    #[tokio::test]
    async fn unknown_tool_is_rejected_without_executing() {
        let fixture = Fixture::new();
        let orchestrator = fixture.orchestrator(
            vec![
                action_script("query_db", json!({"sql": "select 1"})),
                complete_script("done"),
            ],
            vec![], // nothing registered
        );
        let (rx, _handle) = orchestrator.run("q".to_string());
        let events = collect(rx).await;

        assert_eq!(count(&events, "tool.error"), 1);
        assert_eq!(count(&events, "tool.started"), 0);
        assert_eq!(finished_status(&events), ExecutionStatus::Success);
    }

    // A research-plan run may not invoke an action-only tool.
    #[tokio::test]
    async fn plan_type_violation_never_executes() {
        struct PublishTool;

        #[async_trait]
        impl ToolHandler for PublishTool {
            fn name(&self) -> &str {
                "publish_dashboard"
            }
            fn description(&self) -> &str {
                "publishes"
            }
            fn input_schema(&self) -> Value {
                json!({"type": "object"})
            }
            fn capability(&self) -> ToolCapability {
                ToolCapability::Action
            }
            async fn execute(
                &self,
                _arguments: Value,
                _ctx: &crate::tools::ToolContext,
            ) -> Result<ToolOutcome, ToolError> {
                panic!("must never run under a research plan");
            }
        }

        let fixture = Fixture::new();
        let orchestrator = fixture.orchestrator(
            vec![
                action_script("publish_dashboard", json!({})),
                complete_script("done"),
            ],
            vec![Arc::new(PublishTool)],
        );
        let (rx, _handle) = orchestrator.run("q".to_string());
        let events = collect(rx).await;

        assert_eq!(count(&events, "tool.error"), 1);
        assert_eq!(count(&events, "tool.started"), 0);
        assert_eq!(finished_status(&events), ExecutionStatus::Success);
    }

    // The planner never yields a valid decision.
    #[tokio::test]
    async fn consecutive_invalid_output_trips_breaker() {
        let fixture = Fixture::new();
        let orchestrator = fixture.orchestrator(
            vec![garbage_script(), garbage_script(), garbage_script()],
            vec![Arc::new(EchoTool)],
        );
        let (rx, _handle) = orchestrator.run("q".to_string());
        let events = collect(rx).await;

        assert_eq!(finished_status(&events), ExecutionStatus::Error);
        assert_eq!(count(&events, "planner.retry"), 3);
        assert_eq!(count(&events, "completion.error"), 1);
        assert_eq!(count(&events, "run.finished"), 1);

        let phases = snapshot_phases(&fixture.store, &events);
        assert_eq!(
            phases.iter().filter(|p| **p == SnapshotPhase::Final).count(),
            1
        );
    }

    // The infinite-success-loop guard.
    #[tokio::test]
    async fn repeated_identical_success_trips_breaker() {
        let fixture = Fixture::new();
        let args = json!({"sql": "select 1"});
        let orchestrator = fixture.orchestrator(
            vec![
                action_script("query_db", args.clone()),
                action_script("query_db", args.clone()),
                action_script("query_db", args.clone()),
                complete_script("never reached"),
            ],
            vec![Arc::new(EchoTool)],
        );
        let (rx, _handle) = orchestrator.run("q".to_string());
        let events = collect(rx).await;

        assert_eq!(finished_status(&events), ExecutionStatus::Error);
        let error = events
            .iter()
            .find_map(|e| match e {
                AgentEvent::CompletionError { error, .. } => Some(error.clone()),
                _ => None,
            })
            .unwrap();
        assert!(error.contains("identical arguments"));
        assert_eq!(count(&events, "tool.finished"), 3);
    }

    // Hard iteration ceiling forces finalization.
    #[tokio::test]
    async fn iteration_ceiling_forces_finalizing() {
        let mut fixture = Fixture::new();
        fixture.config.max_iterations = 3;
        // Different arguments each round so the repeat-success guard
        // stays quiet.
        let orchestrator = fixture.orchestrator(
            vec![
                action_script("query_db", json!({"sql": "select 1"})),
                action_script("query_db", json!({"sql": "select 2"})),
                action_script("query_db", json!({"sql": "select 3"})),
            ],
            vec![Arc::new(EchoTool)],
        );
        let (rx, _handle) = orchestrator.run("q".to_string());
        let events = collect(rx).await;

        assert_eq!(finished_status(&events), ExecutionStatus::Error);
        let answer = events
            .iter()
            .find_map(|e| match e {
                AgentEvent::CompletionFinished { final_answer, .. } => final_answer.clone(),
                _ => None,
            })
            .unwrap();
        assert!(answer.contains("could not be completed"));

        let executions = fixture.store.executions();
        assert_eq!(executions[0].iterations, 3);

        let phases = snapshot_phases(&fixture.store, &events);
        assert_eq!(
            phases.iter().filter(|p| **p == SnapshotPhase::Final).count(),
            1
        );
    }

    // External stop while a tool is in flight.
    #[tokio::test]
    async fn external_stop_mid_tool_finalizes_cleanly() {
        let fixture = Fixture::new();
        let orchestrator = fixture.orchestrator(
            vec![action_script("slow_export", json!({}))],
            vec![Arc::new(HangingTool)],
        );
        let (rx, handle) = orchestrator.run("q".to_string());

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            handle.stop();
        });

        let events = collect(rx).await;
        assert_eq!(finished_status(&events), ExecutionStatus::Stopped);
        assert_eq!(count(&events, "tool.started"), 1);
        assert_eq!(count(&events, "tool.finished"), 0);

        let phases = snapshot_phases(&fixture.store, &events);
        assert_eq!(
            phases.iter().filter(|p| **p == SnapshotPhase::Final).count(),
            1
        );

        let executions = fixture.store.executions();
        assert_eq!(executions[0].status, Some(ExecutionStatus::Stopped));
    }

    // Both delivery channels observe the same ordered event stream.
    #[tokio::test]
    async fn broadcast_channel_mirrors_primary() {
        let fixture = Fixture::new();
        let orchestrator =
            fixture.orchestrator(vec![complete_script("done")], vec![Arc::new(EchoTool)]);
        let (rx, handle) = orchestrator.run("q".to_string());
        let mut fanout = handle.subscribe();

        let events = collect(rx).await;

        let mut mirrored = Vec::new();
        while mirrored.len() < events.len() {
            match fanout.recv().await {
                Ok(event) => mirrored.push(event.wire_name().to_string()),
                Err(_) => break,
            }
        }
        let primary: Vec<_> = events.iter().map(|e| e.wire_name().to_string()).collect();
        assert_eq!(mirrored, primary);
    }

    #[test]
    fn title_is_first_line_truncated() {
        assert_eq!(derive_title("short question\nmore"), "short question");
        let long = "x".repeat(200);
        let title = derive_title(&long);
        assert!(title.chars().count() <= TITLE_BUDGET + 1);
        assert!(title.ends_with('…'));
    }
}
