//! Agent loop for Pearl.
//!
//! ## Orchestrator (the canonical loop)
//! - `AgentOrchestrator` - iterative plan/execute cycle with snapshots,
//!   guards, and event streaming
//! - `OrchestratorConfig` / `OrchestratorServices` - configuration and
//!   collaborator wiring
//! - `OrchestratorHandle` - stop signal + legacy fan-out subscription
//!
//! ## Records
//! - `AgentExecution` / `ExecutionStatus` - one run of the loop
//! - `Block` / `Transcript` - upsert-only transcript units
//!
//! ## Guards
//! - `LoopGuards` / `GuardConfig` - invalid-output bound, per-tool failure
//!   breaker, repeated-identical-success guard
//!
//! ## Scoring
//! - `Scorer` / `ScoringTask` - best-effort heuristics racing the planner
//! - `SuggestionSink` - downstream instruction suggestions

pub mod blocks;
pub mod execution;
pub mod guards;
pub mod orchestrator;
pub mod scoring;

pub use blocks::{Block, BlockKind, Transcript};
pub use execution::{AgentExecution, ExecutionStatus};
pub use guards::{GuardConfig, GuardTrip, LoopGuards};
pub use orchestrator::{
    AgentOrchestrator, OrchestratorConfig, OrchestratorHandle, OrchestratorServices,
};
pub use scoring::{HeuristicScorer, Scorer, ScoringOutcome, ScoringTask, SuggestionSink};
