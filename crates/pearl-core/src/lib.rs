//! Core library for Pearl — an autonomous analyst agent.
//!
//! A user asks a natural-language question; the loop decides, step by step,
//! whether to call a tool (query data, inspect a table, build a model) or
//! produce a final answer, streaming every intermediate thought and result
//! while persisting phase-tagged context snapshots for audit and resume.
//!
//! Module map:
//! - [`agent`] — the orchestrator loop, guards, transcript, scoring
//! - [`planner`] — decision streaming over an opaque generator
//! - [`context`] — planner input assembly and snapshots
//! - [`tools`] — registry, retry/timeout policies, runner
//! - [`events`] — the wire event protocol and dual-channel bus
//! - [`storage`] — repository traits plus SQLite/in-memory stores
//! - [`config`] — TOML-loadable thresholds
//!
//! Transport layers (HTTP/SSE, TUI) and connector implementations live
//! outside this crate and integrate through the collaborator traits:
//! [`planner::GenerationStream`], [`tools::ToolHandler`],
//! [`context::ResourceLister`], [`context::SchemaSource`],
//! [`tools::FeatureGate`], [`agent::SuggestionSink`], and the repository
//! traits in [`storage`].

pub mod agent;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod planner;
pub mod storage;
pub mod tools;

pub use agent::{
    AgentExecution, AgentOrchestrator, ExecutionStatus, OrchestratorConfig, OrchestratorHandle,
    OrchestratorServices,
};
pub use config::AgentConfig;
pub use error::{AgentError, ToolError};
pub use events::{AgentEvent, EventBus};
pub use planner::{GenerationChunk, GenerationStream, PlanType, Planner, PlannerDecision};
