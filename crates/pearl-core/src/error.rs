//! Error taxonomy for the agent loop.
//!
//! Tool-level failures are normalized at the [`ToolRunner`] boundary and
//! never reach the orchestrator as raw errors; the variants here are the
//! conditions the orchestrator itself reasons about.
//!
//! [`ToolRunner`]: crate::tools::runner::ToolRunner

use thiserror::Error;

/// Orchestrator-level errors.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The decision stream ended without ever producing a schema-valid
    /// decision. Retried up to a bound, then fatal.
    #[error("planner produced no valid decision: {0}")]
    InvalidPlannerOutput(String),

    /// The planner named a tool that is not in the catalog.
    #[error("tool not found: {0}")]
    ToolNotFound(String),

    /// The planner named a tool outside its permitted capability for the
    /// current plan type, or one disabled by org feature flags.
    #[error("tool '{tool}' not allowed: {reason}")]
    ToolNotAllowed { tool: String, reason: String },

    /// A loop guard fired and forced early finalization.
    #[error("circuit breaker tripped: {0}")]
    CircuitBreakerTripped(String),

    /// A warm-context section failed to build and was omitted. Non-fatal:
    /// surfaced as a degraded input, never an aborted run.
    #[error("context build degraded: {0}")]
    ContextBuildDegraded(String),

    /// User/operator cancellation. Not a failure, but a distinct
    /// non-success terminal path.
    #[error("execution stopped externally")]
    ExternalStop,

    /// Durable storage failed in a context where the loop cannot continue.
    #[error("storage error: {0}")]
    Storage(#[source] anyhow::Error),
}

/// Errors raised by tool handlers, classified for retry eligibility.
///
/// Only transient classes consume retry attempts; programmer and
/// validation errors terminate on attempt 1.
#[derive(Debug, Error)]
pub enum ToolError {
    /// Transient I/O or upstream flakiness. Retryable.
    #[error("transient error: {0}")]
    Transient(String),

    /// Upstream rate limiting. Retryable.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// The attempt exceeded its deadline. Recorded by the runner, never
    /// raised by handlers directly. Retryable.
    #[error("attempt timed out")]
    Timeout,

    /// The arguments failed schema/semantic validation. Not retryable.
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    /// Any other handler failure. Not retryable.
    #[error("{0}")]
    Fatal(String),
}

impl ToolError {
    /// Whether this error class may consume a retry attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transient(_) | Self::RateLimited(_) | Self::Timeout
        )
    }

    /// Short stable code for summaries and failure signatures.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Transient(_) => "transient",
            Self::RateLimited(_) => "rate_limited",
            Self::Timeout => "timeout",
            Self::InvalidArguments(_) => "invalid_arguments",
            Self::Fatal(_) => "tool_error",
        }
    }
}
