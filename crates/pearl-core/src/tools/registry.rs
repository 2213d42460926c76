//! Tool catalog: descriptors, handlers, and availability checks.
//!
//! The registry is an explicit value built once at startup (registration
//! takes `&mut self`) and passed into the orchestrator; it is never mutated
//! at runtime. Availability is re-evaluated per call — plan-type capability
//! and org feature flags can change between iterations of a long run, so
//! `catalog_for` computes fresh every time.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{AgentError, ToolError};
use crate::planner::PlanType;
use crate::tools::policy::{RetryPolicy, TimeoutPolicy};

/// What a tool is allowed to do, checked against the run's [`PlanType`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCapability {
    /// Read-only: queries, inspection, summarization.
    Research,
    /// Side-effecting: writes models, publishes artifacts.
    Action,
    /// Permitted under either plan type.
    Both,
}

impl ToolCapability {
    pub fn permits(&self, plan_type: PlanType) -> bool {
        match self {
            Self::Both => true,
            Self::Research => plan_type == PlanType::Research,
            Self::Action => plan_type == PlanType::Action,
        }
    }
}

/// Static description of a tool: what the planner sees in its catalog.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
    pub capability: ToolCapability,
}

/// Successful handler output before normalization.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    /// Human-readable digest for the observation history.
    pub summary: String,
    /// Opaque payload; the orchestrator never inspects it.
    pub payload: Value,
}

impl ToolOutcome {
    pub fn new(summary: impl Into<String>, payload: Value) -> Self {
        Self {
            summary: summary.into(),
            payload,
        }
    }
}

/// Signals a running handler can raise mid-attempt. The runner forwards
/// them onto the event stream.
#[derive(Debug, Clone)]
pub enum ToolSignal {
    /// Stage update ("compiling sql", "fetching rows").
    Progress { stage: String },
    /// Incremental answer fragment from a long-running generative tool.
    Partial { delta: String },
    /// A query record was created.
    QueryCreated { query_id: String },
    /// A visualization was created.
    VisualizationCreated { visualization_id: String },
    /// A visualization was updated in place.
    VisualizationUpdated { visualization_id: String },
    /// A data model build finished.
    DataModelCompleted { model_id: String },
    /// Artifact payload to attach to the tool's transcript block.
    Artifact { artifact: Value },
}

/// Per-call runtime context injected into a handler.
///
/// Built fresh by the orchestrator for every call — never held as
/// orchestrator-global state. Handlers must observe `cancellation` and
/// stop cooperatively when it fires.
#[derive(Clone)]
pub struct ToolContext {
    pub execution_id: String,
    pub organization_id: String,
    /// 1-based attempt number under the retry policy.
    pub attempt: u32,
    pub cancellation: CancellationToken,
    signal_tx: Option<mpsc::UnboundedSender<ToolSignal>>,
}

impl ToolContext {
    pub fn new(execution_id: impl Into<String>, organization_id: impl Into<String>) -> Self {
        Self {
            execution_id: execution_id.into(),
            organization_id: organization_id.into(),
            attempt: 1,
            cancellation: CancellationToken::new(),
            signal_tx: None,
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    pub fn with_signals(mut self, tx: mpsc::UnboundedSender<ToolSignal>) -> Self {
        self.signal_tx = Some(tx);
        self
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    /// Raise a signal; dropped silently when nobody listens.
    pub fn signal(&self, signal: ToolSignal) {
        if let Some(tx) = &self.signal_tx {
            let _ = tx.send(signal);
        }
    }

    pub fn progress(&self, stage: impl Into<String>) {
        self.signal(ToolSignal::Progress {
            stage: stage.into(),
        });
    }

    pub fn partial(&self, delta: impl Into<String>) {
        self.signal(ToolSignal::Partial {
            delta: delta.into(),
        });
    }
}

/// Trait for tool implementations.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    /// Tool name (id).
    fn name(&self) -> &str;

    /// Description shown to the planner.
    fn description(&self) -> &str;

    /// JSON schema for arguments.
    fn input_schema(&self) -> Value;

    /// Capability category for plan-type validation.
    fn capability(&self) -> ToolCapability;

    /// Per-tool retry override; `None` uses the registry default.
    fn retry_policy(&self) -> Option<RetryPolicy> {
        None
    }

    /// Per-tool timeout override; `None` uses the registry default.
    fn timeout_policy(&self) -> Option<TimeoutPolicy> {
        None
    }

    /// Execute one attempt.
    async fn execute(&self, arguments: Value, ctx: &ToolContext) -> Result<ToolOutcome, ToolError>;
}

/// Org-level feature flags consulted fresh on every catalog build.
pub trait FeatureGate: Send + Sync {
    fn is_enabled(&self, organization_id: &str, tool_name: &str) -> bool;
}

/// Gate that enables everything. The default.
pub struct AllowAll;

impl FeatureGate for AllowAll {
    fn is_enabled(&self, _organization_id: &str, _tool_name: &str) -> bool {
        true
    }
}

/// Static catalog of available tools.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn ToolHandler>>,
    gate: Arc<dyn FeatureGate>,
    default_retry: RetryPolicy,
    default_timeout: TimeoutPolicy,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
            gate: Arc::new(AllowAll),
            default_retry: RetryPolicy::default(),
            default_timeout: TimeoutPolicy::default(),
        }
    }

    pub fn with_gate(mut self, gate: Arc<dyn FeatureGate>) -> Self {
        self.gate = gate;
        self
    }

    pub fn with_defaults(mut self, retry: RetryPolicy, timeout: TimeoutPolicy) -> Self {
        self.default_retry = retry;
        self.default_timeout = timeout;
        self
    }

    /// Register a tool. Startup only — the registry is immutable once
    /// handed to the orchestrator.
    pub fn register(&mut self, tool: Arc<dyn ToolHandler>) {
        let name = tool.name().to_string();
        tracing::debug!(tool = %name, "registered tool");
        self.tools.insert(name, tool);
    }

    /// Filtered descriptors permitted for this plan type and org.
    /// Computed fresh per call; feature flags can change mid-execution.
    pub fn catalog_for(&self, plan_type: PlanType, organization_id: &str) -> Vec<ToolDescriptor> {
        let mut catalog: Vec<ToolDescriptor> = self
            .tools
            .values()
            .filter(|t| t.capability().permits(plan_type))
            .filter(|t| self.gate.is_enabled(organization_id, t.name()))
            .map(|t| ToolDescriptor {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.input_schema(),
                capability: t.capability(),
            })
            .collect();
        catalog.sort_by(|a, b| a.name.cmp(&b.name));
        catalog
    }

    /// Pure lookup; no side effects.
    pub fn resolve(&self, tool_name: &str) -> Result<Arc<dyn ToolHandler>, AgentError> {
        self.tools
            .get(tool_name)
            .cloned()
            .ok_or_else(|| AgentError::ToolNotFound(tool_name.to_string()))
    }

    /// Reject a tool outside its permitted category before the runner is
    /// ever invoked; a disallowed tool never executes even once.
    pub fn validate_for_plan_type(
        &self,
        tool_name: &str,
        plan_type: PlanType,
        organization_id: &str,
    ) -> Result<(), AgentError> {
        let tool = self.resolve(tool_name)?;
        if !tool.capability().permits(plan_type) {
            return Err(AgentError::ToolNotAllowed {
                tool: tool_name.to_string(),
                reason: format!("capability {:?} not permitted under {plan_type:?} plan", tool.capability()),
            });
        }
        if !self.gate.is_enabled(organization_id, tool_name) {
            return Err(AgentError::ToolNotAllowed {
                tool: tool_name.to_string(),
                reason: format!("disabled for organization {organization_id}"),
            });
        }
        Ok(())
    }

    /// Effective retry policy for a tool.
    pub fn retry_policy_for(&self, tool: &dyn ToolHandler) -> RetryPolicy {
        tool.retry_policy().unwrap_or(self.default_retry)
    }

    /// Effective timeout policy for a tool.
    pub fn timeout_policy_for(&self, tool: &dyn ToolHandler) -> TimeoutPolicy {
        tool.timeout_policy().unwrap_or(self.default_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct StubTool {
        name: &'static str,
        capability: ToolCapability,
    }

    #[async_trait]
    impl ToolHandler for StubTool {
        fn name(&self) -> &str {
            self.name
        }

        fn description(&self) -> &str {
            "stub"
        }

        fn input_schema(&self) -> Value {
            json!({"type": "object"})
        }

        fn capability(&self) -> ToolCapability {
            self.capability
        }

        async fn execute(
            &self,
            _arguments: Value,
            _ctx: &ToolContext,
        ) -> Result<ToolOutcome, ToolError> {
            Ok(ToolOutcome::new("ok", Value::Null))
        }
    }

    struct DenyTool(&'static str);

    impl FeatureGate for DenyTool {
        fn is_enabled(&self, _organization_id: &str, tool_name: &str) -> bool {
            tool_name != self.0
        }
    }

    fn registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(StubTool {
            name: "query_db",
            capability: ToolCapability::Research,
        }));
        registry.register(Arc::new(StubTool {
            name: "publish_dashboard",
            capability: ToolCapability::Action,
        }));
        registry.register(Arc::new(StubTool {
            name: "inspect_table",
            capability: ToolCapability::Both,
        }));
        registry
    }

    #[test]
    fn catalog_filters_by_plan_type() {
        let registry = registry();
        let names: Vec<_> = registry
            .catalog_for(PlanType::Research, "org_1")
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(names, vec!["inspect_table", "query_db"]);
    }

    #[test]
    fn catalog_filters_by_feature_gate() {
        let registry = registry().with_gate(Arc::new(DenyTool("query_db")));
        let names: Vec<_> = registry
            .catalog_for(PlanType::Research, "org_1")
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(names, vec!["inspect_table"]);
    }

    #[test]
    fn resolve_unknown_tool_fails() {
        let registry = registry();
        assert!(matches!(
            registry.resolve("nope"),
            Err(AgentError::ToolNotFound(_))
        ));
    }

    #[test]
    fn research_tool_rejected_under_action_plan() {
        let registry = registry();
        let err = registry
            .validate_for_plan_type("query_db", PlanType::Action, "org_1")
            .unwrap_err();
        assert!(matches!(err, AgentError::ToolNotAllowed { .. }));
    }

    #[test]
    fn both_capability_passes_either_plan() {
        let registry = registry();
        assert!(registry
            .validate_for_plan_type("inspect_table", PlanType::Action, "org_1")
            .is_ok());
        assert!(registry
            .validate_for_plan_type("inspect_table", PlanType::Research, "org_1")
            .is_ok());
    }

    #[test]
    fn gated_tool_rejected_for_org() {
        let registry = registry().with_gate(Arc::new(DenyTool("inspect_table")));
        let err = registry
            .validate_for_plan_type("inspect_table", PlanType::Research, "org_1")
            .unwrap_err();
        assert!(matches!(err, AgentError::ToolNotAllowed { .. }));
    }
}
