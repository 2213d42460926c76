//! Agent configuration.
//!
//! Every threshold the loop enforces — iteration ceiling, retry defaults,
//! breaker thresholds, grace windows — is configurable here and loadable
//! from TOML. Defaults match the values the rest of the crate uses.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::agent::guards::GuardConfig;
use crate::tools::policy::{Backoff, RetryPolicy, TimeoutPolicy};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Hard iteration ceiling for every execution.
    pub max_iterations: u32,
    pub planner: PlannerConfig,
    pub tools: ToolsConfig,
    pub guards: GuardConfig,
    pub scoring: ScoringConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: 30,
            planner: PlannerConfig::default(),
            tools: ToolsConfig::default(),
            guards: GuardConfig::default(),
            scoring: ScoringConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    /// Abort a decision stream that goes quiet for this long.
    pub inactivity_timeout_secs: u64,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    pub default_max_attempts: u32,
    pub default_backoff_base_ms: u64,
    pub default_backoff_cap_ms: u64,
    pub default_timeout_ms: u64,
    /// Character budget for tool summaries entering observations.
    pub summary_budget_chars: usize,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            default_max_attempts: 3,
            default_backoff_base_ms: 250,
            default_backoff_cap_ms: 5_000,
            default_timeout_ms: 120_000,
            summary_budget_chars: 30_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    /// How long finalization waits for a pending scoring task.
    pub grace_ms: u64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self { grace_ms: 150 }
    }
}

impl AgentConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("read config {}", path.as_ref().display()))?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        toml::from_str(raw).context("parse agent config")
    }

    pub fn planner_inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.planner.inactivity_timeout_secs)
    }

    pub fn scoring_grace(&self) -> Duration {
        Duration::from_millis(self.scoring.grace_ms)
    }

    /// Registry-wide retry default derived from the tools section.
    pub fn default_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.tools.default_max_attempts,
            backoff: Backoff::Exponential {
                base_ms: self.tools.default_backoff_base_ms,
                cap_ms: self.tools.default_backoff_cap_ms,
            },
            jitter: true,
        }
    }

    /// Registry-wide timeout default derived from the tools section.
    pub fn default_timeout_policy(&self) -> TimeoutPolicy {
        TimeoutPolicy {
            per_attempt_ms: self.tools.default_timeout_ms,
        }
    }
}
