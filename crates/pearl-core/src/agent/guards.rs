//! Loop guards against unproductive runs.
//!
//! Three circuit breakers, all configurable:
//! - consecutive invalid planner output,
//! - consecutive failures of the same tool (trips a per-tool breaker that
//!   disables the tool for the remainder of the run),
//! - the same tool succeeding with materially identical arguments too many
//!   iterations in a row (the planner is not converging).
//!
//! "Materially identical" is a canonical fingerprint of the argument JSON:
//! object keys sorted recursively, then hashed, so key order differences do
//! not defeat the guard.

use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};

use serde::Deserialize;
use serde_json::Value;

/// Thresholds for the three breakers.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    /// Consecutive invalid planner decisions before the run aborts.
    pub max_invalid_decisions: u32,
    /// Consecutive failures of one tool before it is disabled.
    pub tool_failure_threshold: u32,
    /// Consecutive identical successes of one tool before the run aborts.
    pub repeat_success_threshold: u32,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            max_invalid_decisions: 3,
            tool_failure_threshold: 3,
            repeat_success_threshold: 3,
        }
    }
}

/// Which breaker fired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardTrip {
    /// Planner failed to produce a valid decision too many times in a row.
    InvalidDecisions { count: u32 },
    /// A tool kept failing; it is now disabled for this run.
    ToolDisabled { tool: String, failures: u32 },
    /// A tool kept succeeding with identical arguments; the loop is stuck.
    RepeatedSuccess { tool: String, repeats: u32 },
}

impl GuardTrip {
    pub fn describe(&self) -> String {
        match self {
            Self::InvalidDecisions { count } => {
                format!("planner produced {count} consecutive invalid decisions")
            }
            Self::ToolDisabled { tool, failures } => {
                format!("tool '{tool}' disabled after {failures} consecutive failures")
            }
            Self::RepeatedSuccess { tool, repeats } => format!(
                "tool '{tool}' succeeded with identical arguments {repeats} times in a row"
            ),
        }
    }
}

/// Mutable guard state for one execution. Owned by the loop task.
pub struct LoopGuards {
    config: GuardConfig,
    invalid_streak: u32,
    tool_failures: HashMap<String, u32>,
    disabled_tools: HashSet<String>,
    last_success: Option<(String, u64)>,
    success_streak: u32,
}

impl LoopGuards {
    pub fn new(config: GuardConfig) -> Self {
        Self {
            config,
            invalid_streak: 0,
            tool_failures: HashMap::new(),
            disabled_tools: HashSet::new(),
            last_success: None,
            success_streak: 0,
        }
    }

    /// The planner failed to produce a valid decision this iteration.
    pub fn record_invalid_decision(&mut self) -> Option<GuardTrip> {
        self.invalid_streak += 1;
        if self.invalid_streak >= self.config.max_invalid_decisions {
            return Some(GuardTrip::InvalidDecisions {
                count: self.invalid_streak,
            });
        }
        None
    }

    /// A valid decision resets the invalid streak.
    pub fn record_valid_decision(&mut self) {
        self.invalid_streak = 0;
    }

    pub fn invalid_streak(&self) -> u32 {
        self.invalid_streak
    }

    /// A tool call failed (validation failure or exhausted runner).
    pub fn record_tool_failure(&mut self, tool: &str) -> Option<GuardTrip> {
        self.success_streak = 0;
        self.last_success = None;

        let failures = self.tool_failures.entry(tool.to_string()).or_insert(0);
        *failures += 1;
        if *failures >= self.config.tool_failure_threshold {
            self.disabled_tools.insert(tool.to_string());
            return Some(GuardTrip::ToolDisabled {
                tool: tool.to_string(),
                failures: *failures,
            });
        }
        None
    }

    /// A tool call succeeded. Trips when the same tool succeeds with a
    /// materially identical fingerprint too many iterations in a row.
    pub fn record_tool_success(&mut self, tool: &str, arguments: &Value) -> Option<GuardTrip> {
        self.tool_failures.remove(tool);

        let fingerprint = argument_fingerprint(arguments);
        match &self.last_success {
            Some((last_tool, last_fp)) if last_tool == tool && *last_fp == fingerprint => {
                self.success_streak += 1;
            }
            _ => {
                self.success_streak = 1;
                self.last_success = Some((tool.to_string(), fingerprint));
            }
        }

        if self.success_streak >= self.config.repeat_success_threshold {
            return Some(GuardTrip::RepeatedSuccess {
                tool: tool.to_string(),
                repeats: self.success_streak,
            });
        }
        None
    }

    /// Whether a per-tool breaker has disabled this tool.
    pub fn is_tool_disabled(&self, tool: &str) -> bool {
        self.disabled_tools.contains(tool)
    }
}

/// Order-insensitive hash of an argument value.
fn argument_fingerprint(arguments: &Value) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    canonical(arguments).hash(&mut hasher);
    hasher.finish()
}

/// Render a JSON value with object keys sorted recursively.
fn canonical(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{k}:{}", canonical(&map[k])))
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        Value::Array(items) => {
            let rendered: Vec<String> = items.iter().map(canonical).collect();
            format!("[{}]", rendered.join(","))
        }
        other => other.to_string(),
    }
}
