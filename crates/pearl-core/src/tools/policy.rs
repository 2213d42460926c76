//! Retry and timeout policies for tool execution.
//!
//! Both are plain value objects consumed by the runner, so retry shapes
//! are testable without a live handler. A policy can be attached to an
//! individual tool descriptor or applied registry-wide as the default.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Delay shape between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum Backoff {
    /// Retry immediately.
    None,
    /// Constant delay between attempts.
    Fixed { delay_ms: u64 },
    /// `base * 2^(attempt-1)`, capped.
    Exponential { base_ms: u64, cap_ms: u64 },
}

/// Bounded-attempt policy for one logical tool call.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
    /// Add up to 10% random jitter to non-zero delays.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::Exponential {
                base_ms: 250,
                cap_ms: 5_000,
            },
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// A single attempt, no delay.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            backoff: Backoff::None,
            jitter: false,
        }
    }

    /// Delay to honor before `attempt` (1-based). `None` before the first
    /// attempt or when the shape produces no delay.
    pub fn delay_before(&self, attempt: u32) -> Option<Duration> {
        if attempt <= 1 {
            return None;
        }
        let millis = match self.backoff {
            Backoff::None => return None,
            Backoff::Fixed { delay_ms } => delay_ms,
            Backoff::Exponential { base_ms, cap_ms } => {
                let exp = attempt.saturating_sub(2).min(31);
                base_ms.saturating_mul(1u64 << exp).min(cap_ms)
            }
        };
        if millis == 0 {
            return None;
        }
        let millis = if self.jitter {
            let spread = (millis / 10).max(1);
            millis + rand::thread_rng().gen_range(0..spread)
        } else {
            millis
        };
        Some(Duration::from_millis(millis))
    }
}

/// Per-attempt deadline for one tool attempt.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeoutPolicy {
    pub per_attempt_ms: u64,
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        Self {
            per_attempt_ms: 120_000,
        }
    }
}

impl TimeoutPolicy {
    pub fn per_attempt(&self) -> Duration {
        Duration::from_millis(self.per_attempt_ms)
    }
}
