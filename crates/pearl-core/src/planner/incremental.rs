//! Incremental decision parsing.
//!
//! The decision stream arrives as arbitrary text fragments: partial JSON,
//! prose around a fenced JSON block, heartbeats. This module is an explicit
//! accumulate-and-scan state machine rather than ad hoc string patching.
//! Each pushed fragment resolves to one of two externally meaningful
//! outcomes — "not yet valid" or "valid decision" — plus an intermediate
//! `Candidate` for a balanced object that parsed but does not validate as a
//! decision (emitted upstream as `planner.decision.partial` and skipped).

use serde_json::Value;

use super::decision::PlannerDecision;

/// Result of feeding one fragment to the parser.
#[derive(Debug)]
pub enum ParseOutcome {
    /// The buffer does not yet contain a complete decision. Keep streaming.
    Pending,
    /// A syntactically complete JSON object that is not a valid decision.
    /// Tolerated and skipped; later fragments may still produce one.
    Candidate(Value),
    /// A schema-valid decision was assembled.
    Decision(PlannerDecision),
}

/// Buffering parser for the planner's streamed output.
#[derive(Debug, Default)]
pub struct IncrementalDecisionParser {
    buffer: String,
}

impl IncrementalDecisionParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one fragment. Empty fragments are ignored.
    pub fn push(&mut self, fragment: &str) -> ParseOutcome {
        if fragment.is_empty() {
            return ParseOutcome::Pending;
        }
        self.buffer.push_str(fragment);
        self.drain_complete_objects()
    }

    /// Final chance at stream end: parse whatever is buffered.
    pub fn finish(&mut self) -> Option<PlannerDecision> {
        match self.drain_complete_objects() {
            ParseOutcome::Decision(decision) => Some(decision),
            _ => None,
        }
    }

    /// Scan the buffer for balanced top-level objects, consuming each one.
    /// Returns on the first valid decision; otherwise reports the last
    /// non-decision candidate, or `Pending`.
    fn drain_complete_objects(&mut self) -> ParseOutcome {
        let mut last_candidate = None;

        while let Some((start, end)) = scan_balanced_object(&self.buffer) {
            let raw = &self.buffer[start..=end];
            let parsed = serde_json::from_str::<Value>(raw).ok();
            self.buffer.drain(..=end);

            let Some(value) = parsed else {
                // Balanced braces but not valid JSON (e.g. bare words).
                continue;
            };

            match serde_json::from_value::<PlannerDecision>(value.clone()) {
                Ok(decision) => return ParseOutcome::Decision(decision),
                Err(_) => last_candidate = Some(value),
            }
        }

        match last_candidate {
            Some(value) => ParseOutcome::Candidate(value),
            None => ParseOutcome::Pending,
        }
    }
}

/// Find the first balanced `{...}` region, honoring JSON strings and
/// escapes. Returns byte offsets of the opening and closing braces.
fn scan_balanced_object(text: &str) -> Option<(usize, usize)> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some((start, start + offset));
                }
            }
            _ => {}
        }
    }
    None
}
