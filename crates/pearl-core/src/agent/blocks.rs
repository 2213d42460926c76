//! Transcript blocks.
//!
//! A block is one renderable transcript unit with a stable id. Blocks are
//! upserted (created or updated in place) as planner and tool streams
//! progress, never deleted mid-run, so clients can re-render incrementally
//! from `block.upsert` events alone.

use std::collections::HashMap;

use serde::Serialize;

/// What a block renders as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    /// Planner reasoning text.
    Reasoning,
    /// Answer/content text.
    Content,
    /// Embedded tool-execution summary.
    ToolCall,
}

/// One transcript unit.
#[derive(Debug, Clone, Serialize)]
pub struct Block {
    pub id: String,
    pub kind: BlockKind,
    pub text: String,
    /// Set for `ToolCall` blocks.
    pub tool_id: Option<String>,
    /// Lifecycle hint for tool blocks ("running", "success", "error").
    pub status: Option<String>,
}

impl Block {
    pub fn reasoning(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: BlockKind::Reasoning,
            text: text.into(),
            tool_id: None,
            status: None,
        }
    }

    pub fn content(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: BlockKind::Content,
            text: text.into(),
            tool_id: None,
            status: None,
        }
    }

    pub fn tool_call(
        id: impl Into<String>,
        tool_id: impl Into<String>,
        text: impl Into<String>,
        status: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            kind: BlockKind::ToolCall,
            text: text.into(),
            tool_id: Some(tool_id.into()),
            status: Some(status.into()),
        }
    }
}

/// Ordered, upsert-only block store for one execution.
#[derive(Default)]
pub struct Transcript {
    blocks: Vec<Block>,
    index: HashMap<String, usize>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new block or replace the one with the same id in place.
    /// Returns a clone of the stored block for event emission.
    pub fn upsert(&mut self, block: Block) -> Block {
        match self.index.get(&block.id) {
            Some(&position) => {
                self.blocks[position] = block.clone();
            }
            None => {
                self.index.insert(block.id.clone(), self.blocks.len());
                self.blocks.push(block.clone());
            }
        }
        block
    }

    pub fn get(&self, id: &str) -> Option<&Block> {
        self.index.get(id).map(|&position| &self.blocks[position])
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }
}
