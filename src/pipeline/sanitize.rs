//! Pre-persistence cleanup of accumulated turns.

use std::collections::HashSet;
use tracing::debug;

use super::accumulate::ResponseTurn;
use crate::types::ContentBlock;

/// Drop tool calls that never got a result, results whose call is unknown,
/// empty text blocks, and turns left with no content.
///
/// A tool call without a result comes from truncation or cancellation and
/// must not be stored as if it had completed.
pub fn sanitize_turns(turns: Vec<ResponseTurn>) -> Vec<ResponseTurn> {
    let mut calls: HashSet<String> = HashSet::new();
    let mut results: HashSet<String> = HashSet::new();
    for block in turns.iter().flat_map(|t| t.content.iter()) {
        match block {
            ContentBlock::ToolUse { id, .. } => {
                calls.insert(id.clone());
            }
            ContentBlock::ToolResult { tool_use_id, .. } => {
                results.insert(tool_use_id.clone());
            }
            _ => {}
        }
    }

    let mut dropped = 0usize;
    let out: Vec<ResponseTurn> = turns
        .into_iter()
        .map(|turn| {
            let before = turn.content.len();
            let content: Vec<ContentBlock> = turn
                .content
                .into_iter()
                .filter(|b| match b {
                    ContentBlock::ToolUse { id, .. } => results.contains(id),
                    ContentBlock::ToolResult { tool_use_id, .. } => calls.contains(tool_use_id),
                    ContentBlock::Text { text } => !text.trim().is_empty(),
                    ContentBlock::Image { .. } => true,
                })
                .collect();
            dropped += before - content.len();
            ResponseTurn::new(turn.role, content)
        })
        .filter(|t| !t.is_empty())
        .collect();

    if dropped > 0 {
        debug!(dropped, "sanitized incomplete content before persisting");
    }
    out
}
