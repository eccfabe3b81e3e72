//! Folds a chunk timeline back into role turns.

use crate::types::{ChunkEvent, ContentBlock, MessageRole, StreamChunk, Usage};

/// One role's contribution to a response, in content order.
#[derive(Debug, Clone, PartialEq)]
pub struct ResponseTurn {
    pub role: MessageRole,
    pub content: Vec<ContentBlock>,
}

impl ResponseTurn {
    pub fn new(role: MessageRole, content: Vec<ContentBlock>) -> Self {
        Self { role, content }
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }
}

/// Accumulates streamed chunks into an assistant turn (text and tool calls)
/// and a tool turn (tool results). Adjacent text deltas merge into one
/// block; a tool call splits the text around it.
#[derive(Debug, Default)]
pub struct ResponseAccumulator {
    assistant: Vec<ContentBlock>,
    tool: Vec<ContentBlock>,
    finish_reason: Option<String>,
    usage: Option<Usage>,
}

impl ResponseAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_chunks<'a>(chunks: impl IntoIterator<Item = &'a StreamChunk>) -> Self {
        let mut acc = Self::new();
        for c in chunks {
            acc.push(c);
        }
        acc
    }

    pub fn push(&mut self, chunk: &StreamChunk) {
        match &chunk.event {
            ChunkEvent::TextDelta { text } => {
                if let Some(ContentBlock::Text { text: last }) = self.assistant.last_mut() {
                    last.push_str(text);
                } else {
                    self.assistant.push(ContentBlock::text(text.clone()));
                }
            }
            ChunkEvent::ToolCall {
                tool_call_id,
                tool_name,
                args,
            } => self.assistant.push(ContentBlock::ToolUse {
                id: tool_call_id.clone(),
                name: tool_name.clone(),
                input: args.clone(),
            }),
            ChunkEvent::ToolResult {
                tool_call_id,
                tool_name,
                result,
                is_error,
            } => self.tool.push(ContentBlock::ToolResult {
                tool_use_id: tool_call_id.clone(),
                name: Some(tool_name.clone()),
                content: result.clone(),
                is_error: *is_error,
            }),
            ChunkEvent::ResponseMetadata(_) => {}
            ChunkEvent::Finish {
                finish_reason,
                usage,
            } => {
                self.finish_reason = Some(finish_reason.clone());
                self.usage = usage.clone();
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finish_reason.is_some()
    }

    pub fn finish_reason(&self) -> Option<&str> {
        self.finish_reason.as_deref()
    }

    pub fn usage(&self) -> Option<&Usage> {
        self.usage.as_ref()
    }

    /// Concatenated assistant text.
    pub fn text(&self) -> String {
        self.assistant
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Assistant turn followed by the tool turn. Either may be empty.
    pub fn into_turns(self) -> Vec<ResponseTurn> {
        vec![
            ResponseTurn::new(MessageRole::Assistant, self.assistant),
            ResponseTurn::new(MessageRole::Tool, self.tool),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChunkSequencer;
    use serde_json::json;

    #[test]
    fn test_accumulates_text_and_tools() {
        let mut seq = ChunkSequencer::new();
        let chunks = vec![
            seq.chunk(ChunkEvent::text("Let me ")),
            seq.chunk(ChunkEvent::text("check.")),
            seq.chunk(ChunkEvent::ToolCall {
                tool_call_id: "c1".into(),
                tool_name: "get_current_time".into(),
                args: json!({}),
            }),
            seq.chunk(ChunkEvent::ToolResult {
                tool_call_id: "c1".into(),
                tool_name: "get_current_time".into(),
                result: json!("12:00"),
                is_error: false,
            }),
            seq.chunk(ChunkEvent::text("Done")),
            seq.chunk(ChunkEvent::finish("stop", Some(Usage::new(3, 4)))),
        ];
        let acc = ResponseAccumulator::from_chunks(&chunks);
        assert!(acc.is_finished());
        assert_eq!(acc.text(), "Let me check.Done");
        assert_eq!(acc.usage().map(|u| u.total_tokens), Some(7));

        let turns = acc.into_turns();
        assert_eq!(turns[0].role, MessageRole::Assistant);
        assert_eq!(turns[0].content.len(), 3);
        assert!(matches!(turns[0].content[1], ContentBlock::ToolUse { .. }));
        assert_eq!(turns[1].role, MessageRole::Tool);
        assert_eq!(turns[1].content.len(), 1);
    }

    #[test]
    fn test_unfinished_accumulator() {
        let mut seq = ChunkSequencer::new();
        let acc = ResponseAccumulator::from_chunks(&[seq.chunk(ChunkEvent::text("partial"))]);
        assert!(!acc.is_finished());
        assert!(acc.into_turns()[1].is_empty());
    }
}
