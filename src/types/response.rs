//! Single-shot generation results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::events::{ChunkEvent, ChunkSequencer, ResponseMetadata, StreamChunk, Usage};
use crate::types::tool::ToolCall;

/// Full structured result of a non-streamed generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateResult {
    pub text: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default)]
    pub response: ResponseMetadata,
}

impl GenerateResult {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            tool_calls: Vec::new(),
            finish_reason: "stop".to_string(),
            usage: None,
            response: ResponseMetadata {
                timestamp: Some(Utc::now()),
                ..Default::default()
            },
        }
    }

    /// Replace the response timestamp (if any) with `now`.
    pub fn restamp(&mut self, now: DateTime<Utc>) {
        if self.response.timestamp.is_some() {
            self.response.timestamp = Some(now);
        }
    }

    /// Express the result as the chunk timeline a stream would have produced:
    /// metadata, text, tool calls, finish.
    pub fn into_chunks(self) -> Vec<StreamChunk> {
        let mut seq = ChunkSequencer::new();
        let mut chunks = vec![seq.chunk(ChunkEvent::ResponseMetadata(self.response))];
        if !self.text.is_empty() {
            chunks.push(seq.chunk(ChunkEvent::text(self.text)));
        }
        for call in self.tool_calls {
            chunks.push(seq.chunk(ChunkEvent::ToolCall {
                tool_call_id: call.id,
                tool_name: call.name,
                args: call.arguments,
            }));
        }
        chunks.push(seq.chunk(ChunkEvent::finish(self.finish_reason, self.usage)));
        chunks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::events::ChunkKind;

    #[test]
    fn test_into_chunks_ends_with_finish() {
        let mut result = GenerateResult::text("hello");
        result.tool_calls.push(ToolCall {
            id: "c1".into(),
            name: "lookup".into(),
            arguments: serde_json::json!({"q": "x"}),
        });
        let kinds: Vec<_> = result.into_chunks().iter().map(|c| c.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                ChunkKind::ResponseMetadata,
                ChunkKind::TextDelta,
                ChunkKind::ToolCall,
                ChunkKind::Finish
            ]
        );
    }
}
