//! Stream chunks and the outbound wire shape.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::classify::ClassificationLabel;
use crate::types::message::MessageRole;

/// Token usage reported by the provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl Usage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// Response-level metadata. `timestamp` is the time the generation started
/// and is re-stamped whenever a cached response is served.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Payload of a single chunk, discriminated by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ChunkEvent {
    TextDelta {
        text: String,
    },
    ToolCall {
        tool_call_id: String,
        tool_name: String,
        args: serde_json::Value,
    },
    ToolResult {
        tool_call_id: String,
        tool_name: String,
        result: serde_json::Value,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
    ResponseMetadata(ResponseMetadata),
    Finish {
        finish_reason: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
    },
}

/// Kind tag of a chunk, without payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChunkKind {
    TextDelta,
    ToolCall,
    ToolResult,
    ResponseMetadata,
    Finish,
}

impl ChunkEvent {
    pub fn kind(&self) -> ChunkKind {
        match self {
            ChunkEvent::TextDelta { .. } => ChunkKind::TextDelta,
            ChunkEvent::ToolCall { .. } => ChunkKind::ToolCall,
            ChunkEvent::ToolResult { .. } => ChunkKind::ToolResult,
            ChunkEvent::ResponseMetadata(_) => ChunkKind::ResponseMetadata,
            ChunkEvent::Finish { .. } => ChunkKind::Finish,
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        ChunkEvent::TextDelta { text: text.into() }
    }

    pub fn finish(reason: impl Into<String>, usage: Option<Usage>) -> Self {
        ChunkEvent::Finish {
            finish_reason: reason.into(),
            usage,
        }
    }
}

/// One discrete unit of a streamed generation. Order is significant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamChunk {
    pub sequence: u64,
    #[serde(flatten)]
    pub event: ChunkEvent,
}

impl StreamChunk {
    pub fn new(sequence: u64, event: ChunkEvent) -> Self {
        Self { sequence, event }
    }

    pub fn kind(&self) -> ChunkKind {
        self.event.kind()
    }

    pub fn is_finish(&self) -> bool {
        matches!(self.event, ChunkEvent::Finish { .. })
    }

    /// Replace an embedded generation timestamp with `now`. Chunks without a
    /// timestamp are left untouched.
    pub fn restamp(&mut self, now: DateTime<Utc>) {
        if let ChunkEvent::ResponseMetadata(ResponseMetadata {
            timestamp: Some(ts),
            ..
        }) = &mut self.event
        {
            *ts = now;
        }
    }
}

/// Assigns monotonically increasing sequence numbers to chunk events.
#[derive(Debug, Default)]
pub struct ChunkSequencer {
    next: u64,
}

impl ChunkSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn chunk(&mut self, event: ChunkEvent) -> StreamChunk {
        let chunk = StreamChunk::new(self.next, event);
        self.next += 1;
        chunk
    }
}

/// Out-of-band metadata attached to the outbound stream. Never model text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Annotation {
    /// Server-assigned id of a persisted message.
    MessageId { message_id: Uuid, role: MessageRole },
    Classification { label: ClassificationLabel },
    ToolProgress {
        tool_call_id: String,
        message: String,
    },
}

/// Outbound stream element: a generation chunk or an annotation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StreamPart {
    Chunk(StreamChunk),
    Annotation(Annotation),
}

impl StreamPart {
    pub fn as_chunk(&self) -> Option<&StreamChunk> {
        match self {
            StreamPart::Chunk(c) => Some(c),
            StreamPart::Annotation(_) => None,
        }
    }

    pub fn as_annotation(&self) -> Option<&Annotation> {
        match self {
            StreamPart::Annotation(a) => Some(a),
            StreamPart::Chunk(_) => None,
        }
    }
}
