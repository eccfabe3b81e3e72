//! Deterministic offline model, used by tests and the CLI's `--offline` mode.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::{LanguageModel, ProviderKind};
use crate::stream::{spawn_stage, CancelHandle, DEFAULT_STAGE_BUFFER};
use crate::types::{
    ChunkEvent, ChunkSequencer, GenerateResult, GenerationRequest, MessageRole, ResponseMetadata,
    StreamChunk, ToolCall, Usage,
};
use crate::{BoxStream, Error, Result};

/// A model whose output is fixed up front.
///
/// Without a scripted reply it echoes the last user message. Requests with a
/// `response_schema` holding a string enum (at the root, or as a property of
/// an object root) get one of the enum values back: `vision` when the conversation holds an image, `question` when the
/// last user text ends with `?`, `other` otherwise (falling back to the first
/// value when those are not in the enum).
pub struct ScriptedModel {
    kind: ProviderKind,
    reply: Option<String>,
    tool_calls: Vec<ToolCall>,
    fail_on_start: Option<String>,
    fail_after: Option<usize>,
    chunk_delay: Duration,
    generate_calls: AtomicUsize,
    stream_calls: AtomicUsize,
    requests: Mutex<Vec<GenerationRequest>>,
}

impl Default for ScriptedModel {
    fn default() -> Self {
        Self {
            kind: ProviderKind::OpenAi,
            reply: None,
            tool_calls: Vec::new(),
            fail_on_start: None,
            fail_after: None,
            chunk_delay: Duration::ZERO,
            generate_calls: AtomicUsize::new(0),
            stream_calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_kind(mut self, kind: ProviderKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_reply(mut self, text: impl Into<String>) -> Self {
        self.reply = Some(text.into());
        self
    }

    pub fn with_tool_call(mut self, id: impl Into<String>, name: impl Into<String>, args: Value) -> Self {
        self.tool_calls.push(ToolCall {
            id: id.into(),
            name: name.into(),
            arguments: args,
        });
        self
    }

    /// Every call fails before producing anything.
    pub fn failing(mut self, message: impl Into<String>) -> Self {
        self.fail_on_start = Some(message.into());
        self
    }

    /// Streams fail after `n` chunks.
    pub fn fail_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }

    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    pub fn generate_calls(&self) -> usize {
        self.generate_calls.load(Ordering::SeqCst)
    }

    pub fn stream_calls(&self) -> usize {
        self.stream_calls.load(Ordering::SeqCst)
    }

    /// Every request received so far, in order.
    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().map(|r| r.clone()).unwrap_or_default()
    }

    fn record(&self, request: &GenerationRequest) {
        if let Ok(mut r) = self.requests.lock() {
            r.push(request.clone());
        }
    }

    fn reply_text(&self, request: &GenerationRequest) -> String {
        if let Some(label) = enum_answer(request) {
            return label;
        }
        if let Some(ref r) = self.reply {
            return r.clone();
        }
        let last = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == MessageRole::User)
            .map(|m| m.text())
            .unwrap_or_default();
        format!("You said: {}", last)
    }

    fn result(&self, request: &GenerationRequest) -> GenerateResult {
        let text = self.reply_text(request);
        let completion = text.split_whitespace().count() as u64;
        let tool_calls = if request.response_schema.is_some() {
            Vec::new()
        } else {
            self.tool_calls.clone()
        };
        let finish_reason = if tool_calls.is_empty() { "stop" } else { "tool_calls" };
        GenerateResult {
            finish_reason: finish_reason.to_string(),
            text,
            tool_calls,
            usage: Some(Usage::new(request.messages.len() as u64, completion)),
            response: ResponseMetadata {
                id: Some(format!("scripted-{}", self.generate_calls() + self.stream_calls())),
                model_id: Some(request.model.clone()),
                timestamp: Some(Utc::now()),
            },
        }
    }

    fn check_start(&self) -> Result<()> {
        match self.fail_on_start {
            Some(ref msg) => Err(Error::provider(self.kind, Some(500), msg.clone())),
            None => Ok(()),
        }
    }
}

fn enum_answer(request: &GenerationRequest) -> Option<String> {
    let schema = request.response_schema.as_ref()?;
    if let Some(values) = schema.get("enum").and_then(|e| e.as_array()) {
        return pick_label(request, values);
    }
    // Object wrapping one enum property: answer as `{"<prop>": "<value>"}`.
    let (prop, values) = schema
        .get("properties")?
        .as_object()?
        .iter()
        .find_map(|(name, s)| Some((name, s.get("enum")?.as_array()?)))?;
    let label = pick_label(request, values)?;
    Some(serde_json::json!({ prop.as_str(): label }).to_string())
}

fn pick_label(request: &GenerationRequest, values: &[Value]) -> Option<String> {
    let values: Vec<&str> = values.iter().filter_map(|v| v.as_str()).collect();
    let has_image = request.messages.iter().any(|m| m.contains_image());
    let asks = request
        .messages
        .iter()
        .rev()
        .find(|m| m.role == MessageRole::User)
        .map(|m| m.text().trim_end().ends_with('?'))
        .unwrap_or(false);
    let wanted = if has_image {
        "vision"
    } else if asks {
        "question"
    } else {
        "other"
    };
    values
        .iter()
        .find(|v| **v == wanted)
        .or_else(|| values.first())
        .map(|v| v.to_string())
}

/// Split text into word-sized deltas, keeping whitespace attached.
fn deltas(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        current.push(ch);
        if ch == ' ' {
            out.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    fn provider(&self) -> ProviderKind {
        self.kind
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<GenerateResult> {
        self.record(request);
        self.check_start()?;
        let result = self.result(request);
        self.generate_calls.fetch_add(1, Ordering::SeqCst);
        Ok(result)
    }

    async fn stream(
        &self,
        request: &GenerationRequest,
        cancel: &CancelHandle,
    ) -> Result<BoxStream<'static, StreamChunk>> {
        self.record(request);
        self.check_start()?;
        let result = self.result(request);
        self.stream_calls.fetch_add(1, Ordering::SeqCst);

        let mut seq = ChunkSequencer::new();
        let mut chunks = vec![seq.chunk(ChunkEvent::ResponseMetadata(result.response.clone()))];
        for d in deltas(&result.text) {
            chunks.push(seq.chunk(ChunkEvent::text(d)));
        }
        for call in result.tool_calls {
            chunks.push(seq.chunk(ChunkEvent::ToolCall {
                tool_call_id: call.id,
                tool_name: call.name,
                args: call.arguments,
            }));
        }
        chunks.push(seq.chunk(ChunkEvent::finish(result.finish_reason, result.usage)));

        let kind = self.kind;
        let fail_after = self.fail_after;
        let delay = self.chunk_delay;
        let stream = spawn_stage(cancel, DEFAULT_STAGE_BUFFER, move |out| async move {
            for (i, chunk) in chunks.into_iter().enumerate() {
                if fail_after == Some(i) {
                    out.emit(Err(Error::provider(kind, None, "scripted failure mid-stream")))
                        .await;
                    return;
                }
                if !out.pause(delay).await || !out.emit(Ok(chunk)).await {
                    return;
                }
            }
        });
        Ok(Box::pin(stream))
    }
}
