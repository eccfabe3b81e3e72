//! Provider drivers and the model capability they implement.
//!
//! [`LanguageModel`] is the one capability the pipeline consumes (`generate`
//! and `stream`). [`HttpModel`] implements it over HTTP for a closed set of
//! providers ([`ProviderKind`]); the wire differences live in one
//! [`ProviderDriver`] per kind, chosen once when the model is built.

pub mod anthropic;
pub mod gemini;
pub mod http;
pub mod openai;
pub mod scripted;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::stream::CancelHandle;
use crate::types::{ChunkEvent, GenerateResult, GenerationRequest, ResponseMetadata, StreamChunk, Usage};
use crate::utils::ToolCallAssembler;
use crate::{BoxStream, Error, Result};

pub use anthropic::AnthropicDriver;
pub use gemini::GeminiDriver;
pub use http::{HttpModel, ProviderConfig};
pub use openai::OpenAiDriver;
pub use scripted::ScriptedModel;

/// The providers this crate can talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProviderKind {
    #[serde(rename = "openai")]
    OpenAi,
    #[serde(rename = "anthropic")]
    Anthropic,
    #[serde(rename = "google", alias = "gemini")]
    Google,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Google => "google",
        }
    }

    pub fn default_base_url(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "https://api.openai.com/v1",
            ProviderKind::Anthropic => "https://api.anthropic.com/v1",
            ProviderKind::Google => "https://generativelanguage.googleapis.com/v1beta",
        }
    }

    /// Environment variables searched for an API key, in order.
    pub fn api_key_env(&self) -> &'static [&'static str] {
        match self {
            ProviderKind::OpenAi => &["OPENAI_API_KEY"],
            ProviderKind::Anthropic => &["ANTHROPIC_API_KEY"],
            ProviderKind::Google => &["GEMINI_API_KEY", "GOOGLE_API_KEY"],
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(ProviderKind::OpenAi),
            "anthropic" => Ok(ProviderKind::Anthropic),
            "google" | "gemini" => Ok(ProviderKind::Google),
            other => Err(format!("unknown provider: {}", other)),
        }
    }
}

/// Generation capability consumed by the pipeline.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn provider(&self) -> ProviderKind;

    async fn generate(&self, request: &GenerationRequest) -> Result<GenerateResult>;

    /// Start a streamed generation. Errors before the first chunk are
    /// returned here; later failures arrive as an `Err` item.
    async fn stream(
        &self,
        request: &GenerationRequest,
        cancel: &CancelHandle,
    ) -> Result<BoxStream<'static, StreamChunk>>;
}

/// Provider-specific HTTP request.
#[derive(Debug, Clone)]
pub struct DriverRequest {
    /// Path appended to the provider base URL.
    pub path: String,
    pub headers: HashMap<String, String>,
    pub body: Value,
    pub stream: bool,
}

/// Per-stream decoding state shared by all drivers.
///
/// Text is emitted as it arrives. Tool-call fragments are assembled and
/// emitted whole, followed by `finish`, when the stream ends.
#[derive(Debug, Default)]
pub struct StreamState {
    assembler: ToolCallAssembler,
    /// Provider block/choice index -> tool call id.
    block_ids: HashMap<u64, String>,
    prompt_tokens: Option<u64>,
    completion_tokens: Option<u64>,
    finish_reason: Option<String>,
    metadata_sent: bool,
}

impl StreamState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Response metadata, emitted only for the first call.
    pub(crate) fn metadata_once(&mut self, id: Option<&str>, model: Option<&str>) -> Option<ChunkEvent> {
        if self.metadata_sent {
            return None;
        }
        self.metadata_sent = true;
        Some(ChunkEvent::ResponseMetadata(ResponseMetadata {
            id: id.map(String::from),
            model_id: model.map(String::from),
            timestamp: Some(Utc::now()),
        }))
    }

    pub(crate) fn start_tool_call(&mut self, index: u64, id: &str, name: &str) {
        self.block_ids.insert(index, id.to_string());
        self.assembler.on_started(id, name);
    }

    pub(crate) fn push_tool_arguments(&mut self, index: u64, fragment: &str) {
        if let Some(id) = self.block_ids.get(&index) {
            self.assembler.on_partial(id, fragment);
        }
    }

    pub(crate) fn tool_call_count(&self) -> usize {
        self.block_ids.len()
    }

    pub(crate) fn set_prompt_tokens(&mut self, n: u64) {
        self.prompt_tokens = Some(n);
    }

    pub(crate) fn set_completion_tokens(&mut self, n: u64) {
        self.completion_tokens = Some(n);
    }

    pub(crate) fn set_finish_reason(&mut self, reason: impl Into<String>) {
        self.finish_reason = Some(reason.into());
    }

    pub fn is_finished(&self) -> bool {
        self.finish_reason.is_some()
    }

    /// Flush assembled tool calls and the terminal `finish` event.
    pub fn finish(self) -> Vec<ChunkEvent> {
        let usage = match (self.prompt_tokens, self.completion_tokens) {
            (None, None) => None,
            (p, c) => Some(Usage::new(p.unwrap_or(0), c.unwrap_or(0))),
        };
        let mut events: Vec<ChunkEvent> = self
            .assembler
            .finalize()
            .into_iter()
            .map(|call| ChunkEvent::ToolCall {
                tool_call_id: call.id,
                tool_name: call.name,
                args: call.arguments,
            })
            .collect();
        if let Some(reason) = self.finish_reason {
            events.push(ChunkEvent::finish(reason, usage));
        }
        events
    }
}

/// Wire format adapter for one provider API.
pub trait ProviderDriver: Send + Sync + std::fmt::Debug {
    fn kind(&self) -> ProviderKind;

    fn build_request(&self, request: &GenerationRequest, stream: bool) -> Result<DriverRequest>;

    /// Headers carrying the API key.
    fn auth_headers(&self, api_key: &str) -> Vec<(String, String)>;

    fn parse_response(&self, body: &Value) -> Result<GenerateResult>;

    /// Decode one SSE data payload into zero or more chunk events.
    fn parse_stream_event(&self, data: &str, state: &mut StreamState) -> Result<Vec<ChunkEvent>>;
}

pub fn create_driver(kind: ProviderKind) -> Box<dyn ProviderDriver> {
    match kind {
        ProviderKind::OpenAi => Box::new(OpenAiDriver::new()),
        ProviderKind::Anthropic => Box::new(AnthropicDriver::new()),
        ProviderKind::Google => Box::new(GeminiDriver::new()),
    }
}

pub(crate) fn parse_event_json(kind: ProviderKind, data: &str) -> Result<Value> {
    serde_json::from_str(data)
        .map_err(|e| Error::provider(kind, None, format!("malformed stream event: {}", e)))
}

pub(crate) fn unix_timestamp(secs: Option<i64>) -> DateTime<Utc> {
    secs.and_then(|s| DateTime::from_timestamp(s, 0))
        .unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_kind_parsing() {
        assert_eq!("OpenAI".parse::<ProviderKind>().unwrap(), ProviderKind::OpenAi);
        assert_eq!("gemini".parse::<ProviderKind>().unwrap(), ProviderKind::Google);
        assert!("mistral".parse::<ProviderKind>().is_err());
        let k: ProviderKind = serde_json::from_str("\"gemini\"").unwrap();
        assert_eq!(k.to_string(), "google");
    }

    #[test]
    fn test_stream_state_flushes_tools_before_finish() {
        let mut s = StreamState::new();
        assert!(s.metadata_once(Some("r1"), None).is_some());
        assert!(s.metadata_once(Some("r1"), None).is_none());
        s.start_tool_call(0, "c1", "lookup");
        s.push_tool_arguments(0, "{\"q\":1}");
        s.set_prompt_tokens(7);
        s.set_finish_reason("tool_calls");
        let events = s.finish();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], ChunkEvent::ToolCall { .. }));
        match &events[1] {
            ChunkEvent::Finish { usage, .. } => assert_eq!(usage.as_ref().unwrap().prompt_tokens, 7),
            other => panic!("expected finish, got {:?}", other),
        }
    }

    #[test]
    fn test_unfinished_state_emits_no_finish() {
        let s = StreamState::new();
        assert!(!s.is_finished());
        assert!(s.finish().is_empty());
    }
}
