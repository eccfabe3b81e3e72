//! Anthropic Messages API driver. Differences from OpenAI:
//! - System text is a top-level `system` parameter.
//! - Content uses typed blocks; tool results are `tool_result` blocks in a
//!   user turn.
//! - Streaming events are typed (`message_start`, `content_block_delta`, ...).
//! - `max_tokens` is required.

use serde_json::{json, Value};
use std::collections::HashMap;

use super::{parse_event_json, DriverRequest, ProviderDriver, ProviderKind, StreamState};
use crate::types::{
    ChunkEvent, ContentBlock, GenerateResult, GenerationRequest, MessageContent, MessageRole,
    ResponseMetadata, ToolCall, ToolChoice, Usage,
};
use crate::{Error, Result};

const DEFAULT_MAX_TOKENS: u32 = 4096;
const API_VERSION: &str = "2023-06-01";

#[derive(Debug, Default)]
pub struct AnthropicDriver;

impl AnthropicDriver {
    pub fn new() -> Self {
        Self
    }

    /// Split into the top-level system text and the conversation turns.
    fn split_messages(request: &GenerationRequest) -> (Option<String>, Vec<Value>) {
        let mut system_parts: Vec<String> = request.system.iter().cloned().collect();
        let mut turns: Vec<Value> = Vec::new();

        for m in &request.messages {
            let role = match m.role {
                MessageRole::System => {
                    system_parts.push(m.text());
                    continue;
                }
                MessageRole::Assistant => "assistant",
                MessageRole::User | MessageRole::Tool => "user",
            };
            let content = match &m.content {
                MessageContent::Text(s) => json!([{ "type": "text", "text": s }]),
                MessageContent::Blocks(bs) => Value::Array(bs.iter().map(Self::block).collect()),
            };
            turns.push(json!({ "role": role, "content": content }));
        }

        let system = if system_parts.is_empty() {
            None
        } else {
            Some(system_parts.join("\n\n"))
        };
        (system, turns)
    }

    fn block(b: &ContentBlock) -> Value {
        match b {
            ContentBlock::Text { text } => json!({ "type": "text", "text": text }),
            ContentBlock::Image { source } if source.source_type == "base64" => json!({
                "type": "image",
                "source": {
                    "type": "base64",
                    "media_type": source.media_type.as_deref().unwrap_or("image/png"),
                    "data": source.data,
                }
            }),
            ContentBlock::Image { source } => json!({
                "type": "image",
                "source": { "type": "url", "url": source.data }
            }),
            ContentBlock::ToolUse { id, name, input } => json!({
                "type": "tool_use", "id": id, "name": name, "input": input
            }),
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
                ..
            } => {
                let content = match content {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                json!({
                    "type": "tool_result",
                    "tool_use_id": tool_use_id,
                    "content": content,
                    "is_error": is_error,
                })
            }
        }
    }

    fn tool_choice(choice: &ToolChoice) -> Value {
        match choice {
            ToolChoice::Auto => json!({ "type": "auto" }),
            ToolChoice::None => json!({ "type": "none" }),
            ToolChoice::Required => json!({ "type": "any" }),
            ToolChoice::Tool { name } => json!({ "type": "tool", "name": name }),
        }
    }

    fn normalize_stop_reason(reason: &str) -> String {
        match reason {
            "end_turn" | "stop_sequence" => "stop".to_string(),
            "max_tokens" => "length".to_string(),
            "tool_use" => "tool_calls".to_string(),
            other => other.to_string(),
        }
    }
}

impl ProviderDriver for AnthropicDriver {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    fn build_request(&self, request: &GenerationRequest, stream: bool) -> Result<DriverRequest> {
        let (mut system, turns) = Self::split_messages(request);

        // No native structured output: the schema goes into the system text.
        if let Some(ref schema) = request.response_schema {
            let instruction = format!(
                "Respond only with JSON matching this schema, no other text: {}",
                schema
            );
            system = Some(match system {
                Some(s) => format!("{}\n\n{}", s, instruction),
                None => instruction,
            });
        }

        let mut body = json!({
            "model": request.model,
            "messages": turns,
            "max_tokens": request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            "stream": stream,
        });
        if let Some(sys) = system {
            body["system"] = Value::String(sys);
        }
        if let Some(t) = request.temperature {
            body["temperature"] = json!(t);
        }
        if !request.tools.is_empty() {
            body["tools"] = request
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "name": t.name,
                        "description": t.description,
                        "input_schema": t.parameters,
                    })
                })
                .collect();
        }
        if let Some(ref choice) = request.tool_choice {
            body["tool_choice"] = Self::tool_choice(choice);
        }

        let mut headers = HashMap::new();
        headers.insert("anthropic-version".into(), API_VERSION.into());

        Ok(DriverRequest {
            path: "/messages".into(),
            headers,
            body,
            stream,
        })
    }

    fn auth_headers(&self, api_key: &str) -> Vec<(String, String)> {
        vec![("x-api-key".into(), api_key.to_string())]
    }

    fn parse_response(&self, body: &Value) -> Result<GenerateResult> {
        let blocks = body["content"].as_array().ok_or_else(|| {
            Error::provider(ProviderKind::Anthropic, None, "response has no content")
        })?;

        let mut text = String::new();
        let mut tool_calls = Vec::new();
        for b in blocks {
            match b["type"].as_str() {
                Some("text") => text.push_str(b["text"].as_str().unwrap_or_default()),
                Some("tool_use") => tool_calls.push(ToolCall {
                    id: b["id"].as_str().unwrap_or_default().to_string(),
                    name: b["name"].as_str().unwrap_or_default().to_string(),
                    arguments: b["input"].clone(),
                }),
                _ => {}
            }
        }

        let finish_reason = body["stop_reason"]
            .as_str()
            .map(Self::normalize_stop_reason)
            .unwrap_or_else(|| "stop".to_string());
        let usage = body.get("usage").map(|u| {
            Usage::new(
                u["input_tokens"].as_u64().unwrap_or(0),
                u["output_tokens"].as_u64().unwrap_or(0),
            )
        });

        Ok(GenerateResult {
            text,
            tool_calls,
            finish_reason,
            usage,
            response: ResponseMetadata {
                id: body["id"].as_str().map(String::from),
                model_id: body["model"].as_str().map(String::from),
                timestamp: Some(chrono::Utc::now()),
            },
        })
    }

    fn parse_stream_event(&self, data: &str, state: &mut StreamState) -> Result<Vec<ChunkEvent>> {
        if data.trim().is_empty() {
            return Ok(Vec::new());
        }
        let v = parse_event_json(ProviderKind::Anthropic, data)?;
        let mut events = Vec::new();

        match v["type"].as_str().unwrap_or_default() {
            "message_start" => {
                let msg = &v["message"];
                if let Some(meta) = state.metadata_once(msg["id"].as_str(), msg["model"].as_str()) {
                    events.push(meta);
                }
                if let Some(n) = msg.pointer("/usage/input_tokens").and_then(|n| n.as_u64()) {
                    state.set_prompt_tokens(n);
                }
            }
            "content_block_start" => {
                let block = &v["content_block"];
                if block["type"] == "tool_use" {
                    state.start_tool_call(
                        v["index"].as_u64().unwrap_or(0),
                        block["id"].as_str().unwrap_or_default(),
                        block["name"].as_str().unwrap_or_default(),
                    );
                }
            }
            "content_block_delta" => {
                let delta = &v["delta"];
                match delta["type"].as_str() {
                    Some("text_delta") => {
                        let text = delta["text"].as_str().unwrap_or_default();
                        if !text.is_empty() {
                            events.push(ChunkEvent::text(text));
                        }
                    }
                    Some("input_json_delta") => state.push_tool_arguments(
                        v["index"].as_u64().unwrap_or(0),
                        delta["partial_json"].as_str().unwrap_or_default(),
                    ),
                    _ => {}
                }
            }
            "message_delta" => {
                if let Some(reason) = v.pointer("/delta/stop_reason").and_then(|r| r.as_str()) {
                    state.set_finish_reason(Self::normalize_stop_reason(reason));
                }
                if let Some(n) = v.pointer("/usage/output_tokens").and_then(|n| n.as_u64()) {
                    state.set_completion_tokens(n);
                }
            }
            "error" => {
                let msg = v
                    .pointer("/error/message")
                    .and_then(|m| m.as_str())
                    .unwrap_or("stream error");
                return Err(Error::provider(ProviderKind::Anthropic, None, msg));
            }
            _ => {}
        }
        Ok(events)
    }
}
