//! OpenAI Chat Completions driver.
//!
//! - System text is the first `system` message.
//! - Tool results travel as separate `tool` role messages.
//! - Tool-call arguments stream as string fragments keyed by choice index.
//! - `stream_options.include_usage` adds a final usage-only event.

use serde_json::{json, Value};
use std::collections::HashMap;

use super::{parse_event_json, unix_timestamp, DriverRequest, ProviderDriver, ProviderKind, StreamState};
use crate::types::{
    ChunkEvent, ContentBlock, GenerateResult, GenerationRequest, Message, MessageContent,
    MessageRole, ResponseMetadata, ToolCall, ToolChoice, Usage,
};
use crate::{Error, Result};

#[derive(Debug, Default)]
pub struct OpenAiDriver;

impl OpenAiDriver {
    pub fn new() -> Self {
        Self
    }

    fn convert_messages(request: &GenerationRequest) -> Vec<Value> {
        let mut out = Vec::with_capacity(request.messages.len() + 1);
        if let Some(ref system) = request.system {
            out.push(json!({ "role": "system", "content": system }));
        }
        for m in &request.messages {
            Self::convert_message(m, &mut out);
        }
        out
    }

    fn convert_message(m: &Message, out: &mut Vec<Value>) {
        let role = match m.role {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::Tool => "tool",
        };
        let blocks = match &m.content {
            MessageContent::Text(s) => {
                out.push(json!({ "role": role, "content": s }));
                return;
            }
            MessageContent::Blocks(bs) => bs,
        };

        let mut parts = Vec::new();
        let mut tool_calls = Vec::new();
        for b in blocks {
            match b {
                ContentBlock::Text { text } => parts.push(json!({ "type": "text", "text": text })),
                ContentBlock::Image { source } => {
                    let url = if source.source_type == "base64" {
                        format!(
                            "data:{};base64,{}",
                            source.media_type.as_deref().unwrap_or("image/png"),
                            source.data
                        )
                    } else {
                        source.data.clone()
                    };
                    parts.push(json!({ "type": "image_url", "image_url": { "url": url } }));
                }
                ContentBlock::ToolUse { id, name, input } => tool_calls.push(json!({
                    "id": id,
                    "type": "function",
                    "function": { "name": name, "arguments": input.to_string() },
                })),
                ContentBlock::ToolResult {
                    tool_use_id, content, ..
                } => {
                    let content = match content {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    out.push(json!({ "role": "tool", "tool_call_id": tool_use_id, "content": content }));
                }
            }
        }

        if parts.is_empty() && tool_calls.is_empty() {
            return;
        }
        let outer_role = if role == "tool" { "user" } else { role };
        let mut msg = json!({ "role": outer_role });
        msg["content"] = if parts.is_empty() { Value::Null } else { Value::Array(parts) };
        if !tool_calls.is_empty() {
            msg["tool_calls"] = Value::Array(tool_calls);
        }
        out.push(msg);
    }

    fn tool_choice(choice: &ToolChoice) -> Value {
        match choice {
            ToolChoice::Auto => json!("auto"),
            ToolChoice::None => json!("none"),
            ToolChoice::Required => json!("required"),
            ToolChoice::Tool { name } => json!({ "type": "function", "function": { "name": name } }),
        }
    }
}

impl ProviderDriver for OpenAiDriver {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAi
    }

    fn build_request(&self, request: &GenerationRequest, stream: bool) -> Result<DriverRequest> {
        let mut body = json!({
            "model": request.model,
            "messages": Self::convert_messages(request),
            "stream": stream,
        });
        if stream {
            body["stream_options"] = json!({ "include_usage": true });
        }
        if let Some(t) = request.temperature {
            body["temperature"] = json!(t);
        }
        if let Some(mt) = request.max_tokens {
            body["max_tokens"] = json!(mt);
        }
        if !request.tools.is_empty() {
            body["tools"] = request
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
        }
        if let Some(ref choice) = request.tool_choice {
            body["tool_choice"] = Self::tool_choice(choice);
        }
        if let Some(ref schema) = request.response_schema {
            body["response_format"] = json!({
                "type": "json_schema",
                "json_schema": { "name": "response", "schema": schema, "strict": true },
            });
        }

        Ok(DriverRequest {
            path: "/chat/completions".into(),
            headers: HashMap::new(),
            body,
            stream,
        })
    }

    fn auth_headers(&self, api_key: &str) -> Vec<(String, String)> {
        vec![("authorization".into(), format!("Bearer {}", api_key))]
    }

    fn parse_response(&self, body: &Value) -> Result<GenerateResult> {
        let message = body.pointer("/choices/0/message").ok_or_else(|| {
            Error::provider(ProviderKind::OpenAi, None, "response has no choices")
        })?;
        let text = message
            .get("content")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let tool_calls = message
            .get("tool_calls")
            .and_then(|v| v.as_array())
            .map(|calls| {
                calls
                    .iter()
                    .map(|c| {
                        let raw = c.pointer("/function/arguments").and_then(|a| a.as_str()).unwrap_or("{}");
                        ToolCall {
                            id: c["id"].as_str().unwrap_or_default().to_string(),
                            name: c.pointer("/function/name").and_then(|n| n.as_str()).unwrap_or_default().to_string(),
                            arguments: serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string())),
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();
        let finish_reason = body
            .pointer("/choices/0/finish_reason")
            .and_then(|v| v.as_str())
            .unwrap_or("stop")
            .to_string();
        let usage = body.get("usage").map(|u| {
            Usage::new(
                u["prompt_tokens"].as_u64().unwrap_or(0),
                u["completion_tokens"].as_u64().unwrap_or(0),
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
                timestamp: Some(unix_timestamp(body["created"].as_i64())),
            },
        })
    }

    fn parse_stream_event(&self, data: &str, state: &mut StreamState) -> Result<Vec<ChunkEvent>> {
        if data.trim().is_empty() {
            return Ok(Vec::new());
        }
        let v = parse_event_json(ProviderKind::OpenAi, data)?;
        if let Some(msg) = v.pointer("/error/message").and_then(|m| m.as_str()) {
            return Err(Error::provider(ProviderKind::OpenAi, None, msg));
        }

        let mut events = Vec::new();
        if let Some(meta) = state.metadata_once(v["id"].as_str(), v["model"].as_str()) {
            events.push(meta);
        }

        if let Some(delta) = v.pointer("/choices/0/delta") {
            if let Some(text) = delta.get("content").and_then(|c| c.as_str()) {
                if !text.is_empty() {
                    events.push(ChunkEvent::text(text));
                }
            }
            for call in delta.get("tool_calls").and_then(|c| c.as_array()).into_iter().flatten() {
                let index = call["index"].as_u64().unwrap_or(0);
                if let Some(id) = call["id"].as_str() {
                    let name = call.pointer("/function/name").and_then(|n| n.as_str()).unwrap_or_default();
                    state.start_tool_call(index, id, name);
                }
                if let Some(args) = call.pointer("/function/arguments").and_then(|a| a.as_str()) {
                    state.push_tool_arguments(index, args);
                }
            }
        }

        if let Some(reason) = v.pointer("/choices/0/finish_reason").and_then(|r| r.as_str()) {
            state.set_finish_reason(reason);
        }
        if let Some(u) = v.get("usage").filter(|u| !u.is_null()) {
            state.set_prompt_tokens(u["prompt_tokens"].as_u64().unwrap_or(0));
            state.set_completion_tokens(u["completion_tokens"].as_u64().unwrap_or(0));
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ToolDefinition;

    #[test]
    fn test_build_request_maps_tools_and_choice() {
        let req = GenerationRequest::new("gpt-4o", vec![Message::user("Hello")])
            .system("be brief")
            .temperature(0.7)
            .tools(vec![ToolDefinition::new("lookup", json!({"type": "object"}))])
            .tool_choice(ToolChoice::tool("lookup"));
        let r = OpenAiDriver::new().build_request(&req, true).unwrap();
        assert_eq!(r.path, "/chat/completions");
        assert_eq!(r.body["messages"][0]["role"], "system");
        assert_eq!(r.body["messages"][1]["content"], "Hello");
        assert_eq!(r.body["tools"][0]["function"]["name"], "lookup");
        assert_eq!(r.body["tool_choice"]["function"]["name"], "lookup");
        assert_eq!(r.body["stream_options"]["include_usage"], true);
    }

    #[test]
    fn test_tool_results_become_tool_messages() {
        let req = GenerationRequest::new(
            "gpt-4o",
            vec![
                Message::with_content(
                    MessageRole::Assistant,
                    MessageContent::blocks(vec![ContentBlock::ToolUse {
                        id: "c1".into(),
                        name: "lookup".into(),
                        input: json!({"q": "x"}),
                    }]),
                ),
                Message::with_content(
                    MessageRole::Tool,
                    MessageContent::blocks(vec![ContentBlock::ToolResult {
                        tool_use_id: "c1".into(),
                        name: Some("lookup".into()),
                        content: json!("found"),
                        is_error: false,
                    }]),
                ),
            ],
        );
        let r = OpenAiDriver::new().build_request(&req, false).unwrap();
        let msgs = r.body["messages"].as_array().unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0]["tool_calls"][0]["function"]["arguments"], "{\"q\":\"x\"}");
        assert_eq!(msgs[1]["role"], "tool");
        assert_eq!(msgs[1]["content"], "found");
    }

    #[test]
    fn test_parse_response() {
        let body = json!({
            "id": "chatcmpl-1",
            "model": "gpt-4o",
            "created": 1700000000,
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{"id": "c1", "type": "function", "function": {"name": "lookup", "arguments": "{\"q\":\"x\"}"}}]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
        });
        let r = OpenAiDriver::new().parse_response(&body).unwrap();
        assert_eq!(r.text, "");
        assert_eq!(r.tool_calls[0].arguments, json!({"q": "x"}));
        assert_eq!(r.finish_reason, "tool_calls");
        assert_eq!(r.usage.unwrap().total_tokens, 15);
        assert_eq!(r.response.timestamp.unwrap().timestamp(), 1700000000);
    }

    #[test]
    fn test_stream_assembles_tool_calls() {
        let d = OpenAiDriver::new();
        let mut s = StreamState::new();
        let events = [
            r#"{"id":"c","model":"gpt-4o","choices":[{"index":0,"delta":{"content":"Hi"}}]}"#,
            r#"{"id":"c","choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"lookup","arguments":"{\"q\""}}]}}]}"#,
            r#"{"id":"c","choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"function":{"arguments":":1}"}}]}}]}"#,
            r#"{"id":"c","choices":[{"index":0,"delta":{},"finish_reason":"tool_calls"}]}"#,
            r#"{"id":"c","choices":[],"usage":{"prompt_tokens":3,"completion_tokens":4,"total_tokens":7}}"#,
        ];
        let mut out = Vec::new();
        for e in events {
            out.extend(d.parse_stream_event(e, &mut s).unwrap());
        }
        assert_eq!(out.len(), 2);
        assert!(matches!(out[0], ChunkEvent::ResponseMetadata(_)));
        assert_eq!(out[1], ChunkEvent::text("Hi"));

        let tail = s.finish();
        assert_eq!(
            tail[0],
            ChunkEvent::ToolCall {
                tool_call_id: "call_1".into(),
                tool_name: "lookup".into(),
                args: json!({"q": 1}),
            }
        );
        assert_eq!(tail[1], ChunkEvent::finish("tool_calls", Some(Usage::new(3, 4))));
    }
}
