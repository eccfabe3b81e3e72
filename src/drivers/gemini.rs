//! Google Gemini `generateContent` driver. Key differences:
//! - `contents` with `parts`; roles are `user` and `model`.
//! - System text goes in `system_instruction`.
//! - Sampling parameters live under `generationConfig`.
//! - Function calls arrive whole and carry no id; one is derived from the
//!   name and position.
//! - The model id is part of the path; the key travels in `x-goog-api-key`.

use serde_json::{json, Value};
use std::collections::HashMap;

use super::{parse_event_json, DriverRequest, ProviderDriver, ProviderKind, StreamState};
use crate::types::{
    ChunkEvent, ContentBlock, GenerateResult, GenerationRequest, MessageContent, MessageRole,
    ResponseMetadata, ToolCall, ToolChoice, Usage,
};
use crate::{Error, Result};

#[derive(Debug, Default)]
pub struct GeminiDriver;

impl GeminiDriver {
    pub fn new() -> Self {
        Self
    }

    fn split_messages(request: &GenerationRequest) -> (Option<Value>, Vec<Value>) {
        let mut system_parts: Vec<String> = request.system.iter().cloned().collect();
        let mut contents: Vec<Value> = Vec::new();

        for m in &request.messages {
            let role = match m.role {
                MessageRole::System => {
                    system_parts.push(m.text());
                    continue;
                }
                MessageRole::Assistant => "model",
                MessageRole::User | MessageRole::Tool => "user",
            };
            let parts = match &m.content {
                MessageContent::Text(s) => vec![json!({ "text": s })],
                MessageContent::Blocks(bs) => bs.iter().map(Self::part).collect(),
            };
            contents.push(json!({ "role": role, "parts": parts }));
        }

        let system_instruction = if system_parts.is_empty() {
            None
        } else {
            Some(json!({ "parts": [{ "text": system_parts.join("\n\n") }] }))
        };
        (system_instruction, contents)
    }

    fn part(b: &ContentBlock) -> Value {
        match b {
            ContentBlock::Text { text } => json!({ "text": text }),
            ContentBlock::Image { source } => {
                let mime = source.media_type.as_deref().unwrap_or("image/png");
                if source.source_type == "base64" {
                    json!({ "inline_data": { "mime_type": mime, "data": source.data } })
                } else {
                    json!({ "file_data": { "mime_type": mime, "file_uri": source.data } })
                }
            }
            ContentBlock::ToolUse { name, input, .. } => {
                json!({ "functionCall": { "name": name, "args": input } })
            }
            ContentBlock::ToolResult {
                tool_use_id,
                name,
                content,
                ..
            } => json!({
                "functionResponse": {
                    "name": name.as_deref().unwrap_or(tool_use_id),
                    "response": { "content": content },
                }
            }),
        }
    }

    fn tool_config(choice: &ToolChoice) -> Value {
        match choice {
            ToolChoice::Auto => json!({ "functionCallingConfig": { "mode": "AUTO" } }),
            ToolChoice::None => json!({ "functionCallingConfig": { "mode": "NONE" } }),
            ToolChoice::Required => json!({ "functionCallingConfig": { "mode": "ANY" } }),
            ToolChoice::Tool { name } => json!({
                "functionCallingConfig": { "mode": "ANY", "allowedFunctionNames": [name] }
            }),
        }
    }

    fn normalize_finish_reason(reason: &str) -> String {
        match reason {
            "STOP" => "stop".to_string(),
            "MAX_TOKENS" => "length".to_string(),
            "SAFETY" | "RECITATION" | "BLOCKLIST" | "PROHIBITED_CONTENT" => {
                "content_filter".to_string()
            }
            other => other.to_lowercase(),
        }
    }

    fn call_id(name: &str, position: usize) -> String {
        format!("{}-{}", name, position)
    }
}

impl ProviderDriver for GeminiDriver {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Google
    }

    fn build_request(&self, request: &GenerationRequest, stream: bool) -> Result<DriverRequest> {
        let (system_instruction, contents) = Self::split_messages(request);
        let mut body = json!({ "contents": contents });
        if let Some(sys) = system_instruction {
            body["system_instruction"] = sys;
        }

        let mut gen_config = serde_json::Map::new();
        if let Some(t) = request.temperature {
            gen_config.insert("temperature".into(), json!(t));
        }
        if let Some(mt) = request.max_tokens {
            gen_config.insert("maxOutputTokens".into(), json!(mt));
        }
        if let Some(ref schema) = request.response_schema {
            gen_config.insert("responseMimeType".into(), json!("application/json"));
            gen_config.insert("responseSchema".into(), schema.clone());
        }
        if !gen_config.is_empty() {
            body["generationConfig"] = Value::Object(gen_config);
        }

        if !request.tools.is_empty() {
            let decls: Vec<Value> = request
                .tools
                .iter()
                .map(|t| json!({ "name": t.name, "description": t.description, "parameters": t.parameters }))
                .collect();
            body["tools"] = json!([{ "functionDeclarations": decls }]);
        }
        if let Some(ref choice) = request.tool_choice {
            body["toolConfig"] = Self::tool_config(choice);
        }

        let path = if stream {
            format!("/models/{}:streamGenerateContent?alt=sse", request.model)
        } else {
            format!("/models/{}:generateContent", request.model)
        };
        Ok(DriverRequest {
            path,
            headers: HashMap::new(),
            body,
            stream,
        })
    }

    fn auth_headers(&self, api_key: &str) -> Vec<(String, String)> {
        vec![("x-goog-api-key".into(), api_key.to_string())]
    }

    fn parse_response(&self, body: &Value) -> Result<GenerateResult> {
        let candidate = body.pointer("/candidates/0").ok_or_else(|| {
            Error::provider(ProviderKind::Google, None, "response has no candidates")
        })?;

        let mut text = String::new();
        let mut tool_calls = Vec::new();
        for part in candidate.pointer("/content/parts").and_then(|p| p.as_array()).into_iter().flatten() {
            if let Some(t) = part["text"].as_str() {
                text.push_str(t);
            }
            if let Some(call) = part.get("functionCall") {
                let name = call["name"].as_str().unwrap_or_default();
                tool_calls.push(ToolCall {
                    id: Self::call_id(name, tool_calls.len()),
                    name: name.to_string(),
                    arguments: call.get("args").cloned().unwrap_or_else(|| json!({})),
                });
            }
        }

        let finish_reason = if !tool_calls.is_empty() {
            "tool_calls".to_string()
        } else {
            candidate["finishReason"]
                .as_str()
                .map(Self::normalize_finish_reason)
                .unwrap_or_else(|| "stop".to_string())
        };
        let usage = body.get("usageMetadata").map(|u| {
            Usage::new(
                u["promptTokenCount"].as_u64().unwrap_or(0),
                u["candidatesTokenCount"].as_u64().unwrap_or(0),
            )
        });

        Ok(GenerateResult {
            text,
            tool_calls,
            finish_reason,
            usage,
            response: ResponseMetadata {
                id: body["responseId"].as_str().map(String::from),
                model_id: body["modelVersion"].as_str().map(String::from),
                timestamp: Some(chrono::Utc::now()),
            },
        })
    }

    fn parse_stream_event(&self, data: &str, state: &mut StreamState) -> Result<Vec<ChunkEvent>> {
        if data.trim().is_empty() {
            return Ok(Vec::new());
        }
        let v = parse_event_json(ProviderKind::Google, data)?;
        if let Some(error) = v.get("error") {
            let msg = error["message"].as_str().unwrap_or("stream error");
            return Err(Error::provider(ProviderKind::Google, error["code"].as_u64().map(|c| c as u16), msg));
        }

        let mut events = Vec::new();
        if let Some(meta) = state.metadata_once(v["responseId"].as_str(), v["modelVersion"].as_str()) {
            events.push(meta);
        }

        let mut saw_call = false;
        for part in v.pointer("/candidates/0/content/parts").and_then(|p| p.as_array()).into_iter().flatten() {
            if let Some(t) = part["text"].as_str() {
                if !t.is_empty() {
                    events.push(ChunkEvent::text(t));
                }
            }
            if let Some(call) = part.get("functionCall") {
                let name = call["name"].as_str().unwrap_or_default();
                let index = state.tool_call_count() as u64;
                let id = Self::call_id(name, index as usize);
                state.start_tool_call(index, &id, name);
                let args = call.get("args").cloned().unwrap_or_else(|| json!({}));
                state.push_tool_arguments(index, &args.to_string());
                saw_call = true;
            }
        }

        if let Some(reason) = v.pointer("/candidates/0/finishReason").and_then(|r| r.as_str()) {
            if saw_call || state.tool_call_count() > 0 {
                state.set_finish_reason("tool_calls");
            } else {
                state.set_finish_reason(Self::normalize_finish_reason(reason));
            }
        }
        if let Some(u) = v.get("usageMetadata") {
            if let Some(n) = u["promptTokenCount"].as_u64() {
                state.set_prompt_tokens(n);
            }
            if let Some(n) = u["candidatesTokenCount"].as_u64() {
                state.set_completion_tokens(n);
            }
        }
        Ok(events)
    }
}
