//! HttpModel against mock provider endpoints.

use futures::StreamExt;
use genflow::drivers::{HttpModel, ProviderConfig};
use genflow::types::{ChunkEvent, ChunkKind, GenerationRequest, Message, StreamChunk};
use genflow::{CancelHandle, Error, LanguageModel, ProviderKind};
use mockito::{Matcher, Server};

fn sse(frames: &[&str]) -> String {
    frames.iter().map(|f| format!("data: {}\n\n", f)).collect()
}

fn model(kind: ProviderKind, base_url: &str, name: &str) -> HttpModel {
    HttpModel::new(
        &ProviderConfig::new(kind, name)
            .with_base_url(base_url)
            .with_api_key("test-key"),
    )
    .expect("model")
}

async fn collect(model: &HttpModel, req: &GenerationRequest) -> Vec<genflow::Result<StreamChunk>> {
    model
        .stream(req, &CancelHandle::new())
        .await
        .expect("stream start")
        .collect()
        .await
}

#[tokio::test]
async fn test_openai_stream_assembles_tool_call() {
    let mut server = Server::new_async().await;
    let body = sse(&[
        r#"{"id":"chatcmpl-1","model":"gpt-4o","choices":[{"index":0,"delta":{"role":"assistant","content":"Hel"},"finish_reason":null}]}"#,
        r#"{"id":"chatcmpl-1","model":"gpt-4o","choices":[{"index":0,"delta":{"content":"lo"},"finish_reason":null}]}"#,
        r#"{"id":"chatcmpl-1","model":"gpt-4o","choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"id":"call_1","type":"function","function":{"name":"get_current_time","arguments":""}}]},"finish_reason":null}]}"#,
        r#"{"id":"chatcmpl-1","model":"gpt-4o","choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"function":{"arguments":"{\"tz\":"}}]},"finish_reason":null}]}"#,
        r#"{"id":"chatcmpl-1","model":"gpt-4o","choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\"UTC\"}"}}]},"finish_reason":null}]}"#,
        r#"{"id":"chatcmpl-1","model":"gpt-4o","choices":[{"index":0,"delta":{},"finish_reason":"tool_calls"}]}"#,
        r#"{"id":"chatcmpl-1","model":"gpt-4o","choices":[],"usage":{"prompt_tokens":9,"completion_tokens":4,"total_tokens":13}}"#,
        "[DONE]",
    ]);
    let mock = server
        .mock("POST", "/chat/completions")
        .match_header("authorization", "Bearer test-key")
        .match_body(Matcher::PartialJson(serde_json::json!({"model": "gpt-4o", "stream": true})))
        .with_status(200)
        .with_header("content-type", "text/event-stream")
        .with_body(body)
        .create_async()
        .await;

    let m = model(ProviderKind::OpenAi, &server.url(), "gpt-4o");
    let req = GenerationRequest::new("gpt-4o", vec![Message::user("time?")]);
    let chunks: Vec<StreamChunk> = collect(&m, &req).await.into_iter().map(|r| r.unwrap()).collect();
    mock.assert_async().await;

    let kinds: Vec<ChunkKind> = chunks.iter().map(|c| c.kind()).collect();
    assert_eq!(
        kinds,
        vec![
            ChunkKind::ResponseMetadata,
            ChunkKind::TextDelta,
            ChunkKind::TextDelta,
            ChunkKind::ToolCall,
            ChunkKind::Finish,
        ]
    );
    match &chunks[3].event {
        ChunkEvent::ToolCall { tool_call_id, args, .. } => {
            assert_eq!(tool_call_id, "call_1");
            assert_eq!(args, &serde_json::json!({"tz": "UTC"}));
        }
        other => panic!("expected tool call, got {:?}", other),
    }
    match &chunks[4].event {
        ChunkEvent::Finish { finish_reason, usage } => {
            assert_eq!(finish_reason, "tool_calls");
            assert_eq!(usage.as_ref().map(|u| u.total_tokens), Some(13));
        }
        other => panic!("expected finish, got {:?}", other),
    }
    let seqs: Vec<u64> = chunks.iter().map(|c| c.sequence).collect();
    assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
}

#[tokio::test]
async fn test_truncated_stream_ends_with_error() {
    let mut server = Server::new_async().await;
    let body = sse(&[
        r#"{"id":"chatcmpl-2","model":"gpt-4o","choices":[{"index":0,"delta":{"content":"partial"},"finish_reason":null}]}"#,
    ]);
    let _mock = server
        .mock("POST", "/chat/completions")
        .with_status(200)
        .with_header("content-type", "text/event-stream")
        .with_body(body)
        .create_async()
        .await;

    let m = model(ProviderKind::OpenAi, &server.url(), "gpt-4o");
    let req = GenerationRequest::new("gpt-4o", vec![Message::user("x")]);
    let items = collect(&m, &req).await;
    assert!(items.iter().take(items.len() - 1).all(|r| r.is_ok()));
    assert!(matches!(items.last(), Some(Err(Error::Provider { .. }))));
}

#[tokio::test]
async fn test_anthropic_generate() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/messages")
        .match_header("x-api-key", "test-key")
        .match_header("anthropic-version", Matcher::Any)
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            r#"{"id":"msg_1","model":"claude-3-5-haiku-latest","type":"message","role":"assistant",
                "content":[{"type":"text","text":"Hi there"}],
                "stop_reason":"end_turn","usage":{"input_tokens":5,"output_tokens":2}}"#,
        )
        .create_async()
        .await;

    let m = model(ProviderKind::Anthropic, &server.url(), "claude-3-5-haiku-latest");
    let req = GenerationRequest::new("claude-3-5-haiku-latest", vec![Message::user("hello")]);
    let result = m.generate(&req).await.unwrap();
    mock.assert_async().await;

    assert_eq!(result.text, "Hi there");
    assert_eq!(result.finish_reason, "stop");
    assert_eq!(result.usage.map(|u| u.total_tokens), Some(7));
    assert_eq!(result.response.id.as_deref(), Some("msg_1"));
}

#[tokio::test]
async fn test_anthropic_stream() {
    let mut server = Server::new_async().await;
    let body = sse(&[
        r#"{"type":"message_start","message":{"id":"msg_2","model":"claude-3-5-haiku-latest","usage":{"input_tokens":3}}}"#,
        r#"{"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}"#,
        r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hi"}}"#,
        r#"{"type":"content_block_stop","index":0}"#,
        r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":1}}"#,
        r#"{"type":"message_stop"}"#,
    ]);
    let _mock = server
        .mock("POST", "/messages")
        .with_status(200)
        .with_header("content-type", "text/event-stream")
        .with_body(body)
        .create_async()
        .await;

    let m = model(ProviderKind::Anthropic, &server.url(), "claude-3-5-haiku-latest");
    let req = GenerationRequest::new("claude-3-5-haiku-latest", vec![Message::user("hello")]);
    let chunks: Vec<StreamChunk> = collect(&m, &req).await.into_iter().map(|r| r.unwrap()).collect();
    let kinds: Vec<ChunkKind> = chunks.iter().map(|c| c.kind()).collect();
    assert_eq!(kinds, vec![ChunkKind::ResponseMetadata, ChunkKind::TextDelta, ChunkKind::Finish]);
}

#[tokio::test]
async fn test_gemini_stream() {
    let mut server = Server::new_async().await;
    let body = sse(&[
        r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"Bonjour"}]}}],"responseId":"r1","modelVersion":"gemini-2.0-flash"}"#,
        r#"{"candidates":[{"content":{"role":"model","parts":[{"text":" !"}]},"finishReason":"STOP"}],"usageMetadata":{"promptTokenCount":2,"candidatesTokenCount":2}}"#,
    ]);
    let mock = server
        .mock("POST", Matcher::Regex(r"^/models/gemini-2\.0-flash:streamGenerateContent".into()))
        .match_header("x-goog-api-key", "test-key")
        .with_status(200)
        .with_header("content-type", "text/event-stream")
        .with_body(body)
        .create_async()
        .await;

    let m = model(ProviderKind::Google, &server.url(), "gemini-2.0-flash");
    let req = GenerationRequest::new("gemini-2.0-flash", vec![Message::user("salut")]);
    let chunks: Vec<StreamChunk> = collect(&m, &req).await.into_iter().map(|r| r.unwrap()).collect();
    mock.assert_async().await;

    let text: String = chunks
        .iter()
        .filter_map(|c| match &c.event {
            ChunkEvent::TextDelta { text } => Some(text.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(text, "Bonjour !");
    assert!(chunks.last().unwrap().is_finish());
}

#[tokio::test]
async fn test_error_status_is_a_provider_error_at_start() {
    let mut server = Server::new_async().await;
    let _mock = server
        .mock("POST", "/chat/completions")
        .with_status(429)
        .with_header("content-type", "application/json")
        .with_body(r#"{"error":{"message":"Rate limit reached","type":"requests"}}"#)
        .expect(2)
        .create_async()
        .await;

    let m = model(ProviderKind::OpenAi, &server.url(), "gpt-4o");
    let req = GenerationRequest::new("gpt-4o", vec![Message::user("x")]);

    match m.generate(&req).await {
        Err(Error::Provider { status, message, .. }) => {
            assert_eq!(status, Some(429));
            assert_eq!(message, "Rate limit reached");
        }
        other => panic!("expected provider error, got {:?}", other.map(|r| r.text)),
    }
    assert!(matches!(
        m.stream(&req, &CancelHandle::new()).await,
        Err(Error::Provider { status: Some(429), .. })
    ));
}
