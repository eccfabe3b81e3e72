//! Server-side tool execution.

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::drivers::LanguageModel;
use crate::stream::{spawn_stage, CancelHandle, ChannelStream, DEFAULT_STAGE_BUFFER};
use crate::types::{
    Annotation, ChunkEvent, ChunkSequencer, ContentBlock, GenerationRequest, Message, MessageContent, MessageRole,
    StreamChunk, ToolDefinition,
};
use crate::{BoxStream, Error, ErrorContext, Result};

/// Name the built-in image tool registers under.
pub const DESCRIBE_IMAGE_TOOL: &str = "describe_image";

/// Sending half of the side channel feeding annotations to the merger.
#[derive(Debug, Clone)]
pub struct AnnotationSender(mpsc::UnboundedSender<Annotation>);

pub type AnnotationReceiver = mpsc::UnboundedReceiver<Annotation>;

pub fn annotation_channel() -> (AnnotationSender, AnnotationReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (AnnotationSender(tx), rx)
}

impl AnnotationSender {
    /// Returns `false` when the stream consuming annotations is gone.
    pub fn send(&self, annotation: Annotation) -> bool {
        self.0.send(annotation).is_ok()
    }
}

/// What a tool sees of the request it runs in.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub chat_id: String,
    pub tool_call_id: String,
    annotations: AnnotationSender,
}

impl ToolContext {
    pub fn new(chat_id: impl Into<String>, tool_call_id: impl Into<String>, annotations: AnnotationSender) -> Self {
        Self {
            chat_id: chat_id.into(),
            tool_call_id: tool_call_id.into(),
            annotations,
        }
    }

    pub fn annotate(&self, annotation: Annotation) -> bool {
        self.annotations.send(annotation)
    }

    pub fn progress(&self, message: impl Into<String>) -> bool {
        self.annotate(Annotation::ToolProgress {
            tool_call_id: self.tool_call_id.clone(),
            message: message.into(),
        })
    }
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn definition(&self) -> ToolDefinition;

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<Value>;
}

#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the tools that ship with the crate.
    pub fn with_builtins() -> Self {
        let mut r = Self::new();
        r.register(Arc::new(CurrentTimeTool));
        r
    }

    /// Replaces any tool registered under the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.definition().name;
        self.tools.insert(name, tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Definitions of the named tools, in the given order. Unknown names are
    /// skipped.
    pub fn definitions(&self, names: &[String]) -> Vec<ToolDefinition> {
        names
            .iter()
            .filter_map(|n| match self.tools.get(n) {
                Some(t) => Some(t.definition()),
                None => {
                    warn!(tool = %n, "routed tool is not registered");
                    None
                }
            })
            .collect()
    }
}

/// Reports the current UTC time.
pub struct CurrentTimeTool;

#[async_trait]
impl Tool for CurrentTimeTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            "get_current_time",
            json!({"type": "object", "properties": {}, "additionalProperties": false}),
        )
        .with_description("Current date and time in UTC")
    }

    async fn execute(&self, _args: Value, _ctx: &ToolContext) -> Result<Value> {
        Ok(json!({ "utc": Utc::now().to_rfc3339() }))
    }
}

/// Describes an image by asking a vision-capable model about it.
pub struct DescribeImageTool {
    model: Arc<dyn LanguageModel>,
    model_id: String,
}

impl DescribeImageTool {
    pub fn new(model: Arc<dyn LanguageModel>, model_id: impl Into<String>) -> Self {
        Self {
            model,
            model_id: model_id.into(),
        }
    }
}

#[async_trait]
impl Tool for DescribeImageTool {
    fn definition(&self) -> ToolDefinition {
        ToolDefinition::new(
            DESCRIBE_IMAGE_TOOL,
            json!({
                "type": "object",
                "properties": {
                    "image_url": {"type": "string", "description": "URL of the image to describe"},
                    "question": {"type": "string", "description": "What to look for in the image"}
                },
                "required": ["image_url"],
                "additionalProperties": false
            }),
        )
        .with_description("Describe the contents of an image")
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<Value> {
        let url = args
            .get("image_url")
            .and_then(Value::as_str)
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| {
                Error::validation_with_context(
                    "image_url is required",
                    ErrorContext::new().with_field_path("image_url"),
                )
            })?;
        let question = args
            .get("question")
            .and_then(Value::as_str)
            .unwrap_or("Describe this image in detail.");

        ctx.progress("looking at the image");
        let request = GenerationRequest::new(
            self.model_id.clone(),
            vec![Message::with_content(
                MessageRole::User,
                MessageContent::blocks(vec![ContentBlock::text(question), ContentBlock::image_url(url, None)]),
            )],
        );
        let result = self.model.generate(&request).await?;
        Ok(json!({ "image_url": url, "description": result.text }))
    }
}

/// Executes tool calls found in a chunk stream.
///
/// Each `tool-call` chunk for an active, registered tool is followed by a
/// `tool-result` chunk. A failing tool yields a result with `is_error` set.
/// Calls to other tools pass through without a result. Output chunks are
/// renumbered so sequences stay contiguous.
pub struct ToolRunner {
    registry: Arc<ToolRegistry>,
    active: HashSet<String>,
}

impl ToolRunner {
    pub fn new(registry: Arc<ToolRegistry>, active: &[String]) -> Self {
        Self {
            registry,
            active: active.iter().cloned().collect(),
        }
    }

    fn resolve(&self, name: &str) -> Option<Arc<dyn Tool>> {
        if !self.active.contains(name) {
            return None;
        }
        self.registry.get(name)
    }

    pub fn run(
        self,
        mut input: BoxStream<'static, StreamChunk>,
        chat_id: impl Into<String>,
        annotations: AnnotationSender,
        cancel: &CancelHandle,
    ) -> ChannelStream<StreamChunk> {
        let chat_id = chat_id.into();
        spawn_stage(cancel, DEFAULT_STAGE_BUFFER, move |out| async move {
            let mut seq = ChunkSequencer::new();
            loop {
                let next = tokio::select! {
                    biased;
                    _ = out.cancelled() => return,
                    next = input.next() => next,
                };
                let chunk = match next {
                    Some(Ok(c)) => c,
                    Some(Err(e)) => {
                        out.emit(Err(e)).await;
                        return;
                    }
                    None => return,
                };
                let call = match &chunk.event {
                    ChunkEvent::ToolCall {
                        tool_call_id,
                        tool_name,
                        args,
                    } => Some((tool_call_id.clone(), tool_name.clone(), args.clone())),
                    _ => None,
                };
                if !out.emit(Ok(seq.chunk(chunk.event))).await {
                    return;
                }
                let Some((id, name, args)) = call else {
                    continue;
                };
                let Some(tool) = self.resolve(&name) else {
                    debug!(tool = %name, "tool call left for the client");
                    continue;
                };

                let ctx = ToolContext::new(chat_id.clone(), id.clone(), annotations.clone());
                let outcome = tokio::select! {
                    biased;
                    _ = out.cancelled() => return,
                    r = tool.execute(args, &ctx) => r,
                };
                let (result, is_error) = match outcome {
                    Ok(v) => (v, false),
                    Err(e) => {
                        warn!(tool = %name, error = %e, "tool failed");
                        (json!({ "error": e.to_string() }), true)
                    }
                };
                let event = ChunkEvent::ToolResult {
                    tool_call_id: id,
                    tool_name: name,
                    result,
                    is_error,
                };
                if !out.emit(Ok(seq.chunk(event))).await {
                    return;
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChunkKind;
    use crate::Error;
    use futures::stream;

    struct Failing;

    #[async_trait]
    impl Tool for Failing {
        fn definition(&self) -> ToolDefinition {
            ToolDefinition::new("broken", json!({"type": "object"}))
        }

        async fn execute(&self, _args: Value, ctx: &ToolContext) -> Result<Value> {
            ctx.progress("trying");
            Err(Error::runtime("boom"))
        }
    }

    fn registry() -> Arc<ToolRegistry> {
        let mut r = ToolRegistry::with_builtins();
        r.register(Arc::new(Failing));
        Arc::new(r)
    }

    fn call(seq: u64, id: &str, name: &str) -> StreamChunk {
        StreamChunk::new(
            seq,
            ChunkEvent::ToolCall {
                tool_call_id: id.into(),
                tool_name: name.into(),
                args: json!({}),
            },
        )
    }

    async fn run(active: &[&str], input: Vec<StreamChunk>) -> (Vec<StreamChunk>, Vec<Annotation>) {
        let active: Vec<String> = active.iter().map(|s| s.to_string()).collect();
        let (tx, mut rx) = annotation_channel();
        let input: BoxStream<'static, StreamChunk> = Box::pin(stream::iter(input.into_iter().map(Ok)));
        let out: Vec<StreamChunk> = ToolRunner::new(registry(), &active)
            .run(input, "chat-1", tx, &CancelHandle::new())
            .map(|r| r.unwrap())
            .collect()
            .await;
        let mut notes = Vec::new();
        while let Ok(a) = rx.try_recv() {
            notes.push(a);
        }
        (out, notes)
    }

    #[tokio::test]
    async fn test_inserts_result_after_call() {
        let input = vec![
            StreamChunk::new(0, ChunkEvent::text("hi")),
            call(1, "c1", "get_current_time"),
            StreamChunk::new(2, ChunkEvent::finish("tool_calls", None)),
        ];
        let (out, _) = run(&["get_current_time"], input).await;
        let kinds: Vec<ChunkKind> = out.iter().map(|c| c.kind()).collect();
        assert_eq!(
            kinds,
            vec![ChunkKind::TextDelta, ChunkKind::ToolCall, ChunkKind::ToolResult, ChunkKind::Finish]
        );
        let seqs: Vec<u64> = out.iter().map(|c| c.sequence).collect();
        assert_eq!(seqs, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_tool_error_becomes_error_result() {
        let (out, notes) = run(&["broken"], vec![call(0, "c9", "broken")]).await;
        match &out[1].event {
            ChunkEvent::ToolResult { is_error, result, .. } => {
                assert!(*is_error);
                assert!(result["error"].as_str().unwrap().contains("boom"));
            }
            other => panic!("expected tool result, got {:?}", other),
        }
        assert_eq!(
            notes,
            vec![Annotation::ToolProgress {
                tool_call_id: "c9".into(),
                message: "trying".into()
            }]
        );
    }

    #[tokio::test]
    async fn test_inactive_or_unknown_tools_are_not_run() {
        let input = vec![call(0, "a", "get_current_time"), call(1, "b", "nope")];
        let (out, _) = run(&["nope"], input).await;
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|c| c.kind() == ChunkKind::ToolCall));
    }

    #[tokio::test]
    async fn test_describe_image_asks_model_about_the_image() {
        let model = Arc::new(crate::drivers::ScriptedModel::new().with_reply("a red bicycle"));
        let tool = DescribeImageTool::new(model.clone(), "vision-model");
        let (tx, mut rx) = annotation_channel();
        let ctx = ToolContext::new("chat-1", "v1", tx);

        let out = tool
            .execute(json!({"image_url": "https://img.example/bike.png"}), &ctx)
            .await
            .unwrap();
        assert_eq!(out["description"], "a red bicycle");
        assert_eq!(out["image_url"], "https://img.example/bike.png");

        let seen = model.requests();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].model, "vision-model");
        assert!(seen[0].messages[0].contains_image());
        assert!(rx.try_recv().is_ok());

        let err = tool.execute(json!({"question": "what?"}), &ctx).await.unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        assert_eq!(model.generate_calls(), 1);
    }

    #[test]
    fn test_definitions_follow_requested_order() {
        let r = registry();
        let defs = r.definitions(&["broken".to_string(), "missing".to_string(), "get_current_time".to_string()]);
        let names: Vec<&str> = defs.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["broken", "get_current_time"]);
        assert_eq!(r.names(), vec!["broken".to_string(), "get_current_time".to_string()]);
    }
}
