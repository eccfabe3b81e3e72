use futures::stream;
use std::sync::Arc;
use tracing::info;

use super::builder::ChatOrchestratorBuilder;
use super::chat::{ChatRequest, ChatResponse};
use crate::cache::{CachedModel, GenerationCache};
use crate::classify::PromptClassifier;
use crate::drivers::LanguageModel;
use crate::pipeline::{annotation_channel, PersistenceSink, StreamMerger, ToolRegistry, ToolRunner};
use crate::routing::{Route, StreamingMode, ToolRouter};
use crate::stream::CancelHandle;
use crate::types::{Annotation, GenerationRequest, StreamChunk};
use crate::{BoxStream, Error, ErrorContext, Result};

/// Runs chat requests end to end: classify, route, generate or replay,
/// execute tools, merge, persist.
///
/// Requests share nothing but the cache, the tool registry and the
/// persistence sink.
pub struct ChatOrchestrator {
    pub(crate) model: Arc<CachedModel>,
    pub(crate) classifier: PromptClassifier,
    pub(crate) router: ToolRouter,
    pub(crate) tools: Arc<ToolRegistry>,
    pub(crate) sink: PersistenceSink,
    pub(crate) default_model: String,
}

impl ChatOrchestrator {
    pub fn builder() -> ChatOrchestratorBuilder {
        ChatOrchestratorBuilder::new()
    }

    pub fn cache(&self) -> &GenerationCache {
        self.model.cache()
    }

    pub fn persistence(&self) -> &PersistenceSink {
        &self.sink
    }

    pub fn router(&self) -> &ToolRouter {
        &self.router
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// The primary generation request for `request` under `route`.
    pub fn build_request(&self, request: &ChatRequest, route: &Route) -> GenerationRequest {
        let model = request.model.clone().unwrap_or_else(|| self.default_model.clone());
        let mut g = GenerationRequest::new(model, request.prompt_messages());
        if let Some(ref system) = request.system {
            g = g.system(system.clone());
        }
        let tools = self.tools.definitions(&route.tools);
        if !tools.is_empty() {
            g = g.tools(tools).tool_choice(route.tool_choice.clone());
        }
        g
    }

    pub async fn handle(&self, request: ChatRequest) -> Result<ChatResponse> {
        if request.last_user_message().is_none() {
            return Err(Error::validation_with_context(
                "chat request has no user message",
                ErrorContext::new().with_field_path("messages"),
            ));
        }

        let label = self.classifier.classify(&request.prompt_messages()).await;
        let route = self.router.route(label);
        info!(chat_id = %request.chat_id, label = %label, mode = ?route.mode, "routing chat request");

        let generation = self.build_request(&request, &route);
        let cancel = CancelHandle::new();
        let chunks: BoxStream<'static, StreamChunk> = match route.mode {
            StreamingMode::Stream => self.model.stream(&generation, &cancel).await?,
            StreamingMode::Generate => {
                let result = self.model.generate(&generation).await?;
                Box::pin(stream::iter(result.into_chunks().into_iter().map(Ok)))
            }
        };

        let (annotations, side_channel) = annotation_channel();
        annotations.send(Annotation::Classification { label });
        let executed = ToolRunner::new(self.tools.clone(), &route.tools).run(
            chunks,
            request.chat_id.clone(),
            annotations,
            &cancel,
        );

        let hook = self.sink.on_finish(
            request.chat_id.clone(),
            request.last_user_message().cloned(),
            request.attachments.clone(),
        );
        let merged = StreamMerger::new()
            .with_finish_hook(Box::new(hook))
            .merge(Box::pin(executed), side_channel, &cancel);

        Ok(ChatResponse {
            label,
            route,
            stream: Box::pin(merged),
            cancel,
        })
    }

    /// Wait for pending cache and persistence writes, then close the KV
    /// client.
    pub async fn shutdown(&self) -> Result<()> {
        self.sink.drain().await;
        self.cache().close().await?;
        info!("orchestrator shut down");
        Ok(())
    }
}
