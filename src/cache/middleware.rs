//! Caching middleware around any [`LanguageModel`].

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use super::key::{CacheKeyDeriver, GenerationMode};
use super::manager::GenerationCache;
use crate::drivers::{LanguageModel, ProviderKind};
use crate::stream::{CancelHandle, StreamRecorder, StreamReplayer};
use crate::types::{GenerateResult, GenerationRequest, StreamChunk};
use crate::{BoxStream, Result};

/// Serves generations from the cache when possible and records them when
/// not. Error behavior is that of the inner model: a cache hit can only
/// replay a generation that finished, and a miss passes provider errors
/// through untouched.
pub struct CachedModel {
    inner: Arc<dyn LanguageModel>,
    cache: GenerationCache,
    deriver: CacheKeyDeriver,
    recorder: StreamRecorder,
    replayer: StreamReplayer,
}

impl CachedModel {
    pub fn new(inner: Arc<dyn LanguageModel>, cache: GenerationCache) -> Self {
        Self {
            inner,
            cache,
            deriver: CacheKeyDeriver::new(),
            recorder: StreamRecorder::new(),
            replayer: StreamReplayer::default(),
        }
    }

    pub fn with_deriver(mut self, deriver: CacheKeyDeriver) -> Self {
        self.deriver = deriver;
        self
    }

    pub fn with_replayer(mut self, replayer: StreamReplayer) -> Self {
        self.replayer = replayer;
        self
    }

    pub fn cache(&self) -> &GenerationCache {
        &self.cache
    }

    pub fn inner(&self) -> &Arc<dyn LanguageModel> {
        &self.inner
    }
}

#[async_trait]
impl LanguageModel for CachedModel {
    fn provider(&self) -> ProviderKind {
        self.inner.provider()
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<GenerateResult> {
        let key = self.deriver.derive(GenerationMode::Generate, request);
        if let Some(hit) = self.cache.get_generate(&key).await {
            return Ok(hit);
        }
        let result = self.inner.generate(request).await?;
        self.cache.spawn_set_generate(key, result.clone());
        Ok(result)
    }

    async fn stream(
        &self,
        request: &GenerationRequest,
        cancel: &CancelHandle,
    ) -> Result<BoxStream<'static, StreamChunk>> {
        let key = self.deriver.derive(GenerationMode::Stream, request);
        if let Some(chunks) = self.cache.get_stream(&key).await {
            debug!(key = %key, chunks = chunks.len(), "replaying cached stream");
            return Ok(Box::pin(self.replayer.replay(chunks, cancel)));
        }

        let live = self.inner.stream(request, cancel).await?;
        let cache = self.cache.clone();
        let recorded = self
            .recorder
            .wrap(live, cancel, move |chunks| cache.spawn_set_stream(key, chunks));
        Ok(Box::pin(recorded))
    }
}
