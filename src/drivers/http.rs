//! `LanguageModel` over HTTP.

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{create_driver, DriverRequest, LanguageModel, ProviderDriver, ProviderKind, StreamState};
use crate::stream::{spawn_stage, CancelHandle, DEFAULT_STAGE_BUFFER};
use crate::transport::{sse_data, HttpTransport};
use crate::types::{ChunkSequencer, GenerateResult, GenerationRequest, StreamChunk};
use crate::{BoxStream, Error, ErrorContext, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub kind: ProviderKind,
    /// Defaults to the provider's public endpoint.
    pub base_url: Option<String>,
    /// Literal key. When unset, `api_key_env` and then the provider's
    /// conventional variables are consulted.
    pub api_key: Option<String>,
    pub api_key_env: Option<String>,
    /// Model used for the primary generation.
    pub model: String,
    pub timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: ProviderKind::OpenAi,
            base_url: None,
            api_key: None,
            api_key_env: None,
            model: "gpt-4o-mini".to_string(),
            timeout_secs: 60,
        }
    }
}

impl ProviderConfig {
    pub fn new(kind: ProviderKind, model: impl Into<String>) -> Self {
        Self {
            kind,
            model: model.into(),
            ..Default::default()
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn resolve_api_key(&self) -> Option<String> {
        if let Some(ref k) = self.api_key {
            return Some(k.clone());
        }
        self.api_key_env
            .iter()
            .map(String::as_str)
            .chain(self.kind.api_key_env().iter().copied())
            .find_map(|var| std::env::var(var).ok().filter(|v| !v.is_empty()))
    }
}

/// Provider-backed model. The driver is fixed at construction.
pub struct HttpModel {
    driver: Arc<dyn ProviderDriver>,
    transport: HttpTransport,
    auth: Vec<(String, String)>,
}

impl HttpModel {
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        let api_key = config.resolve_api_key().ok_or_else(|| {
            Error::configuration_with_context(
                format!("no API key for provider {}", config.kind),
                ErrorContext::new()
                    .with_field_path("provider.api_key")
                    .with_details(format!("set one of {:?}", config.kind.api_key_env())),
            )
        })?;
        let driver: Arc<dyn ProviderDriver> = Arc::from(create_driver(config.kind));
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| config.kind.default_base_url().to_string());
        let transport = HttpTransport::new(config.kind, base_url, Duration::from_secs(config.timeout_secs))?;
        let auth = driver.auth_headers(&api_key);
        Ok(Self {
            driver,
            transport,
            auth,
        })
    }

    fn prepare(&self, request: &GenerationRequest, stream: bool) -> Result<DriverRequest> {
        let mut req = self.driver.build_request(request, stream)?;
        for (k, v) in &self.auth {
            req.headers.insert(k.clone(), v.clone());
        }
        Ok(req)
    }
}

#[async_trait]
impl LanguageModel for HttpModel {
    fn provider(&self) -> ProviderKind {
        self.driver.kind()
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<GenerateResult> {
        let req = self.prepare(request, false)?;
        let body = self.transport.post_json(&req).await?;
        self.driver.parse_response(&body)
    }

    async fn stream(
        &self,
        request: &GenerationRequest,
        cancel: &CancelHandle,
    ) -> Result<BoxStream<'static, StreamChunk>> {
        let req = self.prepare(request, true)?;
        let mut data = sse_data(self.driver.kind(), self.transport.post_stream(&req).await?);
        let driver = self.driver.clone();

        let chunks = spawn_stage(cancel, DEFAULT_STAGE_BUFFER, move |out| async move {
            let kind = driver.kind();
            let mut seq = ChunkSequencer::new();
            let mut state = StreamState::new();
            loop {
                let next = tokio::select! {
                    biased;
                    _ = out.cancelled() => {
                        debug!(provider = %kind, "provider stream cancelled");
                        return;
                    }
                    next = data.next() => next,
                };
                let payload = match next {
                    Some(Ok(p)) => p,
                    Some(Err(e)) => {
                        out.emit(Err(e)).await;
                        return;
                    }
                    None => break,
                };
                match driver.parse_stream_event(&payload, &mut state) {
                    Ok(events) => {
                        for ev in events {
                            if !out.emit(Ok(seq.chunk(ev))).await {
                                return;
                            }
                        }
                    }
                    Err(e) => {
                        out.emit(Err(e)).await;
                        return;
                    }
                }
            }
            if !state.is_finished() {
                out.emit(Err(Error::provider(kind, None, "stream ended before a finish event")))
                    .await;
                return;
            }
            for ev in state.finish() {
                if !out.emit(Ok(seq.chunk(ev))).await {
                    return;
                }
            }
        });
        Ok(Box::pin(chunks))
    }
}
