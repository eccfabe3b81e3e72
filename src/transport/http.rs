use bytes::Bytes;
use futures::TryStreamExt;
use reqwest::Proxy;
use serde_json::Value;
use std::env;
use std::time::Duration;
use tracing::debug;

use super::TransportError;
use crate::drivers::{DriverRequest, ProviderKind};
use crate::{BoxStream, Error, Result};

/// Pooled HTTP client bound to one provider endpoint.
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
    kind: ProviderKind,
}

impl HttpTransport {
    pub fn new(kind: ProviderKind, base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(
                env::var("GENFLOW_HTTP_POOL_MAX_IDLE_PER_HOST")
                    .ok()
                    .and_then(|s| s.parse::<usize>().ok())
                    .unwrap_or(32),
            )
            .pool_idle_timeout(Some(Duration::from_secs(90)));

        if let Ok(proxy_url) = env::var("GENFLOW_PROXY_URL") {
            if let Ok(proxy) = Proxy::all(&proxy_url) {
                builder = builder.proxy(proxy);
            }
        }

        let client = builder
            .build()
            .map_err(|e| Error::Transport(TransportError::Other(e.to_string())))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            kind,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Send `request` and fail with a provider error on any non-2xx status.
    pub async fn send(&self, request: &DriverRequest) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.base_url, request.path);
        let mut req = self.client.post(&url).json(&request.body);
        for (k, v) in &request.headers {
            req = req.header(k, v);
        }
        if request.stream {
            req = req.header("accept", "text/event-stream");
        }
        debug!(provider = %self.kind, url = %url, stream = request.stream, "provider request");

        let response = req
            .send()
            .await
            .map_err(|e| Error::Transport(TransportError::Http(e)))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(Error::provider(
            self.kind,
            Some(status.as_u16()),
            error_message(&body),
        ))
    }

    pub async fn post_json(&self, request: &DriverRequest) -> Result<Value> {
        let response = self.send(request).await?;
        response
            .json()
            .await
            .map_err(|e| Error::Transport(TransportError::Http(e)))
    }

    pub async fn post_stream(&self, request: &DriverRequest) -> Result<BoxStream<'static, Bytes>> {
        let response = self.send(request).await?;
        let bytes = response
            .bytes_stream()
            .map_err(|e| Error::Transport(TransportError::Http(e)));
        Ok(Box::pin(bytes))
    }
}

/// Best-effort extraction of a provider error message from a response body.
fn error_message(body: &str) -> String {
    if let Ok(v) = serde_json::from_str::<Value>(body) {
        let msg = v
            .pointer("/error/message")
            .or_else(|| v.get("message"))
            .or_else(|| v.get("error"))
            .and_then(|m| m.as_str());
        if let Some(m) = msg {
            return m.to_string();
        }
    }
    if body.is_empty() {
        "empty error response".to_string()
    } else {
        body.chars().take(512).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_message_extraction() {
        assert_eq!(
            error_message(r#"{"error":{"type":"overloaded_error","message":"Overloaded"}}"#),
            "Overloaded"
        );
        assert_eq!(error_message(r#"{"error":"bad key"}"#), "bad key");
        assert_eq!(error_message("gateway timeout"), "gateway timeout");
        assert_eq!(error_message(""), "empty error response");
    }
}
