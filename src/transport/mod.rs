//! HTTP transport and SSE framing for provider calls.

pub mod http;
pub mod sse;

pub use http::HttpTransport;
pub use sse::sse_data;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Transport error: {0}")]
    Other(String),
}
