//! # genflow
//!
//! Generation caching and streaming orchestration for LLM chat backends.
//!
//! ## Overview
//!
//! A chat request is classified, routed to a tool set, and answered by a
//! model call that may be served from a cache. Streamed generations are
//! recorded while they are forwarded and replayed with live-like pacing on a
//! later identical request. Tool side effects are merged into the outbound
//! stream and the finished exchange is written to durable storage once.
//!
//! ```text
//! ChatRequest → PromptClassifier → ToolRouter → CachedModel ──┐
//!                                              (record/replay) │
//!          StreamPart ← StreamMerger ← ToolRunner ←────────────┘
//!                            └─ finish → PersistenceSink
//! ```
//!
//! ## Core Philosophy
//!
//! - **Fail open**: a broken cache backend means no caching, never a failed request
//! - **Transparent**: cached and live responses have the same shape and the same errors
//! - **Streaming-first**: chunks reach the caller as they are produced
//! - **Explicit cancellation**: one handle per request stops every stage
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use genflow::{ChatOrchestrator, ChatRequest, GenflowConfig, Message};
//! use futures::StreamExt;
//!
//! #[tokio::main]
//! async fn main() -> genflow::Result<()> {
//!     let mut config = GenflowConfig::default();
//!     config.apply_env_overrides()?;
//!     let orchestrator = ChatOrchestrator::builder().config(config).build().await?;
//!
//!     let request = ChatRequest::new("chat-1", vec![Message::user("Hello!")]);
//!     let mut response = orchestrator.handle(request).await?;
//!     while let Some(part) = response.stream.next().await {
//!         println!("{}", serde_json::to_string(&part?)?);
//!     }
//!
//!     orchestrator.shutdown().await
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`cache`] | Cache keys, KV backends, the generation cache and its model middleware |
//! | [`stream`] | Stage plumbing, stream recording and replay, cancellation |
//! | [`classify`] | Prompt classification |
//! | [`routing`] | Label to tool set and streaming mode |
//! | [`pipeline`] | Tool execution, outbound merging, persistence |
//! | [`client`] | The chat orchestrator |
//! | [`drivers`] | Provider drivers and the `LanguageModel` capability |
//! | [`transport`] | HTTP and SSE plumbing |
//! | [`types`] | Messages, requests, chunks |
//! | [`config`] | YAML configuration with environment overrides |

pub mod cache;
pub mod classify;
pub mod client;
pub mod config;
pub mod drivers;
pub mod pipeline;
pub mod routing;
pub mod stream;
pub mod transport;
pub mod types;
pub mod utils;

// Re-export main types for convenience
pub use cache::{CacheKey, CacheKeyDeriver, CachedModel, GenerationCache, GenerationMode};
pub use classify::{ClassificationLabel, PromptClassifier};
pub use client::{ChatOrchestrator, ChatOrchestratorBuilder, ChatRequest, ChatResponse};
pub use config::GenflowConfig;
pub use drivers::{HttpModel, LanguageModel, ProviderKind};
pub use routing::{Route, StreamingMode, ToolRouter};
pub use stream::{CancelHandle, StreamRecorder, StreamReplayer};
pub use types::{
    message::{Message, MessageRole},
    Annotation, StreamChunk, StreamPart,
};

use futures::Stream;
use std::pin::Pin;

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

/// A unified pinned, boxed stream that emits `Result<T>`
pub type BoxStream<'a, T> = Pin<Box<dyn Stream<Item = Result<T>> + Send + 'a>>;

/// Error type for the library
pub mod error;
pub use error::{Error, ErrorContext};
