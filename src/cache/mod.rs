//! # Generation Cache
//!
//! Content-addressed memoization of model invocations, both single-shot and
//! streamed.
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`CacheKeyDeriver`] | Pure SHA-256 fingerprint of `{mode, request}` |
//! | [`GenerationCache`] | Fail-open get/set/expire against a [`KvStore`] |
//! | [`CachedModel`] | [`LanguageModel`](crate::drivers::LanguageModel) middleware that records on miss and replays on hit |
//! | [`MemoryKv`] / [`NullKv`] | In-process and disabled backends |
//!
//! Stream entries carry a TTL (180 s by default). Generate entries persist
//! until evicted unless `generate_ttl_secs` is set.
//!
//! ```rust
//! use genflow::cache::{CacheConfig, CacheKeyDeriver, GenerationCache, GenerationMode, MemoryKv};
//! use genflow::types::{GenerationRequest, Message};
//! use std::sync::Arc;
//!
//! let cache = GenerationCache::new(CacheConfig::default(), Arc::new(MemoryKv::new(1000)));
//! let request = GenerationRequest::new("m1", vec![Message::user("hi")]);
//! let key = CacheKeyDeriver::new().derive(GenerationMode::Stream, &request);
//! assert_eq!(key.hash.len(), 64);
//! # let _ = cache;
//! ```

mod backend;
mod key;
mod manager;
mod middleware;
#[cfg(feature = "redis")]
mod redis_kv;

pub use backend::{connect, connect_fail_open, KvBackendKind, KvConfig, KvStore, MemoryKv, NullKv};
pub use key::{CacheKey, CacheKeyDeriver, GenerationMode};
pub use manager::{CacheConfig, CacheStats, GenerationCache, DEFAULT_STREAM_TTL};
pub use middleware::CachedModel;
#[cfg(feature = "redis")]
pub use redis_kv::RedisKv;
