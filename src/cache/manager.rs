//! Generation cache: typed, fail-open access to the KV store.

use chrono::Utc;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use super::backend::KvStore;
use super::key::{CacheKey, GenerationMode};
use crate::types::{GenerateResult, StreamChunk};
use crate::Result;

/// Reference TTL for streamed entries.
pub const DEFAULT_STREAM_TTL: Duration = Duration::from_secs(180);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub key_prefix: Option<String>,
    pub stream_ttl_secs: u64,
    /// `None` keeps single-shot entries until evicted by the backend.
    pub generate_ttl_secs: Option<u64>,
    pub max_entry_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            key_prefix: Some("genflow".to_string()),
            stream_ttl_secs: DEFAULT_STREAM_TTL.as_secs(),
            generate_ttl_secs: None,
            max_entry_size: 10 * 1024 * 1024,
        }
    }
}

impl CacheConfig {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }
    pub fn with_stream_ttl(mut self, ttl: Duration) -> Self {
        self.stream_ttl_secs = ttl.as_secs();
        self
    }
    pub fn with_generate_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.generate_ttl_secs = ttl.map(|t| t.as_secs());
        self
    }
    pub fn stream_ttl(&self) -> Duration {
        Duration::from_secs(self.stream_ttl_secs)
    }
    pub fn generate_ttl(&self) -> Option<Duration> {
        self.generate_ttl_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub sets: u64,
    pub errors: u64,
}

impl CacheStats {
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Default)]
struct AtomicStats {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    errors: AtomicU64,
}

impl AtomicStats {
    fn to_stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Typed cache over a shared KV client.
///
/// Reads never fail: a missing, expired, corrupt or unreachable entry is a
/// miss. Writes never fail either; errors are logged and counted. Entries are
/// immutable once written, a later write for the same key replaces the whole
/// value.
#[derive(Clone)]
pub struct GenerationCache {
    config: CacheConfig,
    kv: Arc<dyn KvStore>,
    stats: Arc<AtomicStats>,
    pending: TaskTracker,
    draining: Arc<Mutex<()>>,
}

impl GenerationCache {
    pub fn new(config: CacheConfig, kv: Arc<dyn KvStore>) -> Self {
        Self {
            config,
            kv,
            stats: Arc::new(AtomicStats::default()),
            pending: TaskTracker::new(),
            draining: Arc::new(Mutex::new(())),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.to_stats()
    }

    pub fn backend_name(&self) -> &'static str {
        self.kv.name()
    }

    pub async fn get_generate(&self, key: &CacheKey) -> Option<GenerateResult> {
        let mut result: GenerateResult = self.read(key, GenerationMode::Generate).await?;
        result.restamp(Utc::now());
        Some(result)
    }

    pub async fn set_generate(&self, key: &CacheKey, result: &GenerateResult) {
        self.write(key, GenerationMode::Generate, result, self.config.generate_ttl())
            .await
    }

    pub async fn get_stream(&self, key: &CacheKey) -> Option<Vec<StreamChunk>> {
        self.read(key, GenerationMode::Stream).await
    }

    pub async fn set_stream(&self, key: &CacheKey, chunks: &[StreamChunk], ttl: Duration) {
        self.write(key, GenerationMode::Stream, chunks, Some(ttl))
            .await
    }

    /// Write in the background. The caller never waits on the KV store.
    pub fn spawn_set_generate(&self, key: CacheKey, result: GenerateResult) {
        let cache = self.clone();
        self.pending.spawn(async move {
            cache.set_generate(&key, &result).await;
        });
    }

    /// Write in the background with the configured stream TTL.
    pub fn spawn_set_stream(&self, key: CacheKey, chunks: Vec<StreamChunk>) {
        let cache = self.clone();
        let ttl = self.config.stream_ttl();
        self.pending.spawn(async move {
            cache.set_stream(&key, &chunks, ttl).await;
        });
    }

    /// Wait until every background write issued so far has finished.
    /// Concurrent callers drain one at a time.
    pub async fn drain(&self) {
        let _guard = self.draining.lock().await;
        self.pending.close();
        self.pending.wait().await;
        self.pending.reopen();
    }

    /// Drain pending writes and release the KV client.
    pub async fn close(&self) -> Result<()> {
        self.drain().await;
        self.kv.close().await
    }

    async fn read<T: DeserializeOwned>(&self, key: &CacheKey, mode: GenerationMode) -> Option<T> {
        if !self.config.enabled {
            return None;
        }
        if key.mode != mode {
            warn!(key = %key, expected = %mode, "cache key used with the wrong mode");
            return None;
        }
        let storage_key = key.storage_key(self.config.key_prefix.as_deref());
        match self.kv.get(&storage_key).await {
            Ok(Some(data)) => match serde_json::from_slice(&data) {
                Ok(val) => {
                    self.stats.hits.fetch_add(1, Ordering::Relaxed);
                    debug!(key = %key, "cache hit");
                    Some(val)
                }
                Err(e) => {
                    self.stats.errors.fetch_add(1, Ordering::Relaxed);
                    warn!(key = %key, error = %e, "discarding undecodable cache entry");
                    None
                }
            },
            Ok(None) => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, "cache miss");
                None
            }
            Err(e) => {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                warn!(key = %key, backend = self.kv.name(), error = %e, "cache read failed, treating as miss");
                None
            }
        }
    }

    async fn write<T: Serialize + ?Sized>(
        &self,
        key: &CacheKey,
        mode: GenerationMode,
        value: &T,
        ttl: Option<Duration>,
    ) {
        if !self.config.enabled {
            return;
        }
        if key.mode != mode {
            warn!(key = %key, expected = %mode, "cache key used with the wrong mode");
            return;
        }
        let data = match serde_json::to_vec(value) {
            Ok(d) => d,
            Err(e) => {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                warn!(key = %key, error = %e, "cache entry not serializable");
                return;
            }
        };
        if data.len() > self.config.max_entry_size {
            debug!(key = %key, size = data.len(), "cache entry too large, skipped");
            return;
        }
        let storage_key = key.storage_key(self.config.key_prefix.as_deref());
        let outcome = async {
            self.kv.set(&storage_key, &data).await?;
            if let Some(ttl) = ttl {
                self.kv.expire(&storage_key, ttl).await?;
            }
            Ok::<(), crate::Error>(())
        }
        .await;
        match outcome {
            Ok(()) => {
                self.stats.sets.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, ttl_secs = ttl.map(|t| t.as_secs()), "cache entry written");
            }
            Err(e) => {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                warn!(key = %key, backend = self.kv.name(), error = %e, "cache write failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::backend::MemoryKv;
    use crate::cache::key::CacheKeyDeriver;
    use crate::types::{ChunkEvent, ChunkSequencer, GenerationRequest, Message, ResponseMetadata};
    use async_trait::async_trait;
    use chrono::DateTime;

    struct DownKv;

    #[async_trait]
    impl KvStore for DownKv {
        async fn get(&self, _: &str) -> Result<Option<Vec<u8>>> {
            Err(crate::Error::kv("down", "connection refused"))
        }
        async fn set(&self, _: &str, _: &[u8]) -> Result<()> {
            Err(crate::Error::kv("down", "connection refused"))
        }
        async fn expire(&self, _: &str, _: Duration) -> Result<()> {
            Err(crate::Error::kv("down", "connection refused"))
        }
        async fn delete(&self, _: &str) -> Result<bool> {
            Err(crate::Error::kv("down", "connection refused"))
        }
        fn name(&self) -> &'static str {
            "down"
        }
    }

    fn key(mode: GenerationMode) -> CacheKey {
        CacheKeyDeriver::new().derive(mode, &GenerationRequest::new("m1", vec![Message::user("hi")]))
    }

    fn chunks() -> Vec<StreamChunk> {
        let mut seq = ChunkSequencer::new();
        vec![
            seq.chunk(ChunkEvent::text("a")),
            seq.chunk(ChunkEvent::finish("stop", None)),
        ]
    }

    #[tokio::test]
    async fn test_generate_round_trip_restamps() {
        let cache = GenerationCache::new(CacheConfig::default(), Arc::new(MemoryKv::new(10)));
        let k = key(GenerationMode::Generate);
        let mut original = GenerateResult::text("hello");
        let then = DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        original.response = ResponseMetadata {
            id: Some("r1".into()),
            model_id: Some("m1".into()),
            timestamp: Some(then),
        };

        assert!(cache.get_generate(&k).await.is_none());
        cache.set_generate(&k, &original).await;
        let cached = cache.get_generate(&k).await.unwrap();

        assert_eq!(cached.text, original.text);
        assert_eq!(cached.response.id, original.response.id);
        assert!(cached.response.timestamp.unwrap() > then);
        assert_eq!(cache.stats(), CacheStats { hits: 1, misses: 1, sets: 1, errors: 0 });
    }

    #[tokio::test]
    async fn test_stream_entry_expires() {
        let cache = GenerationCache::new(CacheConfig::default(), Arc::new(MemoryKv::new(10)));
        let k = key(GenerationMode::Stream);
        cache.set_stream(&k, &chunks(), Duration::from_millis(30)).await;
        assert_eq!(cache.get_stream(&k).await.unwrap(), chunks());
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(cache.get_stream(&k).await.is_none());
    }

    #[tokio::test]
    async fn test_fail_open_when_backend_down() {
        let cache = GenerationCache::new(CacheConfig::default(), Arc::new(DownKv));
        let k = key(GenerationMode::Stream);
        cache.set_stream(&k, &chunks(), DEFAULT_STREAM_TTL).await;
        assert!(cache.get_stream(&k).await.is_none());
        assert_eq!(cache.stats().errors, 2);
    }

    #[tokio::test]
    async fn test_wrong_mode_is_a_miss() {
        let cache = GenerationCache::new(CacheConfig::default(), Arc::new(MemoryKv::new(10)));
        let k = key(GenerationMode::Stream);
        cache.set_generate(&k, &GenerateResult::text("x")).await;
        assert!(cache.get_generate(&k).await.is_none());
        assert_eq!(cache.stats().sets, 0);
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_a_miss() {
        let kv = Arc::new(MemoryKv::new(10));
        let cache = GenerationCache::new(CacheConfig::default(), kv.clone());
        let k = key(GenerationMode::Stream);
        kv.set(&k.storage_key(Some("genflow")), b"not json").await.unwrap();
        assert!(cache.get_stream(&k).await.is_none());
        assert_eq!(cache.stats().errors, 1);
    }

    #[tokio::test]
    async fn test_disabled_cache_never_stores() {
        let kv = Arc::new(MemoryKv::new(10));
        let cache = GenerationCache::new(CacheConfig::new().with_enabled(false), kv.clone());
        let k = key(GenerationMode::Generate);
        cache.set_generate(&k, &GenerateResult::text("x")).await;
        assert!(kv.is_empty().await);
    }

    #[tokio::test]
    async fn test_background_writes_complete_on_drain() {
        let cache = GenerationCache::new(CacheConfig::default(), Arc::new(MemoryKv::new(10)));
        let k = key(GenerationMode::Stream);
        cache.spawn_set_stream(k.clone(), chunks());
        cache.drain().await;
        assert!(cache.get_stream(&k).await.is_some());

        // The tracker is reusable after a drain.
        let g = key(GenerationMode::Generate);
        cache.spawn_set_generate(g.clone(), GenerateResult::text("y"));
        cache.drain().await;
        assert!(cache.get_generate(&g).await.is_some());
    }

    struct SlowKv(MemoryKv);

    #[async_trait]
    impl KvStore for SlowKv {
        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
            self.0.get(key).await
        }
        async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
            tokio::time::sleep(Duration::from_millis(30)).await;
            self.0.set(key, value).await
        }
        async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
            self.0.expire(key, ttl).await
        }
        async fn delete(&self, key: &str) -> Result<bool> {
            self.0.delete(key).await
        }
        fn name(&self) -> &'static str {
            "slow"
        }
    }

    #[tokio::test]
    async fn test_concurrent_drains_both_return() {
        let cache = GenerationCache::new(CacheConfig::default(), Arc::new(SlowKv(MemoryKv::new(10))));
        let k = key(GenerationMode::Stream);
        cache.spawn_set_stream(k.clone(), chunks());

        let (a, b) = (cache.clone(), cache.clone());
        let both = tokio::time::timeout(Duration::from_secs(2), async move {
            let first = tokio::spawn(async move { a.drain().await });
            let second = tokio::spawn(async move { b.drain().await });
            let _ = tokio::join!(first, second);
        })
        .await;
        assert!(both.is_ok(), "a concurrent drain never returned");
        assert!(cache.get_stream(&k).await.is_some());
    }
}
