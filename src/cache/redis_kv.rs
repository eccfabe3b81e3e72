//! Redis-backed KV store (feature `redis`).

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use std::time::Duration;

use super::backend::{log_connected, KvStore};
use crate::{Error, Result};

const BACKEND: &str = "redis";

fn kv_err(e: redis::RedisError) -> Error {
    Error::kv(BACKEND, e.to_string())
}

/// Multiplexed Redis connection; clones share one socket and are safe to use
/// from concurrent requests.
pub struct RedisKv {
    conn: MultiplexedConnection,
}

impl RedisKv {
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self> {
        let client = redis::Client::open(url).map_err(kv_err)?;
        let conn = tokio::time::timeout(timeout, client.get_multiplexed_async_connection())
            .await
            .map_err(|_| Error::kv(BACKEND, "connect timed out"))?
            .map_err(kv_err)?;
        log_connected(BACKEND, url);
        Ok(Self { conn })
    }
}

#[async_trait]
impl KvStore for RedisKv {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.conn.clone();
        conn.get::<_, Option<Vec<u8>>>(key).await.map_err(kv_err)
    }

    async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(key, value.to_vec()).await.map_err(kv_err)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.expire::<_, ()>(key, ttl.as_secs().max(1) as i64)
            .await
            .map_err(kv_err)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = conn.del(key).await.map_err(kv_err)?;
        Ok(removed > 0)
    }

    fn name(&self) -> &'static str {
        BACKEND
    }
}
