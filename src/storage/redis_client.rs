//! [`RemoteClient`] over a Redis-compatible server.
//!
//! The compound operations run as Lua scripts, so each one is a single
//! server-side step. Scripts are sent by hash and reloaded transparently when
//! the server has flushed its script cache.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{RedisError, Script};
use tracing::{debug, info};

use super::client::{RemoteClient, FIXED_WINDOW_SCRIPT, SLIDING_WINDOW_SCRIPT};
use super::StorageError;

/// Redis client with automatic reconnection.
#[derive(Clone)]
pub struct RedisClient {
    conn: ConnectionManager,
    fixed_window: Script,
    sliding_window: Script,
}

impl RedisClient {
    /// Connect to `url`, e.g. `redis://127.0.0.1:6379/0`.
    pub async fn connect(url: &str) -> Result<Self, StorageError> {
        let client = redis::Client::open(url).map_err(backend)?;
        let conn = ConnectionManager::new(client).await.map_err(backend)?;
        info!("Connected to Redis rate limit backend");
        Ok(Self::new(conn))
    }

    /// Wrap an existing connection manager.
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            fixed_window: Script::new(FIXED_WINDOW_SCRIPT),
            sliding_window: Script::new(SLIDING_WINDOW_SCRIPT),
        }
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

fn backend(err: RedisError) -> StorageError {
    StorageError::Backend(err.to_string())
}

#[async_trait]
impl RemoteClient for RedisClient {
    async fn incr_with_expiry(&self, key: &str, window_ms: u64) -> Result<(u64, u64), StorageError> {
        let mut conn = self.conn();
        let (count, ttl): (u64, i64) = self
            .fixed_window
            .key(key)
            .arg(window_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok((count, ttl.max(0) as u64))
    }

    async fn sliding_hit(
        &self,
        key: &str,
        now_ms: u64,
        member: &str,
        window_ms: u64,
    ) -> Result<u64, StorageError> {
        let mut conn = self.conn();
        let count: u64 = self
            .sliding_window
            .key(key)
            .arg(now_ms)
            .arg(member)
            .arg(window_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(count)
    }

    async fn incr(&self, key: &str) -> Result<u64, StorageError> {
        let mut conn = self.conn();
        let count: u64 = redis::cmd("INCR")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(count)
    }

    async fn pttl(&self, key: &str) -> Result<i64, StorageError> {
        let mut conn = self.conn();
        let ttl: i64 = redis::cmd("PTTL")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(ttl)
    }

    async fn pexpire(&self, key: &str, ttl_ms: u64) -> Result<(), StorageError> {
        let mut conn = self.conn();
        let _: i64 = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> Result<u64, StorageError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn();
        let removed: u64 = redis::cmd("DEL")
            .arg(keys)
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(removed)
    }

    async fn zadd(&self, key: &str, score: u64, member: &str) -> Result<(), StorageError> {
        let mut conn = self.conn();
        let _: i64 = redis::cmd("ZADD")
            .arg(key)
            .arg(score)
            .arg(member)
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn zremrangebyscore(&self, key: &str, min: u64, max: u64) -> Result<u64, StorageError> {
        let mut conn = self.conn();
        let removed: u64 = redis::cmd("ZREMRANGEBYSCORE")
            .arg(key)
            .arg(min)
            .arg(max)
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(removed)
    }

    async fn zcard(&self, key: &str) -> Result<u64, StorageError> {
        let mut conn = self.conn();
        let count: u64 = redis::cmd("ZCARD")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(backend)?;
        Ok(count)
    }

    async fn close(&self) -> Result<(), StorageError> {
        // The manager disconnects once its last clone is dropped
        debug!("Releasing Redis connection");
        Ok(())
    }
}
