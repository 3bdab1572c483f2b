//! Command contract for shared counter backends.

use async_trait::async_trait;

use super::StorageError;

/// Server-side script implementing [`RemoteClient::incr_with_expiry`] on
/// Redis-compatible servers.
///
/// `KEYS[1]` is the counter key and `ARGV[1]` the window in milliseconds.
/// Returns `{count, pttl}`.
pub const FIXED_WINDOW_SCRIPT: &str = r#"
local count = redis.call('INCR', KEYS[1])
local ttl = redis.call('PTTL', KEYS[1])
if count == 1 or ttl < 0 then
  redis.call('PEXPIRE', KEYS[1], ARGV[1])
  ttl = tonumber(ARGV[1])
end
return {count, ttl}
"#;

/// Server-side script implementing [`RemoteClient::sliding_hit`] on
/// Redis-compatible servers.
///
/// `KEYS[1]` is the sorted-set key, `ARGV[1]` the current time in
/// milliseconds, `ARGV[2]` the member and `ARGV[3]` the window in
/// milliseconds. Returns the number of members left in the window.
pub const SLIDING_WINDOW_SCRIPT: &str = r#"
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[3])
redis.call('ZADD', KEYS[1], now, ARGV[2])
redis.call('ZREMRANGEBYSCORE', KEYS[1], 0, now - window)
local count = redis.call('ZCARD', KEYS[1])
redis.call('PEXPIRE', KEYS[1], window)
return count
"#;

/// An already-connected client to a shared key/value backend.
///
/// Every method is a single backend command. `incr_with_expiry` and
/// `sliding_hit` are compound operations that must each execute as one
/// indivisible server-side step. Backends that cannot run them atomically
/// report `supports_scripting() == false`, and callers fall back to the
/// individual commands.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Whether `incr_with_expiry` and `sliding_hit` run atomically on the server.
    fn supports_scripting(&self) -> bool {
        true
    }

    /// Atomically increment `key` and ensure it expires. Returns the new
    /// count and the remaining time to live in milliseconds.
    async fn incr_with_expiry(&self, key: &str, window_ms: u64) -> Result<(u64, u64), StorageError>;

    /// Atomically record `member` at score `now_ms` in the sorted set at
    /// `key`, drop members scored at or below `now_ms - window_ms`, refresh
    /// the set's expiry to `window_ms` and return how many members remain.
    async fn sliding_hit(
        &self,
        key: &str,
        now_ms: u64,
        member: &str,
        window_ms: u64,
    ) -> Result<u64, StorageError>;

    /// Increment `key`, creating it at zero if missing.
    async fn incr(&self, key: &str) -> Result<u64, StorageError>;

    /// Remaining time to live in milliseconds; `-1` without expiry, `-2` when missing.
    async fn pttl(&self, key: &str) -> Result<i64, StorageError>;

    /// Set the time to live of `key`.
    async fn pexpire(&self, key: &str, ttl_ms: u64) -> Result<(), StorageError>;

    /// Delete keys, returning how many existed.
    async fn del(&self, keys: &[String]) -> Result<u64, StorageError>;

    /// Add `member` to the sorted set at `key` with `score`.
    async fn zadd(&self, key: &str, score: u64, member: &str) -> Result<(), StorageError>;

    /// Remove members with `min <= score <= max`, returning how many were removed.
    async fn zremrangebyscore(&self, key: &str, min: u64, max: u64) -> Result<u64, StorageError>;

    /// Number of members in the sorted set at `key`.
    async fn zcard(&self, key: &str) -> Result<u64, StorageError>;

    /// Close the connection.
    async fn close(&self) -> Result<(), StorageError> {
        Ok(())
    }
}
