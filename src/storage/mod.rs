//! Counter storage for the rate limiter.
//!
//! A [`StorageProvider`] owns per-key window records and, where supported,
//! the timestamp history used for sliding-window counting. Two providers
//! ship with the crate:
//!
//! - [`LocalStorage`]: in-process maps, suitable for a single instance
//! - [`RemoteStorage`]: a shared backend reached through a [`RemoteClient`],
//!   so several limiter instances can count against the same keys
//!
//! [`MemoryBackend`] is an in-process [`RemoteClient`]; with the `redis`
//! feature, `RedisClient` talks to a Redis-compatible server.

mod client;
mod counter;
mod local;
mod memory;
#[cfg(feature = "redis")]
mod redis_client;
mod remote;

pub use client::{RemoteClient, FIXED_WINDOW_SCRIPT, SLIDING_WINDOW_SCRIPT};
pub use counter::WindowRecord;
pub use local::{LocalStorage, LocalStorageOptions};
pub use memory::MemoryBackend;
#[cfg(feature = "redis")]
pub use redis_client::RedisClient;
pub use remote::{RemoteStorage, RemoteStorageOptions};

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Errors raised by storage providers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Backend or transport failure
    #[error("Backend failure: {0}")]
    Backend(String),

    /// The provider does not implement the requested operation
    #[error("Operation not supported by this storage: {0}")]
    Unsupported(&'static str),
}

/// Optional operations a provider implements, advertised once at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    /// `sliding_window_count` returns real sliding counts
    pub sliding_window: bool,
    /// `batch_increment` is pipelined rather than the sequential default
    pub batch_increment: bool,
    /// `clean_expired` reclaims memory
    pub cleanup: bool,
}

/// Atomic per-key counting primitive behind the rate limiter.
///
/// Implementations must make `increment` atomic with respect to concurrent
/// callers on the same key: when the stored window has elapsed the record is
/// replaced as a whole, never patched.
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Optional operations this provider supports.
    fn capabilities(&self) -> Capabilities;

    /// Record one hit for `key` and return the resulting window record.
    async fn increment(&self, key: &str, window: Duration) -> Result<WindowRecord, StorageError>;

    /// Clear all state held for `key`.
    async fn reset(&self, key: &str) -> Result<(), StorageError>;

    /// Clear all state held by this provider.
    async fn reset_all(&self) -> Result<(), StorageError>;

    /// Number of hits for `key` within the trailing `window`.
    async fn sliding_window_count(&self, _key: &str, _window: Duration) -> Result<u64, StorageError> {
        Err(StorageError::Unsupported("sliding_window_count"))
    }

    /// Record one hit for `key` and return the number of hits within the
    /// trailing `window`, this one included.
    ///
    /// The default records through `increment` and then reads
    /// `sliding_window_count`, answering with the fixed-window count when
    /// sliding counts are unsupported. Providers that can record and count
    /// in one step override it so concurrent hits see each other exactly once.
    async fn sliding_increment(&self, key: &str, window: Duration) -> Result<u64, StorageError> {
        let record = self.increment(key, window).await?;
        match self.sliding_window_count(key, window).await {
            Ok(count) => Ok(count),
            Err(StorageError::Unsupported(_)) => Ok(record.count),
            Err(err) => Err(err),
        }
    }

    /// Increment several keys, returning one record per key in order.
    async fn batch_increment(
        &self,
        keys: &[String],
        window: Duration,
    ) -> Result<Vec<WindowRecord>, StorageError> {
        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            records.push(self.increment(key, window).await?);
        }
        Ok(records)
    }

    /// Drop expired state. Returns how many entries were removed.
    async fn clean_expired(&self) -> Result<usize, StorageError> {
        Ok(0)
    }

    /// Release timers and connections owned by this provider.
    async fn dispose(&self) {}
}

/// Convert a window to whole milliseconds, never less than one.
pub(crate) fn window_millis(window: Duration) -> u64 {
    (window.as_millis() as u64).max(1)
}
