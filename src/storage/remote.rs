//! Counter storage on a shared backend.
//!
//! Several limiter instances pointing at the same backend count against the
//! same keys. Atomicity is the backend's job: fixed windows go through
//! [`RemoteClient::incr_with_expiry`] and sliding windows through
//! [`RemoteClient::sliding_hit`], both single server-side steps.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::client::RemoteClient;
use super::counter::WindowRecord;
use super::{window_millis, Capabilities, StorageError, StorageProvider};
use crate::clock::{Clock, SystemClock};

/// Default prefix applied to every backend key.
const DEFAULT_KEY_PREFIX: &str = "ratekeeper:";
/// Suffix distinguishing a key's sliding-window set from its counter.
const LOG_SUFFIX: &str = ":log";
/// Tracked keys below which expired entries are left for `clean_expired`.
const PRUNE_FLOOR: usize = 1024;

/// Tuning for [`RemoteStorage`].
#[derive(Debug, Clone)]
pub struct RemoteStorageOptions {
    /// Prefix for every key written to the backend
    pub key_prefix: String,
    /// Propagate backend failures instead of treating the hit as the first
    /// one in a fresh window
    pub strict: bool,
}

impl Default for RemoteStorageOptions {
    fn default() -> Self {
        Self {
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            strict: false,
        }
    }
}

/// Counter storage on a backend shared between limiter instances.
pub struct RemoteStorage<C: RemoteClient> {
    client: Arc<C>,
    /// Close the client on dispose; only when this storage created it
    owns_client: bool,
    /// Resolved once from `supports_scripting`, covers both windows
    atomic: bool,
    options: RemoteStorageOptions,
    clock: Arc<dyn Clock>,
    /// Makes sorted-set members unique across instances
    instance_id: Uuid,
    sequence: AtomicU64,
    /// Keys this instance has written, with the time their backend keys
    /// expire, for `reset_all`
    touched: DashMap<String, u64>,
    /// Tracked key count that triggers the next prune of `touched`
    prune_at: AtomicUsize,
}

impl<C: RemoteClient> RemoteStorage<C> {
    /// Take ownership of `client`; it is closed on dispose.
    pub fn owned(client: C) -> Self {
        Self::build(Arc::new(client), true)
    }

    /// Use a client owned elsewhere; it is never closed here.
    pub fn shared(client: Arc<C>) -> Self {
        Self::build(client, false)
    }

    fn build(client: Arc<C>, owns_client: bool) -> Self {
        let atomic = client.supports_scripting();
        if !atomic {
            warn!("Remote backend lacks atomic scripting, window counting is best-effort");
        }

        Self {
            client,
            owns_client,
            atomic,
            options: RemoteStorageOptions::default(),
            clock: Arc::new(SystemClock::new()),
            instance_id: Uuid::new_v4(),
            sequence: AtomicU64::new(0),
            touched: DashMap::new(),
            prune_at: AtomicUsize::new(PRUNE_FLOOR),
        }
    }

    /// Replace the clock used for timestamps.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the options.
    pub fn with_options(mut self, options: RemoteStorageOptions) -> Self {
        self.options = options;
        self
    }

    /// The underlying client.
    pub fn client(&self) -> &Arc<C> {
        &self.client
    }

    /// Number of keys remembered for `reset_all`.
    pub fn tracked_keys(&self) -> usize {
        self.touched.len()
    }

    /// Remember that `key` lives on the backend until `expires_at`.
    ///
    /// Entries whose backend keys have expired are pruned once the map has
    /// doubled since the last prune, so it stays proportional to live keys.
    fn track(&self, key: &str, expires_at: u64) {
        self.touched
            .entry(key.to_owned())
            .and_modify(|at| *at = (*at).max(expires_at))
            .or_insert(expires_at);

        if self.touched.len() >= self.prune_at.load(Ordering::Relaxed) {
            let pruned = self.prune(self.clock.now_ms());
            let next = (self.touched.len() * 2).max(PRUNE_FLOOR);
            self.prune_at.store(next, Ordering::Relaxed);
            trace!(pruned = pruned, next_prune_at = next, "Pruned tracked remote keys");
        }
    }

    fn prune(&self, now: u64) -> usize {
        let before = self.touched.len();
        self.touched.retain(|_, expires_at| *expires_at > now);
        before.saturating_sub(self.touched.len())
    }

    fn counter_key(&self, key: &str) -> String {
        format!("{}{}", self.options.key_prefix, key)
    }

    fn log_key(&self, key: &str) -> String {
        format!("{}{}{}", self.options.key_prefix, key, LOG_SUFFIX)
    }

    /// Increment the fixed-window counter, surfacing every failure.
    async fn fetch_record(&self, key: &str, window_ms: u64) -> Result<WindowRecord, StorageError> {
        let now = self.clock.now_ms();
        let counter_key = self.counter_key(key);

        let (count, ttl) = if self.atomic {
            self.client.incr_with_expiry(&counter_key, window_ms).await?
        } else {
            self.increment_best_effort(&counter_key, window_ms).await?
        };

        trace!(key = %key, count = count, ttl_ms = ttl, "Incremented remote counter");

        let record = WindowRecord {
            count,
            reset_time: now + ttl.max(1),
        };
        self.track(key, record.reset_time);
        Ok(record)
    }

    /// Increment then set the expiry in separate commands.
    ///
    /// A crash between the calls can leave a counter without expiry until
    /// the next increment repairs it.
    async fn increment_best_effort(&self, key: &str, window_ms: u64) -> Result<(u64, u64), StorageError> {
        let count = self.client.incr(key).await?;
        let ttl = self.client.pttl(key).await?;

        if count == 1 || ttl < 0 {
            self.client.pexpire(key, window_ms).await?;
            return Ok((count, window_ms));
        }
        Ok((count, ttl as u64))
    }

    /// Record a sliding-window hit, surfacing every failure.
    async fn record_hit(&self, key: &str, window_ms: u64) -> Result<u64, StorageError> {
        let now = self.clock.now_ms();
        let log_key = self.log_key(key);
        let member = format!(
            "{}-{}-{}",
            now,
            self.instance_id,
            self.sequence.fetch_add(1, Ordering::Relaxed)
        );

        let count = if self.atomic {
            self.client.sliding_hit(&log_key, now, &member, window_ms).await?
        } else {
            self.sliding_hit_best_effort(&log_key, now, &member, window_ms)
                .await?
        };

        self.track(key, now + window_ms);
        Ok(count)
    }

    /// Sliding-window hit as separate commands.
    ///
    /// The expiry is refreshed right after the add so a failure further on
    /// never leaves the set without one. Concurrent hits from other
    /// instances may be counted by both callers.
    async fn sliding_hit_best_effort(
        &self,
        log_key: &str,
        now: u64,
        member: &str,
        window_ms: u64,
    ) -> Result<u64, StorageError> {
        self.client.zadd(log_key, now, member).await?;
        self.client.pexpire(log_key, window_ms).await?;
        if now >= window_ms {
            self.client
                .zremrangebyscore(log_key, 0, now - window_ms)
                .await?;
        }
        self.client.zcard(log_key).await
    }

    /// Decide whether a failed operation is absorbed or propagated.
    fn absorb(&self, key: &str, operation: &'static str, err: StorageError) -> Result<(), StorageError> {
        if self.options.strict {
            return Err(err);
        }
        warn!(
            key = %key,
            operation = operation,
            error = %err,
            "Remote storage failure, treating hit as first observation"
        );
        Ok(())
    }
}

#[async_trait]
impl<C: RemoteClient + 'static> StorageProvider for RemoteStorage<C> {
    fn name(&self) -> &'static str {
        "remote"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            sliding_window: true,
            batch_increment: true,
            cleanup: true,
        }
    }

    async fn increment(&self, key: &str, window: Duration) -> Result<WindowRecord, StorageError> {
        let window_ms = window_millis(window);
        match self.fetch_record(key, window_ms).await {
            Ok(record) => Ok(record),
            Err(err) => {
                self.absorb(key, "increment", err)?;
                Ok(WindowRecord::first(self.clock.now_ms(), window_ms))
            }
        }
    }

    async fn reset(&self, key: &str) -> Result<(), StorageError> {
        self.client
            .del(&[self.counter_key(key), self.log_key(key)])
            .await?;
        self.touched.remove(key);
        Ok(())
    }

    async fn reset_all(&self) -> Result<(), StorageError> {
        self.prune(self.clock.now_ms());
        let keys: Vec<String> = self
            .touched
            .iter()
            .flat_map(|entry| [self.counter_key(entry.key()), self.log_key(entry.key())])
            .collect();

        if !keys.is_empty() {
            let deleted = self.client.del(&keys).await?;
            debug!(deleted = deleted, "Cleared remote rate limit keys");
        }
        self.touched.clear();
        Ok(())
    }

    async fn sliding_window_count(&self, key: &str, window: Duration) -> Result<u64, StorageError> {
        let window_ms = window_millis(window);

        match self.record_hit(key, window_ms).await {
            Ok(count) => Ok(count),
            Err(err) => {
                self.absorb(key, "sliding_window_count", err)?;
                Ok(1)
            }
        }
    }

    async fn batch_increment(
        &self,
        keys: &[String],
        window: Duration,
    ) -> Result<Vec<WindowRecord>, StorageError> {
        let window_ms = window_millis(window);
        let results = join_all(keys.iter().map(|key| self.fetch_record(key, window_ms))).await;

        let records = keys
            .iter()
            .zip(results)
            .map(|(key, result)| {
                result.unwrap_or_else(|err| {
                    warn!(
                        key = %key,
                        error = %err,
                        "Batch increment failed for key, treating hit as first observation"
                    );
                    WindowRecord::first(self.clock.now_ms(), window_ms)
                })
            })
            .collect();

        Ok(records)
    }

    async fn clean_expired(&self) -> Result<usize, StorageError> {
        let pruned = self.prune(self.clock.now_ms());
        self.prune_at.store(
            (self.touched.len() * 2).max(PRUNE_FLOOR),
            Ordering::Relaxed,
        );
        Ok(pruned)
    }

    async fn dispose(&self) {
        self.touched.clear();
        if !self.owns_client {
            return;
        }
        if let Err(err) = self.client.close().await {
            warn!(error = %err, "Failed to close remote storage client");
        } else {
            debug!("Remote storage client closed");
        }
    }
}
