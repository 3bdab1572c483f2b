//! Token bucket state and refill arithmetic.
//!
//! A bucket holds up to `capacity` tokens and refills continuously at
//! `capacity / window` tokens per millisecond. Each admitted request takes one
//! whole token. Token counts are kept as `f64` and never rounded in place so
//! repeated partial refills do not lose fractions.
//!
//! Buckets live only in the memory of the limiter that owns them; they are not
//! shared through storage. A bucket that has refilled to capacity is
//! indistinguishable from a fresh one, so full buckets are swept away.

use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::clock::Clock;

/// Per-key bucket state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenBucket {
    /// Tokens available, within `[0, capacity]`
    pub tokens: f64,
    /// Time of the last refill in epoch milliseconds
    pub last_refill: u64,
}

impl TokenBucket {
    /// A full bucket.
    pub fn full(capacity: f64, now_ms: u64) -> Self {
        Self {
            tokens: capacity,
            last_refill: now_ms,
        }
    }

    /// Add the tokens accrued since the last refill, capped at `capacity`.
    pub fn refill(&mut self, now_ms: u64, capacity: f64, window_ms: u64) {
        let elapsed = now_ms.saturating_sub(self.last_refill);
        if elapsed > 0 {
            let accrued = elapsed as f64 * capacity / window_ms as f64;
            self.tokens = (self.tokens + accrued).min(capacity);
            self.last_refill = now_ms;
        }
    }

    /// Take one token if a whole one is available.
    pub fn try_take(&mut self) -> bool {
        if self.tokens >= 1.0 {
            self.tokens = (self.tokens - 1.0).max(0.0);
            true
        } else {
            false
        }
    }

    /// Milliseconds until the bucket is full again.
    pub fn ms_until_full(&self, capacity: f64, window_ms: u64) -> u64 {
        let missing = (capacity - self.tokens).max(0.0);
        (missing * window_ms as f64 / capacity).ceil() as u64
    }
}

/// Result of offering one request to a bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct BucketOutcome {
    /// A whole token was available
    pub available: bool,
    /// Tokens after refill, before any take
    pub tokens_before: f64,
    /// Milliseconds until the bucket is full after this request
    pub ms_until_full: u64,
}

impl BucketOutcome {
    /// Usage including this request, rounded for reporting.
    pub fn usage(&self, capacity: f64) -> u64 {
        (capacity - self.tokens_before + 1.0).round().max(0.0) as u64
    }
}

/// Buckets indexed by key, all sharing one capacity and refill rate.
pub(crate) struct BucketMap {
    buckets: DashMap<String, TokenBucket>,
    capacity: f64,
    window_ms: u64,
}

impl BucketMap {
    pub fn new(capacity: u64, window_ms: u64) -> Self {
        Self {
            buckets: DashMap::new(),
            capacity: capacity as f64,
            window_ms: window_ms.max(1),
        }
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    /// Refill the key's bucket and offer it one request. The token is only
    /// taken when `consume` is set. The entry lock is held throughout so
    /// concurrent offers on one key are serialized.
    pub fn offer(&self, key: &str, now_ms: u64, consume: bool) -> BucketOutcome {
        let mut bucket = self
            .buckets
            .entry(key.to_owned())
            .or_insert_with(|| TokenBucket::full(self.capacity, now_ms));

        bucket.refill(now_ms, self.capacity, self.window_ms);
        let tokens_before = bucket.tokens;
        let available = if consume {
            bucket.try_take()
        } else {
            tokens_before >= 1.0
        };

        BucketOutcome {
            available,
            tokens_before,
            ms_until_full: bucket.ms_until_full(self.capacity, self.window_ms),
        }
    }

    pub fn get(&self, key: &str) -> Option<TokenBucket> {
        self.buckets.get(key).map(|bucket| *bucket)
    }

    pub fn remove(&self, key: &str) {
        self.buckets.remove(key);
    }

    pub fn clear(&self) {
        self.buckets.clear();
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    /// Drop buckets that are full at `now_ms`. Returns how many were removed.
    pub fn sweep(&self, now_ms: u64) -> usize {
        let mut removed = 0;
        self.buckets.retain(|_, bucket| {
            let full_at = bucket.last_refill + bucket.ms_until_full(self.capacity, self.window_ms);
            let keep = full_at > now_ms;
            if !keep {
                removed += 1;
            }
            keep
        });
        removed
    }
}

/// Periodically sweep full buckets until the map is dropped.
pub(crate) fn spawn_bucket_sweeper(
    handle: &tokio::runtime::Handle,
    buckets: Weak<BucketMap>,
    clock: Arc<dyn Clock>,
    period: Duration,
) -> JoinHandle<()> {
    info!(interval_ms = period.as_millis() as u64, "Starting token bucket sweeper");

    handle.spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let Some(buckets) = buckets.upgrade() else {
                break;
            };
            let removed = buckets.sweep(clock.now_ms());
            if removed > 0 {
                debug!(removed = removed, "Swept full token buckets");
            }
        }
    })
}
