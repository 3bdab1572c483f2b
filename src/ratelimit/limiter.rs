//! Core rate limiter implementation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::decision::Decision;
use super::key::{IdentityKey, KeyGenerator, SkipPredicate};
use super::policy::{Algorithm, FailurePolicy};
use super::token_bucket::{spawn_bucket_sweeper, BucketMap};
use crate::clock::{Clock, SystemClock};
use crate::error::{RatekeeperError, Result};
use crate::storage::{window_millis, LocalStorage, LocalStorageOptions, StorageError, StorageProvider};

/// Default ceiling when none is configured.
pub const DEFAULT_MAX_REQUESTS: u64 = 100;
/// Default window when none is configured.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);
/// Default interval between sweeps of full token buckets.
pub const DEFAULT_BUCKET_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// How sliding-window checks are answered, fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlidingSupport {
    /// The storage keeps timestamp history
    Native,
    /// The storage only counts fixed windows; sliding checks use that count
    Degraded,
}

/// The rate limiting decision engine.
///
/// A limiter is shared between tasks (wrap it in `Arc`) and decides, per key,
/// whether the current request fits in the configured budget. Counting is
/// delegated to a [`StorageProvider`], except for the token bucket whose
/// state stays in this instance.
pub struct RateLimiter<R: ?Sized = str> {
    window: Duration,
    window_ms: u64,
    max_requests: u64,
    algorithm: Algorithm,
    sliding: SlidingSupport,
    draft_mode: bool,
    failure_policy: FailurePolicy,
    storage: Arc<dyn StorageProvider>,
    key_generator: Arc<dyn KeyGenerator<R>>,
    skip: Option<SkipPredicate<R>>,
    /// Token buckets indexed by key
    buckets: Arc<BucketMap>,
    bucket_sweeper: Mutex<Option<JoinHandle<()>>>,
    clock: Arc<dyn Clock>,
    disposed: AtomicBool,
}

/// Builder for [`RateLimiter`].
pub struct RateLimiterBuilder<R: ?Sized = str> {
    window: Duration,
    max_requests: u64,
    algorithm: Algorithm,
    draft_mode: bool,
    failure_policy: FailurePolicy,
    storage: Option<Arc<dyn StorageProvider>>,
    local_options: LocalStorageOptions,
    key_generator: Arc<dyn KeyGenerator<R>>,
    skip: Option<SkipPredicate<R>>,
    bucket_sweep_interval: Duration,
    clock: Option<Arc<dyn Clock>>,
}

impl RateLimiter<str> {
    /// Start building a limiter keyed directly by identifier strings.
    pub fn builder() -> RateLimiterBuilder<str> {
        RateLimiterBuilder::new(Arc::new(IdentityKey))
    }
}

impl<R: ?Sized> RateLimiter<R> {
    /// Start building a limiter that derives keys from `R` sources.
    pub fn builder_with_key<K>(key_generator: K) -> RateLimiterBuilder<R>
    where
        K: KeyGenerator<R> + 'static,
    {
        RateLimiterBuilder::new(Arc::new(key_generator))
    }

    /// Check the rate limit for a request source.
    ///
    /// Derives the key, then counts the request against it. Skipped sources
    /// are admitted without being counted.
    pub async fn check(&self, source: &R) -> Result<Decision> {
        self.ensure_live()?;

        if let Some(skip) = &self.skip {
            if skip(source) {
                trace!("Request skipped rate limiting");
                return Ok(Decision::unaccounted(self.max_requests, self.clock.now_ms()));
            }
        }

        let key = match self.key_generator.key(source) {
            Ok(key) => key,
            Err(err) => match self.failure_policy {
                FailurePolicy::Open => {
                    warn!(error = %err, "Failed to derive rate limit key, allowing request");
                    return Ok(Decision::unaccounted(self.max_requests, self.clock.now_ms()));
                }
                FailurePolicy::Closed => return Err(RatekeeperError::KeyExtraction(err.0)),
            },
        };

        self.check_key(&key).await
    }

    /// Check the rate limit for an already derived key.
    pub async fn check_key(&self, key: &str) -> Result<Decision> {
        self.ensure_live()?;

        trace!(
            key = %key,
            algorithm = %self.algorithm,
            "Checking rate limit"
        );

        if self.max_requests == 0 {
            let now = self.clock.now_ms();
            debug!(key = %key, "Rate limit ceiling is zero, denying request");
            return Ok(Decision::new(false, 0, 0, now, now + self.window_ms));
        }

        let outcome = match self.algorithm {
            Algorithm::FixedWindow => self.fixed_window(key).await,
            Algorithm::SlidingWindow => self.sliding_window(key).await,
            Algorithm::TokenBucket => Ok(self.token_bucket(key)),
        };

        // Results arriving after dispose are discarded.
        self.ensure_live()?;

        let decision = match outcome {
            Ok(decision) => decision,
            Err(err) => self.on_storage_error(key, err)?,
        };

        Ok(self.finish(key, decision))
    }

    /// Check several keys at once.
    ///
    /// Fixed-window limiters send the keys to storage as one batch; the
    /// other algorithms check them one after another.
    pub async fn check_keys(&self, keys: &[String]) -> Result<Vec<Decision>> {
        self.ensure_live()?;

        if self.algorithm != Algorithm::FixedWindow || self.max_requests == 0 {
            let mut decisions = Vec::with_capacity(keys.len());
            for key in keys {
                decisions.push(self.check_key(key).await?);
            }
            return Ok(decisions);
        }

        let records = match self.storage.batch_increment(keys, self.window).await {
            Ok(records) => records,
            Err(err) => {
                let fallback = self.on_storage_error("<batch>", err)?;
                return Ok(vec![fallback; keys.len()]);
            }
        };
        self.ensure_live()?;

        let now = self.clock.now_ms();
        let decisions = keys
            .iter()
            .zip(records)
            .map(|(key, record)| {
                let within_limit = record.count <= self.max_requests;
                let decision = Decision::new(
                    within_limit,
                    record.count,
                    self.max_requests,
                    now,
                    record.reset_time,
                );
                self.finish(key, decision)
            })
            .collect();

        Ok(decisions)
    }

    /// Clear the budget of one key, so its next request is treated as its first.
    pub async fn reset(&self, key: &str) -> Result<()> {
        self.ensure_live()?;
        self.storage.reset(key).await?;
        self.buckets.remove(key);
        debug!(key = %key, "Rate limit reset");
        Ok(())
    }

    /// Clear the budgets of all keys.
    pub async fn reset_all(&self) -> Result<()> {
        self.ensure_live()?;
        self.storage.reset_all().await?;
        self.buckets.clear();
        info!("All rate limits reset");
        Ok(())
    }

    /// Stop background work and drop in-memory state.
    ///
    /// Later calls fail with [`RatekeeperError::Disposed`]; storage calls
    /// already in flight complete but their results are discarded.
    /// Token buckets and their sweeper are dropped before the storage is
    /// disposed, so they are gone even if closing a remote connection stalls.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop_bucket_sweeper();
        self.buckets.clear();
        self.storage.dispose().await;
        info!(storage = self.storage.name(), "Rate limiter disposed");
    }

    /// Whether `dispose` has been called.
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// The configured window.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// The configured ceiling.
    pub fn max_requests(&self) -> u64 {
        self.max_requests
    }

    /// The configured algorithm.
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Whether decisions are forced to allow.
    pub fn is_draft_mode(&self) -> bool {
        self.draft_mode
    }

    /// The counter storage.
    pub fn storage(&self) -> &Arc<dyn StorageProvider> {
        &self.storage
    }

    /// Number of keys with a live token bucket.
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    fn stop_bucket_sweeper(&self) {
        if let Some(handle) = self.bucket_sweeper.lock().take() {
            handle.abort();
            debug!("Token bucket sweeper stopped");
        }
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(RatekeeperError::Disposed);
        }
        Ok(())
    }

    async fn fixed_window(&self, key: &str) -> std::result::Result<Decision, StorageError> {
        let record = self.storage.increment(key, self.window).await?;
        let now = self.clock.now_ms();

        Ok(Decision::new(
            record.count <= self.max_requests,
            record.count,
            self.max_requests,
            now,
            record.reset_time,
        ))
    }

    async fn sliding_window(&self, key: &str) -> std::result::Result<Decision, StorageError> {
        let count = match self.sliding {
            SlidingSupport::Degraded => self.storage.increment(key, self.window).await?.count,
            SlidingSupport::Native => self.storage.sliding_increment(key, self.window).await?,
        };

        let now = self.clock.now_ms();
        Ok(Decision::new(
            count <= self.max_requests,
            count,
            self.max_requests,
            now,
            now + self.window_ms,
        ))
    }

    fn token_bucket(&self, key: &str) -> Decision {
        let now = self.clock.now_ms();
        let outcome = self.buckets.offer(key, now, !self.draft_mode);

        Decision::new(
            outcome.available,
            outcome.usage(self.buckets.capacity()),
            self.max_requests,
            now,
            now + outcome.ms_until_full,
        )
    }

    fn on_storage_error(&self, key: &str, err: StorageError) -> Result<Decision> {
        match self.failure_policy {
            FailurePolicy::Open => {
                warn!(
                    key = %key,
                    storage = self.storage.name(),
                    error = %err,
                    "Rate limit storage failed, allowing request"
                );
                Ok(Decision::unaccounted(self.max_requests, self.clock.now_ms()))
            }
            FailurePolicy::Closed => Err(RatekeeperError::Storage(err)),
        }
    }

    /// Apply draft mode and log denials.
    fn finish(&self, key: &str, mut decision: Decision) -> Decision {
        if !decision.allowed {
            if self.draft_mode {
                debug!(
                    key = %key,
                    current = decision.current,
                    limit = decision.limit,
                    "Rate limit would be exceeded (draft mode)"
                );
                decision.allowed = true;
            } else {
                debug!(
                    key = %key,
                    current = decision.current,
                    limit = decision.limit,
                    "Rate limit exceeded"
                );
            }
        }
        decision
    }
}

impl<R: ?Sized> Drop for RateLimiter<R> {
    fn drop(&mut self) {
        if let Some(handle) = self.bucket_sweeper.get_mut().take() {
            handle.abort();
        }
    }
}

impl<R: ?Sized> RateLimiterBuilder<R> {
    fn new(key_generator: Arc<dyn KeyGenerator<R>>) -> Self {
        Self {
            window: DEFAULT_WINDOW,
            max_requests: DEFAULT_MAX_REQUESTS,
            algorithm: Algorithm::default(),
            draft_mode: false,
            failure_policy: FailurePolicy::default(),
            storage: None,
            local_options: LocalStorageOptions::default(),
            key_generator,
            skip: None,
            bucket_sweep_interval: DEFAULT_BUCKET_SWEEP_INTERVAL,
            clock: None,
        }
    }

    /// Length of the counting window. Must be positive.
    pub fn window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    /// Length of the counting window in milliseconds.
    pub fn window_ms(self, window_ms: u64) -> Self {
        self.window(Duration::from_millis(window_ms))
    }

    /// Requests admitted per window (or bucket capacity). Zero denies everything.
    pub fn max_requests(mut self, max_requests: u64) -> Self {
        self.max_requests = max_requests;
        self
    }

    /// Admission algorithm.
    pub fn algorithm(mut self, algorithm: Algorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    /// Count requests but never deny them.
    pub fn draft_mode(mut self, draft_mode: bool) -> Self {
        self.draft_mode = draft_mode;
        self
    }

    /// Behavior on key extraction and storage failures.
    pub fn failure_policy(mut self, failure_policy: FailurePolicy) -> Self {
        self.failure_policy = failure_policy;
        self
    }

    /// Counter storage. Defaults to a [`LocalStorage`] on the limiter's clock.
    pub fn storage(mut self, storage: Arc<dyn StorageProvider>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Options for the default local storage; ignored when `storage` is set.
    pub fn local_storage_options(mut self, options: LocalStorageOptions) -> Self {
        self.local_options = options;
        self
    }

    /// Replace the key generator.
    pub fn key_generator<K>(mut self, key_generator: K) -> Self
    where
        K: KeyGenerator<R> + 'static,
    {
        self.key_generator = Arc::new(key_generator);
        self
    }

    /// Admit sources matching `predicate` without counting them.
    pub fn skip<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&R) -> bool + Send + Sync + 'static,
    {
        self.skip = Some(Arc::new(predicate));
        self
    }

    /// How often token buckets that refilled to capacity are dropped.
    /// Zero disables the sweep. Only token bucket limiters run it, and only
    /// when built inside a Tokio runtime.
    pub fn bucket_sweep_interval(mut self, interval: Duration) -> Self {
        self.bucket_sweep_interval = interval;
        self
    }

    /// Time source for the limiter and its default storage.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Validate the configuration and build the limiter.
    pub fn build(self) -> Result<RateLimiter<R>> {
        if self.window.is_zero() {
            return Err(RatekeeperError::Config(
                "window must be a positive duration".to_string(),
            ));
        }

        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(SystemClock::new()));
        let storage = self.storage.unwrap_or_else(|| {
            Arc::new(LocalStorage::with_options(clock.clone(), self.local_options))
        });

        let sliding = if storage.capabilities().sliding_window {
            SlidingSupport::Native
        } else {
            SlidingSupport::Degraded
        };
        if self.algorithm == Algorithm::SlidingWindow && sliding == SlidingSupport::Degraded {
            debug!(
                storage = storage.name(),
                "Storage has no sliding window support, counting fixed windows instead"
            );
        }

        let window_ms = window_millis(self.window);

        let buckets = Arc::new(BucketMap::new(self.max_requests, window_ms));
        let bucket_sweeper = match tokio::runtime::Handle::try_current() {
            Ok(handle)
                if self.algorithm == Algorithm::TokenBucket
                    && !self.bucket_sweep_interval.is_zero() =>
            {
                Some(spawn_bucket_sweeper(
                    &handle,
                    Arc::downgrade(&buckets),
                    clock.clone(),
                    self.bucket_sweep_interval,
                ))
            }
            _ => None,
        };

        info!(
            algorithm = %self.algorithm,
            window_ms = window_ms,
            max_requests = self.max_requests,
            draft_mode = self.draft_mode,
            storage = storage.name(),
            "Rate limiter initialized"
        );

        Ok(RateLimiter {
            window: self.window,
            window_ms,
            max_requests: self.max_requests,
            algorithm: self.algorithm,
            sliding,
            draft_mode: self.draft_mode,
            failure_policy: self.failure_policy,
            storage,
            key_generator: self.key_generator,
            skip: self.skip,
            buckets,
            bucket_sweeper: Mutex::new(bucket_sweeper),
            clock,
            disposed: AtomicBool::new(false),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ratelimit::KeyError;
    use crate::storage::{
        Capabilities, MemoryBackend, RemoteStorage, WindowRecord,
    };
    use async_trait::async_trait;
    use tokio_test::{assert_err, assert_ok};

    /// Fixed-window-only storage that can be told to fail.
    struct CountingOnly {
        inner: LocalStorage,
        failing: AtomicBool,
    }

    impl CountingOnly {
        fn new(clock: Arc<ManualClock>) -> Self {
            Self {
                inner: LocalStorage::with_options(
                    clock,
                    LocalStorageOptions {
                        cleanup_interval: Duration::ZERO,
                        ..Default::default()
                    },
                ),
                failing: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl StorageProvider for CountingOnly {
        fn name(&self) -> &'static str {
            "counting-only"
        }

        fn capabilities(&self) -> Capabilities {
            Capabilities::default()
        }

        async fn increment(
            &self,
            key: &str,
            window: Duration,
        ) -> std::result::Result<WindowRecord, StorageError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(StorageError::Backend("unreachable".to_string()));
            }
            self.inner.increment(key, window).await
        }

        async fn reset(&self, key: &str) -> std::result::Result<(), StorageError> {
            self.inner.reset(key).await
        }

        async fn reset_all(&self) -> std::result::Result<(), StorageError> {
            self.inner.reset_all().await
        }
    }

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(1_700_000_000_000))
    }

    fn limiter(clock: &Arc<ManualClock>, algorithm: Algorithm, window_ms: u64, max: u64) -> RateLimiter {
        RateLimiter::builder()
            .window_ms(window_ms)
            .max_requests(max)
            .algorithm(algorithm)
            .clock(clock.clone())
            .local_storage_options(LocalStorageOptions {
                cleanup_interval: Duration::ZERO,
                ..Default::default()
            })
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_fixed_window_scenario() {
        let clock = clock();
        let limiter = limiter(&clock, Algorithm::FixedWindow, 1_000, 2);

        let first = limiter.check("client").await.unwrap();
        assert!(first.allowed);
        assert_eq!(first.current, 1);
        assert_eq!(first.limit, 2);

        let second = limiter.check("client").await.unwrap();
        assert!(second.allowed);
        assert_eq!(second.current, 2);

        let third = limiter.check("client").await.unwrap();
        assert!(!third.allowed);
        assert_eq!(third.current, 3);
        assert_eq!(third.remaining_requests(), 0);

        clock.advance(Duration::from_millis(1_050));
        let fourth = limiter.check("client").await.unwrap();
        assert!(fourth.allowed);
        assert_eq!(fourth.current, 1);
    }

    #[tokio::test]
    async fn test_current_tracks_call_index_within_ceiling() {
        let clock = clock();

        for algorithm in [
            Algorithm::FixedWindow,
            Algorithm::SlidingWindow,
            Algorithm::TokenBucket,
        ] {
            let limiter = limiter(&clock, algorithm, 60_000, 10);
            for index in 1..=10 {
                let decision = limiter.check("client").await.unwrap();
                assert!(decision.allowed, "{} call {} should pass", algorithm, index);
                assert_eq!(decision.current, index, "{} call {}", algorithm, index);
            }
            let decision = limiter.check("client").await.unwrap();
            assert!(!decision.allowed, "{} call 11 should be denied", algorithm);
        }
    }

    #[tokio::test]
    async fn test_reset_time_and_remaining() {
        let clock = clock();
        let limiter = limiter(&clock, Algorithm::FixedWindow, 1_000, 5);
        let start = clock.now_ms();

        let decision = limiter.check("client").await.unwrap();
        assert_eq!(decision.reset_time_ms(), start + 1_000);
        assert_eq!(decision.remaining, Duration::from_millis(1_000));

        clock.advance(Duration::from_millis(400));
        let decision = limiter.check("client").await.unwrap();
        assert_eq!(decision.reset_time_ms(), start + 1_000);
        assert_eq!(decision.remaining, Duration::from_millis(600));
    }

    #[tokio::test]
    async fn test_sliding_window_counts_trailing_hits() {
        let clock = clock();
        let limiter = RateLimiter::builder()
            .window_ms(1_000)
            .max_requests(2)
            .algorithm(Algorithm::SlidingWindow)
            .clock(clock.clone())
            .storage(Arc::new(
                RemoteStorage::owned(MemoryBackend::with_clock(clock.clone()))
                    .with_clock(clock.clone()),
            ))
            .build()
            .unwrap();

        assert!(limiter.check("client").await.unwrap().allowed);
        clock.advance(Duration::from_millis(600));
        assert!(limiter.check("client").await.unwrap().allowed);

        clock.advance(Duration::from_millis(300));
        let denied = limiter.check("client").await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.current, 3);

        // The first hit has left the trailing window
        clock.advance(Duration::from_millis(200));
        let decision = limiter.check("client").await.unwrap();
        assert_eq!(decision.current, 3);
        assert!(!decision.allowed);

        clock.advance(Duration::from_millis(1_000));
        let decision = limiter.check("client").await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.current, 1);
    }

    #[tokio::test]
    async fn test_sliding_window_degrades_without_support() {
        let clock = clock();
        let storage = Arc::new(CountingOnly::new(clock.clone()));
        let limiter = RateLimiter::builder()
            .window_ms(1_000)
            .max_requests(2)
            .algorithm(Algorithm::SlidingWindow)
            .clock(clock.clone())
            .storage(storage)
            .build()
            .unwrap();

        assert_eq!(limiter.check("client").await.unwrap().current, 1);
        assert_eq!(limiter.check("client").await.unwrap().current, 2);
        let denied = assert_ok!(limiter.check("client").await);
        assert!(!denied.allowed);
        assert_eq!(denied.current, 3);
    }

    #[tokio::test]
    async fn test_token_bucket_scenario() {
        let clock = clock();
        let limiter = limiter(&clock, Algorithm::TokenBucket, 100, 5);

        for _ in 0..5 {
            assert!(limiter.check("client").await.unwrap().allowed);
        }
        let denied = limiter.check("client").await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.current, 6);

        clock.advance(Duration::from_millis(25));
        assert!(limiter.check("client").await.unwrap().allowed);
        assert!(!limiter.check("client").await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_token_bucket_refill_never_exceeds_capacity() {
        let clock = clock();
        let limiter = limiter(&clock, Algorithm::TokenBucket, 100, 5);

        for _ in 0..3 {
            limiter.check("client").await.unwrap();
        }

        // 60ms at 0.05 tokens/ms refills 3 whole tokens
        clock.advance(Duration::from_millis(60));
        for _ in 0..5 {
            assert!(limiter.check("client").await.unwrap().allowed);
        }
        assert!(!limiter.check("client").await.unwrap().allowed);

        // A long idle period only fills the bucket to capacity
        clock.advance(Duration::from_secs(60));
        for _ in 0..5 {
            assert!(limiter.check("client").await.unwrap().allowed);
        }
        assert!(!limiter.check("client").await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_token_bucket_state_is_not_in_storage() {
        let clock = clock();
        let limiter = limiter(&clock, Algorithm::TokenBucket, 1_000, 3);

        limiter.check("client").await.unwrap();
        assert_eq!(limiter.bucket_count(), 1);
        assert_eq!(
            limiter
                .storage()
                .sliding_window_count("client", Duration::from_secs(1))
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_zero_ceiling_denies_everything() {
        let clock = clock();
        let storage = Arc::new(CountingOnly::new(clock.clone()));
        storage.failing.store(true, Ordering::SeqCst);

        for algorithm in [
            Algorithm::FixedWindow,
            Algorithm::SlidingWindow,
            Algorithm::TokenBucket,
        ] {
            let limiter = RateLimiter::builder()
                .window_ms(1_000)
                .max_requests(0)
                .algorithm(algorithm)
                .failure_policy(FailurePolicy::Closed)
                .clock(clock.clone())
                .storage(storage.clone())
                .build()
                .unwrap();

            // A failing storage proves it is never consulted
            for _ in 0..3 {
                let decision = limiter.check("client").await.unwrap();
                assert!(!decision.allowed);
                assert_eq!(decision.limit, 0);
                assert_eq!(decision.current, 0);
            }
        }
    }

    #[tokio::test]
    async fn test_reset_restores_first_call_behavior() {
        let clock = clock();

        for algorithm in [
            Algorithm::FixedWindow,
            Algorithm::SlidingWindow,
            Algorithm::TokenBucket,
        ] {
            let limiter = limiter(&clock, algorithm, 60_000, 2);
            let first = limiter.check("client").await.unwrap();
            limiter.check("client").await.unwrap();
            assert!(!limiter.check("client").await.unwrap().allowed);

            limiter.reset("client").await.unwrap();
            let after_reset = limiter.check("client").await.unwrap();
            assert_eq!(after_reset, first, "{}", algorithm);
        }
    }

    #[tokio::test]
    async fn test_reset_all() {
        let clock = clock();
        let limiter = limiter(&clock, Algorithm::TokenBucket, 60_000, 1);

        limiter.check("a").await.unwrap();
        limiter.check("b").await.unwrap();
        limiter.reset_all().await.unwrap();

        assert_eq!(limiter.bucket_count(), 0);
        assert!(limiter.check("a").await.unwrap().allowed);
        assert!(limiter.check("b").await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_draft_mode_allows_but_counts() {
        let clock = clock();
        let limiter = RateLimiter::builder()
            .window_ms(1_000)
            .max_requests(2)
            .draft_mode(true)
            .clock(clock.clone())
            .build()
            .unwrap();
        let start = clock.now_ms();

        for expected in 1..=4 {
            let decision = limiter.check("client").await.unwrap();
            assert!(decision.allowed);
            assert_eq!(decision.current, expected);
            assert_eq!(decision.reset_time_ms(), start + 1_000);
        }
    }

    #[tokio::test]
    async fn test_draft_mode_token_bucket_does_not_consume() {
        let clock = clock();
        let limiter = RateLimiter::builder()
            .window_ms(1_000)
            .max_requests(2)
            .algorithm(Algorithm::TokenBucket)
            .draft_mode(true)
            .clock(clock.clone())
            .build()
            .unwrap();

        for _ in 0..5 {
            let decision = limiter.check("client").await.unwrap();
            assert!(decision.allowed);
            assert_eq!(decision.current, 1);
        }
    }

    #[tokio::test]
    async fn test_skip_bypasses_accounting() {
        let clock = clock();
        let limiter = RateLimiter::builder()
            .window_ms(1_000)
            .max_requests(1)
            .skip(|id: &str| id.starts_with("internal-"))
            .clock(clock.clone())
            .build()
            .unwrap();

        for _ in 0..3 {
            let decision = limiter.check("internal-health").await.unwrap();
            assert!(decision.allowed);
            assert_eq!(decision.current, 0);
        }
        assert!(limiter.check("client").await.unwrap().allowed);
        assert!(!limiter.check("client").await.unwrap().allowed);
    }

    struct Request {
        api_key: Option<&'static str>,
    }

    fn by_api_key(req: &Request) -> std::result::Result<String, KeyError> {
        req.api_key
            .map(str::to_owned)
            .ok_or_else(|| KeyError::new("missing api key"))
    }

    #[tokio::test]
    async fn test_key_generator_over_request_type() {
        let clock = clock();
        let limiter = RateLimiter::<Request>::builder_with_key(by_api_key)
            .window_ms(1_000)
            .max_requests(1)
            .clock(clock.clone())
            .build()
            .unwrap();

        let alice = Request { api_key: Some("alice") };
        let bob = Request { api_key: Some("bob") };
        assert!(limiter.check(&alice).await.unwrap().allowed);
        assert!(!limiter.check(&alice).await.unwrap().allowed);
        assert!(limiter.check(&bob).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_key_failure_policy() {
        let clock = clock();
        let anonymous = Request { api_key: None };

        let open = RateLimiter::<Request>::builder_with_key(by_api_key)
            .max_requests(1)
            .clock(clock.clone())
            .build()
            .unwrap();
        for _ in 0..3 {
            assert!(open.check(&anonymous).await.unwrap().allowed);
        }

        let closed = RateLimiter::<Request>::builder_with_key(by_api_key)
            .max_requests(1)
            .failure_policy(FailurePolicy::Closed)
            .clock(clock.clone())
            .build()
            .unwrap();
        let err = assert_err!(closed.check(&anonymous).await);
        assert!(matches!(err, RatekeeperError::KeyExtraction(msg) if msg == "missing api key"));
    }

    #[tokio::test]
    async fn test_storage_failure_policy() {
        let clock = clock();
        let storage = Arc::new(CountingOnly::new(clock.clone()));
        storage.failing.store(true, Ordering::SeqCst);

        let open = RateLimiter::builder()
            .max_requests(1)
            .clock(clock.clone())
            .storage(storage.clone())
            .build()
            .unwrap();
        for _ in 0..3 {
            let decision = open.check("client").await.unwrap();
            assert!(decision.allowed);
            assert_eq!(decision.current, 0);
        }

        let closed = RateLimiter::builder()
            .max_requests(1)
            .failure_policy(FailurePolicy::Closed)
            .clock(clock.clone())
            .storage(storage.clone())
            .build()
            .unwrap();
        assert!(matches!(
            closed.check("client").await,
            Err(RatekeeperError::Storage(StorageError::Backend(_)))
        ));
    }

    #[tokio::test]
    async fn test_zero_window_is_rejected() {
        let result = RateLimiter::builder().window(Duration::ZERO).build();
        assert!(matches!(result, Err(RatekeeperError::Config(_))));
    }

    #[tokio::test]
    async fn test_check_keys_batches_fixed_window() {
        let clock = clock();
        let limiter = limiter(&clock, Algorithm::FixedWindow, 1_000, 1);

        let keys = vec!["a".to_string(), "b".to_string(), "a".to_string()];
        let decisions = limiter.check_keys(&keys).await.unwrap();

        assert_eq!(decisions.len(), 3);
        assert!(decisions[0].allowed);
        assert!(decisions[1].allowed);
        assert!(!decisions[2].allowed);
        assert_eq!(decisions[2].current, 2);
    }

    #[tokio::test]
    async fn test_limiters_share_remote_backend() {
        let clock = clock();
        let backend = Arc::new(MemoryBackend::with_clock(clock.clone()));
        let build = || {
            RateLimiter::builder()
                .window_ms(1_000)
                .max_requests(3)
                .clock(clock.clone())
                .storage(Arc::new(
                    RemoteStorage::shared(backend.clone()).with_clock(clock.clone()),
                ))
                .build()
                .unwrap()
        };
        let a = build();
        let b = build();

        assert!(a.check("client").await.unwrap().allowed);
        assert!(b.check("client").await.unwrap().allowed);
        assert!(a.check("client").await.unwrap().allowed);
        let denied = b.check("client").await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.current, 4);
    }

    #[tokio::test]
    async fn test_dispose() {
        let clock = clock();
        let limiter = limiter(&clock, Algorithm::TokenBucket, 1_000, 3);

        limiter.check("client").await.unwrap();
        limiter.dispose().await;
        limiter.dispose().await;

        assert!(limiter.is_disposed());
        assert_eq!(limiter.bucket_count(), 0);
        assert!(matches!(
            limiter.check("client").await,
            Err(RatekeeperError::Disposed)
        ));
        assert!(matches!(
            limiter.reset("client").await,
            Err(RatekeeperError::Disposed)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_checks_admit_exactly_the_ceiling() {
        for algorithm in [
            Algorithm::FixedWindow,
            Algorithm::SlidingWindow,
            Algorithm::TokenBucket,
        ] {
            let clock = clock();
            let limiter = Arc::new(limiter(&clock, algorithm, 60_000, 50));

            let tasks: Vec<_> = (0..10)
                .map(|_| {
                    let limiter = limiter.clone();
                    tokio::spawn(async move {
                        let mut allowed = 0;
                        for _ in 0..20 {
                            if limiter.check("shared").await.unwrap().allowed {
                                allowed += 1;
                            }
                        }
                        allowed
                    })
                })
                .collect();

            let mut total = 0;
            for task in tasks {
                total += task.await.unwrap();
            }
            assert_eq!(total, 50, "{}", algorithm);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_sliding_checks_across_shared_backend() {
        let clock = clock();
        let backend = Arc::new(MemoryBackend::with_clock(clock.clone()));
        let limiters: Vec<_> = (0..2)
            .map(|_| {
                Arc::new(
                    RateLimiter::builder()
                        .window_ms(60_000)
                        .max_requests(50)
                        .algorithm(Algorithm::SlidingWindow)
                        .clock(clock.clone())
                        .storage(Arc::new(
                            RemoteStorage::shared(backend.clone()).with_clock(clock.clone()),
                        ))
                        .build()
                        .unwrap(),
                )
            })
            .collect();

        let tasks: Vec<_> = (0..10)
            .map(|i| {
                let limiter = limiters[i % 2].clone();
                tokio::spawn(async move {
                    let mut allowed = 0;
                    for _ in 0..20 {
                        if limiter.check("shared").await.unwrap().allowed {
                            allowed += 1;
                        }
                    }
                    allowed
                })
            })
            .collect();

        let mut total = 0;
        for task in tasks {
            total += task.await.unwrap();
        }
        assert_eq!(total, 50);
    }

    #[tokio::test]
    async fn test_full_token_buckets_are_swept() {
        let clock = clock();
        let limiter = RateLimiter::builder()
            .window_ms(100)
            .max_requests(5)
            .algorithm(Algorithm::TokenBucket)
            .bucket_sweep_interval(Duration::from_millis(20))
            .clock(clock.clone())
            .build()
            .unwrap();

        limiter.check("a").await.unwrap();
        limiter.check("b").await.unwrap();
        assert_eq!(limiter.bucket_count(), 2);

        clock.advance(Duration::from_secs(1));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(limiter.bucket_count(), 0);

        // A swept key starts over with a full bucket
        let decision = limiter.check("a").await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.current, 1);
    }

    #[tokio::test]
    async fn test_dispose_stops_bucket_sweeper_before_storage() {
        let clock = clock();
        let limiter = limiter(&clock, Algorithm::TokenBucket, 1_000, 3);
        assert!(limiter.bucket_sweeper.lock().is_some());

        limiter.check("client").await.unwrap();
        limiter.dispose().await;

        assert!(limiter.bucket_sweeper.lock().is_none());
        assert_eq!(limiter.bucket_count(), 0);
    }

    #[tokio::test]
    async fn test_only_token_bucket_limiters_sweep() {
        let clock = clock();
        let fixed = limiter(&clock, Algorithm::FixedWindow, 1_000, 3);
        assert!(fixed.bucket_sweeper.lock().is_none());

        let disabled = RateLimiter::builder()
            .algorithm(Algorithm::TokenBucket)
            .bucket_sweep_interval(Duration::ZERO)
            .clock(clock.clone())
            .build()
            .unwrap();
        assert!(disabled.bucket_sweeper.lock().is_none());
    }
}
