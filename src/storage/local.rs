//! In-process counter storage.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace};

use super::counter::WindowRecord;
use super::{window_millis, Capabilities, StorageError, StorageProvider};
use crate::clock::{Clock, SystemClock};

/// Default interval between background sweeps.
const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);
/// Default horizon for sliding-window timestamp logs.
const DEFAULT_LOG_RETENTION: Duration = Duration::from_secs(3600);
/// Default time a single background sweep may run.
const DEFAULT_SWEEP_BUDGET: Duration = Duration::from_millis(10);
/// Entries visited between budget checks.
const SWEEP_CHECK_EVERY: usize = 64;

/// Tuning for [`LocalStorage`].
#[derive(Debug, Clone)]
pub struct LocalStorageOptions {
    /// Interval between background sweeps; zero disables the sweeper
    pub cleanup_interval: Duration,
    /// Timestamps older than this are trimmed from every log, whatever the
    /// window sizes in use. Should be at least the largest sliding window.
    pub log_retention: Duration,
    /// Upper bound on the time one background sweep may spend
    pub sweep_budget: Duration,
}

impl Default for LocalStorageOptions {
    fn default() -> Self {
        Self {
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            log_retention: DEFAULT_LOG_RETENTION,
            sweep_budget: DEFAULT_SWEEP_BUDGET,
        }
    }
}

struct LocalState {
    /// Fixed-window records indexed by key
    records: DashMap<String, WindowRecord>,
    /// Hit timestamps indexed by key, oldest first
    logs: DashMap<String, VecDeque<u64>>,
    clock: Arc<dyn Clock>,
    options: LocalStorageOptions,
    /// Where the next budgeted sweep resumes; also serializes sweeps
    cursor: Mutex<SweepCursor>,
}

/// Iteration positions reached by the last budgeted sweep.
#[derive(Debug, Default)]
struct SweepCursor {
    records: usize,
    logs: usize,
}

/// Counter storage backed by in-process maps.
///
/// Per-key updates hold the map shard lock for the whole read-modify-write,
/// so concurrent increments on one key never interleave, even on a
/// multi-threaded runtime. When a record and its log are both touched the
/// record lock is always taken first.
pub struct LocalStorage {
    state: Arc<LocalState>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl LocalStorage {
    /// Create storage on the system clock with default options.
    pub fn new() -> Self {
        Self::with_options(Arc::new(SystemClock::new()), LocalStorageOptions::default())
    }

    /// Create storage reading time from `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self::with_options(clock, LocalStorageOptions::default())
    }

    /// Create storage with explicit options.
    ///
    /// The background sweeper is only started when called from within a
    /// tokio runtime; otherwise [`StorageProvider::clean_expired`] must be
    /// driven by the owner.
    pub fn with_options(clock: Arc<dyn Clock>, options: LocalStorageOptions) -> Self {
        let state = Arc::new(LocalState {
            records: DashMap::new(),
            logs: DashMap::new(),
            clock,
            options,
            cursor: Mutex::new(SweepCursor::default()),
        });

        let sweeper = match tokio::runtime::Handle::try_current() {
            Ok(handle) if !state.options.cleanup_interval.is_zero() => {
                Some(spawn_sweeper(&handle, Arc::downgrade(&state), &state.options))
            }
            _ => None,
        };

        Self {
            state,
            sweeper: Mutex::new(sweeper),
        }
    }

    /// Number of keys holding a window record.
    pub fn key_count(&self) -> usize {
        self.state.records.len()
    }

    /// Number of keys holding a timestamp log.
    pub fn log_count(&self) -> usize {
        self.state.logs.len()
    }

    /// Whether the background sweeper is running.
    pub fn is_sweeping(&self) -> bool {
        self.sweeper
            .lock()
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    fn stop_sweeper(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
    }
}

impl Default for LocalStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for LocalStorage {
    fn drop(&mut self) {
        self.stop_sweeper();
    }
}

impl LocalState {
    /// Record one hit and count the key's hits within the trailing window.
    ///
    /// Both happen under the key's record lock, so concurrent hits on one
    /// key are counted exactly once each.
    fn record_hit(&self, key: &str, window_ms: u64) -> (WindowRecord, u64) {
        let entry = self.records.entry(key.to_owned());
        // Read under the lock so each key's log stays in time order.
        let now = self.clock.now_ms();

        match entry {
            Entry::Occupied(mut occupied) => {
                let record = occupied.get_mut();
                let rolled_over = record.is_expired(now);
                record.hit(now, window_ms);
                let record = *record;

                let trailing = if rolled_over {
                    self.logs.insert(key.to_owned(), VecDeque::from([now]));
                    1
                } else {
                    let mut log = self.logs.entry(key.to_owned()).or_default();
                    log.push_back(now);
                    trailing_count(&log, now, window_ms)
                };
                (record, trailing)
            }
            Entry::Vacant(vacant) => {
                let record = WindowRecord::first(now, window_ms);
                self.logs.insert(key.to_owned(), VecDeque::from([now]));
                vacant.insert(record);
                debug!(key = %key, reset_time = record.reset_time, "Created local window record");
                (record, 1)
            }
        }
    }

    /// Remove expired records and trim stale log entries.
    ///
    /// With a budget the scan stops once the budget is spent and the next
    /// budgeted sweep resumes where this one stopped, wrapping around at the
    /// end of each map. Without a budget both maps are scanned in full.
    fn sweep(&self, budget: Option<Duration>) -> usize {
        let started = Instant::now();
        let over_budget = |visited: usize| {
            visited > 0
                && visited % SWEEP_CHECK_EVERY == 0
                && budget.is_some_and(|b| started.elapsed() >= b)
        };

        let mut cursor = self.cursor.lock();
        let (records_from, logs_from) = match budget {
            Some(_) => (cursor.records, cursor.logs),
            None => (0, 0),
        };

        let now = self.clock.now_ms();
        let horizon = now.saturating_sub(self.options.log_retention.as_millis() as u64);
        let mut removed = 0;

        let mut expired = Vec::new();
        let mut visited = 0;
        let mut finished = true;
        for entry in self.records.iter().skip(records_from) {
            if over_budget(visited) {
                finished = false;
                break;
            }
            visited += 1;
            if entry.value().is_expired(now) {
                expired.push(entry.key().clone());
            }
        }
        let mut dropped = 0;
        for key in expired {
            if self
                .records
                .remove_if(&key, |_, record| record.is_expired(now))
                .is_some()
            {
                dropped += 1;
            }
        }
        removed += dropped;
        // Removed entries all sat before the stopping point.
        cursor.records = if finished {
            0
        } else {
            records_from + visited - dropped
        };

        let mut stale = Vec::new();
        let mut visited = 0;
        let mut finished = true;
        for entry in self.logs.iter().skip(logs_from) {
            if over_budget(visited) {
                finished = false;
                break;
            }
            visited += 1;
            if entry.value().front().is_some_and(|&ts| ts < horizon) {
                stale.push(entry.key().clone());
            }
        }
        let mut dropped = 0;
        for key in stale {
            if let Some(mut log) = self.logs.get_mut(&key) {
                while log.front().is_some_and(|&ts| ts < horizon) {
                    log.pop_front();
                    removed += 1;
                }
            }
            if self.logs.remove_if(&key, |_, log| log.is_empty()).is_some() {
                dropped += 1;
            }
        }
        cursor.logs = if finished {
            0
        } else {
            logs_from + visited - dropped
        };

        removed
    }
}

/// Hits in `(now - window, now]`.
fn trailing_count(log: &VecDeque<u64>, now: u64, window_ms: u64) -> u64 {
    log.iter()
        .filter(|&&ts| ts <= now && ts + window_ms > now)
        .count() as u64
}

fn spawn_sweeper(
    handle: &tokio::runtime::Handle,
    state: Weak<LocalState>,
    options: &LocalStorageOptions,
) -> JoinHandle<()> {
    let period = options.cleanup_interval;
    let budget = options.sweep_budget;

    info!(interval_ms = period.as_millis() as u64, "Starting local storage sweeper");

    handle.spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let Some(state) = state.upgrade() else {
                break;
            };
            let removed = state.sweep(Some(budget));
            if removed > 0 {
                debug!(removed = removed, "Swept expired local rate limit state");
            }
        }
    })
}

#[async_trait]
impl StorageProvider for LocalStorage {
    fn name(&self) -> &'static str {
        "local"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            sliding_window: true,
            batch_increment: false,
            cleanup: true,
        }
    }

    async fn increment(&self, key: &str, window: Duration) -> Result<WindowRecord, StorageError> {
        let (record, _) = self.state.record_hit(key, window_millis(window));
        trace!(key = %key, count = record.count, "Incremented local counter");
        Ok(record)
    }

    async fn sliding_increment(&self, key: &str, window: Duration) -> Result<u64, StorageError> {
        let (record, trailing) = self.state.record_hit(key, window_millis(window));
        trace!(
            key = %key,
            count = record.count,
            trailing = trailing,
            "Recorded local sliding window hit"
        );
        Ok(trailing)
    }

    async fn reset(&self, key: &str) -> Result<(), StorageError> {
        self.state.records.remove(key);
        self.state.logs.remove(key);
        Ok(())
    }

    async fn reset_all(&self) -> Result<(), StorageError> {
        self.state.records.clear();
        self.state.logs.clear();
        Ok(())
    }

    async fn sliding_window_count(&self, key: &str, window: Duration) -> Result<u64, StorageError> {
        let now = self.state.clock.now_ms();
        let window_ms = window_millis(window);

        let count = self
            .state
            .logs
            .get(key)
            .map(|log| trailing_count(&log, now, window_ms))
            .unwrap_or(0);

        Ok(count)
    }

    async fn clean_expired(&self) -> Result<usize, StorageError> {
        Ok(self.state.sweep(None))
    }

    async fn dispose(&self) {
        self.stop_sweeper();
        self.state.records.clear();
        self.state.logs.clear();
        info!("Local storage disposed");
    }
}
