//! In-process emulation of a shared counter backend.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, trace};

use super::client::RemoteClient;
use super::StorageError;
use crate::clock::{Clock, SystemClock};

/// Commands between two full purges of expired keys.
const PURGE_EVERY: u64 = 1024;

#[derive(Debug)]
enum Value {
    Counter(u64),
    SortedSet(BTreeSet<(u64, String)>),
}

#[derive(Debug)]
struct Slot {
    value: Value,
    /// Expiry in epoch milliseconds
    expires_at: Option<u64>,
}

/// A [`RemoteClient`] that keeps its keyspace in memory.
///
/// Each command runs under one lock, so `incr_with_expiry` and `sliding_hit`
/// are as atomic as a server-side script. Share one backend between several
/// [`RemoteStorage`] instances (through `Arc`) to have independent limiters
/// count against the same keys.
///
/// Expired keys are dropped when touched and, for keys nobody touches again,
/// by a purge that runs every few hundred commands.
///
/// [`RemoteStorage`]: super::RemoteStorage
#[derive(Debug)]
pub struct MemoryBackend {
    slots: Mutex<HashMap<String, Slot>>,
    clock: Arc<dyn Clock>,
    scripting: bool,
    closed: AtomicBool,
    /// Commands served, drives the periodic purge
    commands: AtomicU64,
}

impl MemoryBackend {
    /// Create an empty backend on the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    /// Create an empty backend reading time from `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            clock,
            scripting: true,
            closed: AtomicBool::new(false),
            commands: AtomicU64::new(0),
        }
    }

    /// Advertise no atomic script support, forcing callers onto the
    /// individual-command fallback.
    pub fn without_scripting(mut self) -> Self {
        self.scripting = false;
        self
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of live keys. Expired keys are purged first.
    pub fn key_count(&self) -> usize {
        let mut slots = self.slots.lock();
        purge(&mut slots, self.clock.now_ms());
        slots.len()
    }

    /// Drop every expired key, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        purge(&mut self.slots.lock(), self.clock.now_ms())
    }

    /// Lock the keyspace for one command.
    fn keyspace(&self, now: u64) -> MutexGuard<'_, HashMap<String, Slot>> {
        let mut slots = self.slots.lock();
        let served = self.commands.fetch_add(1, Ordering::Relaxed) + 1;
        if served % PURGE_EVERY == 0 {
            let purged = purge(&mut slots, now);
            if purged > 0 {
                trace!(purged = purged, "Purged expired backend keys");
            }
        }
        slots
    }

    fn ensure_open(&self) -> Result<(), StorageError> {
        if self.is_closed() {
            return Err(StorageError::Backend("connection closed".to_string()));
        }
        Ok(())
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn purge(slots: &mut HashMap<String, Slot>, now: u64) -> usize {
    let before = slots.len();
    slots.retain(|_, slot| slot.expires_at.map_or(true, |at| at > now));
    before - slots.len()
}

/// Drop `key` if its expiry has passed.
fn expire_key(slots: &mut HashMap<String, Slot>, key: &str, now: u64) {
    if slots
        .get(key)
        .is_some_and(|slot| slot.expires_at.is_some_and(|at| at <= now))
    {
        slots.remove(key);
    }
}

/// Drop `key` if its expiry has passed, then return the live slot if any.
fn live_slot<'a>(
    slots: &'a mut HashMap<String, Slot>,
    key: &str,
    now: u64,
) -> Option<&'a mut Slot> {
    expire_key(slots, key, now);
    slots.get_mut(key)
}

fn wrong_type(key: &str) -> StorageError {
    StorageError::Backend(format!(
        "WRONGTYPE operation against key '{}' holding the wrong kind of value",
        key
    ))
}

fn bump_counter(slots: &mut HashMap<String, Slot>, key: &str, now: u64) -> Result<u64, StorageError> {
    match live_slot(slots, key, now) {
        Some(Slot {
            value: Value::Counter(count),
            ..
        }) => {
            *count += 1;
            Ok(*count)
        }
        Some(_) => Err(wrong_type(key)),
        None => {
            slots.insert(
                key.to_owned(),
                Slot {
                    value: Value::Counter(1),
                    expires_at: None,
                },
            );
            Ok(1)
        }
    }
}

#[async_trait]
impl RemoteClient for MemoryBackend {
    fn supports_scripting(&self) -> bool {
        self.scripting
    }

    async fn incr_with_expiry(&self, key: &str, window_ms: u64) -> Result<(u64, u64), StorageError> {
        self.ensure_open()?;
        if !self.scripting {
            return Err(StorageError::Unsupported("incr_with_expiry"));
        }

        let now = self.clock.now_ms();
        let mut slots = self.keyspace(now);
        let count = bump_counter(&mut slots, key, now)?;

        let slot = slots
            .get_mut(key)
            .ok_or_else(|| StorageError::Backend(format!("key '{}' vanished", key)))?;
        let expires_at = match slot.expires_at {
            Some(at) if count > 1 => at,
            _ => {
                let at = now + window_ms;
                slot.expires_at = Some(at);
                at
            }
        };

        Ok((count, expires_at.saturating_sub(now)))
    }

    async fn sliding_hit(
        &self,
        key: &str,
        now_ms: u64,
        member: &str,
        window_ms: u64,
    ) -> Result<u64, StorageError> {
        self.ensure_open()?;
        if !self.scripting {
            return Err(StorageError::Unsupported("sliding_hit"));
        }

        let now = self.clock.now_ms();
        let mut slots = self.keyspace(now);
        expire_key(&mut slots, key, now);
        let slot = slots.entry(key.to_owned()).or_insert_with(|| Slot {
            value: Value::SortedSet(BTreeSet::new()),
            expires_at: None,
        });

        let Value::SortedSet(set) = &mut slot.value else {
            return Err(wrong_type(key));
        };
        set.retain(|(_, existing)| existing != member);
        set.insert((now_ms, member.to_owned()));
        set.retain(|(score, _)| score + window_ms > now_ms);
        let count = set.len() as u64;
        slot.expires_at = Some(now + window_ms);

        Ok(count)
    }

    async fn incr(&self, key: &str) -> Result<u64, StorageError> {
        self.ensure_open()?;
        let now = self.clock.now_ms();
        bump_counter(&mut self.keyspace(now), key, now)
    }

    async fn pttl(&self, key: &str) -> Result<i64, StorageError> {
        self.ensure_open()?;
        let now = self.clock.now_ms();
        let mut slots = self.keyspace(now);

        Ok(match live_slot(&mut slots, key, now) {
            None => -2,
            Some(Slot {
                expires_at: None, ..
            }) => -1,
            Some(Slot {
                expires_at: Some(at),
                ..
            }) => at.saturating_sub(now) as i64,
        })
    }

    async fn pexpire(&self, key: &str, ttl_ms: u64) -> Result<(), StorageError> {
        self.ensure_open()?;
        let now = self.clock.now_ms();
        let mut slots = self.keyspace(now);

        if let Some(slot) = live_slot(&mut slots, key, now) {
            slot.expires_at = Some(now + ttl_ms);
        }
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> Result<u64, StorageError> {
        self.ensure_open()?;
        let now = self.clock.now_ms();
        let mut slots = self.keyspace(now);

        let mut deleted = 0;
        for key in keys {
            if live_slot(&mut slots, key, now).is_some() {
                slots.remove(key);
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn zadd(&self, key: &str, score: u64, member: &str) -> Result<(), StorageError> {
        self.ensure_open()?;
        let now = self.clock.now_ms();
        let mut slots = self.keyspace(now);

        match live_slot(&mut slots, key, now) {
            Some(Slot {
                value: Value::SortedSet(set),
                ..
            }) => {
                set.retain(|(_, existing)| existing != member);
                set.insert((score, member.to_owned()));
            }
            Some(_) => return Err(wrong_type(key)),
            None => {
                slots.insert(
                    key.to_owned(),
                    Slot {
                        value: Value::SortedSet(BTreeSet::from([(score, member.to_owned())])),
                        expires_at: None,
                    },
                );
            }
        }
        Ok(())
    }

    async fn zremrangebyscore(&self, key: &str, min: u64, max: u64) -> Result<u64, StorageError> {
        self.ensure_open()?;
        let now = self.clock.now_ms();
        let mut slots = self.keyspace(now);

        let (removed, now_empty) = match live_slot(&mut slots, key, now) {
            Some(Slot {
                value: Value::SortedSet(set),
                ..
            }) => {
                let before = set.len();
                set.retain(|(score, _)| *score < min || *score > max);
                ((before - set.len()) as u64, set.is_empty())
            }
            Some(_) => return Err(wrong_type(key)),
            None => (0, false),
        };

        if now_empty {
            slots.remove(key);
        }
        Ok(removed)
    }

    async fn zcard(&self, key: &str) -> Result<u64, StorageError> {
        self.ensure_open()?;
        let now = self.clock.now_ms();
        let mut slots = self.keyspace(now);

        match live_slot(&mut slots, key, now) {
            Some(Slot {
                value: Value::SortedSet(set),
                ..
            }) => Ok(set.len() as u64),
            Some(_) => Err(wrong_type(key)),
            None => Ok(0),
        }
    }

    async fn close(&self) -> Result<(), StorageError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            debug!("Memory backend closed");
        }
        Ok(())
    }
}
