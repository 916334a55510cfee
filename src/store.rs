//! Fixed-window counter storage.
//!
//! Each composite key owns a [`CounterEntry`] whose `reset_time_ms` is fixed
//! when the window opens. Requests inside the window increment the count in
//! place; the first request at or after `reset_time_ms` replaces the entry.
//!
//! Fixed windows admit a burst of up to `2 * max_requests` around a window
//! boundary (`max_requests` just before the reset and `max_requests` just
//! after). This is a known property of the algorithm.
//!
//! [`MemoryStore`] bounds memory with two mechanisms that are independent of
//! window state: a capacity bound enforced by least-recently-used eviction and
//! a per-entry TTL. An entry evicted while its window is still open simply
//! restarts its count on the next request.
//!
//! Counters are local to the process. Several instances behind a load
//! balancer each keep their own counts, so the effective global limit grows
//! with the instance count.

use crate::clock::{Clock, SystemClock};
use crate::error::{ThrottlerError, ThrottlerResult};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

pub const DEFAULT_CAPACITY: usize = 10_000;
pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Counter state for one composite key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterEntry {
    pub count: u64,
    pub reset_time_ms: u64,
}

/// Outcome of a single check-and-increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitResult {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    pub reset_time_ms: u64,
    pub total_hits: u64,
}

/// Storage backend for fixed-window counters.
///
/// `check_and_increment` must be a single atomic step per key: two
/// concurrent calls on a key at `max_requests - 1` hits must not both be
/// admitted.
pub trait CounterStore: Send + Sync {
    fn check_and_increment(
        &self,
        key: &str,
        window: Duration,
        max_requests: u64,
    ) -> ThrottlerResult<RateLimitResult>;

    /// Back one hit out of `key`, but only while its current window is the
    /// one that ends at `reset_time_ms`.
    fn decrement(&self, key: &str, reset_time_ms: u64) -> ThrottlerResult<()>;

    fn reset(&self, key: &str) -> ThrottlerResult<()>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn capacity(&self) -> usize;
}

#[derive(Debug)]
struct Slot {
    entry: CounterEntry,
    expires_at_ms: u64,
    tick: u64,
}

/// Map plus recency index. `recency` maps an access tick to its key, so the
/// first entry is always the least recently used one.
#[derive(Debug, Default)]
struct Inner {
    slots: HashMap<String, Slot>,
    recency: BTreeMap<u64, String>,
    next_tick: u64,
}

impl Inner {
    /// Remove `key` and return its entry if it has not outlived its TTL.
    fn take_live(&mut self, key: &str, now_ms: u64) -> Option<CounterEntry> {
        let slot = self.slots.remove(key)?;
        self.recency.remove(&slot.tick);
        (now_ms < slot.expires_at_ms).then_some(slot.entry)
    }

    fn put(&mut self, key: &str, entry: CounterEntry, expires_at_ms: u64) {
        let tick = self.next_tick;
        self.next_tick += 1;
        self.recency.insert(tick, key.to_string());
        self.slots.insert(
            key.to_string(),
            Slot {
                entry,
                expires_at_ms,
                tick,
            },
        );
    }

    /// Evict least recently used entries until `capacity` holds.
    fn evict_to(&mut self, capacity: usize) -> usize {
        let mut evicted = 0;
        while self.slots.len() > capacity {
            let Some((_, victim)) = self.recency.pop_first() else {
                break;
            };
            self.slots.remove(&victim);
            evicted += 1;
        }
        evicted
    }
}

/// In-memory, LRU-bounded counter store guarded by a single mutex.
///
/// The critical section is O(log n) bounded work with no I/O, so one global
/// lock is enough for a single process.
#[derive(Debug)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    capacity: usize,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    pub fn new(capacity: usize, ttl: Duration) -> ThrottlerResult<Self> {
        Self::with_clock(capacity, ttl, Arc::new(SystemClock))
    }

    pub fn with_clock(
        capacity: usize,
        ttl: Duration,
        clock: Arc<dyn Clock>,
    ) -> ThrottlerResult<Self> {
        if capacity == 0 {
            return Err(ThrottlerError::Configuration(
                "Store capacity must be greater than 0".to_string(),
            ));
        }
        if ttl.is_zero() {
            return Err(ThrottlerError::Configuration(
                "Store TTL must be greater than 0".to_string(),
            ));
        }

        Ok(Self {
            inner: Mutex::new(Inner::default()),
            capacity,
            ttl,
            clock,
        })
    }

    /// Every critical section leaves `Inner` consistent, so a lock poisoned
    /// by a panicking thread is still safe to keep using.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop every entry that has outlived its TTL. Returns how many were removed.
    pub fn purge_expired(&self) -> ThrottlerResult<usize> {
        let now_ms = self.clock.now_ms();
        let mut inner = self.lock();

        let expired: Vec<(String, u64)> = inner
            .slots
            .iter()
            .filter(|(_, slot)| now_ms >= slot.expires_at_ms)
            .map(|(key, slot)| (key.clone(), slot.tick))
            .collect();

        for (key, tick) in &expired {
            inner.slots.remove(key);
            inner.recency.remove(tick);
        }

        Ok(expired.len())
    }

    fn ttl_ms(&self) -> u64 {
        duration_ms(self.ttl)
    }
}

impl CounterStore for MemoryStore {
    fn check_and_increment(
        &self,
        key: &str,
        window: Duration,
        max_requests: u64,
    ) -> ThrottlerResult<RateLimitResult> {
        let now_ms = self.clock.now_ms();
        let mut inner = self.lock();

        let entry = match inner.take_live(key, now_ms) {
            Some(current) if now_ms < current.reset_time_ms => CounterEntry {
                count: current.count.saturating_add(1),
                reset_time_ms: current.reset_time_ms,
            },
            _ => CounterEntry {
                count: 1,
                reset_time_ms: now_ms.saturating_add(duration_ms(window)),
            },
        };

        inner.put(key, entry, now_ms.saturating_add(self.ttl_ms()));
        // The key just written is the most recent, so it is never the victim.
        let evicted = inner.evict_to(self.capacity);
        if evicted > 0 {
            tracing::debug!(
                target: "route_throttle::store",
                evicted,
                capacity = self.capacity,
                "Evicted least recently used counters"
            );
        }

        Ok(RateLimitResult {
            allowed: entry.count <= max_requests,
            limit: max_requests,
            remaining: max_requests.saturating_sub(entry.count),
            reset_time_ms: entry.reset_time_ms,
            total_hits: entry.count,
        })
    }

    fn decrement(&self, key: &str, reset_time_ms: u64) -> ThrottlerResult<()> {
        let mut inner = self.lock();

        if let Some(slot) = inner.slots.get_mut(key) {
            if slot.entry.reset_time_ms == reset_time_ms {
                slot.entry.count = slot.entry.count.saturating_sub(1);
            }
        }

        Ok(())
    }

    fn reset(&self, key: &str) -> ThrottlerResult<()> {
        let mut inner = self.lock();

        if let Some(slot) = inner.slots.remove(key) {
            inner.recency.remove(&slot.tick);
        }

        Ok(())
    }

    fn len(&self) -> usize {
        self.lock().slots.len()
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
