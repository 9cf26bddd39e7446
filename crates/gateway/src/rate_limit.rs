use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use edgeguard_policy::CounterStore;

use crate::clock::{Clock, SystemClock};

/// Minimum spacing between sweeps triggered by inserts at capacity.
pub const INLINE_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);
const NEVER_SWEPT: u64 = u64::MAX;

fn expiry(now: Instant, window: Duration) -> Instant {
    now.checked_add(window)
        .or_else(|| now.checked_add(FAR_FUTURE))
        .unwrap_or(now)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterEntry {
    pub count: u64,
    pub expires_at: Instant,
}

impl CounterEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }

    fn bump(&mut self, now: Instant, window: Duration) -> u64 {
        if self.is_live(now) {
            self.count = self.count.saturating_add(1);
        } else {
            self.count = 1;
            self.expires_at = expiry(now, window);
        }
        self.count
    }
}

/// In-memory counter store keyed by rate-limit key.
///
/// Each operation runs under the dashmap shard lock owning its key, so
/// increments on one key are linearizable and unrelated keys rarely contend.
/// Expired entries read as absent and are reclaimed by [`RateLimiter::sweep_expired`].
///
/// `max_keys` triggers reclamation rather than capping the map: new keys are
/// always admitted, and at capacity an inline sweep runs at most once per
/// [`INLINE_SWEEP_INTERVAL`].
#[derive(Clone)]
pub struct RateLimiter<C = SystemClock> {
    entries: Arc<DashMap<String, CounterEntry>>,
    clock: C,
    max_keys: usize,
    origin: Instant,
    last_inline_sweep_ms: Arc<AtomicU64>,
}

impl RateLimiter<SystemClock> {
    pub fn new(max_keys: usize) -> Self {
        Self::with_clock(max_keys, SystemClock)
    }
}

impl<C: Clock> RateLimiter<C> {
    pub fn with_clock(max_keys: usize, clock: C) -> Self {
        let origin = clock.now();
        Self {
            entries: Arc::new(DashMap::new()),
            clock,
            max_keys: max_keys.max(1),
            origin,
            last_inline_sweep_ms: Arc::new(AtomicU64::new(NEVER_SWEPT)),
        }
    }

    /// Number of stored entries, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, key: &str) -> Option<CounterEntry> {
        self.entries.get(key).map(|entry| *entry)
    }

    /// Drops every expired entry and returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_live(now));
        before.saturating_sub(self.entries.len())
    }

    /// Claims the inline sweep slot; only one caller per interval wins.
    fn claim_inline_sweep(&self, now: Instant) -> bool {
        let now_ms = now
            .saturating_duration_since(self.origin)
            .as_millis()
            .min(u128::from(NEVER_SWEPT - 1)) as u64;
        let last = self.last_inline_sweep_ms.load(Ordering::Acquire);
        if last != NEVER_SWEPT
            && now_ms.saturating_sub(last) < INLINE_SWEEP_INTERVAL.as_millis() as u64
        {
            return false;
        }
        self.last_inline_sweep_ms
            .compare_exchange(last, now_ms, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn make_room(&self, now: Instant) {
        if !self.claim_inline_sweep(now) {
            return;
        }

        let removed = self.sweep_expired();
        if self.entries.len() >= self.max_keys {
            tracing::warn!(
                max_keys = self.max_keys,
                entries = self.entries.len(),
                swept = removed,
                "counter store over capacity with live entries"
            );
        }
    }
}

impl<C: Clock> CounterStore for RateLimiter<C> {
    fn increment(&self, key: &str, window: Duration) -> u64 {
        let now = self.clock.now();

        if let Some(mut entry) = self.entries.get_mut(key) {
            return entry.bump(now, window);
        }

        if self.entries.len() >= self.max_keys {
            self.make_room(now);
        }

        // A concurrent caller may have created the key since the lookup above;
        // `entry` re-checks under the shard lock.
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert(CounterEntry {
                count: 0,
                expires_at: now,
            });
        entry.bump(now, window)
    }

    fn penalize(&self, key: &str, count: u64, window: Duration) {
        let now = self.clock.now();
        self.entries.insert(
            key.to_string(),
            CounterEntry {
                count,
                expires_at: expiry(now, window),
            },
        );
    }

    fn get(&self, key: &str) -> u64 {
        let now = self.clock.now();
        self.entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.count)
            .unwrap_or(0)
    }

    fn penalize_if_below(&self, key: &str, count: u64, window: Duration) -> bool {
        let now = self.clock.now();
        let penalized = CounterEntry {
            count,
            expires_at: expiry(now, window),
        };

        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert(CounterEntry {
                count: 0,
                expires_at: now,
            });
        if entry.is_live(now) && entry.count >= count {
            return false;
        }
        *entry = penalized;
        true
    }
}
