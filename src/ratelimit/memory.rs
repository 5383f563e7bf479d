//! In-process fixed-window rate limiter.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, trace, warn};

use super::backend::{BackendKind, RateLimiterBackend};
use super::bucket::Bucket;
use super::clock::{Clock, SystemClock};
use super::decision::Decision;
use crate::error::Result;

/// Default ceiling on tracked keys before an insert triggers a sweep.
pub const DEFAULT_MAX_BUCKETS: usize = 100_000;

/// Minimum gap between sweeps triggered by inserts into a full table.
pub const CAPACITY_SWEEP_INTERVAL_MS: u64 = 1_000;

/// `last_capacity_sweep` before the first capacity sweep.
const NEVER_SWEPT: u64 = u64::MAX;

/// Fixed-window limiter keeping one [`Bucket`] per key in process memory.
///
/// The admission step for a key runs under that key's map entry lock, so
/// concurrent checks for the same key never over-admit.
pub struct MemoryRateLimiter {
    /// Buckets indexed by flat key
    buckets: DashMap<String, Bucket>,
    /// Time source for window arithmetic
    clock: Arc<dyn Clock>,
    /// Soft cap on tracked keys
    max_buckets: usize,
    /// When an insert at capacity last swept, in epoch milliseconds
    last_capacity_sweep: AtomicU64,
    /// Sweeps triggered by inserts at capacity
    capacity_sweeps: AtomicU64,
}

impl MemoryRateLimiter {
    /// Create a limiter on the system clock with the default capacity.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock), DEFAULT_MAX_BUCKETS)
    }

    /// Create a limiter on a specific clock and capacity.
    pub fn with_clock(clock: Arc<dyn Clock>, max_buckets: usize) -> Self {
        Self {
            buckets: DashMap::new(),
            clock,
            max_buckets: max_buckets.max(1),
            last_capacity_sweep: AtomicU64::new(NEVER_SWEPT),
            capacity_sweeps: AtomicU64::new(0),
        }
    }

    /// Check one unit of work for `key`.
    pub fn check_now(&self, key: &str, limit: u32, window_ms: u64) -> Decision {
        let now = self.clock.now_ms();

        if self.buckets.len() >= self.max_buckets && !self.buckets.contains_key(key) {
            self.sweep_at_capacity(now);
        }

        let decision = match self.buckets.entry(key.to_string()) {
            Entry::Occupied(mut entry) => entry.get_mut().admit(now, limit, window_ms),
            Entry::Vacant(entry) => {
                let bucket = Bucket::open(now, window_ms);
                entry.insert(bucket);
                debug!(key = %key, limit = limit, window_ms = window_ms, "Opened new window");
                Decision::allow(limit, limit.saturating_sub(1), bucket.window_reset_at())
            }
        };

        trace!(
            key = %key,
            allowed = decision.allowed,
            remaining = decision.remaining,
            "Checked in-process rate limit"
        );

        decision
    }

    /// Sweep a full table, at most once per [`CAPACITY_SWEEP_INTERVAL_MS`].
    ///
    /// Inserts in between go ahead without scanning; the periodic sweeper
    /// still bounds growth.
    fn sweep_at_capacity(&self, now: u64) {
        let last = self.last_capacity_sweep.load(Ordering::Acquire);
        if last != NEVER_SWEPT && now.saturating_sub(last) < CAPACITY_SWEEP_INTERVAL_MS {
            return;
        }
        if self
            .last_capacity_sweep
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let sweeps = self.capacity_sweeps.fetch_add(1, Ordering::Relaxed) + 1;
        let removed = self.sweep_expired();
        if self.buckets.len() >= self.max_buckets {
            warn!(
                tracked = self.buckets.len(),
                max_buckets = self.max_buckets,
                removed = removed,
                capacity_sweeps = sweeps,
                "Bucket table at capacity with no expired entries"
            );
        }
    }

    /// Current admission count for `key`, if it has a live window.
    pub fn count(&self, key: &str) -> Option<u32> {
        let now = self.clock.now_ms();
        self.buckets
            .get(key)
            .filter(|bucket| !bucket.is_expired(now))
            .map(|bucket| bucket.count())
    }

    /// Remove every bucket whose window has ended.
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now_ms();
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| !bucket.is_expired(now));
        let removed = before.saturating_sub(self.buckets.len());
        if removed > 0 {
            debug!(removed = removed, remaining = self.buckets.len(), "Swept expired buckets");
        }
        removed
    }

    /// Number of tracked keys, live or expired.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    /// Whether no keys are tracked.
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Forget every key.
    pub fn clear(&self) {
        self.buckets.clear();
    }
}

impl Default for MemoryRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RateLimiterBackend for MemoryRateLimiter {
    async fn check(&self, key: &str, limit: u32, window_ms: u64) -> Result<Decision> {
        Ok(self.check_now(key, limit, window_ms))
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }

    fn sweep(&self) -> usize {
        self.sweep_expired()
    }

    fn tracked_keys(&self) -> Option<usize> {
        Some(self.len())
    }
}
