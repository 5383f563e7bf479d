//! Fixed-window bucket state.

use super::decision::Decision;

/// Counter state for one rate limited key.
///
/// Not synchronized on its own; callers hold it behind a per-key lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bucket {
    /// Admissions counted in the current window
    count: u32,
    /// When the current window ends, in epoch milliseconds
    window_reset_at: u64,
}

impl Bucket {
    /// Start a new window with the first admission already counted.
    pub fn open(now_ms: u64, window_ms: u64) -> Self {
        Self {
            count: 1,
            window_reset_at: now_ms.saturating_add(window_ms),
        }
    }

    /// Admissions counted in the current window.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// When the current window ends.
    pub fn window_reset_at(&self) -> u64 {
        self.window_reset_at
    }

    /// Whether the window has ended at `now_ms`.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.window_reset_at
    }

    /// Try to admit one more unit of work.
    ///
    /// An expired window is replaced by a fresh one. A full window is left
    /// untouched so denied attempts never count against the caller.
    pub fn admit(&mut self, now_ms: u64, limit: u32, window_ms: u64) -> Decision {
        if self.is_expired(now_ms) {
            *self = Bucket::open(now_ms, window_ms);
            return Decision::allow(limit, limit.saturating_sub(1), self.window_reset_at);
        }

        if self.count >= limit {
            return Decision::deny(limit, self.window_reset_at);
        }

        self.count += 1;
        Decision::allow(limit, limit - self.count, self.window_reset_at)
    }
}
