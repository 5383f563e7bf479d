//! The outcome of a single rate limit check.

use serde::{Deserialize, Serialize};

/// Result of asking whether a key may perform one more unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    /// Whether this call was admitted and counted.
    pub allowed: bool,
    /// The ceiling the caller asked for.
    pub limit: u32,
    /// Admissions left in the current window after this call.
    pub remaining: u32,
    /// When the window resets (fixed window) or the oldest counted
    /// event ages out (sliding window), in epoch milliseconds.
    pub reset_at: u64,
}

impl Decision {
    /// An admitted call.
    pub fn allow(limit: u32, remaining: u32, reset_at: u64) -> Self {
        Self {
            allowed: true,
            limit,
            remaining,
            reset_at,
        }
    }

    /// A refused call. Remaining is always zero.
    pub fn deny(limit: u32, reset_at: u64) -> Self {
        Self {
            allowed: false,
            limit,
            remaining: 0,
            reset_at,
        }
    }

    /// Whole seconds a client should wait before retrying. Never below one.
    pub fn retry_after_secs(&self, now_ms: u64) -> u64 {
        self.reset_at.saturating_sub(now_ms).div_ceil(1000).max(1)
    }

    /// `reset_at` rounded up to epoch seconds, as sent in `RateLimit-Reset`.
    pub fn reset_epoch_secs(&self) -> u64 {
        self.reset_at.div_ceil(1000)
    }
}
