//! Rate limiter trait for abstracting in-process and shared-store implementations.

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;

use super::decision::Decision;
use crate::error::Result;

/// Which counting strategy a backend implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Process-local fixed window
    Memory,
    /// Shared Upstash Redis sliding window
    Upstash,
}

impl BackendKind {
    /// The guarantee this backend gives, for logs and health output.
    pub fn guarantee(&self) -> &'static str {
        match self {
            BackendKind::Memory => "fixed window, single process",
            BackendKind::Upstash => "sliding window, shared across instances",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Memory => write!(f, "memory"),
            BackendKind::Upstash => write!(f, "upstash"),
        }
    }
}

/// Trait for rate limiter backends.
///
/// Implementations count admissions for `key` and report a [`Decision`].
/// Arguments are validated by the caller: `limit` and `window_ms` are never zero.
#[async_trait]
pub trait RateLimiterBackend: Send + Sync {
    /// Admit or refuse one unit of work for `key`.
    async fn check(&self, key: &str, limit: u32, window_ms: u64) -> Result<Decision>;

    /// The strategy this backend implements.
    fn kind(&self) -> BackendKind;

    /// Drop state for windows that have ended. Returns how many entries were removed.
    fn sweep(&self) -> usize {
        0
    }

    /// Number of keys currently tracked in process, if the backend keeps any.
    fn tracked_keys(&self) -> Option<usize> {
        None
    }
}
