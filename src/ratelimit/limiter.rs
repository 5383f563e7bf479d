//! Core rate limiter implementation.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::backend::{BackendKind, RateLimiterBackend};
use super::clock::{Clock, SystemClock};
use super::decision::Decision;
use super::key::RateLimitKey;
use super::memory::{MemoryRateLimiter, DEFAULT_MAX_BUCKETS};
use super::policy::{validate_limit, ActionPolicy};
use super::upstash::UpstashRateLimiter;
use crate::config::{RateLimitingConfig, StoreConfig};
use crate::error::Result;

/// What to answer when the backend cannot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Admit the request
    #[default]
    Open,
    /// Refuse the request
    Closed,
}

/// The rate limiter handed to every mutating handler.
///
/// Owns exactly one backend, chosen at construction, and applies a single
/// failure policy to every backend error. Cheap to share behind an `Arc`.
pub struct RateLimiter {
    /// The counting backend
    backend: Arc<dyn RateLimiterBackend>,
    /// Time source shared with the backend
    clock: Arc<dyn Clock>,
    /// Answer used when the backend errors
    failure_policy: FailurePolicy,
}

impl RateLimiter {
    /// Create an in-process, fail-open rate limiter on the system clock.
    pub fn new() -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let backend = MemoryRateLimiter::with_clock(clock.clone(), DEFAULT_MAX_BUCKETS);
        Self::with_backend(Arc::new(backend), clock, FailurePolicy::Open)
    }

    /// Create a rate limiter around an existing backend.
    pub fn with_backend(
        backend: Arc<dyn RateLimiterBackend>,
        clock: Arc<dyn Clock>,
        failure_policy: FailurePolicy,
    ) -> Self {
        Self {
            backend,
            clock,
            failure_policy,
        }
    }

    /// Build the rate limiter described by configuration.
    pub fn from_config(rate_limiting: &RateLimitingConfig, store: &StoreConfig) -> Result<Self> {
        Self::from_config_with_clock(rate_limiting, store, Arc::new(SystemClock))
    }

    /// Build the rate limiter described by configuration on a specific clock.
    ///
    /// The shared store is used when both its url and token are present;
    /// otherwise counting stays in process for the life of this limiter.
    pub fn from_config_with_clock(
        rate_limiting: &RateLimitingConfig,
        store: &StoreConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let backend: Arc<dyn RateLimiterBackend> = match store.upstash()? {
            Some(upstash) => {
                info!(url = %upstash.url, prefix = %upstash.prefix, "Shared store configured");
                Arc::new(UpstashRateLimiter::with_clock(upstash, clock.clone())?)
            }
            None => {
                info!(
                    max_buckets = rate_limiting.max_buckets,
                    "No shared store configured, counting in process"
                );
                Arc::new(MemoryRateLimiter::with_clock(
                    clock.clone(),
                    rate_limiting.max_buckets,
                ))
            }
        };

        let limiter = Self::with_backend(backend, clock, rate_limiting.failure_policy);
        info!(
            backend = %limiter.backend_kind(),
            guarantee = limiter.backend_kind().guarantee(),
            failure_policy = ?limiter.failure_policy,
            "Rate limiter initialized"
        );
        Ok(limiter)
    }

    /// Check whether `key` may perform one more unit of work.
    ///
    /// Fails only for a zero `limit` or `window_ms`. Backend errors are
    /// resolved by the failure policy into a decision.
    pub async fn check(&self, key: &str, limit: u32, window_ms: u64) -> Result<Decision> {
        validate_limit(limit, window_ms)?;

        match self.backend.check(key, limit, window_ms).await {
            Ok(decision) => {
                if !decision.allowed {
                    debug!(
                        key = %key,
                        limit = limit,
                        reset_at = decision.reset_at,
                        "Rate limit exceeded"
                    );
                }
                Ok(decision)
            }
            Err(e) => {
                let reset_at = self.clock.now_ms().saturating_add(window_ms);
                warn!(
                    key = %key,
                    backend = %self.backend.kind(),
                    failure_policy = ?self.failure_policy,
                    error = %e,
                    "Rate limit backend failed"
                );
                Ok(match self.failure_policy {
                    FailurePolicy::Open => Decision::allow(limit, limit - 1, reset_at),
                    FailurePolicy::Closed => Decision::deny(limit, reset_at),
                })
            }
        }
    }

    /// Check a composed key against an action policy.
    pub async fn check_key(&self, key: &RateLimitKey, policy: &ActionPolicy) -> Result<Decision> {
        self.check(&key.to_string_key(), policy.limit, policy.window_ms)
            .await
    }

    /// The limiter's notion of now, in epoch milliseconds.
    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        self.failure_policy
    }

    /// Drop expired in-process state. Returns how many entries were removed.
    pub fn sweep(&self) -> usize {
        self.backend.sweep()
    }

    /// Number of keys held in process, if the backend keeps any.
    pub fn tracked_keys(&self) -> Option<usize> {
        self.backend.tracked_keys()
    }

    /// Sweep expired state every `interval` until the handle is aborted.
    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let removed = self.sweep();
                if removed > 0 {
                    debug!(removed = removed, "Periodic sweep finished");
                }
            }
        })
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
