//! Shared-store rate limiter backed by Upstash Redis over its REST API.
//!
//! Counting runs inside Redis as a single Lua script so every instance that
//! points at the same store sees the same counters. The script approximates a
//! sliding window with two fixed buckets: the previous window's count is
//! weighted by how much of it still overlaps the trailing interval.
//!
//! For a window of `w` ms at time `now`, with `c` admissions counted in the
//! current window and `p` in the previous one:
//!
//! - `weighted = floor(p * (w - now % w) / w)`
//! - refused when `weighted + c >= limit`, and nothing is counted
//! - otherwise `c` is incremented, and the key expires `2w + 1000` ms after
//!   its first increment
//! - the script returns `limit - (c + 1 + weighted)`, or `-1` when refused

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, trace};

use super::backend::{BackendKind, RateLimiterBackend};
use super::clock::{Clock, SystemClock};
use super::decision::Decision;
use crate::error::{Result, ThrottleError};

/// Default key prefix in the shared store.
pub const DEFAULT_PREFIX: &str = "ratelimit";

/// Returns the admissions left after this call, or -1 when refused.
const SLIDING_WINDOW_SCRIPT: &str = r#"
local current_key = KEYS[1]
local previous_key = KEYS[2]
local limit = tonumber(ARGV[1])
local now = tonumber(ARGV[2])
local window = tonumber(ARGV[3])

local current = tonumber(redis.call("GET", current_key) or "0")
local previous = tonumber(redis.call("GET", previous_key) or "0")

local weighted = math.floor(previous * (window - now % window) / window)

if weighted + current >= limit then
  return -1
end

local updated = redis.call("INCRBY", current_key, 1)
if updated == 1 then
  redis.call("PEXPIRE", current_key, window * 2 + 1000)
end

return limit - (updated + weighted)
"#;

/// Connection settings for the shared store.
#[derive(Debug, Clone)]
pub struct UpstashConfig {
    /// REST endpoint, e.g. `https://eu1-example.upstash.io`
    pub url: String,
    /// REST bearer token
    pub token: String,
    /// Prefix for every key written to the store
    pub prefix: String,
    /// Per-request timeout
    pub timeout: Duration,
}

/// Body of an Upstash REST reply.
#[derive(Debug, Deserialize)]
struct RestReply {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

/// Sliding-window limiter whose counters live in a shared Redis.
pub struct UpstashRateLimiter {
    client: reqwest::Client,
    url: String,
    token: String,
    prefix: String,
    clock: Arc<dyn Clock>,
}

impl UpstashRateLimiter {
    /// Create a limiter on the system clock.
    pub fn new(config: UpstashConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Create a limiter on a specific clock.
    pub fn with_clock(config: UpstashConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        if config.url.trim().is_empty() || config.token.trim().is_empty() {
            return Err(ThrottleError::Config(
                "store url and token must both be non-empty".to_string(),
            ));
        }

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;

        Ok(Self {
            client,
            url: config.url.trim_end_matches('/').to_string(),
            token: config.token,
            prefix: config.prefix,
            clock,
        })
    }

    /// Store key for one window of `key`.
    fn window_key(&self, key: &str, window_index: u64) -> String {
        format!("{}:{}:{}", self.prefix, key, window_index)
    }

    /// Send one command and return its `result` value.
    async fn command(&self, command: Value) -> Result<Value> {
        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.token)
            .json(&command)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        let reply: Option<RestReply> = serde_json::from_str(&body).ok();

        if let Some(RestReply {
            error: Some(message),
            ..
        }) = &reply
        {
            return Err(ThrottleError::Store(format!("{} ({})", message, status)));
        }

        if !status.is_success() {
            return Err(ThrottleError::Store(format!(
                "unexpected status {} from store",
                status
            )));
        }

        match reply {
            Some(RestReply {
                result: Some(value),
                ..
            }) => Ok(value),
            _ => Err(ThrottleError::Store("reply carried no result".to_string())),
        }
    }
}

#[async_trait]
impl RateLimiterBackend for UpstashRateLimiter {
    async fn check(&self, key: &str, limit: u32, window_ms: u64) -> Result<Decision> {
        let now = self.clock.now_ms();
        let window_index = now / window_ms;
        let current_key = self.window_key(key, window_index);
        let previous_key = self.window_key(key, window_index.saturating_sub(1));

        trace!(
            key = %key,
            window = window_index,
            limit = limit,
            "Checking shared rate limit"
        );

        let result = self
            .command(json!([
                "EVAL",
                SLIDING_WINDOW_SCRIPT,
                "2",
                current_key,
                previous_key,
                limit.to_string(),
                now.to_string(),
                window_ms.to_string(),
            ]))
            .await?;

        let remaining = result.as_i64().ok_or_else(|| {
            ThrottleError::Store(format!("expected an integer result, got {}", result))
        })?;

        let reset_at = (window_index + 1).saturating_mul(window_ms);

        if remaining < 0 {
            debug!(key = %key, limit = limit, "Shared rate limit exceeded");
            return Ok(Decision::deny(limit, reset_at));
        }

        let remaining = u32::try_from(remaining).unwrap_or(limit).min(limit);
        Ok(Decision::allow(limit, remaining, reset_at))
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Upstash
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::{Json, Router};
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// Previous window's count scaled by the unelapsed share of the window.
    fn weighted_previous(previous: u64, now: u64, window: u64) -> u64 {
        previous * (window - now % window) / window
    }

    /// One step of the store script: remaining admissions, or `None` when
    /// refused. `current` is the count before this call.
    fn script_step(limit: u64, current: u64, previous: u64, now: u64, window: u64) -> Option<u64> {
        let weighted = weighted_previous(previous, now, window);
        if weighted + current >= limit {
            return None;
        }
        Some(limit - (current + 1 + weighted))
    }

    /// A stand-in store that answers every command with a canned reply and
    /// remembers what it was sent.
    #[derive(Clone)]
    struct FakeStore {
        status: StatusCode,
        reply: Value,
        seen: Arc<Mutex<Vec<(Option<String>, Value)>>>,
    }

    async fn spawn_store(status: StatusCode, reply: Value) -> (String, FakeStore) {
        let store = FakeStore {
            status,
            reply,
            seen: Arc::new(Mutex::new(Vec::new())),
        };

        let state = store.clone();
        let app = Router::new().route(
            "/",
            post(move |headers: HeaderMap, Json(body): Json<Value>| {
                let state = state.clone();
                async move {
                    let auth = headers
                        .get("authorization")
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_string);
                    state.seen.lock().push((auth, body));
                    (state.status, Json(state.reply.clone()))
                }
            }),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (format!("http://{}", addr), store)
    }

    /// A stand-in store that keeps counters and answers `EVAL` with
    /// `script_step`.
    async fn spawn_counting_store() -> (String, Arc<Mutex<HashMap<String, u64>>>) {
        let counters: Arc<Mutex<HashMap<String, u64>>> = Arc::new(Mutex::new(HashMap::new()));

        let state = counters.clone();
        let app = Router::new().route(
            "/",
            post(move |Json(body): Json<Value>| {
                let state = state.clone();
                async move {
                    let arg = |i: usize| body[i].as_str().unwrap().to_string();
                    let number = |i: usize| arg(i).parse::<u64>().unwrap();
                    let (current_key, previous_key) = (arg(3), arg(4));

                    let mut counters = state.lock();
                    let current = counters.get(&current_key).copied().unwrap_or(0);
                    let previous = counters.get(&previous_key).copied().unwrap_or(0);

                    match script_step(number(5), current, previous, number(6), number(7)) {
                        Some(remaining) => {
                            counters.insert(current_key, current + 1);
                            Json(json!({ "result": remaining }))
                        }
                        None => Json(json!({ "result": -1 })),
                    }
                }
            }),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (format!("http://{}", addr), counters)
    }

    fn limiter_on(url: String, clock: Arc<ManualClock>) -> UpstashRateLimiter {
        let config = UpstashConfig {
            url,
            token: "secret".to_string(),
            prefix: DEFAULT_PREFIX.to_string(),
            timeout: Duration::from_secs(2),
        };
        UpstashRateLimiter::with_clock(config, clock).unwrap()
    }

    fn limiter(url: String, now_ms: u64) -> UpstashRateLimiter {
        let config = UpstashConfig {
            url,
            token: "secret".to_string(),
            prefix: DEFAULT_PREFIX.to_string(),
            timeout: Duration::from_secs(2),
        };
        UpstashRateLimiter::with_clock(config, Arc::new(ManualClock::new(now_ms))).unwrap()
    }

    #[test]
    fn test_previous_window_fully_weighted_at_window_start() {
        assert_eq!(weighted_previous(5, 120_000, 60_000), 5);
        assert_eq!(script_step(5, 0, 5, 120_000, 60_000), None);
        assert_eq!(script_step(5, 0, 4, 120_000, 60_000), Some(0));
    }

    #[test]
    fn test_previous_window_vanishes_at_window_end() {
        assert_eq!(weighted_previous(5, 179_999, 60_000), 0);
        assert_eq!(script_step(5, 0, 5, 179_999, 60_000), Some(4));
        assert_eq!(script_step(5, 4, 5, 179_999, 60_000), Some(0));
        assert_eq!(script_step(5, 5, 5, 179_999, 60_000), None);
    }

    #[test]
    fn test_previous_window_at_limit_halfway() {
        assert_eq!(weighted_previous(5, 150_000, 60_000), 2);
        assert_eq!(script_step(5, 0, 5, 150_000, 60_000), Some(2));
        assert_eq!(script_step(5, 2, 5, 150_000, 60_000), Some(0));
        assert_eq!(script_step(5, 3, 5, 150_000, 60_000), None);
    }

    #[test]
    fn test_script_matches_window_arithmetic() {
        for line in [
            "local weighted = math.floor(previous * (window - now % window) / window)",
            "if weighted + current >= limit then",
            "  return -1",
            "local updated = redis.call(\"INCRBY\", current_key, 1)",
            "if updated == 1 then",
            "  redis.call(\"PEXPIRE\", current_key, window * 2 + 1000)",
            "return limit - (updated + weighted)",
        ] {
            assert!(
                SLIDING_WINDOW_SCRIPT.lines().any(|l| l == line),
                "script is missing `{}`",
                line
            );
        }

        let refusal = SLIDING_WINDOW_SCRIPT.find("return -1").unwrap();
        let increment = SLIDING_WINDOW_SCRIPT.find("INCRBY").unwrap();
        assert!(refusal < increment, "refused calls must not be counted");
    }

    #[tokio::test]
    async fn test_sliding_window_carries_previous_window() {
        let (url, counters) = spawn_counting_store().await;
        let clock = Arc::new(ManualClock::new(60_000));
        let limiter = limiter_on(url, clock.clone());

        for expected in (0..5).rev() {
            let decision = limiter.check("contact:1.2.3.4", 5, 60_000).await.unwrap();
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected);
        }
        let denied = limiter.check("contact:1.2.3.4", 5, 60_000).await.unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.reset_at, 120_000);
        assert_eq!(counters.lock().get("ratelimit:contact:1.2.3.4:1"), Some(&5));

        // Halfway through the next window, half the previous count still weighs in.
        clock.set(150_000);
        let mut admitted = 0;
        while limiter.check("contact:1.2.3.4", 5, 60_000).await.unwrap().allowed {
            admitted += 1;
        }
        assert_eq!(admitted, 3);

        // At the last millisecond the previous window no longer counts.
        clock.set(179_999);
        let decision = limiter.check("contact:1.2.3.4", 5, 60_000).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 1);
        assert_eq!(decision.reset_at, 180_000);
        assert_eq!(counters.lock().get("ratelimit:contact:1.2.3.4:2"), Some(&4));
    }

    #[test]
    fn test_rejects_missing_credentials() {
        let config = UpstashConfig {
            url: "https://example.upstash.io".to_string(),
            token: "  ".to_string(),
            prefix: DEFAULT_PREFIX.to_string(),
            timeout: Duration::from_secs(1),
        };
        assert!(matches!(
            UpstashRateLimiter::new(config),
            Err(ThrottleError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_allowed_reply_translates_to_decision() {
        let (url, store) = spawn_store(StatusCode::OK, json!({ "result": 4 })).await;
        let limiter = limiter(url, 125_000);

        let decision = limiter.check("contact:1.2.3.4", 5, 60_000).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.limit, 5);
        assert_eq!(decision.remaining, 4);
        assert_eq!(decision.reset_at, 180_000);

        let seen = store.seen.lock();
        assert_eq!(seen.len(), 1);
        let (auth, body) = &seen[0];
        assert_eq!(auth.as_deref(), Some("Bearer secret"));
        assert_eq!(body[0], "EVAL");
        assert_eq!(body[2], "2");
        assert_eq!(body[3], "ratelimit:contact:1.2.3.4:2");
        assert_eq!(body[4], "ratelimit:contact:1.2.3.4:1");
        assert_eq!(body[5], "5");
        assert_eq!(body[6], "125000");
        assert_eq!(body[7], "60000");
    }

    #[tokio::test]
    async fn test_refused_reply_translates_to_denial() {
        let (url, _store) = spawn_store(StatusCode::OK, json!({ "result": -1 })).await;
        let limiter = limiter(url, 10_000);

        let decision = limiter.check("k", 5, 60_000).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert_eq!(decision.reset_at, 60_000);
    }

    #[tokio::test]
    async fn test_error_reply_is_an_error() {
        let (url, _store) = spawn_store(
            StatusCode::BAD_REQUEST,
            json!({ "error": "ERR wrong number of arguments" }),
        )
        .await;
        let limiter = limiter(url, 0);

        let err = limiter.check("k", 5, 60_000).await.unwrap_err();
        assert!(matches!(err, ThrottleError::Store(_)));
        assert!(err.is_backend());
    }

    #[tokio::test]
    async fn test_non_integer_result_is_an_error() {
        let (url, _store) = spawn_store(StatusCode::OK, json!({ "result": "OK" })).await;
        let limiter = limiter(url, 0);

        assert!(limiter.check("k", 5, 60_000).await.is_err());
    }

    #[tokio::test]
    async fn test_unreachable_store_is_an_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let limiter = limiter(format!("http://{}", addr), 0);
        let err = limiter.check("k", 5, 60_000).await.unwrap_err();
        assert!(err.is_backend());
    }
}
