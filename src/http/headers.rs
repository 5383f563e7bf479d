//! Rate limit response headers.

use axum::http::header::RETRY_AFTER;
use axum::http::{HeaderMap, HeaderName, HeaderValue};

use crate::ratelimit::Decision;

pub const RATELIMIT_LIMIT: HeaderName = HeaderName::from_static("ratelimit-limit");
pub const RATELIMIT_REMAINING: HeaderName = HeaderName::from_static("ratelimit-remaining");
pub const RATELIMIT_RESET: HeaderName = HeaderName::from_static("ratelimit-reset");

/// Write `RateLimit-Limit`, `RateLimit-Remaining` and `RateLimit-Reset`.
///
/// The reset is sent as epoch seconds.
pub fn apply_rate_limit_headers(headers: &mut HeaderMap, decision: &Decision) {
    headers.insert(RATELIMIT_LIMIT, HeaderValue::from(decision.limit));
    headers.insert(RATELIMIT_REMAINING, HeaderValue::from(decision.remaining));
    headers.insert(RATELIMIT_RESET, HeaderValue::from(decision.reset_epoch_secs()));
}

/// Write `Retry-After` in whole seconds, never below one.
pub fn apply_retry_after(headers: &mut HeaderMap, decision: &Decision, now_ms: u64) {
    headers.insert(RETRY_AFTER, HeaderValue::from(decision.retry_after_secs(now_ms)));
}
