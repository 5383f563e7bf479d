//! Middleware that throttles a mutating route.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use axum::{middleware, routing::post, Router};
//! use throttle::http::guard::{enforce, Guard};
//! use throttle::ratelimit::{ActionPolicy, RateLimiter};
//!
//! # fn build() -> throttle::error::Result<Router> {
//! let limiter = Arc::new(RateLimiter::new());
//! let guard = Guard::new(limiter, "contact", ActionPolicy::new(5, 60_000)?)?;
//!
//! let app = Router::new().route(
//!     "/api/contact",
//!     post(|| async { "sent" }).route_layer(middleware::from_fn_with_state(guard, enforce)),
//! );
//! # Ok(app)
//! # }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::{debug, error};

use super::client_ip::client_ip;
use super::headers::{apply_rate_limit_headers, apply_retry_after};
use crate::error::{Result, ThrottleError};
use crate::ratelimit::{validate_action, ActionPolicy, Decision, RateLimitKey, RateLimiter};

/// Message sent with every 429.
pub const TOO_MANY_REQUESTS_MESSAGE: &str = "Too many requests. Try again later.";

/// The limiter, action name and policy guarding one route.
#[derive(Clone)]
pub struct Guard {
    limiter: Arc<RateLimiter>,
    action: Arc<str>,
    policy: ActionPolicy,
}

impl Guard {
    /// Create a guard, rejecting unusable action names and policies.
    pub fn new(limiter: Arc<RateLimiter>, action: &str, policy: ActionPolicy) -> Result<Self> {
        validate_action(action)?;
        policy.validate()?;

        Ok(Self {
            limiter,
            action: Arc::from(action),
            policy,
        })
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    pub fn policy(&self) -> &ActionPolicy {
        &self.policy
    }
}

/// Throttle the wrapped handler by `<action>:<client ip>`.
///
/// Refused calls get a 429 and never reach the handler. Admitted calls run
/// the handler and carry the `RateLimit-*` headers on its response.
pub async fn enforce(State(guard): State<Guard>, request: Request, next: Next) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let key = RateLimitKey::new(guard.action(), client_ip(request.headers(), peer));

    let decision = match guard.limiter.check_key(&key, &guard.policy).await {
        Ok(decision) => decision,
        Err(e) => {
            error!(key = %key, error = %e, "Rate limit check failed");
            return error_response(&e);
        }
    };

    if !decision.allowed {
        debug!(key = %key, reset_at = decision.reset_at, "Refusing throttled request");
        return too_many_requests(&decision, guard.limiter.now_ms());
    }

    let mut response = next.run(request).await;
    apply_rate_limit_headers(response.headers_mut(), &decision);
    response
}

/// A 429 carrying retry guidance.
pub fn too_many_requests(decision: &Decision, now_ms: u64) -> Response {
    let mut response = (
        StatusCode::TOO_MANY_REQUESTS,
        Json(json!({ "ok": false, "message": TOO_MANY_REQUESTS_MESSAGE })),
    )
        .into_response();
    apply_rate_limit_headers(response.headers_mut(), decision);
    apply_retry_after(response.headers_mut(), decision, now_ms);
    response
}

/// Map a limiter error onto an HTTP response.
pub fn error_response(err: &ThrottleError) -> Response {
    let status = match err {
        ThrottleError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "ok": false, "message": err.to_string() }))).into_response()
}
