//! Decision service routes.
//!
//! Lets processes that cannot embed the limiter ask for decisions over HTTP:
//! either with an explicit key and limit, or forward-auth style for a
//! configured action keyed by the caller's address.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{ConnectInfo, Path, Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use parking_lot::RwLock;
use serde::Deserialize;
use serde_json::json;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use super::client_ip::client_ip;
use super::guard::error_response;
use super::headers::{apply_rate_limit_headers, apply_retry_after};
use crate::ratelimit::{Decision, PolicySet, RateLimitKey, RateLimiter};

/// State shared by every route.
#[derive(Clone)]
pub struct AppState {
    /// The rate limiter instance
    pub limiter: Arc<RateLimiter>,
    /// Action policies, swapped in place on reload
    pub policies: Arc<RwLock<PolicySet>>,
}

impl AppState {
    pub fn new(limiter: Arc<RateLimiter>, policies: PolicySet) -> Self {
        Self {
            limiter,
            policies: Arc::new(RwLock::new(policies)),
        }
    }

    /// Replace the action policies.
    pub fn set_policies(&self, policies: PolicySet) {
        let count = policies.len();
        *self.policies.write() = policies;
        info!(actions = count, "Action policies updated");
    }

    /// Re-read `path` every `interval`, layering it over the built-in defaults.
    ///
    /// A file that fails to load leaves the current policies in place.
    pub fn spawn_policy_reloader(&self, path: PathBuf, interval: Duration) -> JoinHandle<()> {
        let state = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match PolicySet::from_file(&path) {
                    Ok(loaded) => {
                        let policies = PolicySet::default().merge(loaded);
                        if *state.policies.read() != policies {
                            state.set_policies(policies);
                        }
                    }
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Failed to reload action policies");
                    }
                }
            }
        })
    }
}

/// Body of `POST /v1/check`.
#[derive(Debug, Deserialize)]
pub struct CheckRequest {
    pub key: String,
    pub limit: u32,
    pub window_ms: u64,
}

/// Build the decision service router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health))
        .route("/v1/check", post(check))
        .route("/v1/actions/{action}", get(check_action).post(check_action))
        .with_state(state)
}

/// Render a decision as JSON with rate limit headers; 429 when refused.
fn decision_response(decision: &Decision, now_ms: u64) -> Response {
    let status = if decision.allowed {
        StatusCode::OK
    } else {
        StatusCode::TOO_MANY_REQUESTS
    };

    let mut response = (status, Json(decision)).into_response();
    apply_rate_limit_headers(response.headers_mut(), decision);
    if !decision.allowed {
        apply_retry_after(response.headers_mut(), decision, now_ms);
    }
    response
}

#[instrument(skip_all, fields(key = %request.key))]
async fn check(State(state): State<AppState>, Json(request): Json<CheckRequest>) -> Response {
    if request.key.trim().is_empty() {
        warn!("Received check request with empty key");
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "ok": false, "message": "key is required" })),
        )
            .into_response();
    }

    match state
        .limiter
        .check(&request.key, request.limit, request.window_ms)
        .await
    {
        Ok(decision) => decision_response(&decision, state.limiter.now_ms()),
        Err(e) => error_response(&e),
    }
}

#[instrument(skip(state, request))]
async fn check_action(
    State(state): State<AppState>,
    Path(action): Path<String>,
    request: Request,
) -> Response {
    let policy = state.policies.read().get(&action).copied();
    let Some(policy) = policy else {
        warn!(action = %action, "Check requested for unknown action");
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "ok": false, "message": format!("unknown action '{}'", action) })),
        )
            .into_response();
    };

    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let key = RateLimitKey::new(&action, client_ip(request.headers(), peer));

    match state.limiter.check_key(&key, &policy).await {
        Ok(decision) => decision_response(&decision, state.limiter.now_ms()),
        Err(e) => error_response(&e),
    }
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "backend": state.limiter.backend_kind(),
        "guarantee": state.limiter.backend_kind().guarantee(),
        "failure_policy": state.limiter.failure_policy(),
        "tracked_keys": state.limiter.tracked_keys(),
        "actions": state.policies.read().len(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}
