// SPDX-FileCopyrightText: 2025 Hyperpolymath
// SPDX-License-Identifier: PMPL-1.0-or-later

//! HTTP handlers for the admission-control service.
//!
//! The service runs as an external check: the host application or a
//! fronting proxy asks `/check` before performing a protected write and
//! reports the result to `/outcome` afterwards.

use crate::config::Config;
use crate::error::AdmissionError;
use crate::key::RequestContext;
use crate::limiter::AdmissionDecision;
use crate::metrics::AdmissionMetrics;
use crate::middleware::{
    write_decision_headers, PolicySet, RateGuard, X_RATELIMIT_LIMIT, X_RATELIMIT_REMAINING,
    X_RATELIMIT_RESET,
};
use axum::{
    extract::{Path, State},
    http::{header, HeaderValue, Method},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::debug;

/// Shared application state.
pub struct AppState {
    pub guard: RateGuard,
    pub policies: PolicySet,
    pub metrics: Option<Arc<AdmissionMetrics>>,
    pub config: Config,
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub version: &'static str,
}

/// Admission check request.
#[derive(Debug, Deserialize)]
pub struct CheckRequest {
    pub policy: String,
    #[serde(default)]
    pub identity: Option<String>,
    #[serde(default)]
    pub ip: Option<String>,
}

/// Admission check response.
#[derive(Debug, Serialize)]
pub struct CheckResponse {
    /// Counter key to quote back on `/outcome`
    pub key: String,
    #[serde(flatten)]
    pub decision: AdmissionDecision,
}

/// Outcome report for a previously admitted request.
#[derive(Debug, Deserialize)]
pub struct OutcomeRequest {
    pub policy: String,
    pub key: String,
    pub success: bool,
}

/// Outcome report response.
#[derive(Debug, Serialize)]
pub struct OutcomeResponse {
    pub refunded: bool,
}

/// Build the service router.
pub fn router(state: Arc<AppState>) -> Router {
    let mut router = Router::new()
        .route("/health", get(health))
        .route("/healthz", get(health))
        .route("/check", post(check))
        .route("/outcome", post(outcome))
        .route("/status/:policy/:key", get(status));

    if state.config.metrics.enabled {
        router = router.route(&state.config.metrics.path, get(metrics));
    }

    let layers = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(&state.config));
    router.layer(layers).with_state(state)
}

/// Restrictive CORS: configured origins only, rate limit headers exposed.
fn cors_layer(config: &Config) -> CorsLayer {
    let origins: Vec<HeaderValue> = config
        .cors
        .allowed_origins
        .iter()
        .filter_map(|o| o.parse().ok())
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .expose_headers([
            X_RATELIMIT_LIMIT,
            X_RATELIMIT_REMAINING,
            X_RATELIMIT_RESET,
            header::RETRY_AFTER,
        ])
}

/// Health check endpoint.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        service: "admission-control",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Check and consume quota for a protected operation.
pub async fn check(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CheckRequest>,
) -> Result<Response, AdmissionError> {
    let guarded = state.policies.get(&req.policy)?;
    let origin = match req.ip.as_deref() {
        Some(raw) => Some(
            raw.parse::<IpAddr>()
                .map_err(|_| AdmissionError::InvalidRequest(format!("invalid IP address: {}", raw)))?,
        ),
        None => None,
    };
    let ctx = RequestContext {
        identity: req.identity.filter(|id| !id.trim().is_empty()),
        origin,
    };

    debug!(policy = %req.policy, identity = ?ctx.identity, origin = ?ctx.origin, "Processing admission check");

    // The outcome arrives later through /outcome, keyed by the returned key.
    let permit = state.guard.guard(&ctx, &guarded).await?;
    let body = CheckResponse {
        key: permit.key().to_string(),
        decision: permit.decision().clone(),
    };

    let mut response = Json(body).into_response();
    permit.apply_headers(response.headers_mut());
    Ok(response)
}

/// Apply conditional accounting for an admitted request.
pub async fn outcome(
    State(state): State<Arc<AppState>>,
    Json(req): Json<OutcomeRequest>,
) -> Result<Json<OutcomeResponse>, AdmissionError> {
    let guarded = state.policies.get(&req.policy)?;
    let refunded = state
        .guard
        .limiter()
        .record_outcome(&req.key, &guarded.policy, req.success)
        .await;
    Ok(Json(OutcomeResponse { refunded }))
}

/// Quota status for a key, without consuming any.
pub async fn status(
    State(state): State<Arc<AppState>>,
    Path((policy, key)): Path<(String, String)>,
) -> Result<Response, AdmissionError> {
    let guarded = state.policies.get(&policy)?;
    let limiter = state.guard.limiter();
    let now = limiter.store().clock().now();
    let decision = limiter.status(&key, &guarded.policy, now).await;

    let mut headers = axum::http::HeaderMap::new();
    write_decision_headers(&mut headers, &decision);
    Ok((headers, Json(CheckResponse { key, decision })).into_response())
}

/// Prometheus metrics endpoint.
pub async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    let Some(metrics) = &state.metrics else {
        return axum::http::StatusCode::NOT_FOUND.into_response();
    };
    metrics.set_counter_entries(state.guard.limiter().store().len().await);
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics.render(),
    )
        .into_response()
}
