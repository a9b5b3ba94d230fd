//! HTTP request handlers and shared application state.

use crate::admission::classifier::RequestContext;
use crate::admission::gate::{AdmissionGate, FailurePolicy};
use crate::admission::IdentityClassifier;
use crate::api::errors::ApiError;
use crate::api::models::*;
use axum::extract::State;
use axum::http::{StatusCode, Uri};
use axum::{Extension, Json};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use std::time::Instant;

/// Shared application state passed to every handler via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    pub gate: Arc<AdmissionGate>,
    pub classifier: IdentityClassifier,
    pub prometheus_handle: PrometheusHandle,
    pub start_time: Instant,
}

/// `GET /health`
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let store_reachable = tokio::time::timeout(
        state.gate.config().store_timeout,
        state.gate.store().ping(),
    )
    .await
    .map(|r| r.is_ok())
    .unwrap_or(false);

    // Failing open keeps the service usable without the store, so that only degrades it.
    let (status_code, status) = match (store_reachable, state.gate.config().failure_policy) {
        (true, _) => (StatusCode::OK, "ok"),
        (false, FailurePolicy::Open) => (StatusCode::OK, "degraded"),
        (false, FailurePolicy::Closed) => (StatusCode::SERVICE_UNAVAILABLE, "unavailable"),
    };
    let policy = match state.gate.config().failure_policy {
        FailurePolicy::Open => "open",
        FailurePolicy::Closed => "closed",
    };

    (
        status_code,
        Json(HealthResponse {
            status: status.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: state.start_time.elapsed().as_secs(),
            store_reachable,
            failure_policy: policy.to_string(),
        }),
    )
}

/// `GET /metrics`
pub async fn metrics_endpoint(State(state): State<AppState>) -> String {
    state.prometheus_handle.render()
}

/// `GET /ratelimit`
///
/// Reports the caller's bucket after this request was admitted.
pub async fn rate_limit_status(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
) -> Result<Json<RateLimitStatusResponse>, ApiError> {
    let status = state.gate.status(&ctx).await.map_err(|e| {
        tracing::warn!(client_key = %ctx.client_key, error = %e, "bucket status unavailable");
        ApiError::ServiceUnavailable("Rate limit state unavailable".into())
    })?;
    Ok(Json(RateLimitStatusResponse {
        client_key: ctx.client_key,
        tier: status.tier,
        capacity: status.capacity,
        refill_window_ms: status.refill_window_ms,
        tokens: status.tokens,
        remaining: status.tokens.floor() as u32,
        retry_after_ms: status.retry_after_ms,
    }))
}

/// Fallback for unmatched routes.
pub async fn not_found(uri: Uri) -> ApiError {
    ApiError::NotFound(format!("Requested resource {} does not exist", uri.path()))
}
