//! API error types mapped to HTTP status codes.
//!
//! Each [`ApiError`] variant maps to a specific HTTP status code and produces
//! a JSON response body `{"error": "message"}`.

use crate::admission::gate::DenyReason;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// Message returned with every admission denial.
pub const TOO_MANY_REQUESTS_MESSAGE: &str = "Too many requests per minute.  Please wait a bit...";

/// Application-level error type that implements `IntoResponse`.
///
/// Each variant maps to an HTTP status code:
/// - `NotFound` → 404
/// - `TooManyRequests` → 429 (with `Retry-After` header)
/// - `ServiceUnavailable` → 503
#[derive(Debug)]
pub enum ApiError {
    /// No route matched (404).
    NotFound(String),
    /// Admission denied (429).
    TooManyRequests {
        reason: DenyReason,
        retry_after_ms: u64,
    },
    /// A dependency is down (503).
    ServiceUnavailable(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::TooManyRequests {
                reason,
                retry_after_ms,
            } => {
                let body = axum::Json(json!({
                    "error": TOO_MANY_REQUESTS_MESSAGE,
                    "reason": reason.as_str(),
                    "retry_after_ms": retry_after_ms,
                }));
                let mut resp = (StatusCode::TOO_MANY_REQUESTS, body).into_response();
                resp.headers_mut().insert(
                    header::RETRY_AFTER,
                    HeaderValue::from(retry_after_secs(retry_after_ms)),
                );
                resp
            }
            ApiError::NotFound(msg) => {
                (StatusCode::NOT_FOUND, axum::Json(json!({ "error": msg }))).into_response()
            }
            ApiError::ServiceUnavailable(msg) => (
                StatusCode::SERVICE_UNAVAILABLE,
                axum::Json(json!({ "error": msg })),
            )
                .into_response(),
        }
    }
}

/// `Retry-After` takes whole seconds; round up so clients never retry early.
fn retry_after_secs(ms: u64) -> u64 {
    ms.div_ceil(1000).max(1)
}
