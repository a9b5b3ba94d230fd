//! Response data transfer objects for the REST API.

use serde::Serialize;
use turnstile_core::Tier;

/// Response body for `GET /health`.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub store_reachable: bool,
    pub failure_policy: String,
}

/// Response body for `GET /ratelimit`.
#[derive(Debug, Serialize)]
pub struct RateLimitStatusResponse {
    pub client_key: String,
    pub tier: Tier,
    pub capacity: u32,
    pub refill_window_ms: u64,
    /// Tokens available right now, fractional.
    pub tokens: f64,
    /// Whole requests that would be admitted right now.
    pub remaining: u32,
    /// 0 when at least one token is available.
    pub retry_after_ms: u64,
}
