//! Prometheus metrics recording.

use crate::admission::gate::Decision;
use crate::admission::store::StoreError;
use metrics::counter;
use metrics::histogram;
use std::time::Duration;
use turnstile_core::Tier;

/// Records HTTP request metrics.
pub fn record_request(method: &str, path: &str, status: u16, duration: Duration) {
    let labels = [
        ("method", method.to_string()),
        ("path", path.to_string()),
        ("status", status.to_string()),
    ];
    counter!("http_requests_total", &labels).increment(1);
    histogram!("http_request_duration_seconds", &labels).record(duration.as_secs_f64());
}

/// Records the outcome of one admission check.
pub fn record_decision(tier: Tier, decision: &Decision) {
    let reason = match decision {
        Decision::Allow { .. } => "ok",
        Decision::Deny { reason, .. } => reason.as_str(),
    };
    counter!(
        "turnstile_decisions_total",
        "tier" => tier.as_str(),
        "outcome" => decision.outcome(),
        "reason" => reason
    )
    .increment(1);
}

/// Records a failed or timed-out store call.
pub fn record_store_error(op: &'static str, err: &StoreError) {
    counter!(
        "turnstile_store_errors_total",
        "op" => op,
        "kind" => err.kind()
    )
    .increment(1);
}

/// Records a lost compare-and-swap race.
pub fn record_cas_conflict() {
    counter!("turnstile_cas_conflicts_total").increment(1);
}

/// Records an admission that gave up waiting for its key lock.
pub fn record_lock_timeout() {
    counter!("turnstile_lock_timeouts_total").increment(1);
}

/// Records a corrupt bucket record read back from the store.
pub fn record_malformed_bucket() {
    counter!("turnstile_malformed_buckets_total").increment(1);
}

/// Records why a request was classified as anonymous.
pub fn record_anonymous(cause: &'static str) {
    counter!("turnstile_anonymous_total", "cause" => cause).increment(1);
}
