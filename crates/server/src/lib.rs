//! turnstile-server: HTTP admission controller.
//!
//! Throttles inbound requests per client with token buckets kept in a
//! store shared by every instance of the service. Bucket arithmetic lives in
//! `turnstile-core`.

/// Request admission: classification, bucket stores, and the gate.
pub mod admission;
/// REST API layer: Axum router, middleware, handlers, metrics.
pub mod api;
