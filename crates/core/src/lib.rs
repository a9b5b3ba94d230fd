//! # turnstile-core
//!
//! Building blocks of the turnstile admission controller: the token bucket
//! engine, client tiers, and clock sources.
//!
//! This is the synchronous core crate with zero async or network
//! dependencies. The HTTP service, bucket stores, and admission gate live in
//! `turnstile-server`.

/// Token bucket state and the pure refill-and-consume engine.
pub mod bucket;
/// Wall-clock sources: system time and a manual clock for tests.
pub mod clock;
/// Global configuration constants: tier defaults, timeouts, and server defaults.
pub mod config;
/// Client tiers and their immutable capacity/refill limits.
pub mod tier;

pub use bucket::{refill_and_consume, Refill, TokenBucket};
pub use clock::{Clock, ManualClock, SystemClock};
pub use tier::{Tier, TierLimits, TierTable};
