//! Global configuration constants for turnstile.
//!
//! Tier limits, store defaults, and server defaults are defined here.
//! These are compile-time constants; runtime configuration is handled via CLI
//! arguments and environment variables in the server's `main.rs`.

/// Burst capacity of the anonymous tier, in requests.
pub const ANONYMOUS_CAPACITY: u32 = 10;

/// Burst capacity of the authenticated tier, in requests.
pub const AUTHENTICATED_CAPACITY: u32 = 30;

/// Time for an empty bucket to refill to full capacity, shared by both tiers.
///
/// A tier with capacity `c` refills at `c / REFILL_WINDOW_MS` tokens per millisecond.
pub const REFILL_WINDOW_MS: u64 = 60_000;

/// Default HTTP server port.
pub const DEFAULT_PORT: u16 = 8000;

/// Default Redis host.
pub const DEFAULT_REDIS_HOST: &str = "localhost";

/// Default Redis port.
pub const DEFAULT_REDIS_PORT: u16 = 6379;

/// Prefix prepended to every client key before it reaches the store.
pub const DEFAULT_KEY_PREFIX: &str = "turnstile:";

/// Upper bound on a single store round trip (or lock wait) in milliseconds.
///
/// When exceeded, the gate applies its failure policy.
pub const DEFAULT_STORE_TIMEOUT_MS: u64 = 250;

/// Maximum fetch/compute/compare-and-swap cycles per admission before giving up.
pub const DEFAULT_MAX_CAS_ATTEMPTS: u32 = 16;

/// Number of in-process lock stripes used to serialize same-key admissions.
pub const DEFAULT_LOCK_STRIPES: usize = 256;

/// Per-request timeout in seconds.
pub const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Maximum number of concurrent in-flight requests.
pub const MAX_CONCURRENT_REQUESTS: usize = 512;

/// Maximum HTTP request body size in bytes (1 MB).
pub const MAX_REQUEST_BODY_BYTES: usize = 1024 * 1024;

/// Default graceful shutdown timeout in seconds.
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;

/// Lifetime of tokens minted by the JWT authenticator.
pub const AUTH_TOKEN_TTL_SECS: u64 = 24 * 60 * 60;
