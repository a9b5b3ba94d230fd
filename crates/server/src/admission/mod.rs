//! Request admission control.
//!
//! Every inbound request is classified (client key + tier), checked against
//! that client's token bucket in the shared store, and either admitted or
//! denied before any business logic runs.
//!
//! ```text
//! request → IdentityClassifier → AdmissionGate ─┬→ BucketStore (get / CAS)
//!                                               └→ token bucket engine (pure)
//! ```

/// Bearer credential verification (JWT, static API keys).
pub mod auth;
/// Client key and tier derivation.
pub mod classifier;
/// Fetch/refill/persist orchestration and failure policy.
pub mod gate;
/// Redis-backed bucket store.
pub mod redis_store;
/// Bucket store trait and in-memory store.
pub mod store;

pub use auth::{ApiKeyAuthenticator, AuthError, Authenticator, JwtAuthenticator, NoAuthenticator};
pub use classifier::{Classification, IdentityClassifier, RequestContext};
pub use gate::{AdmissionGate, Decision, DenyReason, FailurePolicy, GateConfig};
pub use redis_store::{RedisStore, RedisStoreConfig};
pub use store::{BucketStore, MemoryStore, Snapshot, StoreError, StoredBucket};
