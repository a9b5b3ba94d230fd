//! Admission gate: fetch, refill, decide, persist.
//!
//! Same-key admissions inside one process queue on a striped lock, and a
//! caller that waits too long goes ahead without it;
//! admissions racing from other processes are caught by the store's
//! compare-and-swap and retried against fresh state. Together these keep the
//! number of admitted requests for a key within what its bucket allows.
//!
//! Store outages are handled by [`FailurePolicy`]. The default, `Open`,
//! lets traffic through while the store is unreachable: the protected
//! service stays available at the cost of not limiting anyone until the
//! store returns.

use crate::admission::classifier::RequestContext;
use crate::admission::store::{BucketStore, Snapshot, StoreError, StoredBucket};
use crate::api::metrics;
use serde::Serialize;
use std::collections::hash_map::DefaultHasher;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use turnstile_core::bucket::{self, Refill};
use turnstile_core::{config, Clock, Tier, TierLimits, TierTable, TokenBucket};

/// What to do when the bucket store cannot be read or written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum FailurePolicy {
    /// Admit; availability over strict limiting.
    #[default]
    Open,
    /// Deny; strict limiting over availability.
    Closed,
}

/// Why a request was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    /// The client's bucket is empty.
    RateLimited,
    /// The store failed and the policy is [`FailurePolicy::Closed`].
    StoreUnavailable,
    /// Concurrent writers kept winning the compare-and-swap.
    Contended,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenyReason::RateLimited => "rate_limited",
            DenyReason::StoreUnavailable => "store_unavailable",
            DenyReason::Contended => "contended",
        }
    }
}

/// Outcome of one admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow {
        limit: u32,
        /// Whole tokens left, unknown when the store was bypassed.
        remaining: Option<u32>,
    },
    Deny {
        limit: u32,
        retry_after_ms: u64,
        reason: DenyReason,
    },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow { .. })
    }

    pub fn outcome(&self) -> &'static str {
        match self {
            Decision::Allow { .. } => "allow",
            Decision::Deny { .. } => "deny",
        }
    }
}

/// Rejected gate settings.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("store timeout must be greater than zero")]
    ZeroStoreTimeout,
    #[error("max CAS attempts must be at least 1")]
    ZeroCasAttempts,
    #[error("lock stripes must be at least 1")]
    ZeroLockStripes,
}

/// Tuning for [`AdmissionGate`].
#[derive(Debug, Clone)]
pub struct GateConfig {
    pub tiers: TierTable,
    pub failure_policy: FailurePolicy,
    /// Bound on each store round trip and on waiting for a key's lock.
    pub store_timeout: Duration,
    pub max_cas_attempts: u32,
    pub lock_stripes: usize,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            tiers: TierTable::default(),
            failure_policy: FailurePolicy::Open,
            store_timeout: Duration::from_millis(config::DEFAULT_STORE_TIMEOUT_MS),
            max_cas_attempts: config::DEFAULT_MAX_CAS_ATTEMPTS,
            lock_stripes: config::DEFAULT_LOCK_STRIPES,
        }
    }
}

impl GateConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store_timeout.is_zero() {
            return Err(ConfigError::ZeroStoreTimeout);
        }
        if self.max_cas_attempts == 0 {
            return Err(ConfigError::ZeroCasAttempts);
        }
        if self.lock_stripes == 0 {
            return Err(ConfigError::ZeroLockStripes);
        }
        Ok(())
    }
}

/// A client's bucket as it would look now, without consuming a token.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BucketStatus {
    pub tier: Tier,
    pub capacity: u32,
    pub refill_window_ms: u64,
    pub tokens: f64,
    pub retry_after_ms: u64,
}

/// Per-request admission control in front of the business routes.
pub struct AdmissionGate {
    store: Arc<dyn BucketStore>,
    clock: Arc<dyn Clock>,
    config: GateConfig,
    stripes: Box<[Mutex<()>]>,
}

impl AdmissionGate {
    pub fn new(
        store: Arc<dyn BucketStore>,
        clock: Arc<dyn Clock>,
        config: GateConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let stripes = (0..config.lock_stripes).map(|_| Mutex::new(())).collect();
        Ok(Self {
            store,
            clock,
            config,
            stripes,
        })
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn BucketStore> {
        &self.store
    }

    /// Decide whether the request described by `ctx` may proceed.
    pub async fn admit(&self, ctx: &RequestContext) -> Decision {
        let limits = self.config.tiers.limits(ctx.tier);
        let decision = self.admit_inner(ctx, limits).await;
        metrics::record_decision(ctx.tier, &decision);
        match decision {
            Decision::Deny {
                retry_after_ms,
                reason,
                ..
            } => tracing::info!(
                client_key = %ctx.client_key,
                tier = %ctx.tier,
                retry_after_ms,
                reason = reason.as_str(),
                "request denied"
            ),
            Decision::Allow { remaining, .. } => tracing::debug!(
                client_key = %ctx.client_key,
                tier = %ctx.tier,
                remaining = ?remaining,
                "request admitted"
            ),
        }
        decision
    }

    async fn admit_inner(&self, ctx: &RequestContext, limits: TierLimits) -> Decision {
        // The lock only cuts down CAS conflicts; the CAS loop alone never over-admits.
        let stripe = self.stripe(&ctx.client_key);
        let _guard = match tokio::time::timeout(self.config.store_timeout, stripe.lock()).await {
            Ok(guard) => Some(guard),
            Err(_) => {
                metrics::record_lock_timeout();
                tracing::debug!(
                    client_key = %ctx.client_key,
                    "key lock busy, continuing without it"
                );
                None
            }
        };

        for attempt in 1..=self.config.max_cas_attempts {
            let snapshot = match self.bounded(self.store.get(&ctx.client_key)).await {
                Ok(snapshot) => snapshot,
                Err(err) => return self.on_store_error("get", ctx, limits, err, None),
            };
            let now = self.clock.now_ms();
            let prior = self.prior_bucket(ctx, &snapshot, limits, now);
            let step = bucket::refill_and_consume(&prior, limits, now);

            let written = self.bounded(self.store.compare_and_swap(
                &ctx.client_key,
                snapshot.revision,
                &step.bucket,
            ));
            match written.await {
                Ok(true) => return settle(limits, &step),
                Ok(false) => {
                    metrics::record_cas_conflict();
                    tracing::debug!(
                        client_key = %ctx.client_key,
                        attempt,
                        "bucket changed concurrently, retrying"
                    );
                }
                Err(err) => return self.on_store_error("put", ctx, limits, err, Some(&step)),
            }
        }

        tracing::warn!(
            client_key = %ctx.client_key,
            attempts = self.config.max_cas_attempts,
            "gave up after repeated compare-and-swap conflicts"
        );
        Decision::Deny {
            limit: limits.capacity(),
            retry_after_ms: bucket::retry_after_ms(0.0, limits),
            reason: DenyReason::Contended,
        }
    }

    /// The caller's bucket refilled to now, without writing anything.
    pub async fn status(&self, ctx: &RequestContext) -> Result<BucketStatus, StoreError> {
        let limits = self.config.tiers.limits(ctx.tier);
        let snapshot = self.bounded(self.store.get(&ctx.client_key)).await?;
        let now = self.clock.now_ms();
        let prior = self.prior_bucket(ctx, &snapshot, limits, now);
        let seen = bucket::peek(&prior, limits, now);
        Ok(BucketStatus {
            tier: ctx.tier,
            capacity: limits.capacity(),
            refill_window_ms: limits.refill_window_ms(),
            tokens: seen.tokens,
            retry_after_ms: bucket::retry_after_ms(seen.tokens, limits),
        })
    }

    fn prior_bucket(
        &self,
        ctx: &RequestContext,
        snapshot: &Snapshot,
        limits: TierLimits,
        now: u64,
    ) -> TokenBucket {
        match snapshot.stored {
            StoredBucket::Present(bucket) => bucket,
            StoredBucket::Absent => TokenBucket::full(limits, now),
            StoredBucket::Malformed => {
                metrics::record_malformed_bucket();
                tracing::warn!(
                    client_key = %ctx.client_key,
                    revision = snapshot.revision,
                    "discarding malformed bucket state, reinitializing at full capacity"
                );
                TokenBucket::full(limits, now)
            }
        }
    }

    fn on_store_error(
        &self,
        op: &'static str,
        ctx: &RequestContext,
        limits: TierLimits,
        err: StoreError,
        step: Option<&Refill>,
    ) -> Decision {
        metrics::record_store_error(op, &err);
        match self.config.failure_policy {
            FailurePolicy::Open => {
                tracing::warn!(
                    client_key = %ctx.client_key,
                    op,
                    error = %err,
                    "bucket store failure, failing open"
                );
                match step {
                    Some(step) => settle(limits, step),
                    None => Decision::Allow {
                        limit: limits.capacity(),
                        remaining: None,
                    },
                }
            }
            FailurePolicy::Closed => {
                tracing::warn!(
                    client_key = %ctx.client_key,
                    op,
                    error = %err,
                    "bucket store failure, failing closed"
                );
                Decision::Deny {
                    limit: limits.capacity(),
                    retry_after_ms: bucket::retry_after_ms(0.0, limits),
                    reason: DenyReason::StoreUnavailable,
                }
            }
        }
    }

    async fn bounded<T>(
        &self,
        call: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        match tokio::time::timeout(self.config.store_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.timeout_ms())),
        }
    }

    fn timeout_ms(&self) -> u64 {
        self.config.store_timeout.as_millis() as u64
    }

    fn stripe(&self, key: &str) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.stripes[(hasher.finish() % self.stripes.len() as u64) as usize]
    }
}

/// Turn an engine step into a decision.
fn settle(limits: TierLimits, step: &Refill) -> Decision {
    if step.allowed {
        Decision::Allow {
            limit: limits.capacity(),
            remaining: Some(step.bucket.tokens.floor() as u32),
        }
    } else {
        Decision::Deny {
            limit: limits.capacity(),
            retry_after_ms: step.retry_after_ms(limits),
            reason: DenyReason::RateLimited,
        }
    }
}
