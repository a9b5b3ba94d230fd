//! Token bucket engine.
//!
//! A bucket holds a capped, continuously refilled balance of admission
//! credits. Every function here is pure: the caller supplies the prior state,
//! the tier limits, and the current time, and gets the next state back.
//! Persisting that state is the caller's business.

use crate::tier::TierLimits;
use serde::{Deserialize, Serialize};

/// One client's consumption budget as persisted in the bucket store.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TokenBucket {
    /// Available admission credits, `0 <= tokens <= capacity`.
    pub tokens: f64,
    /// Wall time of the last refill, in milliseconds since the Unix epoch.
    pub last_refill_ms: u64,
}

impl TokenBucket {
    /// A bucket at full capacity, as seen by the first request for a key.
    pub fn full(limits: TierLimits, now_ms: u64) -> Self {
        Self {
            tokens: limits.capacity() as f64,
            last_refill_ms: now_ms,
        }
    }

    /// Whether this state could have been written by the engine.
    ///
    /// Records failing this check are treated as corrupt and reinitialized.
    pub fn is_well_formed(&self) -> bool {
        self.tokens.is_finite() && self.tokens >= 0.0
    }
}

/// Result of one [`refill_and_consume`] step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Refill {
    /// State to write back.
    pub bucket: TokenBucket,
    /// Whether one token was consumed.
    pub allowed: bool,
    /// Balance after refill and before consumption.
    pub refilled: f64,
}

impl Refill {
    /// Advisory wait before a denied client should retry, 0 when allowed.
    pub fn retry_after_ms(&self, limits: TierLimits) -> u64 {
        if self.allowed {
            0
        } else {
            retry_after_ms(self.refilled, limits)
        }
    }
}

/// Balance and timestamp after refilling `bucket` up to `now_ms`.
///
/// A clock that moved backwards yields zero elapsed time, and the returned
/// timestamp never precedes the stored one.
fn refill(bucket: &TokenBucket, limits: TierLimits, now_ms: u64) -> (f64, u64) {
    let elapsed_ms = now_ms.saturating_sub(bucket.last_refill_ms);
    let capacity = limits.capacity() as f64;
    let refilled = (bucket.tokens.max(0.0) + limits.tokens_for(elapsed_ms)).min(capacity);
    (refilled, now_ms.max(bucket.last_refill_ms))
}

/// Refill `bucket` for the time elapsed since its last refill, then try to
/// consume one token.
///
/// A denial leaves the refilled balance untouched.
pub fn refill_and_consume(bucket: &TokenBucket, limits: TierLimits, now_ms: u64) -> Refill {
    let (refilled, stamp) = refill(bucket, limits, now_ms);
    let allowed = refilled >= 1.0;
    let tokens = if allowed { refilled - 1.0 } else { refilled };
    Refill {
        bucket: TokenBucket {
            tokens,
            last_refill_ms: stamp,
        },
        allowed,
        refilled,
    }
}

/// The bucket as it would look at `now_ms`, without consuming anything.
pub fn peek(bucket: &TokenBucket, limits: TierLimits, now_ms: u64) -> TokenBucket {
    let (tokens, last_refill_ms) = refill(bucket, limits, now_ms);
    TokenBucket {
        tokens,
        last_refill_ms,
    }
}

/// Milliseconds until a bucket holding `refilled` tokens regains a whole one.
pub fn retry_after_ms(refilled: f64, limits: TierLimits) -> u64 {
    let deficit = 1.0 - refilled;
    if deficit <= 0.0 {
        return 0;
    }
    (limits.ms_for(deficit).ceil() as u64).max(1)
}
