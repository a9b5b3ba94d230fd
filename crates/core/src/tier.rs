//! Client tiers and their immutable limits.

use crate::config;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Classification of a client, selected per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// No credential, or a credential the authenticator rejected.
    Anonymous,
    /// A credential the authenticator accepted as currently valid.
    Authenticated,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Anonymous => "anonymous",
            Tier::Authenticated => "authenticated",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejected tier parameters.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TierError {
    #[error("tier capacity must be at least 1")]
    ZeroCapacity,
    #[error("tier refill window must be at least 1 ms")]
    ZeroWindow,
}

/// Capacity and refill window of one tier.
///
/// The refill rate is `capacity / refill_window_ms` tokens per millisecond.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierLimits {
    capacity: u32,
    refill_window_ms: u64,
}

impl TierLimits {
    pub fn new(capacity: u32, refill_window_ms: u64) -> Result<Self, TierError> {
        if capacity == 0 {
            return Err(TierError::ZeroCapacity);
        }
        if refill_window_ms == 0 {
            return Err(TierError::ZeroWindow);
        }
        Ok(Self {
            capacity,
            refill_window_ms,
        })
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn refill_window_ms(&self) -> u64 {
        self.refill_window_ms
    }

    /// Tokens regained over `elapsed_ms`, uncapped.
    pub fn tokens_for(&self, elapsed_ms: u64) -> f64 {
        // Multiply before dividing so whole fractions of the window come out exact.
        elapsed_ms as f64 * self.capacity as f64 / self.refill_window_ms as f64
    }

    /// Milliseconds needed to regain `tokens`.
    pub fn ms_for(&self, tokens: f64) -> f64 {
        tokens * self.refill_window_ms as f64 / self.capacity as f64
    }
}

/// Immutable lookup from [`Tier`] to its limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierTable {
    pub anonymous: TierLimits,
    pub authenticated: TierLimits,
}

impl TierTable {
    pub fn new(anonymous: TierLimits, authenticated: TierLimits) -> Self {
        Self {
            anonymous,
            authenticated,
        }
    }

    pub fn limits(&self, tier: Tier) -> TierLimits {
        match tier {
            Tier::Anonymous => self.anonymous,
            Tier::Authenticated => self.authenticated,
        }
    }
}

impl Default for TierTable {
    fn default() -> Self {
        Self {
            anonymous: TierLimits {
                capacity: config::ANONYMOUS_CAPACITY,
                refill_window_ms: config::REFILL_WINDOW_MS,
            },
            authenticated: TierLimits {
                capacity: config::AUTHENTICATED_CAPACITY,
                refill_window_ms: config::REFILL_WINDOW_MS,
            },
        }
    }
}
