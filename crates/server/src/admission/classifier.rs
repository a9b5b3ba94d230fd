//! Identity classification: who is asking, and at which tier.

use crate::admission::auth::{AuthError, Authenticator};
use axum::extract::ConnectInfo;
use axum::http::{header, HeaderMap, Request};
use std::net::SocketAddr;
use std::sync::Arc;
use turnstile_core::Tier;

/// Client key used when a request carries no usable address.
pub const UNKNOWN_CLIENT: &str = "unknown";

/// Per-request classification, passed by value through the admission path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    /// Stable per-client identifier; never empty.
    pub client_key: String,
    pub tier: Tier,
}

/// Classification result plus the reason a request ended up anonymous.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub context: RequestContext,
    /// `None` for authenticated requests.
    pub anonymous_cause: Option<AuthError>,
}

/// Derives a [`RequestContext`] from an inbound request.
#[derive(Clone)]
pub struct IdentityClassifier {
    authenticator: Arc<dyn Authenticator>,
    trust_forwarded_headers: bool,
}

impl IdentityClassifier {
    /// `trust_forwarded_headers` should only be enabled behind a proxy that
    /// overwrites `X-Forwarded-For`; otherwise clients can pick their own key.
    pub fn new(authenticator: Arc<dyn Authenticator>, trust_forwarded_headers: bool) -> Self {
        Self {
            authenticator,
            trust_forwarded_headers,
        }
    }

    /// Classify `req`. Never fails: any credential problem means anonymous.
    pub fn classify<B>(&self, req: &Request<B>) -> Classification {
        let client_key = self.client_key(req);
        let verdict = bearer_token(req.headers()).and_then(|t| self.authenticator.verify(t));
        let (tier, anonymous_cause) = match verdict {
            Ok(principal) => {
                tracing::debug!(
                    client_key = %client_key,
                    subject = %principal.subject,
                    "classified as authenticated"
                );
                (Tier::Authenticated, None)
            }
            Err(cause) => (Tier::Anonymous, Some(cause)),
        };
        Classification {
            context: RequestContext { client_key, tier },
            anonymous_cause,
        }
    }

    fn client_key<B>(&self, req: &Request<B>) -> String {
        if self.trust_forwarded_headers {
            if let Some(ip) = forwarded_client_ip(req.headers()) {
                return ip;
            }
        }
        req.extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string())
            .unwrap_or_else(|| UNKNOWN_CLIENT.to_string())
    }
}

/// Extract the credential from `Authorization: Bearer <token>`.
fn bearer_token(headers: &HeaderMap) -> Result<&str, AuthError> {
    let value = headers
        .get(header::AUTHORIZATION)
        .ok_or(AuthError::Missing)?
        .to_str()
        .map_err(|_| AuthError::Malformed)?;
    match value.strip_prefix("Bearer ") {
        Some(token) if !token.trim().is_empty() => Ok(token.trim()),
        _ => Err(AuthError::Malformed),
    }
}

/// Client IP from proxy headers (X-Forwarded-For → X-Real-IP).
fn forwarded_client_ip(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .or_else(|| {
            headers
                .get("x-real-ip")
                .and_then(|v| v.to_str().ok())
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        })
}
