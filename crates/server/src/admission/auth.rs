//! Credential verification used to pick a client's tier.
//!
//! The admission controller only needs a yes/no verdict on a bearer
//! credential. [`JwtAuthenticator`] accepts the HS256 tokens the rest of the
//! API issues at login; [`ApiKeyAuthenticator`] accepts a static key list.

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use thiserror::Error;
use turnstile_core::{config, Clock, SystemClock};

/// Why a request was not authenticated.
///
/// None of these are failures of the request; they only explain why it was
/// classified as anonymous.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum AuthError {
    #[error("no bearer credential")]
    Missing,
    #[error("malformed credential")]
    Malformed,
    #[error("credential expired")]
    Expired,
    #[error("credential rejected")]
    Invalid,
}

impl AuthError {
    /// Short label for logs and metrics.
    pub fn cause(&self) -> &'static str {
        match self {
            AuthError::Missing => "missing",
            AuthError::Malformed => "malformed",
            AuthError::Expired => "expired",
            AuthError::Invalid => "invalid",
        }
    }
}

/// The identity behind an accepted credential.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub subject: String,
}

/// Verifies bearer credentials.
pub trait Authenticator: Send + Sync {
    fn verify(&self, token: &str) -> Result<Principal, AuthError>;
}

/// Treats every credential as invalid.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAuthenticator;

impl Authenticator for NoAuthenticator {
    fn verify(&self, _token: &str) -> Result<Principal, AuthError> {
        Err(AuthError::Invalid)
    }
}

/// Claims written by [`JwtAuthenticator::issue`].
#[derive(Debug, Serialize)]
struct IssuedClaims<'a> {
    sub: &'a str,
    iat: u64,
    exp: u64,
}

/// Claims read on verification. Login tokens carry the numeric user id as
/// `sub`, so its type is left open; `exp` is checked by [`Validation`].
#[derive(Debug, Deserialize)]
struct VerifiedClaims {
    #[serde(default)]
    sub: serde_json::Value,
}

fn subject_of(sub: serde_json::Value) -> String {
    match sub {
        serde_json::Value::String(s) => s,
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// HS256 JSON Web Token verification with a shared secret.
pub struct JwtAuthenticator {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    ttl_secs: u64,
}

impl JwtAuthenticator {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation: Validation::new(Algorithm::HS256),
            ttl_secs: config::AUTH_TOKEN_TTL_SECS,
        }
    }

    /// Mint a token for `subject`, valid for 24 hours.
    pub fn issue(&self, subject: &str) -> Result<String, jsonwebtoken::errors::Error> {
        let now = SystemClock.now_ms() / 1000;
        self.encode(subject, now, now + self.ttl_secs)
    }

    fn encode(
        &self,
        subject: &str,
        iat: u64,
        exp: u64,
    ) -> Result<String, jsonwebtoken::errors::Error> {
        let claims = IssuedClaims {
            sub: subject,
            iat,
            exp,
        };
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
    }
}

impl Authenticator for JwtAuthenticator {
    fn verify(&self, token: &str) -> Result<Principal, AuthError> {
        match jsonwebtoken::decode::<VerifiedClaims>(token, &self.decoding, &self.validation) {
            Ok(data) => Ok(Principal {
                subject: subject_of(data.claims.sub),
            }),
            Err(e) => Err(match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                ErrorKind::InvalidToken
                | ErrorKind::Base64(_)
                | ErrorKind::Json(_)
                | ErrorKind::Utf8(_) => AuthError::Malformed,
                _ => AuthError::Invalid,
            }),
        }
    }
}

/// Accepts any key from a fixed list, compared in constant time.
pub struct ApiKeyAuthenticator {
    keys: Vec<String>,
}

impl ApiKeyAuthenticator {
    pub fn new(keys: Vec<String>) -> Self {
        Self { keys }
    }

    /// Parse a comma-separated key list, ignoring blanks.
    pub fn from_list(list: &str) -> Self {
        Self::new(
            list.split(',')
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl Authenticator for ApiKeyAuthenticator {
    fn verify(&self, token: &str) -> Result<Principal, AuthError> {
        // Check every key so timing does not reveal which one matched.
        let matched = self.keys.iter().fold(false, |acc, key| {
            let eq: bool = key.as_bytes().ct_eq(token.as_bytes()).into();
            acc | eq
        });
        if matched {
            Ok(Principal {
                subject: mask_key(token),
            })
        } else {
            Err(AuthError::Invalid)
        }
    }
}

/// Mask a credential for safe logging: first 8 chars + "...".
pub fn mask_key(token: &str) -> String {
    match token.get(..8) {
        Some(prefix) if token.len() > 8 => format!("{}...", prefix),
        _ => "***".to_string(),
    }
}
