//! Token authentication: credential extraction and verification.
//!
//! A credential is read from the `Authorization: Bearer <token>` header or,
//! when that yields nothing, from a named cookie ([`extract_token`]). The
//! credential is then verified by a [`TokenValidator`]; [`JwtValidator`] is
//! the built-in implementation.
//!
//! # Example
//!
//! ```rust,ignore
//! use keystone_core::auth::{extract_token, JwtConfig, JwtValidator, TokenValidator};
//!
//! let validator = JwtValidator::new(JwtConfig::builder().jwt_secret("secret").build())?;
//! let credential = extract_token(&headers, "access_token").ok_or(AuthenticationError::NoCredential)?;
//! let principal = validator.validate(&credential).await?;
//! ```

mod extract;
mod jwt;

pub use extract::{extract_token, Credential};
pub use jwt::{Claims, ClaimsBuilder, JwtConfig, JwtConfigBuilder, JwtValidator};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{CharacterId, UserId};

// ═══════════════════════════════════════════════════════════════════════════════
// Principal
// ═══════════════════════════════════════════════════════════════════════════════

/// Where the credential of a request came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestType {
    Bearer,
    Cookie,
}

/// The authenticated identity of one request.
///
/// Built by a [`TokenValidator`] and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub user_id: UserId,
    /// Primary character named by the token, when it carries one.
    pub primary_character_id: Option<CharacterId>,
    pub request_type: RequestType,
    pub scopes: Vec<String>,
}

impl Principal {
    pub fn new(user_id: impl Into<UserId>, request_type: RequestType) -> Self {
        Self {
            user_id: user_id.into(),
            primary_character_id: None,
            request_type,
            scopes: Vec::new(),
        }
    }

    pub fn with_primary_character(mut self, character_id: impl Into<CharacterId>) -> Self {
        self.primary_character_id = Some(character_id.into());
        self
    }

    pub fn with_scopes(mut self, scopes: Vec<String>) -> Self {
        self.scopes = scopes;
        self
    }

    pub fn has_scope(&self, scope: &str) -> bool {
        self.scopes.iter().any(|s| s == scope)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Errors
// ═══════════════════════════════════════════════════════════════════════════════

/// Why a presented credential was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidReason {
    Expired,
    BadSignature,
    Malformed,
    ClaimsMismatch,
}

impl InvalidReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Expired => "expired",
            Self::BadSignature => "bad_signature",
            Self::Malformed => "malformed",
            Self::ClaimsMismatch => "claims_mismatch",
        }
    }
}

/// Authentication failures. Always a hard 401; never degraded by fallback.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthenticationError {
    #[error("no credential presented")]
    NoCredential,

    #[error("invalid credential: {}", .0.as_str())]
    Invalid(InvalidReason),
}

impl AuthenticationError {
    /// Stable machine-readable code for API envelopes.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoCredential => "MISSING_CREDENTIALS",
            Self::Invalid(InvalidReason::Expired) => "TOKEN_EXPIRED",
            Self::Invalid(_) => "INVALID_TOKEN",
        }
    }

    pub(crate) fn record_metrics(&self) {
        let reason = match self {
            Self::NoCredential => "no_credential",
            Self::Invalid(reason) => reason.as_str(),
        };
        metrics::counter!("keystone_auth_failures_total", "reason" => reason).increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Validator Contract
// ═══════════════════════════════════════════════════════════════════════════════

/// Verifies a credential and turns it into a [`Principal`].
///
/// Implementations must be stateless from the caller's point of view and safe
/// to share across requests.
#[async_trait]
pub trait TokenValidator: Send + Sync {
    async fn validate(&self, credential: &Credential) -> Result<Principal, AuthenticationError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_principal_builder() {
        let principal = Principal::new("u-1", RequestType::Bearer)
            .with_primary_character("c-1")
            .with_scopes(vec!["esi-skills.read".into()]);

        assert_eq!(principal.user_id.as_str(), "u-1");
        assert_eq!(principal.primary_character_id, Some(CharacterId::new("c-1")));
        assert!(principal.has_scope("esi-skills.read"));
        assert!(!principal.has_scope("other"));
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(AuthenticationError::NoCredential.code(), "MISSING_CREDENTIALS");
        assert_eq!(
            AuthenticationError::Invalid(InvalidReason::Expired).code(),
            "TOKEN_EXPIRED"
        );
        assert_eq!(
            AuthenticationError::Invalid(InvalidReason::BadSignature).to_string(),
            "invalid credential: bad_signature"
        );
    }
}
