//! JWT verification with `jsonwebtoken`.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::debug;

use super::{AuthenticationError, Credential, InvalidReason, Principal, TokenValidator};
use crate::error::{ErrorCode, KeystoneError, Result};

// ═══════════════════════════════════════════════════════════════════════════════
// Claims
// ═══════════════════════════════════════════════════════════════════════════════

/// JWT claims understood by the validator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user ID)
    pub sub: String,

    /// Primary character of the session
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub character_id: Option<String>,

    /// Scopes; accepted as a space separated string or an array
    #[serde(default, deserialize_with = "deserialize_scopes")]
    pub scp: Vec<String>,

    /// Expiration timestamp
    pub exp: i64,

    /// Issued at timestamp
    pub iat: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,
}

impl Claims {
    pub fn builder(user_id: impl Into<String>) -> ClaimsBuilder {
        ClaimsBuilder::new(user_id)
    }
}

fn deserialize_scopes<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum ScopeClaim {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Option::<ScopeClaim>::deserialize(deserializer)? {
        Some(ScopeClaim::One(s)) => s.split_whitespace().map(str::to_string).collect(),
        Some(ScopeClaim::Many(v)) => v,
        None => Vec::new(),
    })
}

/// Builder for JWT claims.
pub struct ClaimsBuilder {
    claims: Claims,
}

impl ClaimsBuilder {
    pub fn new(user_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            claims: Claims {
                sub: user_id.into(),
                character_id: None,
                scp: Vec::new(),
                exp: (now + Duration::hours(1)).timestamp(),
                iat: now.timestamp(),
                iss: None,
                aud: None,
            },
        }
    }

    pub fn character(mut self, character_id: impl Into<String>) -> Self {
        self.claims.character_id = Some(character_id.into());
        self
    }

    pub fn scopes(mut self, scopes: Vec<String>) -> Self {
        self.claims.scp = scopes;
        self
    }

    /// Expiry relative to now; negative values produce an already expired token.
    pub fn expires_in(mut self, duration: Duration) -> Self {
        self.claims.exp = (Utc::now() + duration).timestamp();
        self
    }

    pub fn issuer(mut self, issuer: impl Into<String>) -> Self {
        self.claims.iss = Some(issuer.into());
        self
    }

    pub fn audience(mut self, audience: impl Into<String>) -> Self {
        self.claims.aud = Some(audience.into());
        self
    }

    pub fn build(self) -> Claims {
        self.claims
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Configuration
// ═══════════════════════════════════════════════════════════════════════════════

/// JWT verification settings.
#[derive(Debug, Clone)]
pub struct JwtConfig {
    /// Secret for HS256/HS384/HS512
    pub jwt_secret: Option<String>,

    /// PEM public key for RS*/ES*
    pub jwt_public_key: Option<String>,

    pub algorithm: Algorithm,

    pub issuer: Option<String>,

    pub audience: Option<String>,

    /// Leeway for expiration checks (in seconds)
    pub leeway_secs: u64,
}

impl Default for JwtConfig {
    fn default() -> Self {
        Self {
            jwt_secret: None,
            jwt_public_key: None,
            algorithm: Algorithm::HS256,
            issuer: None,
            audience: None,
            leeway_secs: 30,
        }
    }
}

impl JwtConfig {
    pub fn builder() -> JwtConfigBuilder {
        JwtConfigBuilder::default()
    }

    /// Build from the `auth` configuration section. A public key selects RS256.
    pub fn from_settings(settings: &crate::config::AuthSettings) -> Self {
        let algorithm = if settings.jwt_public_key.is_some() {
            Algorithm::RS256
        } else {
            Algorithm::HS256
        };

        Self {
            jwt_secret: settings.jwt_secret.clone(),
            jwt_public_key: settings.jwt_public_key.clone(),
            algorithm,
            issuer: settings.issuer.clone(),
            audience: settings.audience.clone(),
            leeway_secs: settings.leeway.as_secs(),
        }
    }
}

/// Builder for [`JwtConfig`].
#[derive(Default)]
pub struct JwtConfigBuilder {
    config: JwtConfig,
}

impl JwtConfigBuilder {
    pub fn jwt_secret(mut self, secret: impl Into<String>) -> Self {
        self.config.jwt_secret = Some(secret.into());
        self
    }

    pub fn jwt_public_key(mut self, key: impl Into<String>) -> Self {
        self.config.jwt_public_key = Some(key.into());
        self
    }

    pub fn algorithm(mut self, algorithm: Algorithm) -> Self {
        self.config.algorithm = algorithm;
        self
    }

    pub fn issuer(mut self, issuer: impl Into<String>) -> Self {
        self.config.issuer = Some(issuer.into());
        self
    }

    pub fn audience(mut self, audience: impl Into<String>) -> Self {
        self.config.audience = Some(audience.into());
        self
    }

    pub fn leeway_secs(mut self, secs: u64) -> Self {
        self.config.leeway_secs = secs;
        self
    }

    pub fn build(self) -> JwtConfig {
        self.config
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Validator
// ═══════════════════════════════════════════════════════════════════════════════

/// Verifies signed JWTs locally; no remote key fetch.
pub struct JwtValidator {
    encoding_key: Option<EncodingKey>,
    decoding_key: DecodingKey,
    algorithm: Algorithm,
    validation: Validation,
}

impl std::fmt::Debug for JwtValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtValidator")
            .field("algorithm", &self.algorithm)
            .field("can_issue", &self.encoding_key.is_some())
            .finish()
    }
}

impl JwtValidator {
    /// Create a validator.
    ///
    /// # Errors
    ///
    /// Fails when the key material required by the algorithm is missing or
    /// unparseable.
    pub fn new(config: JwtConfig) -> Result<Self> {
        let missing = |what: &str| {
            KeystoneError::new(
                ErrorCode::MissingConfiguration,
                format!("{} is required for {:?} tokens", what, config.algorithm),
            )
        };

        let (encoding_key, decoding_key) = match config.algorithm {
            Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => {
                let secret = config.jwt_secret.as_ref().ok_or_else(|| missing("auth.jwt_secret"))?;
                (
                    Some(EncodingKey::from_secret(secret.as_bytes())),
                    DecodingKey::from_secret(secret.as_bytes()),
                )
            }
            Algorithm::RS256 | Algorithm::RS384 | Algorithm::RS512 => {
                let key = config.jwt_public_key.as_ref().ok_or_else(|| missing("auth.jwt_public_key"))?;
                (None, DecodingKey::from_rsa_pem(key.as_bytes())?)
            }
            Algorithm::ES256 | Algorithm::ES384 => {
                let key = config.jwt_public_key.as_ref().ok_or_else(|| missing("auth.jwt_public_key"))?;
                (None, DecodingKey::from_ec_pem(key.as_bytes())?)
            }
            other => {
                return Err(KeystoneError::new(
                    ErrorCode::InvalidConfiguration,
                    format!("Unsupported JWT algorithm: {:?}", other),
                ));
            }
        };

        let mut validation = Validation::new(config.algorithm);
        validation.leeway = config.leeway_secs;
        validation.set_required_spec_claims(&["exp", "sub"]);

        if let Some(ref issuer) = config.issuer {
            validation.set_issuer(&[issuer]);
        }

        match config.audience {
            Some(ref audience) => validation.set_audience(&[audience]),
            None => validation.validate_aud = false,
        }

        Ok(Self {
            encoding_key,
            decoding_key,
            algorithm: config.algorithm,
            validation,
        })
    }

    /// Sign `claims` with the configured secret. Only available for HMAC keys;
    /// used by tests and local development.
    pub fn issue(&self, claims: &Claims) -> Result<String> {
        let key = self.encoding_key.as_ref().ok_or_else(|| {
            KeystoneError::new(
                ErrorCode::InvalidConfiguration,
                "Token issuing requires an HMAC secret",
            )
        })?;

        Ok(encode(&Header::new(self.algorithm), claims, key)?)
    }

    fn classify(kind: &ErrorKind) -> InvalidReason {
        match kind {
            ErrorKind::ExpiredSignature => InvalidReason::Expired,
            ErrorKind::InvalidSignature | ErrorKind::InvalidAlgorithm => InvalidReason::BadSignature,
            ErrorKind::InvalidIssuer
            | ErrorKind::InvalidAudience
            | ErrorKind::InvalidSubject
            | ErrorKind::ImmatureSignature
            | ErrorKind::MissingRequiredClaim(_) => InvalidReason::ClaimsMismatch,
            _ => InvalidReason::Malformed,
        }
    }
}

#[async_trait]
impl TokenValidator for JwtValidator {
    async fn validate(&self, credential: &Credential) -> std::result::Result<Principal, AuthenticationError> {
        let data = decode::<Claims>(&credential.token, &self.decoding_key, &self.validation).map_err(|e| {
            let reason = Self::classify(e.kind());
            debug!(reason = reason.as_str(), error = %e, "Token rejected");
            AuthenticationError::Invalid(reason)
        })?;

        let claims = data.claims;
        if claims.sub.trim().is_empty() {
            return Err(AuthenticationError::Invalid(InvalidReason::ClaimsMismatch));
        }

        let mut principal = Principal::new(claims.sub, credential.request_type).with_scopes(claims.scp);
        if let Some(character_id) = claims.character_id.filter(|c| !c.is_empty()) {
            principal = principal.with_primary_character(character_id);
        }

        Ok(principal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::RequestType;

    fn validator() -> JwtValidator {
        JwtValidator::new(
            JwtConfig::builder()
                .jwt_secret("unit-test-secret")
                .issuer("keystone")
                .audience("keystone-api")
                .build(),
        )
        .unwrap()
    }

    fn bearer(token: String) -> Credential {
        Credential {
            token,
            request_type: RequestType::Bearer,
        }
    }

    #[tokio::test]
    async fn test_valid_token_yields_principal() {
        let v = validator();
        let claims = Claims::builder("user-1")
            .character("char-1")
            .scopes(vec!["a".into(), "b".into()])
            .issuer("keystone")
            .audience("keystone-api")
            .build();

        let principal = v.validate(&bearer(v.issue(&claims).unwrap())).await.unwrap();
        assert_eq!(principal.user_id.as_str(), "user-1");
        assert_eq!(principal.primary_character_id.as_ref().map(|c| c.as_str()), Some("char-1"));
        assert_eq!(principal.scopes, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(principal.request_type, RequestType::Bearer);
    }

    #[tokio::test]
    async fn test_expired_token() {
        let v = validator();
        let claims = Claims::builder("user-1")
            .issuer("keystone")
            .audience("keystone-api")
            .expires_in(Duration::hours(-2))
            .build();

        let err = v.validate(&bearer(v.issue(&claims).unwrap())).await.unwrap_err();
        assert_eq!(err, AuthenticationError::Invalid(InvalidReason::Expired));
    }

    #[tokio::test]
    async fn test_forged_signature() {
        let v = validator();
        let other = JwtValidator::new(JwtConfig::builder().jwt_secret("other-secret").build()).unwrap();
        let claims = Claims::builder("user-1").issuer("keystone").audience("keystone-api").build();

        let err = v.validate(&bearer(other.issue(&claims).unwrap())).await.unwrap_err();
        assert_eq!(err, AuthenticationError::Invalid(InvalidReason::BadSignature));
    }

    #[tokio::test]
    async fn test_wrong_audience() {
        let v = validator();
        let claims = Claims::builder("user-1").issuer("keystone").audience("elsewhere").build();

        let err = v.validate(&bearer(v.issue(&claims).unwrap())).await.unwrap_err();
        assert_eq!(err, AuthenticationError::Invalid(InvalidReason::ClaimsMismatch));
    }

    #[tokio::test]
    async fn test_garbage_token() {
        let err = validator().validate(&bearer("not-a-jwt".into())).await.unwrap_err();
        assert_eq!(err, AuthenticationError::Invalid(InvalidReason::Malformed));
    }

    #[test]
    fn test_scope_string_is_split() {
        let json = serde_json::json!({
            "sub": "u", "exp": 1, "iat": 0, "scp": "read write"
        });
        let claims: Claims = serde_json::from_value(json).unwrap();
        assert_eq!(claims.scp, vec!["read".to_string(), "write".to_string()]);
    }

    #[test]
    fn test_missing_secret_is_configuration_error() {
        let err = JwtValidator::new(JwtConfig::default()).unwrap_err();
        assert_eq!(err.code(), ErrorCode::MissingConfiguration);
    }
}
