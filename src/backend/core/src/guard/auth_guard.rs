//! Request-level guards: require-auth, require-permission, require-any and
//! require-all.

use std::sync::Arc;

use axum::{
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::evaluator::{Evaluation, EvaluationError, Evaluator};
use super::options::GuardOptions;
use crate::audit::AuditResult;
use crate::auth::{extract_token, AuthenticationError, Principal, TokenValidator};
use crate::context::RequestContext;
use crate::error::KeystoneError;
use crate::policy::PermissionId;
use crate::telemetry::GuardMetrics;

// ═══════════════════════════════════════════════════════════════════════════════
// Errors
// ═══════════════════════════════════════════════════════════════════════════════

/// Terminal guard failures.
#[derive(Debug, Error)]
pub enum GuardError {
    /// No or invalid credential (401). Never degraded by fallback.
    #[error(transparent)]
    Unauthenticated(#[from] AuthenticationError),

    /// Authenticated but not permitted (403).
    #[error("missing permission {permission}")]
    Forbidden { permission: String },

    /// Evaluation failed and fallback is disabled or does not apply (500).
    #[error("authorization unavailable: {0}")]
    Unavailable(#[source] KeystoneError),

    /// A permission identifier is malformed (400).
    #[error("invalid permission: {0}")]
    InvalidPermission(#[source] KeystoneError),
}

impl GuardError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden { .. } => StatusCode::FORBIDDEN,
            Self::Unavailable(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::InvalidPermission(_) => StatusCode::BAD_REQUEST,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthenticated(e) => e.code(),
            Self::Forbidden { .. } => "FORBIDDEN",
            Self::Unavailable(_) => "AUTHORIZATION_UNAVAILABLE",
            Self::InvalidPermission(_) => "INVALID_PERMISSION",
        }
    }

    fn client_message(&self) -> String {
        match self {
            Self::Unauthenticated(AuthenticationError::NoCredential) => "Authentication required".to_string(),
            Self::Unauthenticated(_) => "Invalid or expired credential".to_string(),
            Self::Forbidden { permission } => format!("You do not have permission: {}", permission),
            Self::Unavailable(_) => "Authorization is temporarily unavailable".to_string(),
            Self::InvalidPermission(e) => e.user_message().to_string(),
        }
    }
}

impl IntoResponse for GuardError {
    fn into_response(self) -> Response {
        let message = self.client_message();
        let body = json!({
            "success": false,
            "message": message,
            "error": {
                "code": self.code(),
                "message": message,
            }
        });

        let mut response = (self.status(), Json(body)).into_response();
        if let Self::Unauthenticated(_) = self {
            response
                .headers_mut()
                .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
        }
        response
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Guard
// ═══════════════════════════════════════════════════════════════════════════════

/// The single authentication + authorization pipeline.
///
/// ```text
/// extract credential ─► authenticate ─[401]
///                          │
///                          ▼
///                resolve hierarchy ─► build subjects ─► evaluate ─[403]
///                          │                               │
///                          └──── subsystem failure ────────┴─► fallback? principal : [500]
/// ```
#[derive(Clone)]
pub struct AuthGuard {
    validator: Arc<dyn TokenValidator>,
    evaluator: Evaluator,
    options: Arc<GuardOptions>,
}

impl std::fmt::Debug for AuthGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthGuard")
            .field("evaluator", &self.evaluator)
            .finish()
    }
}

enum Check {
    Granted,
    Denied,
    Degraded,
}

impl AuthGuard {
    pub fn new(validator: Arc<dyn TokenValidator>, evaluator: Evaluator) -> Self {
        let options = Arc::new(evaluator.options().clone());
        Self {
            validator,
            evaluator,
            options,
        }
    }

    pub fn options(&self) -> &GuardOptions {
        &self.options
    }

    pub fn evaluator(&self) -> &Evaluator {
        &self.evaluator
    }

    /// Extract and verify the request credential.
    pub async fn authenticate(&self, headers: &HeaderMap) -> Result<Principal, AuthenticationError> {
        let result = match extract_token(headers, self.options.cookie_name()) {
            Some(credential) => self.validator.validate(&credential).await,
            None => Err(AuthenticationError::NoCredential),
        };

        match &result {
            Ok(principal) => {
                if self.options.debug_logging() {
                    debug!(user_id = %principal.user_id, request_type = ?principal.request_type, "Authenticated");
                }
            }
            Err(e) => {
                e.record_metrics();
                GuardMetrics::outcome("unauthenticated");
                debug!(reason = e.code(), "Authentication failed");
            }
        }
        result
    }

    pub async fn require_auth(&self, headers: &HeaderMap) -> Result<Principal, GuardError> {
        Ok(self.authenticate(headers).await?)
    }

    pub async fn require_permission(&self, headers: &HeaderMap, permission: &str) -> Result<Principal, GuardError> {
        self.require_permission_with(headers, permission, &RequestContext::new()).await
    }

    pub async fn require_permission_with(
        &self,
        headers: &HeaderMap,
        permission: &str,
        ctx: &RequestContext,
    ) -> Result<Principal, GuardError> {
        let principal = self.authenticate(headers).await?;
        let permission = parse_permissions(&[permission])?.remove(0);
        self.authorize(principal, &permission, ctx).await
    }

    /// Granted when any permission is granted; permissions are checked in
    /// list order and checking stops at the first grant.
    pub async fn require_any<S: AsRef<str>>(&self, headers: &HeaderMap, permissions: &[S]) -> Result<Principal, GuardError> {
        self.require_any_with(headers, permissions, &RequestContext::new()).await
    }

    pub async fn require_any_with<S: AsRef<str>>(
        &self,
        headers: &HeaderMap,
        permissions: &[S],
        ctx: &RequestContext,
    ) -> Result<Principal, GuardError> {
        let mut principal = self.authenticate(headers).await?;
        let permissions = parse_permissions(permissions)?;

        for permission in &permissions {
            match self.check(&mut principal, permission, ctx).await? {
                Check::Granted => {
                    GuardMetrics::outcome("allowed");
                    return Ok(principal);
                }
                Check::Degraded => return Ok(principal),
                Check::Denied => continue,
            }
        }

        GuardMetrics::outcome("denied");
        let listed: Vec<String> = permissions.iter().map(|p| p.to_string()).collect();
        info!(user_id = %principal.user_id, permissions = ?listed, "None of the permissions granted");
        Err(GuardError::Forbidden {
            permission: listed.join(" | "),
        })
    }

    /// Granted when every permission is granted; checking stops at the first
    /// missing one.
    pub async fn require_all<S: AsRef<str>>(&self, headers: &HeaderMap, permissions: &[S]) -> Result<Principal, GuardError> {
        self.require_all_with(headers, permissions, &RequestContext::new()).await
    }

    pub async fn require_all_with<S: AsRef<str>>(
        &self,
        headers: &HeaderMap,
        permissions: &[S],
        ctx: &RequestContext,
    ) -> Result<Principal, GuardError> {
        let mut principal = self.authenticate(headers).await?;
        let permissions = parse_permissions(permissions)?;

        for permission in &permissions {
            match self.check(&mut principal, permission, ctx).await? {
                Check::Granted => continue,
                Check::Degraded => return Ok(principal),
                Check::Denied => {
                    GuardMetrics::outcome("denied");
                    info!(user_id = %principal.user_id, permission = %permission, "Permission denied");
                    return Err(GuardError::Forbidden {
                        permission: permission.to_string(),
                    });
                }
            }
        }

        GuardMetrics::outcome("allowed");
        Ok(principal)
    }

    /// Authorize an already-authenticated principal. A principal whose
    /// credential named no character gets the hierarchy's primary.
    pub async fn authorize(
        &self,
        mut principal: Principal,
        permission: &PermissionId,
        ctx: &RequestContext,
    ) -> Result<Principal, GuardError> {
        match self.check(&mut principal, permission, ctx).await? {
            Check::Granted => {
                GuardMetrics::outcome("allowed");
                Ok(principal)
            }
            Check::Degraded => Ok(principal),
            Check::Denied => {
                GuardMetrics::outcome("denied");
                info!(user_id = %principal.user_id, permission = %permission, "Permission denied");
                Err(GuardError::Forbidden {
                    permission: permission.to_string(),
                })
            }
        }
    }

    async fn check(&self, principal: &mut Principal, permission: &PermissionId, ctx: &RequestContext) -> Result<Check, GuardError> {
        match self.evaluator.evaluate(&principal.user_id, permission, ctx).await {
            Ok(evaluation) if evaluation.allowed => {
                self.fill_primary(principal, &evaluation, ctx).await;
                Ok(Check::Granted)
            }
            Ok(_) => Ok(Check::Denied),
            Err(EvaluationError::Unavailable(e)) if self.options.fallback_to_auth_only() => {
                GuardMetrics::fallback();
                GuardMetrics::outcome("fallback");
                warn!(
                    user_id = %principal.user_id,
                    permission = %permission,
                    error = %e,
                    "Evaluation unavailable; falling back to authentication only"
                );
                self.evaluator
                    .audit_decision(&principal.user_id, permission, AuditResult::Fallback)
                    .await;
                Ok(Check::Degraded)
            }
            Err(e) => {
                GuardMetrics::outcome("unavailable");
                e.error().log();
                Err(GuardError::Unavailable(e.into()))
            }
        }
    }

    async fn fill_primary(&self, principal: &mut Principal, evaluation: &Evaluation, ctx: &RequestContext) {
        if principal.primary_character_id.is_some() {
            return;
        }
        if evaluation.primary_character_id.is_some() || !evaluation.cached {
            principal.primary_character_id = evaluation.primary_character_id.clone();
            return;
        }
        match self.evaluator.resolver().resolve(&principal.user_id, ctx).await {
            Ok(hierarchy) => principal.primary_character_id = hierarchy.primary_character_id,
            Err(e) => debug!(user_id = %principal.user_id, error = %e, "Primary character lookup failed"),
        }
    }
}

fn parse_permissions<S: AsRef<str>>(permissions: &[S]) -> Result<Vec<PermissionId>, GuardError> {
    if permissions.is_empty() {
        GuardMetrics::outcome("invalid_permission");
        return Err(GuardError::InvalidPermission(KeystoneError::validation(
            "At least one permission is required",
        )));
    }
    permissions
        .iter()
        .map(|p| PermissionId::parse(p.as_ref()))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| {
            GuardMetrics::outcome("invalid_permission");
            GuardError::InvalidPermission(e)
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            GuardError::Unauthenticated(AuthenticationError::NoCredential).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            GuardError::Forbidden { permission: "a:b:c".into() }.status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            GuardError::Unavailable(KeystoneError::internal("x")).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            GuardError::InvalidPermission(KeystoneError::validation("x")).status(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn test_unauthenticated_response_has_challenge() {
        let response = GuardError::Unauthenticated(AuthenticationError::NoCredential).into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(response.headers().get(header::WWW_AUTHENTICATE).unwrap(), "Bearer");
    }

    #[test]
    fn test_parse_permissions() {
        assert!(matches!(
            parse_permissions::<&str>(&[]),
            Err(GuardError::InvalidPermission(_))
        ));
        assert!(matches!(
            parse_permissions(&["a:b:c", "broken"]),
            Err(GuardError::InvalidPermission(_))
        ));
        assert_eq!(parse_permissions(&["a:b:c"]).unwrap().len(), 1);
    }
}
