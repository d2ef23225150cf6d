//! Axum integration: a Tower layer enforcing one permission and an extractor
//! yielding the authenticated principal.

use std::sync::Arc;
use std::task::{Context, Poll};

use axum::{
    body::Body,
    extract::{FromRef, FromRequestParts, Request},
    http::request::Parts,
    response::{IntoResponse, Response},
};
use futures::future::BoxFuture;
use tower::{Layer, Service};

use super::auth_guard::{AuthGuard, GuardError};
use crate::auth::Principal;
use crate::context::RequestContext;
use crate::error::Result;
use crate::policy::PermissionId;

// ═══════════════════════════════════════════════════════════════════════════════
// Tower Layer
// ═══════════════════════════════════════════════════════════════════════════════

/// Rejects requests lacking `permission`; on success the [`Principal`] is
/// inserted into request extensions.
///
/// ```rust,ignore
/// let app = Router::new()
///     .route("/tasks", get(list_tasks))
///     .layer(RequirePermissionLayer::new(guard.clone(), "scheduler:tasks:read")?);
/// ```
#[derive(Clone)]
pub struct RequirePermissionLayer {
    guard: Arc<AuthGuard>,
    permission: PermissionId,
}

impl RequirePermissionLayer {
    /// Fails when `permission` is malformed.
    pub fn new(guard: Arc<AuthGuard>, permission: &str) -> Result<Self> {
        Ok(Self {
            guard,
            permission: PermissionId::parse(permission)?,
        })
    }

    pub fn from_permission(guard: Arc<AuthGuard>, permission: PermissionId) -> Self {
        Self { guard, permission }
    }
}

impl<S> Layer<S> for RequirePermissionLayer {
    type Service = RequirePermissionService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequirePermissionService {
            inner,
            guard: self.guard.clone(),
            permission: self.permission.clone(),
        }
    }
}

#[derive(Clone)]
pub struct RequirePermissionService<S> {
    inner: S,
    guard: Arc<AuthGuard>,
    permission: PermissionId,
}

impl<S> Service<Request<Body>> for RequirePermissionService<S>
where
    S: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, std::result::Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut request: Request<Body>) -> Self::Future {
        let guard = self.guard.clone();
        let permission = self.permission.clone();
        let mut inner = self.inner.clone();

        Box::pin(async move {
            let principal = match guard.authenticate(request.headers()).await {
                Ok(principal) => principal,
                Err(e) => return Ok(GuardError::from(e).into_response()),
            };

            match guard.authorize(principal, &permission, &RequestContext::new()).await {
                Ok(principal) => {
                    request.extensions_mut().insert(principal);
                    inner.call(request).await
                }
                Err(e) => Ok(e.into_response()),
            }
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Extractor
// ═══════════════════════════════════════════════════════════════════════════════

/// The authenticated principal of a request.
///
/// Reuses the principal placed in extensions by [`RequirePermissionLayer`];
/// otherwise authenticates the request with the guard found in state.
#[derive(Debug, Clone)]
pub struct Authenticated(pub Principal);

#[axum::async_trait]
impl<S> FromRequestParts<S> for Authenticated
where
    Arc<AuthGuard>: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = GuardError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> std::result::Result<Self, Self::Rejection> {
        if let Some(principal) = parts.extensions.get::<Principal>() {
            return Ok(Self(principal.clone()));
        }

        let guard = Arc::<AuthGuard>::from_ref(state);
        let principal = guard.require_auth(&parts.headers).await?;
        parts.extensions.insert(principal.clone());
        Ok(Self(principal))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode, routing::get, Router};
    use tower::ServiceExt;

    use crate::auth::{Claims, JwtConfig, JwtValidator};
    use crate::factory::GuardStack;
    use crate::guard::GuardOptions;
    use crate::models::UserId;
    use crate::policy::PolicyGrant;
    use crate::subject::Subject;

    const SECRET: &str = "layer-secret";

    async fn app() -> Router {
        let stack = GuardStack::builder()
            .jwt_secret(SECRET)
            .inline_audit()
            .options(GuardOptions::development())
            .build()
            .unwrap();
        stack
            .policy
            .grant_policy(
                PolicyGrant::allow(Subject::user("U"), "scheduler:tasks", "read"),
                &UserId::new("admin"),
            )
            .await
            .unwrap();

        Router::new()
            .route(
                "/tasks",
                get(|Authenticated(principal): Authenticated| async move { principal.user_id.to_string() }),
            )
            .layer(RequirePermissionLayer::new(stack.guard.clone(), "scheduler:tasks:read").unwrap())
            .with_state(stack.guard.clone())
    }

    fn request(user: Option<&str>) -> Request<Body> {
        let mut builder = axum::http::Request::builder().uri("/tasks");
        if let Some(user) = user {
            let token = JwtValidator::new(JwtConfig::builder().jwt_secret(SECRET).build())
                .unwrap()
                .issue(&Claims::builder(user).build())
                .unwrap();
            builder = builder.header(axum::http::header::AUTHORIZATION, format!("Bearer {}", token));
        }
        builder.body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_layer_passes_principal_to_handler() {
        let response = app().await.oneshot(request(Some("U"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"U");
    }

    #[tokio::test]
    async fn test_layer_rejects() {
        let response = app().await.oneshot(request(None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app().await.oneshot(request(Some("V"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_malformed_permission_is_rejected_at_construction() {
        let stack = GuardStack::builder().jwt_secret(SECRET).inline_audit().build().unwrap();
        assert!(RequirePermissionLayer::new(stack.guard.clone(), "scheduler:tasks").is_err());
    }
}
