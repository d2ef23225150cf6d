//! HTTP surface: health, metrics and the authorization admin API.
//!
//! Every admin route authenticates and authorizes through the same
//! [`AuthGuard`] it administers: manage routes require
//! `authz:admin:manage`, read routes accept `authz:admin:read` as well.

mod admin;
mod handlers;

use std::sync::Arc;

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        FromRef, FromRequest, FromRequestParts, Request,
    },
    http::request::Parts,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::{de::DeserializeOwned, Serialize};
use tower_http::trace::TraceLayer;

use crate::db::Database;
use crate::error::{ErrorCode, KeystoneError};
use crate::factory::GuardStack;
use crate::guard::{AuthGuard, DomainAdapter, GuardError};
use crate::policy::PolicyService;
use crate::telemetry::MetricsRegistry;

/// Resource prefix of the admin permissions.
pub const ADMIN_RESOURCE: &str = "authz";

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub guard: Arc<AuthGuard>,
    pub policy: Arc<PolicyService>,
    pub admin: DomainAdapter,
    pub database: Option<Database>,
    pub metrics: MetricsRegistry,
}

impl AppState {
    pub fn new(stack: &GuardStack, metrics: MetricsRegistry) -> Self {
        Self {
            guard: stack.guard.clone(),
            policy: stack.policy.clone(),
            admin: DomainAdapter::new(stack.guard.clone(), ADMIN_RESOURCE),
            database: stack.database.clone(),
            metrics,
        }
    }
}

impl FromRef<AppState> for Arc<AuthGuard> {
    fn from_ref(state: &AppState) -> Self {
        state.guard.clone()
    }
}

/// Build the router: `/health`, `/metrics` and `/admin/*`.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::prometheus_metrics))
        .nest("/admin", admin::router())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Responses
// ═══════════════════════════════════════════════════════════════════════════════

/// Success envelope.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(message: impl Into<String>, data: T) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Some(data),
        }
    }
}

/// Handler error: either a guard rejection or an operation failure. Both
/// render the `{success: false, message, error}` envelope.
#[derive(Debug)]
pub enum ApiError {
    Guard(GuardError),
    Operation(KeystoneError),
}

impl From<GuardError> for ApiError {
    fn from(e: GuardError) -> Self {
        Self::Guard(e)
    }
}

impl From<KeystoneError> for ApiError {
    fn from(e: KeystoneError) -> Self {
        Self::Operation(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::Guard(e) => e.into_response(),
            Self::Operation(e) => e.into_response(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Extractors
// ═══════════════════════════════════════════════════════════════════════════════

/// `Json` whose rejections use the error envelope.
pub struct ApiJson<T>(pub T);

#[axum::async_trait]
impl<S, T> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(rejection) => Err(json_rejection(rejection).into()),
        }
    }
}

fn json_rejection(rejection: JsonRejection) -> KeystoneError {
    KeystoneError::new(ErrorCode::InvalidJson, rejection.body_text())
}

/// `Query` whose rejections use the error envelope.
pub struct ApiQuery<T>(pub T);

#[axum::async_trait]
impl<S, T> FromRequestParts<S> for ApiQuery<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        match axum::extract::Query::<T>::from_request_parts(parts, state).await {
            Ok(axum::extract::Query(value)) => Ok(Self(value)),
            Err(rejection) => Err(query_rejection(rejection).into()),
        }
    }
}

fn query_rejection(rejection: QueryRejection) -> KeystoneError {
    KeystoneError::validation(rejection.body_text())
}
