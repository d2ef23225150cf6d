//! Authorization administration endpoints.
//!
//! | Method | Path                                     | Permission   |
//! |--------|------------------------------------------|--------------|
//! | POST   | `/admin/policies`                        | manage       |
//! | DELETE | `/admin/policies`                        | manage       |
//! | GET    | `/admin/policies`                        | read         |
//! | POST   | `/admin/roles`                           | manage       |
//! | DELETE | `/admin/roles`                           | manage       |
//! | POST   | `/admin/roles/bulk`                      | manage       |
//! | GET    | `/admin/users/:id/roles`                 | read         |
//! | GET    | `/admin/users/:id/hierarchy`             | read         |
//! | PUT    | `/admin/users/:id/characters`            | manage       |
//! | GET    | `/admin/subjects/:type/:id/permissions`  | read         |
//! | POST   | `/admin/check`                           | read         |
//! | GET    | `/admin/audit`                           | read         |
//! | POST   | `/admin/cleanup`                         | manage       |

use axum::{
    extract::{FromRequestParts, Path, State},
    http::{request::Parts, StatusCode},
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;

use super::{ApiError, ApiJson, ApiQuery, ApiResponse, AppState};
use crate::audit::{AuditFilter, AuditOperation};
use crate::auth::Principal;
use crate::context::RequestContext;
use crate::error::KeystoneError;
use crate::hierarchy::CharacterRecord;
use crate::models::{UserId, GLOBAL_DOMAIN};
use crate::policy::{GrantOutcome, HierarchySync, PolicyFilter, PolicyGrant, PolicyKey, RevokeOutcome, RoleGrant};
use crate::subject::{Subject, SubjectType};

const MAX_PAGE: u32 = 500;

pub(super) fn router() -> Router<AppState> {
    Router::new()
        .route("/policies", post(grant_policy).delete(revoke_policy).get(list_policies))
        .route("/roles", post(assign_role).delete(revoke_role))
        .route("/roles/bulk", post(bulk_assign_role))
        .route("/users/:user_id/roles", get(user_roles))
        .route("/users/:user_id/hierarchy", get(user_hierarchy))
        .route("/users/:user_id/characters", put(sync_characters))
        .route("/subjects/:subject_type/:subject_id/permissions", get(effective_permissions))
        .route("/check", post(check_permission))
        .route("/audit", get(query_audit))
        .route("/cleanup", post(cleanup_expired))
}

/// Caller holding `authz:admin:manage`. Listed before any path, query or
/// body extractor, so callers are rejected before their input is parsed.
struct Manage(Principal);

/// Caller holding `authz:admin:read` or `authz:admin:manage`.
struct Read;

#[axum::async_trait]
impl FromRequestParts<AppState> for Manage {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        Ok(Self(state.admin.require_admin(&parts.headers).await?))
    }
}

#[axum::async_trait]
impl FromRequestParts<AppState> for Read {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        state.admin.require_read(&parts.headers).await?;
        Ok(Self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Policies
// ═══════════════════════════════════════════════════════════════════════════════

async fn grant_policy(
    State(state): State<AppState>,
    Manage(principal): Manage,
    ApiJson(grant): ApiJson<PolicyGrant>,
) -> Result<impl IntoResponse, ApiError> {
    let outcome = state.policy.grant_policy(grant, &principal.user_id).await?;

    let (status, message) = match &outcome {
        GrantOutcome::Created(_) => (StatusCode::CREATED, "Policy granted"),
        GrantOutcome::AlreadyExists(_) => (StatusCode::OK, "Policy already exists"),
    };
    Ok((status, Json(ApiResponse::success(message, outcome))))
}

async fn revoke_policy(
    State(state): State<AppState>,
    Manage(principal): Manage,
    ApiJson(key): ApiJson<PolicyKey>,
) -> Result<impl IntoResponse, ApiError> {
    let description = format!("{} {} {} on {}", key.effect, key.subject, key.action, key.resource);

    match state.policy.revoke_policy(key, &principal.user_id).await? {
        RevokeOutcome::Revoked => Ok(Json(ApiResponse::success("Policy revoked", RevokeOutcome::Revoked))),
        RevokeOutcome::NotFound => Err(KeystoneError::not_found("Active policy", description).into()),
    }
}

async fn list_policies(
    State(state): State<AppState>,
    _: Read,
    ApiQuery(mut filter): ApiQuery<PolicyFilter>,
) -> Result<impl IntoResponse, ApiError> {
    filter.limit = filter.limit.clamp(1, MAX_PAGE);

    let policies = state.policy.list_policies(&filter).await?;
    Ok(Json(ApiResponse::success(
        format!("{} policies", policies.len()),
        policies,
    )))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Roles
// ═══════════════════════════════════════════════════════════════════════════════

async fn assign_role(
    State(state): State<AppState>,
    Manage(principal): Manage,
    ApiJson(grant): ApiJson<RoleGrant>,
) -> Result<impl IntoResponse, ApiError> {
    let outcome = state.policy.assign_role(grant, &principal.user_id).await?;

    let (status, message) = match &outcome {
        GrantOutcome::Created(_) => (StatusCode::CREATED, "Role assigned"),
        GrantOutcome::AlreadyExists(_) => (StatusCode::OK, "Role already assigned"),
    };
    Ok((status, Json(ApiResponse::success(message, outcome))))
}

#[derive(Debug, Deserialize)]
struct RoleRevokeRequest {
    subject: Subject,
    role: String,
    #[serde(default = "global")]
    domain: String,
}

async fn revoke_role(
    State(state): State<AppState>,
    Manage(principal): Manage,
    ApiJson(req): ApiJson<RoleRevokeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    match state
        .policy
        .revoke_role(&req.subject, &req.role, &req.domain, &principal.user_id)
        .await?
    {
        RevokeOutcome::Revoked => Ok(Json(ApiResponse::success("Role revoked", RevokeOutcome::Revoked))),
        RevokeOutcome::NotFound => Err(KeystoneError::not_found(
            "Active role assignment",
            format!("{} -> {}", req.subject, req.role),
        )
        .into()),
    }
}

#[derive(Debug, Deserialize)]
struct BulkRoleRequest {
    subjects: Vec<Subject>,
    role: String,
    #[serde(default = "global")]
    domain: String,
}

async fn bulk_assign_role(
    State(state): State<AppState>,
    Manage(principal): Manage,
    ApiJson(req): ApiJson<BulkRoleRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.subjects.is_empty() {
        return Err(KeystoneError::validation("At least one subject is required").into());
    }

    let outcome = state
        .policy
        .bulk_assign_role(req.subjects, &req.role, &req.domain, &principal.user_id)
        .await;
    let message = format!("{} succeeded, {} failed", outcome.success_count, outcome.failure_count);
    Ok(Json(ApiResponse::success(message, outcome)))
}

async fn user_roles(
    State(state): State<AppState>,
    _: Read,
    Path(user_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let roles = state.policy.get_user_roles(&UserId::new(user_id)).await?;
    Ok(Json(ApiResponse::success("User roles", roles)))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Hierarchy
// ═══════════════════════════════════════════════════════════════════════════════

async fn user_hierarchy(
    State(state): State<AppState>,
    _: Read,
    Path(user_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let context = state
        .policy
        .hierarchy_for_user(&UserId::new(user_id), &RequestContext::new())
        .await?;
    Ok(Json(ApiResponse::success("User hierarchy", context)))
}

#[derive(Debug, Deserialize)]
struct SyncRequest {
    characters: Vec<CharacterRecord>,
}

async fn sync_characters(
    State(state): State<AppState>,
    Manage(principal): Manage,
    Path(user_id): Path<String>,
    ApiJson(req): ApiJson<SyncRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let sync = HierarchySync {
        user_id: UserId::new(user_id),
        characters: req.characters,
    };
    let context = state.policy.sync_hierarchy(sync, &principal.user_id).await?;
    Ok(Json(ApiResponse::success("Hierarchy synchronized", context)))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Evaluation
// ═══════════════════════════════════════════════════════════════════════════════

async fn effective_permissions(
    State(state): State<AppState>,
    _: Read,
    Path((subject_type, subject_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let subject = Subject::new(subject_type.parse::<SubjectType>()?, subject_id);
    let permissions = state.policy.get_effective_permissions(&subject).await?;
    Ok(Json(ApiResponse::success("Effective permissions", permissions)))
}

#[derive(Debug, Deserialize)]
struct CheckRequest {
    user_id: String,
    permission: String,
}

async fn check_permission(
    State(state): State<AppState>,
    _: Read,
    ApiJson(req): ApiJson<CheckRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let evaluation = state
        .policy
        .check_permission(&UserId::new(req.user_id), &req.permission, &RequestContext::new())
        .await?;
    let message = if evaluation.allowed { "Permission granted" } else { "Permission denied" };
    Ok(Json(ApiResponse::success(message, evaluation)))
}

// ═══════════════════════════════════════════════════════════════════════════════
// Audit and maintenance
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
struct AuditQuery {
    operation: Option<String>,
    subject_type: Option<SubjectType>,
    subject_id: Option<String>,
    performed_by: Option<String>,
    since: Option<DateTime<Utc>>,
    until: Option<DateTime<Utc>>,
    #[serde(default = "default_limit")]
    limit: u32,
    #[serde(default)]
    offset: u32,
}

async fn query_audit(
    State(state): State<AppState>,
    _: Read,
    ApiQuery(query): ApiQuery<AuditQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let operation = match query.operation.as_deref() {
        Some(op) => Some(
            AuditOperation::parse(op)
                .ok_or_else(|| KeystoneError::validation(format!("Unknown audit operation: {}", op)))?,
        ),
        None => None,
    };
    let filter = AuditFilter {
        operation,
        subject_type: query.subject_type,
        subject_id: query.subject_id,
        performed_by: query.performed_by,
        since: query.since,
        until: query.until,
    };

    let page = state
        .policy
        .query_audit(&filter, query.limit.clamp(1, MAX_PAGE), query.offset)
        .await?;
    Ok(Json(ApiResponse::success(format!("{} matching entries", page.total), page)))
}

async fn cleanup_expired(
    State(state): State<AppState>,
    Manage(principal): Manage,
) -> Result<impl IntoResponse, ApiError> {
    let report = state.policy.cleanup_expired(&principal.user_id).await?;
    Ok(Json(ApiResponse::success("Expired grants cleaned up", json!(report))))
}

fn global() -> String {
    GLOBAL_DOMAIN.to_string()
}

fn default_limit() -> u32 {
    100
}
