#![allow(clippy::result_large_err)]
//! # Keystone Core
//!
//! Hierarchical authorization for users who own characters that belong to
//! corporations, which in turn belong to alliances.
//!
//! ## Architecture
//!
//! - **Auth**: bearer/cookie token extraction and JWT validation into a [`auth::Principal`]
//! - **Hierarchy**: cached expansion of a user into characters, corporations and alliances
//! - **Engine**: subject/resource/action rules with allow/deny effects and role links
//! - **Guard**: priority-ordered evaluation, decision cache, circuit breaker and auth-only fallback
//! - **Policy**: idempotent grant/revoke/assign administration over the engine and its metadata store
//! - **Audit**: append-only trail of every mutation, written off the request path
//! - **Telemetry**: structured logging and Prometheus metrics

pub mod api;
pub mod audit;
pub mod auth;
pub mod cache;
pub mod config;
pub mod context;
pub mod db;
pub mod engine;
pub mod error;
pub mod factory;
pub mod guard;
pub mod hierarchy;
pub mod models;
pub mod policy;
pub mod subject;
pub mod telemetry;

pub use error::{ErrorCode, ErrorContext, ErrorDetails, KeystoneError, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::audit::{AuditFilter, AuditLogEntry, AuditLogger, AuditOperation, AuditResult, AuditSink};
    pub use crate::auth::{Claims, JwtConfig, JwtValidator, Principal, RequestType, TokenValidator};
    pub use crate::cache::{AuthzCache, CacheConfig};
    pub use crate::context::RequestContext;
    pub use crate::engine::{EngineDecision, MemoryRuleEngine, PolicyRule, RuleEngine};
    pub use crate::error::{ErrorCode, KeystoneError, Result};
    pub use crate::factory::{GuardStack, GuardStackBuilder};
    pub use crate::guard::{
        Authenticated, AuthGuard, DomainAdapter, Evaluation, Evaluator, GuardError, GuardOptions, Profile,
        RequirePermissionLayer,
    };
    pub use crate::hierarchy::{CharacterDirectory, CharacterRecord, HierarchyContext, HierarchyResolver};
    pub use crate::models::{AllianceId, CharacterId, CorporationId, Effect, UserId, GLOBAL_DOMAIN};
    pub use crate::policy::{
        GrantOutcome, PermissionId, PermissionPolicy, PolicyGrant, PolicyKey, PolicyService, PolicyStore,
        RevokeOutcome, RoleAssignment, RoleGrant,
    };
    pub use crate::subject::{Subject, SubjectType};
}
