//! Policy and role assignment records plus administration request/outcome types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::engine::PolicyRule;
use crate::hierarchy::CharacterRecord;
use crate::models::{Effect, UserId, GLOBAL_DOMAIN};
use crate::subject::{Subject, SubjectType};

// ═══════════════════════════════════════════════════════════════════════════════
// Stored Records
// ═══════════════════════════════════════════════════════════════════════════════

/// Metadata for one granted rule. Revocation flips `is_active`; rows are
/// never deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionPolicy {
    pub id: Uuid,
    pub subject_type: SubjectType,
    pub subject_id: String,
    pub resource: String,
    pub action: String,
    pub domain: String,
    pub effect: Effect,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub reason: Option<String>,
}

impl PermissionPolicy {
    pub fn subject(&self) -> Subject {
        Subject::new(self.subject_type, self.subject_id.clone())
    }

    /// The engine rule this row describes.
    pub fn rule(&self) -> PolicyRule {
        PolicyRule::new(
            self.subject(),
            self.resource.clone(),
            self.action.clone(),
            self.domain.clone(),
            self.effect,
        )
        .expiring_at(self.expires_at)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(false, |at| at <= now)
    }

    /// Active and not expired.
    pub fn is_effective_at(&self, now: DateTime<Utc>) -> bool {
        self.is_active && !self.is_expired_at(now)
    }

    pub fn key(&self) -> PolicyKey {
        PolicyKey {
            subject: self.subject(),
            resource: self.resource.clone(),
            action: self.action.clone(),
            domain: self.domain.clone(),
            effect: self.effect,
        }
    }
}

/// Metadata for one role link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleAssignment {
    pub id: Uuid,
    pub role_name: String,
    pub subject_type: SubjectType,
    pub subject_id: String,
    pub domain: String,
    pub granted_by: String,
    pub granted_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub is_active: bool,
}

impl RoleAssignment {
    pub fn subject(&self) -> Subject {
        Subject::new(self.subject_type, self.subject_id.clone())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(false, |at| at <= now)
    }

    pub fn is_effective_at(&self, now: DateTime<Utc>) -> bool {
        self.is_active && !self.is_expired_at(now)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Requests
// ═══════════════════════════════════════════════════════════════════════════════

/// Identity of a rule: everything except lifecycle metadata.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PolicyKey {
    pub subject: Subject,
    pub resource: String,
    pub action: String,
    #[serde(default = "default_domain")]
    pub domain: String,
    pub effect: Effect,
}

impl PolicyKey {
    pub fn new(subject: Subject, resource: impl Into<String>, action: impl Into<String>, effect: Effect) -> Self {
        Self {
            subject,
            resource: resource.into(),
            action: action.into(),
            domain: GLOBAL_DOMAIN.to_string(),
            effect,
        }
    }

    pub fn in_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }

    pub fn rule(&self) -> PolicyRule {
        PolicyRule::new(
            self.subject.clone(),
            self.resource.clone(),
            self.action.clone(),
            self.domain.clone(),
            self.effect,
        )
    }
}

/// A grant request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyGrant {
    #[serde(flatten)]
    pub key: PolicyKey,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl PolicyGrant {
    pub fn new(subject: Subject, resource: impl Into<String>, action: impl Into<String>, effect: Effect) -> Self {
        Self {
            key: PolicyKey::new(subject, resource, action, effect),
            expires_at: None,
            reason: None,
        }
    }

    pub fn allow(subject: Subject, resource: impl Into<String>, action: impl Into<String>) -> Self {
        Self::new(subject, resource, action, Effect::Allow)
    }

    pub fn deny(subject: Subject, resource: impl Into<String>, action: impl Into<String>) -> Self {
        Self::new(subject, resource, action, Effect::Deny)
    }

    pub fn in_domain(mut self, domain: impl Into<String>) -> Self {
        self.key.domain = domain.into();
        self
    }

    pub fn expires_at(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// A role assignment request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleGrant {
    pub subject: Subject,
    pub role: String,
    #[serde(default = "default_domain")]
    pub domain: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl RoleGrant {
    pub fn new(subject: Subject, role: impl Into<String>) -> Self {
        Self {
            subject,
            role: role.into(),
            domain: GLOBAL_DOMAIN.to_string(),
            expires_at: None,
        }
    }

    pub fn in_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }

    pub fn expires_at(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }
}

fn default_domain() -> String {
    GLOBAL_DOMAIN.to_string()
}

/// Conjunctive filter for listing policies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyFilter {
    pub subject_type: Option<SubjectType>,
    pub subject_id: Option<String>,
    pub resource: Option<String>,
    pub action: Option<String>,
    pub effect: Option<Effect>,
    #[serde(default = "default_true")]
    pub active_only: bool,
    #[serde(default = "default_limit")]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
}

impl Default for PolicyFilter {
    fn default() -> Self {
        Self {
            subject_type: None,
            subject_id: None,
            resource: None,
            action: None,
            effect: None,
            active_only: true,
            limit: default_limit(),
            offset: 0,
        }
    }
}

impl PolicyFilter {
    pub fn for_subject(subject: &Subject) -> Self {
        Self {
            subject_type: Some(subject.subject_type),
            subject_id: Some(subject.id.clone()),
            ..Default::default()
        }
    }

    pub fn matches(&self, policy: &PermissionPolicy) -> bool {
        (!self.active_only || policy.is_active)
            && self.subject_type.map_or(true, |t| policy.subject_type == t)
            && self.subject_id.as_ref().map_or(true, |id| &policy.subject_id == id)
            && self.resource.as_ref().map_or(true, |r| &policy.resource == r)
            && self.action.as_ref().map_or(true, |a| &policy.action == a)
            && self.effect.map_or(true, |e| policy.effect == e)
    }
}

fn default_true() -> bool {
    true
}

fn default_limit() -> u32 {
    100
}

// ═══════════════════════════════════════════════════════════════════════════════
// Outcomes
// ═══════════════════════════════════════════════════════════════════════════════

/// Result of an idempotent create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "record", rename_all = "snake_case")]
pub enum GrantOutcome<T> {
    Created(T),
    /// An identical active record already existed; nothing was written.
    AlreadyExists(T),
}

impl<T> GrantOutcome<T> {
    pub fn record(&self) -> &T {
        match self {
            Self::Created(r) | Self::AlreadyExists(r) => r,
        }
    }

    pub fn into_record(self) -> T {
        match self {
            Self::Created(r) | Self::AlreadyExists(r) => r,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, Self::Created(_))
    }
}

/// Result of an idempotent revoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RevokeOutcome {
    Revoked,
    /// No active record matched; nothing was changed.
    NotFound,
}

/// Per-item result of a bulk operation.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BulkOutcome {
    pub succeeded: Vec<String>,
    pub failed: Vec<BulkFailure>,
    pub success_count: usize,
    pub failure_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct BulkFailure {
    pub item: String,
    pub error: String,
}

impl BulkOutcome {
    pub fn push_success(&mut self, item: impl Into<String>) {
        self.succeeded.push(item.into());
        self.success_count += 1;
    }

    pub fn push_failure(&mut self, item: impl Into<String>, error: impl std::fmt::Display) {
        self.failed.push(BulkFailure {
            item: item.into(),
            error: error.to_string(),
        });
        self.failure_count += 1;
    }
}

/// Where an effective permission comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "role", rename_all = "snake_case")]
pub enum PermissionSource {
    Direct,
    Role(String),
}

/// One permission that currently applies to a subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EffectivePermission {
    pub resource: String,
    pub action: String,
    pub domain: String,
    pub effect: Effect,
    pub source: PermissionSource,
    pub expires_at: Option<DateTime<Utc>>,
}

/// What `cleanup_expired` deactivated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub policies_deactivated: usize,
    pub roles_deactivated: usize,
}

/// A full replacement of a user's characters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HierarchySync {
    pub user_id: UserId,
    pub characters: Vec<CharacterRecord>,
}
