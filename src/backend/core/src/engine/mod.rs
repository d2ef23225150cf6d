//! Rule engine collaborator.
//!
//! The engine stores `(subject, resource, action, domain, effect)` rules and
//! subject → role links, and answers one question per subject. Ordering
//! subjects and combining their answers is the evaluator's job; the engine
//! only combines the rules of a single subject, where a matching deny
//! overrides a matching allow.

mod memory;

pub use memory::MemoryRuleEngine;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::models::Effect;
use crate::subject::Subject;

// ═══════════════════════════════════════════════════════════════════════════════
// Rules
// ═══════════════════════════════════════════════════════════════════════════════

/// One stored rule.
///
/// `resource` and `action` accept `*` as a wildcard; `resource` also accepts
/// a trailing `:*` segment (`scheduler:*`). `domain` is either exact or `*`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRule {
    pub subject: Subject,
    pub resource: String,
    pub action: String,
    pub domain: String,
    pub effect: Effect,
    /// Rules past this instant never match.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl PolicyRule {
    pub fn new(
        subject: Subject,
        resource: impl Into<String>,
        action: impl Into<String>,
        domain: impl Into<String>,
        effect: Effect,
    ) -> Self {
        Self {
            subject,
            resource: resource.into(),
            action: action.into(),
            domain: domain.into(),
            effect,
            expires_at: None,
        }
    }

    pub fn expiring_at(mut self, expires_at: Option<DateTime<Utc>>) -> Self {
        self.expires_at = expires_at;
        self
    }

    /// Same rule regardless of expiry.
    pub fn same_rule(&self, other: &PolicyRule) -> bool {
        self.subject == other.subject
            && self.resource == other.resource
            && self.action == other.action
            && self.domain == other.domain
            && self.effect == other.effect
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(false, |at| at <= now)
    }

    /// Whether this rule applies to `(resource, action, domain)`.
    pub fn matches(&self, resource: &str, action: &str, domain: &str) -> bool {
        matches_resource(&self.resource, resource)
            && (self.action == "*" || self.action == action)
            && (self.domain == "*" || self.domain == domain)
    }
}

fn matches_resource(pattern: &str, resource: &str) -> bool {
    if pattern == "*" || pattern == resource {
        return true;
    }
    match pattern.strip_suffix(":*") {
        Some(prefix) => resource
            .strip_prefix(prefix)
            .map_or(false, |rest| rest.starts_with(':')),
        None => false,
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Decision
// ═══════════════════════════════════════════════════════════════════════════════

/// A single subject's answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineDecision {
    Allow,
    Deny,
    /// No rule of this subject applies.
    NoMatch,
}

impl EngineDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Engine Contract
// ═══════════════════════════════════════════════════════════════════════════════

/// Stores rules and evaluates one subject at a time.
///
/// Implementations are shared across requests and must be safe for
/// concurrent use.
#[async_trait]
pub trait RuleEngine: Send + Sync {
    /// Whether `subject` is granted `(resource, action)` in `domain`.
    async fn enforce(&self, subject: &Subject, resource: &str, action: &str, domain: &str) -> Result<bool>;

    /// Three-way answer. Engines that cannot tell an explicit deny from no
    /// match report [`EngineDecision::NoMatch`] for every non-grant.
    async fn decide(&self, subject: &Subject, resource: &str, action: &str, domain: &str) -> Result<EngineDecision> {
        Ok(if self.enforce(subject, resource, action, domain).await? {
            EngineDecision::Allow
        } else {
            EngineDecision::NoMatch
        })
    }

    /// Store a rule. `false` when an identical rule was already present.
    async fn add_policy(&self, rule: &PolicyRule) -> Result<bool>;

    /// Remove a rule. `false` when no identical rule was present.
    async fn remove_policy(&self, rule: &PolicyRule) -> Result<bool>;

    /// Link `subject` to `role`. Links past `expires_at` are no longer
    /// reported. `false` when the link was already present; its expiry is
    /// updated.
    async fn add_role_for_subject(
        &self,
        subject: &Subject,
        role: &str,
        domain: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<bool>;

    async fn remove_role_for_subject(&self, subject: &Subject, role: &str, domain: &str) -> Result<bool>;

    /// Unexpired roles linked to `subject` in `domain`, sorted by name.
    async fn roles_for_subject(&self, subject: &Subject, domain: &str) -> Result<Vec<String>>;

    /// Rules stored directly on `subject`.
    async fn permissions_for_subject(&self, subject: &Subject) -> Result<Vec<PolicyRule>>;

    fn name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(resource: &str, action: &str, domain: &str) -> PolicyRule {
        PolicyRule::new(Subject::user("u"), resource, action, domain, Effect::Allow)
    }

    #[test]
    fn test_rule_matching() {
        assert!(rule("scheduler:tasks", "read", "global").matches("scheduler:tasks", "read", "global"));
        assert!(!rule("scheduler:tasks", "read", "global").matches("scheduler:tasks", "write", "global"));
        assert!(rule("scheduler:tasks", "*", "global").matches("scheduler:tasks", "write", "global"));
        assert!(rule("*", "*", "*").matches("anything:x", "y", "tenant-1"));
        assert!(!rule("scheduler:tasks", "read", "other").matches("scheduler:tasks", "read", "global"));
    }

    #[test]
    fn test_resource_prefix_wildcard() {
        let r = rule("scheduler:*", "read", "global");
        assert!(r.matches("scheduler:tasks", "read", "global"));
        assert!(!r.matches("schedulerx:tasks", "read", "global"));
        assert!(!r.matches("sitemap:admin", "read", "global"));
    }

    #[test]
    fn test_same_rule_ignores_expiry() {
        let a = rule("a:b", "c", "global");
        let b = a.clone().expiring_at(Some(Utc::now()));
        assert!(a.same_rule(&b));
        assert_ne!(a, b);
        assert!(b.is_expired_at(Utc::now() + chrono::Duration::seconds(1)));
        assert!(!a.is_expired_at(Utc::now()));
    }
}
