//! In-process rule engine.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::debug;

use super::{EngineDecision, PolicyRule, RuleEngine};
use crate::error::Result;
use crate::models::Effect;
use crate::subject::Subject;

/// Rule engine backed by concurrent maps.
///
/// Cloning shares the underlying state. Within one subject a matching deny
/// overrides a matching allow; expired rules and role links are skipped.
#[derive(Debug, Clone, Default)]
pub struct MemoryRuleEngine {
    rules: Arc<DashMap<Subject, Vec<PolicyRule>>>,
    /// (subject, domain) → role name → expiry
    roles: Arc<DashMap<(Subject, String), BTreeMap<String, Option<DateTime<Utc>>>>>,
}

impl MemoryRuleEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total stored rules across all subjects.
    pub fn rule_count(&self) -> usize {
        self.rules.iter().map(|r| r.value().len()).sum()
    }

    /// Drop every rule and role link.
    pub fn clear(&self) {
        self.rules.clear();
        self.roles.clear();
    }

    fn decide_now(&self, subject: &Subject, resource: &str, action: &str, domain: &str) -> EngineDecision {
        let Some(rules) = self.rules.get(subject) else {
            return EngineDecision::NoMatch;
        };

        let now = Utc::now();
        let mut allowed = false;
        for rule in rules.iter().filter(|r| !r.is_expired_at(now) && r.matches(resource, action, domain)) {
            match rule.effect {
                Effect::Deny => return EngineDecision::Deny,
                Effect::Allow => allowed = true,
            }
        }

        if allowed {
            EngineDecision::Allow
        } else {
            EngineDecision::NoMatch
        }
    }
}

#[async_trait]
impl RuleEngine for MemoryRuleEngine {
    async fn enforce(&self, subject: &Subject, resource: &str, action: &str, domain: &str) -> Result<bool> {
        Ok(self.decide_now(subject, resource, action, domain).is_allowed())
    }

    async fn decide(&self, subject: &Subject, resource: &str, action: &str, domain: &str) -> Result<EngineDecision> {
        Ok(self.decide_now(subject, resource, action, domain))
    }

    async fn add_policy(&self, rule: &PolicyRule) -> Result<bool> {
        let mut rules = self.rules.entry(rule.subject.clone()).or_default();
        if let Some(existing) = rules.iter_mut().find(|r| r.same_rule(rule)) {
            existing.expires_at = rule.expires_at;
            return Ok(false);
        }
        debug!(subject = %rule.subject, resource = %rule.resource, action = %rule.action, effect = %rule.effect, "Rule added");
        rules.push(rule.clone());
        Ok(true)
    }

    async fn remove_policy(&self, rule: &PolicyRule) -> Result<bool> {
        let removed = match self.rules.get_mut(&rule.subject) {
            Some(mut rules) => {
                let before = rules.len();
                rules.retain(|r| !r.same_rule(rule));
                rules.len() != before
            }
            None => false,
        };
        self.rules.remove_if(&rule.subject, |_, rules| rules.is_empty());
        Ok(removed)
    }

    async fn add_role_for_subject(
        &self,
        subject: &Subject,
        role: &str,
        domain: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        Ok(self
            .roles
            .entry((subject.clone(), domain.to_string()))
            .or_default()
            .insert(role.to_string(), expires_at)
            .is_none())
    }

    async fn remove_role_for_subject(&self, subject: &Subject, role: &str, domain: &str) -> Result<bool> {
        let key = (subject.clone(), domain.to_string());
        let removed = self
            .roles
            .get_mut(&key)
            .map_or(false, |mut roles| roles.remove(role).is_some());
        self.roles.remove_if(&key, |_, roles| roles.is_empty());
        Ok(removed)
    }

    async fn roles_for_subject(&self, subject: &Subject, domain: &str) -> Result<Vec<String>> {
        let now = Utc::now();
        let mut roles: BTreeSet<String> = BTreeSet::new();
        for d in [domain, "*"] {
            if let Some(found) = self.roles.get(&(subject.clone(), d.to_string())) {
                roles.extend(
                    found
                        .iter()
                        .filter(|(_, expires_at)| expires_at.map_or(true, |at| at > now))
                        .map(|(role, _)| role.clone()),
                );
            }
        }
        Ok(roles.into_iter().collect())
    }

    async fn permissions_for_subject(&self, subject: &Subject) -> Result<Vec<PolicyRule>> {
        let now = Utc::now();
        Ok(self
            .rules
            .get(subject)
            .map(|rules| rules.iter().filter(|r| !r.is_expired_at(now)).cloned().collect())
            .unwrap_or_default())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::GLOBAL_DOMAIN;

    fn allow(subject: Subject, resource: &str, action: &str) -> PolicyRule {
        PolicyRule::new(subject, resource, action, GLOBAL_DOMAIN, Effect::Allow)
    }

    fn deny(subject: Subject, resource: &str, action: &str) -> PolicyRule {
        PolicyRule::new(subject, resource, action, GLOBAL_DOMAIN, Effect::Deny)
    }

    #[tokio::test]
    async fn test_allow_and_no_match() {
        let engine = MemoryRuleEngine::new();
        let corp = Subject::corporation("CORP1");
        assert!(engine.add_policy(&allow(corp.clone(), "scheduler:tasks", "read")).await.unwrap());

        assert_eq!(
            engine.decide(&corp, "scheduler:tasks", "read", GLOBAL_DOMAIN).await.unwrap(),
            EngineDecision::Allow
        );
        assert_eq!(
            engine.decide(&corp, "scheduler:tasks", "write", GLOBAL_DOMAIN).await.unwrap(),
            EngineDecision::NoMatch
        );
        assert!(!engine.enforce(&Subject::user("U"), "scheduler:tasks", "read", GLOBAL_DOMAIN).await.unwrap());
    }

    #[tokio::test]
    async fn test_deny_overrides_allow_within_subject() {
        let engine = MemoryRuleEngine::new();
        let character = Subject::character("C1");
        engine.add_policy(&allow(character.clone(), "secret:*", "*")).await.unwrap();
        engine.add_policy(&deny(character.clone(), "secret:ops", "execute")).await.unwrap();

        assert_eq!(
            engine.decide(&character, "secret:ops", "execute", GLOBAL_DOMAIN).await.unwrap(),
            EngineDecision::Deny
        );
        assert!(!engine.enforce(&character, "secret:ops", "execute", GLOBAL_DOMAIN).await.unwrap());
        assert!(engine.enforce(&character, "secret:ops", "read", GLOBAL_DOMAIN).await.unwrap());
    }

    #[tokio::test]
    async fn test_duplicate_add_and_remove() {
        let engine = MemoryRuleEngine::new();
        let rule = allow(Subject::user("U"), "a:b", "c");

        assert!(engine.add_policy(&rule).await.unwrap());
        assert!(!engine.add_policy(&rule).await.unwrap());
        assert_eq!(engine.rule_count(), 1);

        assert!(engine.remove_policy(&rule).await.unwrap());
        assert!(!engine.remove_policy(&rule).await.unwrap());
        assert_eq!(engine.rule_count(), 0);
    }

    #[tokio::test]
    async fn test_expired_rules_never_match() {
        let engine = MemoryRuleEngine::new();
        let user = Subject::user("U");
        let rule = allow(user.clone(), "a:b", "c").expiring_at(Some(Utc::now() - chrono::Duration::minutes(1)));
        engine.add_policy(&rule).await.unwrap();

        assert!(!engine.enforce(&user, "a:b", "c", GLOBAL_DOMAIN).await.unwrap());
        assert!(engine.permissions_for_subject(&user).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_roles() {
        let engine = MemoryRuleEngine::new();
        let user = Subject::user("U");

        assert!(engine.add_role_for_subject(&user, "viewer", GLOBAL_DOMAIN, None).await.unwrap());
        assert!(engine.add_role_for_subject(&user, "admin", GLOBAL_DOMAIN, None).await.unwrap());
        assert!(!engine.add_role_for_subject(&user, "admin", GLOBAL_DOMAIN, None).await.unwrap());
        assert_eq!(
            engine.roles_for_subject(&user, GLOBAL_DOMAIN).await.unwrap(),
            vec!["admin".to_string(), "viewer".to_string()]
        );

        assert!(engine.remove_role_for_subject(&user, "admin", GLOBAL_DOMAIN).await.unwrap());
        assert!(!engine.remove_role_for_subject(&user, "admin", GLOBAL_DOMAIN).await.unwrap());
        assert_eq!(engine.roles_for_subject(&user, GLOBAL_DOMAIN).await.unwrap(), vec!["viewer".to_string()]);
        assert!(engine.roles_for_subject(&user, "other").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_expired_role_links_are_not_reported() {
        let engine = MemoryRuleEngine::new();
        let user = Subject::user("U");
        let past = Some(Utc::now() - chrono::Duration::minutes(1));
        let future = Some(Utc::now() + chrono::Duration::minutes(1));

        engine.add_role_for_subject(&user, "auditor", GLOBAL_DOMAIN, past).await.unwrap();
        engine.add_role_for_subject(&user, "viewer", GLOBAL_DOMAIN, future).await.unwrap();
        assert_eq!(engine.roles_for_subject(&user, GLOBAL_DOMAIN).await.unwrap(), vec!["viewer".to_string()]);

        assert!(!engine.add_role_for_subject(&user, "auditor", GLOBAL_DOMAIN, None).await.unwrap());
        assert_eq!(
            engine.roles_for_subject(&user, GLOBAL_DOMAIN).await.unwrap(),
            vec!["auditor".to_string(), "viewer".to_string()]
        );
    }
}
