//! Policy administration: grants, revocations, role links, hierarchy sync and
//! expiry cleanup.
//!
//! Every mutation goes to the rule engine first and then to the metadata
//! store. A store failure after a successful engine write rolls the engine
//! back so both sides keep describing the same rules. Each successful
//! mutation wipes the decision cache and every mutation, including failed
//! ones, produces an audit entry.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::models::{
    BulkOutcome, CleanupReport, EffectivePermission, GrantOutcome, HierarchySync, PermissionPolicy, PermissionSource,
    PolicyFilter, PolicyGrant, PolicyKey, RevokeOutcome, RoleAssignment, RoleGrant,
};
use super::permission::{validate_role_name, validate_rule_parts, PermissionId};
use super::store::PolicyStore;
use crate::audit::{AuditFilter, AuditLogEntry, AuditOperation, AuditPage, AuditResult};
use crate::context::RequestContext;
use crate::engine::RuleEngine;
use crate::error::{KeystoneError, Result};
use crate::guard::{Evaluation, Evaluator};
use crate::hierarchy::HierarchyContext;
use crate::models::UserId;
use crate::subject::Subject;

/// Administrative operations over the rule engine and its metadata store.
#[derive(Clone)]
pub struct PolicyService {
    engine: Arc<dyn RuleEngine>,
    store: Arc<dyn PolicyStore>,
    evaluator: Evaluator,
}

impl std::fmt::Debug for PolicyService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyService")
            .field("engine", &self.engine.name())
            .field("store", &self.store.name())
            .finish()
    }
}

impl PolicyService {
    /// `evaluator` supplies the cache, hierarchy resolver and audit logger
    /// shared with the guard; `engine` must be the evaluator's engine.
    pub fn new(engine: Arc<dyn RuleEngine>, store: Arc<dyn PolicyStore>, evaluator: Evaluator) -> Self {
        Self {
            engine,
            store,
            evaluator,
        }
    }

    pub fn store(&self) -> &Arc<dyn PolicyStore> {
        &self.store
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Policies
    // ═══════════════════════════════════════════════════════════════════════════

    /// Grant a rule. Granting an identical active rule is a no-op that
    /// returns the existing record.
    pub async fn grant_policy(&self, grant: PolicyGrant, performed_by: &UserId) -> Result<GrantOutcome<PermissionPolicy>> {
        let entry = policy_entry(AuditOperation::Grant, &grant.key, performed_by);

        let result = self.apply_grant(&grant, performed_by).await;
        match &result {
            Ok(GrantOutcome::Created(policy)) => {
                info!(policy_id = %policy.id, subject = %grant.key.subject, resource = %grant.key.resource,
                    action = %grant.key.action, effect = %grant.key.effect, "Policy granted");
                self.record(entry.result(AuditResult::Success).details(json!({ "policy_id": policy.id })))
                    .await;
            }
            Ok(GrantOutcome::AlreadyExists(policy)) => {
                self.record(entry.result(AuditResult::NoOp).details(json!({ "policy_id": policy.id })))
                    .await;
            }
            Err(e) => self.record(entry.failed(e)).await,
        }
        result
    }

    async fn apply_grant(&self, grant: &PolicyGrant, performed_by: &UserId) -> Result<GrantOutcome<PermissionPolicy>> {
        let key = &grant.key;
        validate_subject(&key.subject)?;
        validate_rule_parts(&key.resource, &key.action)?;
        if let Some(at) = grant.expires_at {
            if at <= Utc::now() {
                return Err(KeystoneError::validation("Expiry must be in the future"));
            }
        }

        if let Some(existing) = self.store.find_active_policy(key).await? {
            return Ok(GrantOutcome::AlreadyExists(existing));
        }

        let rule = key.rule().expiring_at(grant.expires_at);
        self.engine.add_policy(&rule).await?;

        let policy = PermissionPolicy {
            id: Uuid::new_v4(),
            subject_type: key.subject.subject_type,
            subject_id: key.subject.id.clone(),
            resource: key.resource.clone(),
            action: key.action.clone(),
            domain: key.domain.clone(),
            effect: key.effect,
            created_by: performed_by.to_string(),
            created_at: Utc::now(),
            expires_at: grant.expires_at,
            is_active: true,
            reason: grant.reason.clone(),
        };

        // The store holds no effective row for this rule, so whatever the
        // engine held before (nothing, or an expired copy) must not stay live.
        if let Err(e) = self.store.insert_policy(&policy).await {
            if let Err(rollback) = self.engine.remove_policy(&rule).await {
                error!(error = %rollback, subject = %key.subject, "Engine rollback failed after store error");
            }
            return Err(e);
        }

        self.invalidate_decisions().await;
        Ok(GrantOutcome::Created(policy))
    }

    /// Revoke the active rule identified by `key`.
    pub async fn revoke_policy(&self, key: PolicyKey, performed_by: &UserId) -> Result<RevokeOutcome> {
        let entry = policy_entry(AuditOperation::Revoke, &key, performed_by);

        let result = self.apply_revoke(&key).await;
        match &result {
            Ok(RevokeOutcome::Revoked) => {
                info!(subject = %key.subject, resource = %key.resource, action = %key.action, "Policy revoked");
                self.record(entry.result(AuditResult::Success)).await;
            }
            Ok(RevokeOutcome::NotFound) => self.record(entry.result(AuditResult::NoOp)).await,
            Err(e) => self.record(entry.failed(e)).await,
        }
        result
    }

    async fn apply_revoke(&self, key: &PolicyKey) -> Result<RevokeOutcome> {
        let Some(existing) = self.store.find_active_policy(key).await? else {
            return Ok(RevokeOutcome::NotFound);
        };

        let rule = existing.rule();
        let removed = self.engine.remove_policy(&rule).await?;

        match self.store.deactivate_policy(existing.id).await {
            Ok(_) => {}
            Err(e) => {
                if removed {
                    if let Err(rollback) = self.engine.add_policy(&rule).await {
                        error!(error = %rollback, subject = %key.subject, "Engine rollback failed after store error");
                    }
                }
                return Err(e);
            }
        }

        self.invalidate_decisions().await;
        Ok(RevokeOutcome::Revoked)
    }

    pub async fn list_policies(&self, filter: &PolicyFilter) -> Result<Vec<PermissionPolicy>> {
        self.store.list_policies(filter).await
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Roles
    // ═══════════════════════════════════════════════════════════════════════════

    /// Link `grant.subject` to a role. Assigning an existing active link is
    /// a no-op.
    pub async fn assign_role(&self, grant: RoleGrant, performed_by: &UserId) -> Result<GrantOutcome<RoleAssignment>> {
        let entry = AuditLogEntry::new(AuditOperation::AssignRole, performed_by.as_str())
            .subject(&grant.subject)
            .role(grant.role.clone());

        let result = self.apply_assign(&grant, performed_by).await;
        match &result {
            Ok(GrantOutcome::Created(assignment)) => {
                info!(subject = %grant.subject, role = %grant.role, domain = %grant.domain, "Role assigned");
                self.record(entry.result(AuditResult::Success).details(json!({ "assignment_id": assignment.id })))
                    .await;
            }
            Ok(GrantOutcome::AlreadyExists(_)) => self.record(entry.result(AuditResult::NoOp)).await,
            Err(e) => self.record(entry.failed(e)).await,
        }
        result
    }

    async fn apply_assign(&self, grant: &RoleGrant, performed_by: &UserId) -> Result<GrantOutcome<RoleAssignment>> {
        validate_subject(&grant.subject)?;
        validate_role_name(&grant.role)?;

        if let Some(existing) = self
            .store
            .find_active_role(&grant.subject, &grant.role, &grant.domain)
            .await?
        {
            return Ok(GrantOutcome::AlreadyExists(existing));
        }

        self.engine
            .add_role_for_subject(&grant.subject, &grant.role, &grant.domain, grant.expires_at)
            .await?;

        let assignment = RoleAssignment {
            id: Uuid::new_v4(),
            role_name: grant.role.clone(),
            subject_type: grant.subject.subject_type,
            subject_id: grant.subject.id.clone(),
            domain: grant.domain.clone(),
            granted_by: performed_by.to_string(),
            granted_at: Utc::now(),
            expires_at: grant.expires_at,
            is_active: true,
        };

        if let Err(e) = self.store.insert_role(&assignment).await {
            if let Err(rollback) = self
                .engine
                .remove_role_for_subject(&grant.subject, &grant.role, &grant.domain)
                .await
            {
                error!(error = %rollback, subject = %grant.subject, "Engine rollback failed after store error");
            }
            return Err(e);
        }

        self.invalidate_decisions().await;
        Ok(GrantOutcome::Created(assignment))
    }

    pub async fn revoke_role(
        &self,
        subject: &Subject,
        role: &str,
        domain: &str,
        performed_by: &UserId,
    ) -> Result<RevokeOutcome> {
        let entry = AuditLogEntry::new(AuditOperation::RevokeRole, performed_by.as_str())
            .subject(subject)
            .role(role);

        let result = self.apply_revoke_role(subject, role, domain).await;
        match &result {
            Ok(RevokeOutcome::Revoked) => {
                info!(subject = %subject, role, domain, "Role revoked");
                self.record(entry.result(AuditResult::Success)).await;
            }
            Ok(RevokeOutcome::NotFound) => self.record(entry.result(AuditResult::NoOp)).await,
            Err(e) => self.record(entry.failed(e)).await,
        }
        result
    }

    async fn apply_revoke_role(&self, subject: &Subject, role: &str, domain: &str) -> Result<RevokeOutcome> {
        let Some(existing) = self.store.find_active_role(subject, role, domain).await? else {
            return Ok(RevokeOutcome::NotFound);
        };

        let removed = self.engine.remove_role_for_subject(subject, role, domain).await?;

        if let Err(e) = self.store.deactivate_role(existing.id).await {
            if removed {
                if let Err(rollback) = self
                    .engine
                    .add_role_for_subject(subject, role, domain, existing.expires_at)
                    .await
                {
                    error!(error = %rollback, subject = %subject, "Engine rollback failed after store error");
                }
            }
            return Err(e);
        }

        self.invalidate_decisions().await;
        Ok(RevokeOutcome::Revoked)
    }

    /// Assign one role to many subjects, reporting each subject separately.
    pub async fn bulk_assign_role(
        &self,
        subjects: Vec<Subject>,
        role: &str,
        domain: &str,
        performed_by: &UserId,
    ) -> BulkOutcome {
        let mut outcome = BulkOutcome::default();
        for subject in subjects {
            let item = subject.to_string();
            let grant = RoleGrant::new(subject, role).in_domain(domain);
            match self.assign_role(grant, performed_by).await {
                Ok(_) => outcome.push_success(item),
                Err(e) => outcome.push_failure(item, e.user_message()),
            }
        }
        outcome
    }

    /// Active, unexpired role names held directly by the user.
    pub async fn get_user_roles(&self, user_id: &UserId) -> Result<Vec<String>> {
        let now = Utc::now();
        let roles: BTreeSet<String> = self
            .store
            .active_roles_for_subject(&Subject::user(user_id))
            .await?
            .into_iter()
            .filter(|r| r.is_effective_at(now))
            .map(|r| r.role_name)
            .collect();
        Ok(roles.into_iter().collect())
    }

    /// Direct rules of `subject` plus rules inherited through its roles.
    pub async fn get_effective_permissions(&self, subject: &Subject) -> Result<Vec<EffectivePermission>> {
        let mut permissions: Vec<EffectivePermission> = self
            .engine
            .permissions_for_subject(subject)
            .await?
            .into_iter()
            .map(|rule| EffectivePermission {
                resource: rule.resource,
                action: rule.action,
                domain: rule.domain,
                effect: rule.effect,
                source: PermissionSource::Direct,
                expires_at: rule.expires_at,
            })
            .collect();

        let roles = self
            .engine
            .roles_for_subject(subject, self.evaluator.options().domain())
            .await?;
        for role in roles {
            let inherited = self.engine.permissions_for_subject(&Subject::role(&role)).await?;
            permissions.extend(inherited.into_iter().map(|rule| EffectivePermission {
                resource: rule.resource,
                action: rule.action,
                domain: rule.domain,
                effect: rule.effect,
                source: PermissionSource::Role(role.clone()),
                expires_at: rule.expires_at,
            }));
        }

        Ok(permissions)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Evaluation and hierarchy
    // ═══════════════════════════════════════════════════════════════════════════

    /// Evaluate `permission` for `user_id`, bypassing the decision cache.
    pub async fn check_permission(&self, user_id: &UserId, permission: &str, ctx: &RequestContext) -> Result<Evaluation> {
        let permission = PermissionId::parse(permission)?;
        self.evaluator
            .evaluate_uncached(user_id, &permission, ctx)
            .await
            .map_err(KeystoneError::from)
    }

    /// Replace a user's characters wholesale.
    pub async fn sync_hierarchy(&self, sync: HierarchySync, performed_by: &UserId) -> Result<HierarchyContext> {
        let entry = AuditLogEntry::new(AuditOperation::Sync, performed_by.as_str())
            .subject(&Subject::user(&sync.user_id))
            .details(json!({ "characters": sync.characters.len() }));

        let result = self.apply_sync(&sync).await;
        match &result {
            Ok(context) => {
                info!(user_id = %sync.user_id, characters = context.characters.len(), "Hierarchy synchronized");
                self.record(entry.result(AuditResult::Success)).await;
            }
            Err(e) => self.record(entry.failed(e)).await,
        }
        result
    }

    async fn apply_sync(&self, sync: &HierarchySync) -> Result<HierarchyContext> {
        if sync.user_id.as_str().is_empty() {
            return Err(KeystoneError::validation("User id must not be empty"));
        }
        let context = HierarchyContext::from_characters(sync.user_id.clone(), sync.characters.clone())
            .map_err(|e| KeystoneError::validation(e.to_string()))?;

        self.evaluator
            .resolver()
            .directory()
            .replace_characters(&sync.user_id, &sync.characters)
            .await?;

        self.evaluator.resolver().invalidate(&sync.user_id).await;
        self.invalidate_decisions().await;
        Ok(context)
    }

    pub async fn hierarchy_for_user(&self, user_id: &UserId, ctx: &RequestContext) -> Result<HierarchyContext> {
        self.evaluator
            .resolver()
            .resolve(user_id, ctx)
            .await
            .map_err(KeystoneError::from)
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // Maintenance
    // ═══════════════════════════════════════════════════════════════════════════

    /// Deactivate every expired policy and role link and drop them from the
    /// engine.
    pub async fn cleanup_expired(&self, performed_by: &UserId) -> Result<CleanupReport> {
        let now = Utc::now();
        let mut report = CleanupReport::default();

        for policy in self.store.expired_policies(now).await? {
            if let Err(e) = self.engine.remove_policy(&policy.rule()).await {
                warn!(policy_id = %policy.id, error = %e, "Failed to drop expired rule from engine");
                continue;
            }
            if self.store.deactivate_policy(policy.id).await? {
                report.policies_deactivated += 1;
            }
        }

        for role in self.store.expired_roles(now).await? {
            let subject = role.subject();
            if let Err(e) = self
                .engine
                .remove_role_for_subject(&subject, &role.role_name, &role.domain)
                .await
            {
                warn!(assignment_id = %role.id, error = %e, "Failed to drop expired role from engine");
                continue;
            }
            if self.store.deactivate_role(role.id).await? {
                report.roles_deactivated += 1;
            }
        }

        if report.policies_deactivated + report.roles_deactivated > 0 {
            self.invalidate_decisions().await;
            info!(
                policies = report.policies_deactivated,
                roles = report.roles_deactivated,
                "Expired grants cleaned up"
            );
        }

        self.record(
            AuditLogEntry::new(AuditOperation::Cleanup, performed_by.as_str())
                .result(AuditResult::Success)
                .details(json!(report)),
        )
        .await;

        Ok(report)
    }

    /// Load every active, unexpired record from the store into the engine.
    /// Returns the number of rules and role links loaded.
    pub async fn rehydrate_engine(&self) -> Result<(usize, usize)> {
        let now = Utc::now();
        let mut rules = 0;
        for policy in self.store.active_policies().await? {
            if policy.is_effective_at(now) {
                self.engine.add_policy(&policy.rule()).await?;
                rules += 1;
            }
        }

        let mut roles = 0;
        for role in self.store.active_roles().await? {
            if role.is_effective_at(now) {
                self.engine
                    .add_role_for_subject(&role.subject(), &role.role_name, &role.domain, role.expires_at)
                    .await?;
                roles += 1;
            }
        }

        self.invalidate_decisions().await;
        info!(rules, roles, engine = self.engine.name(), store = self.store.name(), "Rule engine rehydrated");
        Ok((rules, roles))
    }

    pub async fn query_audit(&self, filter: &AuditFilter, limit: u32, offset: u32) -> Result<AuditPage> {
        self.evaluator.audit().query(filter, limit, offset).await
    }

    async fn invalidate_decisions(&self) {
        match self.evaluator.cache().invalidate_decisions().await {
            Ok(removed) => tracing::debug!(removed, "Decision cache invalidated"),
            Err(e) => error!(error = %e, "Decision cache invalidation failed"),
        }
    }

    async fn record(&self, entry: AuditLogEntry) {
        self.evaluator.audit().record(entry).await;
    }
}

fn policy_entry(operation: AuditOperation, key: &PolicyKey, performed_by: &UserId) -> AuditLogEntry {
    AuditLogEntry::new(operation, performed_by.as_str())
        .subject(&key.subject)
        .resource(key.resource.clone())
        .action(key.action.clone())
        .effect(key.effect)
}

fn validate_subject(subject: &Subject) -> Result<()> {
    if subject.id.trim().is_empty() {
        return Err(KeystoneError::validation("Subject id must not be empty"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditLogger, InMemoryAuditSink};
    use crate::cache::AuthzCache;
    use crate::engine::MemoryRuleEngine;
    use crate::error::ErrorCode;
    use crate::guard::GuardOptions;
    use crate::hierarchy::{CharacterRecord, HierarchyResolver, InMemoryDirectory};
    use crate::policy::InMemoryPolicyStore;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;

    struct Harness {
        service: PolicyService,
        engine: MemoryRuleEngine,
        store: Arc<InMemoryPolicyStore>,
        sink: Arc<InMemoryAuditSink>,
    }

    fn harness_with_store(store: Arc<dyn PolicyStore>) -> (PolicyService, MemoryRuleEngine, Arc<InMemoryAuditSink>) {
        let engine = MemoryRuleEngine::new();
        let sink = Arc::new(InMemoryAuditSink::new());
        let cache = AuthzCache::in_memory();
        let evaluator = Evaluator::new(
            Arc::new(engine.clone()),
            HierarchyResolver::new(Arc::new(InMemoryDirectory::new()), cache.clone()),
            cache,
            AuditLogger::inline(sink.clone()),
            Arc::new(GuardOptions::development()),
        );
        let service = PolicyService::new(Arc::new(engine.clone()), store, evaluator);
        (service, engine, sink)
    }

    fn harness() -> Harness {
        let store = Arc::new(InMemoryPolicyStore::new());
        let (service, engine, sink) = harness_with_store(store.clone());
        Harness {
            service,
            engine,
            store,
            sink,
        }
    }

    fn admin() -> UserId {
        UserId::new("admin")
    }

    #[tokio::test]
    async fn test_grant_is_idempotent() {
        let h = harness();
        let grant = PolicyGrant::allow(Subject::corporation("CORP1"), "scheduler:tasks", "read");

        let first = h.service.grant_policy(grant.clone(), &admin()).await.unwrap();
        let second = h.service.grant_policy(grant, &admin()).await.unwrap();

        assert!(first.is_created());
        assert!(!second.is_created());
        assert_eq!(first.record().id, second.record().id);
        assert_eq!(h.store.all_policies().len(), 1);
        assert_eq!(h.engine.rule_count(), 1);

        let results: Vec<_> = h.sink.snapshot().into_iter().map(|e| e.result).collect();
        assert_eq!(results, vec![Some(AuditResult::Success), Some(AuditResult::NoOp)]);
    }

    #[tokio::test]
    async fn test_revoke_then_revoke_again() {
        let h = harness();
        let grant = PolicyGrant::deny(Subject::character("C1"), "scheduler:tasks", "delete");
        h.service.grant_policy(grant.clone(), &admin()).await.unwrap();

        assert_eq!(
            h.service.revoke_policy(grant.key.clone(), &admin()).await.unwrap(),
            RevokeOutcome::Revoked
        );
        assert_eq!(
            h.service.revoke_policy(grant.key, &admin()).await.unwrap(),
            RevokeOutcome::NotFound
        );
        assert_eq!(h.engine.rule_count(), 0);

        let rows = h.store.all_policies();
        assert_eq!(rows.len(), 1);
        assert!(!rows[0].is_active);
    }

    #[tokio::test]
    async fn test_invalid_grant_is_rejected_and_audited() {
        let h = harness();
        let grant = PolicyGrant::allow(Subject::user("U"), "a:b:c", "read");

        let err = h.service.grant_policy(grant, &admin()).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidPermission);

        let entries = h.sink.snapshot();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].result, Some(AuditResult::Failure));
        assert!(entries[0].error.is_some());
    }

    #[tokio::test]
    async fn test_past_expiry_is_rejected() {
        let h = harness();
        let grant = PolicyGrant::allow(Subject::user("U"), "scheduler:tasks", "read")
            .expires_at(Utc::now() - ChronoDuration::minutes(1));

        let err = h.service.grant_policy(grant, &admin()).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ValidationError);
    }

    #[tokio::test]
    async fn test_role_round_trip() {
        let h = harness();
        let user = Subject::user("U");

        let outcome = h
            .service
            .assign_role(RoleGrant::new(user.clone(), "admin"), &admin())
            .await
            .unwrap();
        assert!(outcome.is_created());
        assert_eq!(h.service.get_user_roles(&UserId::new("U")).await.unwrap(), vec!["admin"]);

        let revoked = h
            .service
            .revoke_role(&user, "admin", crate::models::GLOBAL_DOMAIN, &admin())
            .await
            .unwrap();
        assert_eq!(revoked, RevokeOutcome::Revoked);
        assert!(h.service.get_user_roles(&UserId::new("U")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_bulk_assign_reports_each_item() {
        let h = harness();
        let outcome = h
            .service
            .bulk_assign_role(
                vec![Subject::user("U1"), Subject::user(""), Subject::user("U2")],
                "viewer",
                crate::models::GLOBAL_DOMAIN,
                &admin(),
            )
            .await;

        assert_eq!(outcome.success_count, 2);
        assert_eq!(outcome.failure_count, 1);
        assert_eq!(outcome.failed[0].item, "user:");
    }

    #[tokio::test]
    async fn test_effective_permissions_include_role_rules() {
        let h = harness();
        let user = Subject::user("U");
        h.service
            .grant_policy(PolicyGrant::allow(user.clone(), "scheduler:tasks", "read"), &admin())
            .await
            .unwrap();
        h.service
            .grant_policy(PolicyGrant::allow(Subject::role("ops"), "scheduler:*", "*"), &admin())
            .await
            .unwrap();
        h.service
            .assign_role(RoleGrant::new(user.clone(), "ops"), &admin())
            .await
            .unwrap();

        let permissions = h.service.get_effective_permissions(&user).await.unwrap();
        assert_eq!(permissions.len(), 2);
        assert!(permissions.iter().any(|p| p.source == PermissionSource::Direct));
        assert!(permissions
            .iter()
            .any(|p| p.source == PermissionSource::Role("ops".into()) && p.resource == "scheduler:*"));
    }

    #[tokio::test]
    async fn test_sync_rejects_two_primaries() {
        let h = harness();
        let sync = HierarchySync {
            user_id: UserId::new("U"),
            characters: vec![
                CharacterRecord::new("C1", "A", "CORP1").primary(),
                CharacterRecord::new("C2", "B", "CORP1").primary(),
            ],
        };

        let err = h.service.sync_hierarchy(sync, &admin()).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ValidationError);
    }

    #[tokio::test]
    async fn test_sync_then_check_inherits_corporation_grant() {
        let h = harness();
        h.service
            .sync_hierarchy(
                HierarchySync {
                    user_id: UserId::new("U"),
                    characters: vec![CharacterRecord::new("C1", "Main", "CORP1").primary()],
                },
                &admin(),
            )
            .await
            .unwrap();
        h.service
            .grant_policy(PolicyGrant::allow(Subject::corporation("CORP1"), "scheduler:tasks", "read"), &admin())
            .await
            .unwrap();

        let evaluation = h
            .service
            .check_permission(&UserId::new("U"), "scheduler:tasks:read", &RequestContext::new())
            .await
            .unwrap();
        assert!(evaluation.allowed);
        assert_eq!(evaluation.matched_subject, Some(Subject::corporation("CORP1")));
    }

    #[tokio::test]
    async fn test_cleanup_deactivates_expired_rows() {
        let h = harness();
        let expired = PermissionPolicy {
            id: Uuid::new_v4(),
            subject_type: crate::subject::SubjectType::User,
            subject_id: "U".into(),
            resource: "scheduler:tasks".into(),
            action: "read".into(),
            domain: crate::models::GLOBAL_DOMAIN.into(),
            effect: crate::models::Effect::Allow,
            created_by: "admin".into(),
            created_at: Utc::now() - ChronoDuration::hours(2),
            expires_at: Some(Utc::now() - ChronoDuration::hours(1)),
            is_active: true,
            reason: None,
        };
        h.store.insert_policy(&expired).await.unwrap();
        h.engine.add_policy(&expired.rule()).await.unwrap();

        let report = h.service.cleanup_expired(&admin()).await.unwrap();
        assert_eq!(report.policies_deactivated, 1);
        assert_eq!(h.engine.rule_count(), 0);
        assert!(!h.store.all_policies()[0].is_active);
    }

    #[tokio::test]
    async fn test_rehydrate_loads_active_rows() {
        let h = harness();
        h.service
            .grant_policy(PolicyGrant::allow(Subject::user("U"), "scheduler:tasks", "read"), &admin())
            .await
            .unwrap();
        h.engine.clear();

        let (rules, roles) = h.service.rehydrate_engine().await.unwrap();
        assert_eq!((rules, roles), (1, 0));
        assert_eq!(h.engine.rule_count(), 1);
    }

    struct FailingInsertStore(InMemoryPolicyStore);

    #[async_trait]
    impl PolicyStore for FailingInsertStore {
        async fn find_active_policy(&self, key: &PolicyKey) -> Result<Option<PermissionPolicy>> {
            self.0.find_active_policy(key).await
        }
        async fn insert_policy(&self, _: &PermissionPolicy) -> Result<()> {
            Err(KeystoneError::internal("disk full"))
        }
        async fn deactivate_policy(&self, id: Uuid) -> Result<bool> {
            self.0.deactivate_policy(id).await
        }
        async fn list_policies(&self, filter: &PolicyFilter) -> Result<Vec<PermissionPolicy>> {
            self.0.list_policies(filter).await
        }
        async fn find_active_role(&self, subject: &Subject, role: &str, domain: &str) -> Result<Option<RoleAssignment>> {
            self.0.find_active_role(subject, role, domain).await
        }
        async fn insert_role(&self, _: &RoleAssignment) -> Result<()> {
            Err(KeystoneError::internal("disk full"))
        }
        async fn deactivate_role(&self, id: Uuid) -> Result<bool> {
            self.0.deactivate_role(id).await
        }
        async fn active_roles_for_subject(&self, subject: &Subject) -> Result<Vec<RoleAssignment>> {
            self.0.active_roles_for_subject(subject).await
        }
        async fn active_policies(&self) -> Result<Vec<PermissionPolicy>> {
            self.0.active_policies().await
        }
        async fn active_roles(&self) -> Result<Vec<RoleAssignment>> {
            self.0.active_roles().await
        }
        async fn expired_policies(&self, now: chrono::DateTime<Utc>) -> Result<Vec<PermissionPolicy>> {
            self.0.expired_policies(now).await
        }
        async fn expired_roles(&self, now: chrono::DateTime<Utc>) -> Result<Vec<RoleAssignment>> {
            self.0.expired_roles(now).await
        }
        fn name(&self) -> &'static str {
            "failing"
        }
    }

    #[tokio::test]
    async fn test_store_failure_rolls_back_engine() {
        let (service, engine, sink) = harness_with_store(Arc::new(FailingInsertStore(InMemoryPolicyStore::new())));

        let grant = PolicyGrant::allow(Subject::user("U"), "scheduler:tasks", "read");
        assert!(service.grant_policy(grant, &admin()).await.is_err());
        assert_eq!(engine.rule_count(), 0);

        assert!(service
            .assign_role(RoleGrant::new(Subject::user("U"), "admin"), &admin())
            .await
            .is_err());
        assert!(engine
            .roles_for_subject(&Subject::user("U"), crate::models::GLOBAL_DOMAIN)
            .await
            .unwrap()
            .is_empty());

        assert!(sink.snapshot().iter().all(|e| e.result == Some(AuditResult::Failure)));
    }

    #[tokio::test]
    async fn test_store_failure_does_not_revive_expired_engine_state() {
        let (service, engine, _) = harness_with_store(Arc::new(FailingInsertStore(InMemoryPolicyStore::new())));
        let user = Subject::user("U");
        let lapsed = Some(Utc::now() - ChronoDuration::minutes(1));

        let grant = PolicyGrant::allow(user.clone(), "scheduler:tasks", "read");
        engine.add_policy(&grant.key.rule().expiring_at(lapsed)).await.unwrap();
        engine
            .add_role_for_subject(&user, "admin", crate::models::GLOBAL_DOMAIN, lapsed)
            .await
            .unwrap();

        assert!(service.grant_policy(grant, &admin()).await.is_err());
        assert!(!engine
            .enforce(&user, "scheduler:tasks", "read", crate::models::GLOBAL_DOMAIN)
            .await
            .unwrap());
        assert_eq!(engine.rule_count(), 0);

        assert!(service.assign_role(RoleGrant::new(user.clone(), "admin"), &admin()).await.is_err());
        assert!(engine
            .roles_for_subject(&user, crate::models::GLOBAL_DOMAIN)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_expired_role_drops_out_of_effective_permissions() {
        let h = harness();
        let user = Subject::user("U");
        h.service
            .grant_policy(PolicyGrant::allow(Subject::role("ops"), "scheduler:*", "*"), &admin())
            .await
            .unwrap();
        h.service
            .assign_role(
                RoleGrant::new(user.clone(), "ops").expires_at(Utc::now() + ChronoDuration::milliseconds(100)),
                &admin(),
            )
            .await
            .unwrap();
        assert_eq!(h.service.get_effective_permissions(&user).await.unwrap().len(), 1);

        tokio::time::sleep(std::time::Duration::from_millis(150)).await;
        assert!(h.service.get_effective_permissions(&user).await.unwrap().is_empty());
        assert!(h.service.get_user_roles(&UserId::new("U")).await.unwrap().is_empty());
    }
}
