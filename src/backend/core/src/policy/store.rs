//! Policy and role metadata persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use super::models::{PermissionPolicy, PolicyFilter, PolicyKey, RoleAssignment};
use crate::error::Result;
use crate::subject::Subject;

/// Metadata rows behind the engine's rules.
///
/// "Active" lookups ignore rows whose expiry has passed.
#[async_trait]
pub trait PolicyStore: Send + Sync {
    async fn find_active_policy(&self, key: &PolicyKey) -> Result<Option<PermissionPolicy>>;

    async fn insert_policy(&self, policy: &PermissionPolicy) -> Result<()>;

    /// Mark a policy inactive. `false` when it was not active.
    async fn deactivate_policy(&self, id: Uuid) -> Result<bool>;

    async fn list_policies(&self, filter: &PolicyFilter) -> Result<Vec<PermissionPolicy>>;

    async fn find_active_role(&self, subject: &Subject, role: &str, domain: &str) -> Result<Option<RoleAssignment>>;

    async fn insert_role(&self, assignment: &RoleAssignment) -> Result<()>;

    async fn deactivate_role(&self, id: Uuid) -> Result<bool>;

    async fn active_roles_for_subject(&self, subject: &Subject) -> Result<Vec<RoleAssignment>>;

    /// Every active, unexpired policy (engine rehydration).
    async fn active_policies(&self) -> Result<Vec<PermissionPolicy>>;

    /// Every active, unexpired role link (engine rehydration).
    async fn active_roles(&self) -> Result<Vec<RoleAssignment>>;

    /// Rows still flagged active whose expiry is at or before `now`.
    async fn expired_policies(&self, now: DateTime<Utc>) -> Result<Vec<PermissionPolicy>>;

    async fn expired_roles(&self, now: DateTime<Utc>) -> Result<Vec<RoleAssignment>>;

    fn name(&self) -> &'static str;
}

/// Process-local store.
#[derive(Debug, Default)]
pub struct InMemoryPolicyStore {
    policies: RwLock<Vec<PermissionPolicy>>,
    roles: RwLock<Vec<RoleAssignment>>,
}

impl InMemoryPolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every row ever written, including inactive ones.
    pub fn all_policies(&self) -> Vec<PermissionPolicy> {
        self.policies.read().clone()
    }

    pub fn all_roles(&self) -> Vec<RoleAssignment> {
        self.roles.read().clone()
    }
}

#[async_trait]
impl PolicyStore for InMemoryPolicyStore {
    async fn find_active_policy(&self, key: &PolicyKey) -> Result<Option<PermissionPolicy>> {
        let now = Utc::now();
        Ok(self
            .policies
            .read()
            .iter()
            .find(|p| p.is_effective_at(now) && &p.key() == key)
            .cloned())
    }

    async fn insert_policy(&self, policy: &PermissionPolicy) -> Result<()> {
        self.policies.write().push(policy.clone());
        Ok(())
    }

    async fn deactivate_policy(&self, id: Uuid) -> Result<bool> {
        let mut policies = self.policies.write();
        match policies.iter_mut().find(|p| p.id == id && p.is_active) {
            Some(policy) => {
                policy.is_active = false;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_policies(&self, filter: &PolicyFilter) -> Result<Vec<PermissionPolicy>> {
        let policies = self.policies.read();
        let mut matching: Vec<PermissionPolicy> = policies.iter().filter(|p| filter.matches(p)).cloned().collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(matching
            .into_iter()
            .skip(filter.offset as usize)
            .take(filter.limit as usize)
            .collect())
    }

    async fn find_active_role(&self, subject: &Subject, role: &str, domain: &str) -> Result<Option<RoleAssignment>> {
        let now = Utc::now();
        Ok(self
            .roles
            .read()
            .iter()
            .find(|r| r.is_effective_at(now) && &r.subject() == subject && r.role_name == role && r.domain == domain)
            .cloned())
    }

    async fn insert_role(&self, assignment: &RoleAssignment) -> Result<()> {
        self.roles.write().push(assignment.clone());
        Ok(())
    }

    async fn deactivate_role(&self, id: Uuid) -> Result<bool> {
        let mut roles = self.roles.write();
        match roles.iter_mut().find(|r| r.id == id && r.is_active) {
            Some(role) => {
                role.is_active = false;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn active_roles_for_subject(&self, subject: &Subject) -> Result<Vec<RoleAssignment>> {
        let now = Utc::now();
        Ok(self
            .roles
            .read()
            .iter()
            .filter(|r| r.is_effective_at(now) && &r.subject() == subject)
            .cloned()
            .collect())
    }

    async fn active_policies(&self) -> Result<Vec<PermissionPolicy>> {
        let now = Utc::now();
        Ok(self.policies.read().iter().filter(|p| p.is_effective_at(now)).cloned().collect())
    }

    async fn active_roles(&self) -> Result<Vec<RoleAssignment>> {
        let now = Utc::now();
        Ok(self.roles.read().iter().filter(|r| r.is_effective_at(now)).cloned().collect())
    }

    async fn expired_policies(&self, now: DateTime<Utc>) -> Result<Vec<PermissionPolicy>> {
        Ok(self
            .policies
            .read()
            .iter()
            .filter(|p| p.is_active && p.is_expired_at(now))
            .cloned()
            .collect())
    }

    async fn expired_roles(&self, now: DateTime<Utc>) -> Result<Vec<RoleAssignment>> {
        Ok(self
            .roles
            .read()
            .iter()
            .filter(|r| r.is_active && r.is_expired_at(now))
            .cloned()
            .collect())
    }

    fn name(&self) -> &'static str {
        "in_memory"
    }
}
