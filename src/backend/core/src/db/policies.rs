//! `permission_policies` and `role_assignments` tables.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use super::decode;
use crate::error::Result;
use crate::models::Effect;
use crate::policy::{PermissionPolicy, PolicyFilter, PolicyKey, PolicyStore, RoleAssignment};
use crate::subject::{Subject, SubjectType};

const POLICY_COLUMNS: &str = "id, subject_type, subject_id, resource, action, domain, effect, \
                              created_by, created_at, expires_at, is_active, reason";

const ROLE_COLUMNS: &str =
    "id, role_name, subject_type, subject_id, domain, granted_by, granted_at, expires_at, is_active";

#[derive(Clone)]
pub struct PgPolicyStore {
    pool: PgPool,
}

impl PgPolicyStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn fetch_policies(&self, sql: &str, now: DateTime<Utc>) -> Result<Vec<PermissionPolicy>> {
        let rows = sqlx::query_as::<_, PolicyRow>(sql).bind(now).fetch_all(&self.pool).await?;
        rows.into_iter().map(PolicyRow::into_policy).collect()
    }

    async fn fetch_roles(&self, sql: &str, now: DateTime<Utc>) -> Result<Vec<RoleAssignment>> {
        let rows = sqlx::query_as::<_, RoleRow>(sql).bind(now).fetch_all(&self.pool).await?;
        rows.into_iter().map(RoleRow::into_assignment).collect()
    }
}

#[async_trait]
impl PolicyStore for PgPolicyStore {
    async fn find_active_policy(&self, key: &PolicyKey) -> Result<Option<PermissionPolicy>> {
        let row = sqlx::query_as::<_, PolicyRow>(&format!(
            r#"
            SELECT {POLICY_COLUMNS}
            FROM permission_policies
            WHERE subject_type = $1 AND subject_id = $2 AND resource = $3
              AND action = $4 AND domain = $5 AND effect = $6
              AND is_active AND (expires_at IS NULL OR expires_at > NOW())
            LIMIT 1
            "#
        ))
        .bind(key.subject.subject_type.as_str())
        .bind(&key.subject.id)
        .bind(&key.resource)
        .bind(&key.action)
        .bind(&key.domain)
        .bind(key.effect.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(PolicyRow::into_policy).transpose()
    }

    async fn insert_policy(&self, policy: &PermissionPolicy) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        // An expired row still marked active would collide with the partial
        // unique index.
        sqlx::query(
            r#"
            UPDATE permission_policies SET is_active = FALSE
            WHERE subject_type = $1 AND subject_id = $2 AND resource = $3
              AND action = $4 AND domain = $5 AND effect = $6
              AND is_active AND expires_at IS NOT NULL AND expires_at <= NOW()
            "#,
        )
        .bind(policy.subject_type.as_str())
        .bind(&policy.subject_id)
        .bind(&policy.resource)
        .bind(&policy.action)
        .bind(&policy.domain)
        .bind(policy.effect.as_str())
        .execute(&mut *tx)
        .await?;

        sqlx::query(&format!(
            "INSERT INTO permission_policies ({POLICY_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)"
        ))
        .bind(policy.id)
        .bind(policy.subject_type.as_str())
        .bind(&policy.subject_id)
        .bind(&policy.resource)
        .bind(&policy.action)
        .bind(&policy.domain)
        .bind(policy.effect.as_str())
        .bind(&policy.created_by)
        .bind(policy.created_at)
        .bind(policy.expires_at)
        .bind(policy.is_active)
        .bind(&policy.reason)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn deactivate_policy(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("UPDATE permission_policies SET is_active = FALSE WHERE id = $1 AND is_active")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_policies(&self, filter: &PolicyFilter) -> Result<Vec<PermissionPolicy>> {
        let mut query: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT {POLICY_COLUMNS} FROM permission_policies WHERE TRUE"));

        if filter.active_only {
            query.push(" AND is_active");
        }
        if let Some(subject_type) = filter.subject_type {
            query.push(" AND subject_type = ").push_bind(subject_type.as_str());
        }
        if let Some(subject_id) = &filter.subject_id {
            query.push(" AND subject_id = ").push_bind(subject_id.clone());
        }
        if let Some(resource) = &filter.resource {
            query.push(" AND resource = ").push_bind(resource.clone());
        }
        if let Some(action) = &filter.action {
            query.push(" AND action = ").push_bind(action.clone());
        }
        if let Some(effect) = filter.effect {
            query.push(" AND effect = ").push_bind(effect.as_str());
        }
        query
            .push(" ORDER BY created_at DESC LIMIT ")
            .push_bind(filter.limit as i64)
            .push(" OFFSET ")
            .push_bind(filter.offset as i64);

        let rows = query.build_query_as::<PolicyRow>().fetch_all(&self.pool).await?;
        rows.into_iter().map(PolicyRow::into_policy).collect()
    }

    async fn find_active_role(&self, subject: &Subject, role: &str, domain: &str) -> Result<Option<RoleAssignment>> {
        let row = sqlx::query_as::<_, RoleRow>(&format!(
            r#"
            SELECT {ROLE_COLUMNS}
            FROM role_assignments
            WHERE subject_type = $1 AND subject_id = $2 AND role_name = $3 AND domain = $4
              AND is_active AND (expires_at IS NULL OR expires_at > NOW())
            LIMIT 1
            "#
        ))
        .bind(subject.subject_type.as_str())
        .bind(&subject.id)
        .bind(role)
        .bind(domain)
        .fetch_optional(&self.pool)
        .await?;

        row.map(RoleRow::into_assignment).transpose()
    }

    async fn insert_role(&self, assignment: &RoleAssignment) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE role_assignments SET is_active = FALSE
            WHERE subject_type = $1 AND subject_id = $2 AND role_name = $3 AND domain = $4
              AND is_active AND expires_at IS NOT NULL AND expires_at <= NOW()
            "#,
        )
        .bind(assignment.subject_type.as_str())
        .bind(&assignment.subject_id)
        .bind(&assignment.role_name)
        .bind(&assignment.domain)
        .execute(&mut *tx)
        .await?;

        sqlx::query(&format!(
            "INSERT INTO role_assignments ({ROLE_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)"
        ))
        .bind(assignment.id)
        .bind(&assignment.role_name)
        .bind(assignment.subject_type.as_str())
        .bind(&assignment.subject_id)
        .bind(&assignment.domain)
        .bind(&assignment.granted_by)
        .bind(assignment.granted_at)
        .bind(assignment.expires_at)
        .bind(assignment.is_active)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn deactivate_role(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("UPDATE role_assignments SET is_active = FALSE WHERE id = $1 AND is_active")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn active_roles_for_subject(&self, subject: &Subject) -> Result<Vec<RoleAssignment>> {
        let rows = sqlx::query_as::<_, RoleRow>(&format!(
            r#"
            SELECT {ROLE_COLUMNS}
            FROM role_assignments
            WHERE subject_type = $1 AND subject_id = $2
              AND is_active AND (expires_at IS NULL OR expires_at > NOW())
            ORDER BY role_name
            "#
        ))
        .bind(subject.subject_type.as_str())
        .bind(&subject.id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(RoleRow::into_assignment).collect()
    }

    async fn active_policies(&self) -> Result<Vec<PermissionPolicy>> {
        self.fetch_policies(
            &format!(
                "SELECT {POLICY_COLUMNS} FROM permission_policies \
                 WHERE is_active AND (expires_at IS NULL OR expires_at > $1)"
            ),
            Utc::now(),
        )
        .await
    }

    async fn active_roles(&self) -> Result<Vec<RoleAssignment>> {
        self.fetch_roles(
            &format!(
                "SELECT {ROLE_COLUMNS} FROM role_assignments \
                 WHERE is_active AND (expires_at IS NULL OR expires_at > $1)"
            ),
            Utc::now(),
        )
        .await
    }

    async fn expired_policies(&self, now: DateTime<Utc>) -> Result<Vec<PermissionPolicy>> {
        self.fetch_policies(
            &format!(
                "SELECT {POLICY_COLUMNS} FROM permission_policies \
                 WHERE is_active AND expires_at IS NOT NULL AND expires_at <= $1"
            ),
            now,
        )
        .await
    }

    async fn expired_roles(&self, now: DateTime<Utc>) -> Result<Vec<RoleAssignment>> {
        self.fetch_roles(
            &format!(
                "SELECT {ROLE_COLUMNS} FROM role_assignments \
                 WHERE is_active AND expires_at IS NOT NULL AND expires_at <= $1"
            ),
            now,
        )
        .await
    }

    fn name(&self) -> &'static str {
        "postgres"
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Rows
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, sqlx::FromRow)]
struct PolicyRow {
    id: Uuid,
    subject_type: String,
    subject_id: String,
    resource: String,
    action: String,
    domain: String,
    effect: String,
    created_by: String,
    created_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
    is_active: bool,
    reason: Option<String>,
}

impl PolicyRow {
    fn into_policy(self) -> Result<PermissionPolicy> {
        Ok(PermissionPolicy {
            subject_type: decode("subject_type", &self.subject_type, self.subject_type.parse::<SubjectType>().ok())?,
            effect: decode("effect", &self.effect, Effect::parse(&self.effect))?,
            id: self.id,
            subject_id: self.subject_id,
            resource: self.resource,
            action: self.action,
            domain: self.domain,
            created_by: self.created_by,
            created_at: self.created_at,
            expires_at: self.expires_at,
            is_active: self.is_active,
            reason: self.reason,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct RoleRow {
    id: Uuid,
    role_name: String,
    subject_type: String,
    subject_id: String,
    domain: String,
    granted_by: String,
    granted_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
    is_active: bool,
}

impl RoleRow {
    fn into_assignment(self) -> Result<RoleAssignment> {
        Ok(RoleAssignment {
            subject_type: decode("subject_type", &self.subject_type, self.subject_type.parse::<SubjectType>().ok())?,
            id: self.id,
            role_name: self.role_name,
            subject_id: self.subject_id,
            domain: self.domain,
            granted_by: self.granted_by,
            granted_at: self.granted_at,
            expires_at: self.expires_at,
            is_active: self.is_active,
        })
    }
}
