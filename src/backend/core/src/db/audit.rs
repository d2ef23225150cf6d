//! `audit_log` table.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use super::decode;
use crate::audit::{AuditFilter, AuditLogEntry, AuditOperation, AuditPage, AuditResult, AuditSink};
use crate::error::Result;
use crate::models::Effect;
use crate::subject::SubjectType;

#[derive(Clone)]
pub struct PgAuditSink {
    pool: PgPool,
}

impl PgAuditSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn push_filter<'a>(query: &mut QueryBuilder<'a, Postgres>, filter: &'a AuditFilter) {
    query.push(" WHERE TRUE");
    if let Some(operation) = filter.operation {
        query.push(" AND operation = ").push_bind(operation.as_str());
    }
    if let Some(subject_type) = filter.subject_type {
        query.push(" AND subject_type = ").push_bind(subject_type.as_str());
    }
    if let Some(subject_id) = &filter.subject_id {
        query.push(" AND subject_id = ").push_bind(subject_id.as_str());
    }
    if let Some(performed_by) = &filter.performed_by {
        query.push(" AND performed_by = ").push_bind(performed_by.as_str());
    }
    if let Some(since) = filter.since {
        query.push(" AND timestamp >= ").push_bind(since);
    }
    if let Some(until) = filter.until {
        query.push(" AND timestamp < ").push_bind(until);
    }
}

#[async_trait]
impl AuditSink for PgAuditSink {
    async fn append(&self, entry: &AuditLogEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO audit_log
                (id, operation, subject_type, subject_id, resource, action, effect, role,
                 result, performed_by, timestamp, error, details)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(entry.id)
        .bind(entry.operation.as_str())
        .bind(entry.subject_type.map(|t| t.as_str()))
        .bind(&entry.subject_id)
        .bind(&entry.resource)
        .bind(&entry.action)
        .bind(entry.effect.map(|e| e.as_str()))
        .bind(&entry.role)
        .bind(entry.result.map(|r| r.as_str()))
        .bind(&entry.performed_by)
        .bind(entry.timestamp)
        .bind(&entry.error)
        .bind(&entry.details)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn query(&self, filter: &AuditFilter, limit: u32, offset: u32) -> Result<AuditPage> {
        let mut count: QueryBuilder<Postgres> = QueryBuilder::new("SELECT COUNT(*) FROM audit_log");
        push_filter(&mut count, filter);
        let total: i64 = count.build_query_scalar().fetch_one(&self.pool).await?;

        let mut select: QueryBuilder<Postgres> = QueryBuilder::new(
            "SELECT id, operation, subject_type, subject_id, resource, action, effect, role, \
             result, performed_by, timestamp, error, details FROM audit_log",
        );
        push_filter(&mut select, filter);
        select
            .push(" ORDER BY timestamp DESC LIMIT ")
            .push_bind(limit as i64)
            .push(" OFFSET ")
            .push_bind(offset as i64);

        let rows = select.build_query_as::<AuditRow>().fetch_all(&self.pool).await?;
        Ok(AuditPage {
            entries: rows.into_iter().map(AuditRow::into_entry).collect::<Result<_>>()?,
            total: total as u64,
        })
    }

    fn name(&self) -> &'static str {
        "postgres"
    }
}

#[derive(Debug, sqlx::FromRow)]
struct AuditRow {
    id: Uuid,
    operation: String,
    subject_type: Option<String>,
    subject_id: Option<String>,
    resource: Option<String>,
    action: Option<String>,
    effect: Option<String>,
    role: Option<String>,
    result: Option<String>,
    performed_by: String,
    timestamp: DateTime<Utc>,
    error: Option<String>,
    details: Option<serde_json::Value>,
}

impl AuditRow {
    fn into_entry(self) -> Result<AuditLogEntry> {
        let subject_type = match self.subject_type.as_deref() {
            Some(s) => Some(decode("subject_type", s, s.parse::<SubjectType>().ok())?),
            None => None,
        };
        let effect = match self.effect.as_deref() {
            Some(s) => Some(decode("effect", s, Effect::parse(s))?),
            None => None,
        };
        let result = match self.result.as_deref() {
            Some(s) => Some(decode("result", s, AuditResult::parse(s))?),
            None => None,
        };

        Ok(AuditLogEntry {
            id: self.id,
            operation: decode("operation", &self.operation, AuditOperation::parse(&self.operation))?,
            subject_type,
            subject_id: self.subject_id,
            resource: self.resource,
            action: self.action,
            effect,
            role: self.role,
            result,
            performed_by: self.performed_by,
            timestamp: self.timestamp,
            error: self.error,
            details: self.details,
        })
    }
}
