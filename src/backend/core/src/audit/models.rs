//! Audit log entries and query filters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::models::Effect;
use crate::subject::{Subject, SubjectType};

/// What kind of action an entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOperation {
    Grant,
    Revoke,
    AssignRole,
    RevokeRole,
    Check,
    Sync,
    Cleanup,
}

impl AuditOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Grant => "grant",
            Self::Revoke => "revoke",
            Self::AssignRole => "assign_role",
            Self::RevokeRole => "revoke_role",
            Self::Check => "check",
            Self::Sync => "sync",
            Self::Cleanup => "cleanup",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "grant" => Some(Self::Grant),
            "revoke" => Some(Self::Revoke),
            "assign_role" => Some(Self::AssignRole),
            "revoke_role" => Some(Self::RevokeRole),
            "check" => Some(Self::Check),
            "sync" => Some(Self::Sync),
            "cleanup" => Some(Self::Cleanup),
            _ => None,
        }
    }
}

impl fmt::Display for AuditOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the recorded action ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditResult {
    Success,
    /// The change was already in effect (or already absent).
    NoOp,
    Failure,
    Allowed,
    Denied,
    /// Evaluation was unavailable and the guard degraded to auth-only.
    Fallback,
}

impl AuditResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::NoOp => "no_op",
            Self::Failure => "failure",
            Self::Allowed => "allowed",
            Self::Denied => "denied",
            Self::Fallback => "fallback",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "success" => Some(Self::Success),
            "no_op" => Some(Self::NoOp),
            "failure" => Some(Self::Failure),
            "allowed" => Some(Self::Allowed),
            "denied" => Some(Self::Denied),
            "fallback" => Some(Self::Fallback),
            _ => None,
        }
    }
}

/// One immutable audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub id: Uuid,
    pub operation: AuditOperation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject_type: Option<SubjectType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub effect: Option<Effect>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<AuditResult>,
    pub performed_by: String,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl AuditLogEntry {
    pub fn new(operation: AuditOperation, performed_by: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            operation,
            subject_type: None,
            subject_id: None,
            resource: None,
            action: None,
            effect: None,
            role: None,
            result: None,
            performed_by: performed_by.into(),
            timestamp: Utc::now(),
            error: None,
            details: None,
        }
    }

    pub fn subject(mut self, subject: &Subject) -> Self {
        self.subject_type = Some(subject.subject_type);
        self.subject_id = Some(subject.id.clone());
        self
    }

    pub fn resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    pub fn action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn effect(mut self, effect: Effect) -> Self {
        self.effect = Some(effect);
        self
    }

    pub fn role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    pub fn result(mut self, result: AuditResult) -> Self {
        self.result = Some(result);
        self
    }

    /// Mark the entry failed with `error`.
    pub fn failed(mut self, error: impl fmt::Display) -> Self {
        self.result = Some(AuditResult::Failure);
        self.error = Some(error.to_string());
        self
    }

    pub fn details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// Conjunctive filter over audit entries; `None` fields match anything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditFilter {
    pub operation: Option<AuditOperation>,
    pub subject_type: Option<SubjectType>,
    pub subject_id: Option<String>,
    pub performed_by: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl AuditFilter {
    pub fn matches(&self, entry: &AuditLogEntry) -> bool {
        self.operation.map_or(true, |op| entry.operation == op)
            && self.subject_type.map_or(true, |t| entry.subject_type == Some(t))
            && self
                .subject_id
                .as_ref()
                .map_or(true, |id| entry.subject_id.as_ref() == Some(id))
            && self
                .performed_by
                .as_ref()
                .map_or(true, |by| &entry.performed_by == by)
            && self.since.map_or(true, |since| entry.timestamp >= since)
            && self.until.map_or(true, |until| entry.timestamp < until)
    }
}

/// One page of a filtered query, newest first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditPage {
    pub entries: Vec<AuditLogEntry>,
    /// Matching entries across all pages.
    pub total: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_builder() {
        let entry = AuditLogEntry::new(AuditOperation::Grant, "admin-1")
            .subject(&Subject::corporation("CORP1"))
            .resource("scheduler:tasks")
            .action("read")
            .effect(Effect::Allow)
            .failed("engine down");

        assert_eq!(entry.subject_type, Some(SubjectType::Corporation));
        assert_eq!(entry.subject_id.as_deref(), Some("CORP1"));
        assert_eq!(entry.result, Some(AuditResult::Failure));
        assert_eq!(entry.error.as_deref(), Some("engine down"));
    }

    #[test]
    fn test_filter() {
        let entry = AuditLogEntry::new(AuditOperation::Check, "u1").subject(&Subject::user("u1"));

        assert!(AuditFilter::default().matches(&entry));
        assert!(AuditFilter { operation: Some(AuditOperation::Check), ..Default::default() }.matches(&entry));
        assert!(!AuditFilter { operation: Some(AuditOperation::Grant), ..Default::default() }.matches(&entry));
        assert!(!AuditFilter { subject_id: Some("u2".into()), ..Default::default() }.matches(&entry));
    }

    #[test]
    fn test_operation_round_trip_names() {
        for op in [AuditOperation::Grant, AuditOperation::AssignRole, AuditOperation::Cleanup] {
            assert_eq!(AuditOperation::parse(op.as_str()), Some(op));
        }
        assert_eq!(serde_json::to_string(&AuditOperation::RevokeRole).unwrap(), "\"revoke_role\"");
    }
}
