//! Permission identifiers of the form `resource:category:action`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{ErrorCode, KeystoneError, Result};

/// A parsed `resource:category:action` permission.
///
/// The rule engine sees `resource:category` as its resource and `action` as
/// its action, so `sitemap:admin:manage` is checked as
/// `("sitemap:admin", "manage")`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PermissionId {
    resource: String,
    category: String,
    action: String,
}

impl PermissionId {
    pub fn new(resource: &str, category: &str, action: &str) -> Result<Self> {
        for (name, segment) in [("resource", resource), ("category", category), ("action", action)] {
            if !segment_is_valid(segment) {
                return Err(invalid(format!(
                    "Permission {} segment '{}' must be non-empty and use only letters, digits, '_', '.', '-' or '*'",
                    name, segment
                )));
            }
        }
        Ok(Self {
            resource: resource.to_string(),
            category: category.to_string(),
            action: action.to_string(),
        })
    }

    pub fn parse(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split(':').collect();
        match parts.as_slice() {
            [resource, category, action] => Self::new(resource, category, action),
            _ => Err(invalid(format!(
                "Permission '{}' must have the form resource:category:action",
                s
            ))),
        }
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn action(&self) -> &str {
        &self.action
    }

    /// The resource string handed to the rule engine.
    pub fn engine_resource(&self) -> String {
        format!("{}:{}", self.resource, self.category)
    }
}

/// Validate the engine-side parts of a rule: `resource` is one or two
/// segments (`scheduler:tasks`, `scheduler:*`, `*`), `action` is one.
pub fn validate_rule_parts(resource: &str, action: &str) -> Result<()> {
    let segments: Vec<&str> = resource.split(':').collect();
    if segments.len() > 2 || !segments.iter().all(|s| segment_is_valid(s)) {
        return Err(invalid(format!(
            "Resource '{}' must have the form resource:category",
            resource
        )));
    }
    if !segment_is_valid(action) {
        return Err(invalid(format!("Action '{}' is not a valid permission action", action)));
    }
    Ok(())
}

/// Validate a role name (a single permission segment).
pub fn validate_role_name(role: &str) -> Result<()> {
    if segment_is_valid(role) && role != "*" {
        Ok(())
    } else {
        Err(KeystoneError::validation(format!("Role name '{}' is not valid", role)))
    }
}

fn invalid(message: String) -> KeystoneError {
    KeystoneError::new(ErrorCode::InvalidPermission, message)
}

fn segment_is_valid(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-' | '*'))
}

impl fmt::Display for PermissionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.resource, self.category, self.action)
    }
}

impl FromStr for PermissionId {
    type Err = KeystoneError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for PermissionId {
    type Error = KeystoneError;

    fn try_from(s: String) -> Result<Self> {
        Self::parse(&s)
    }
}

impl From<PermissionId> for String {
    fn from(p: PermissionId) -> Self {
        p.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid() {
        let p = PermissionId::parse("sitemap:admin:manage").unwrap();
        assert_eq!(p.resource(), "sitemap");
        assert_eq!(p.category(), "admin");
        assert_eq!(p.action(), "manage");
        assert_eq!(p.engine_resource(), "sitemap:admin");
        assert_eq!(p.to_string(), "sitemap:admin:manage");
    }

    #[test]
    fn test_parse_invalid() {
        for bad in ["", "a:b", "a:b:c:d", "a::c", "a:b:", "a b:c:d", "a:b:c/d"] {
            let err = PermissionId::parse(bad).unwrap_err();
            assert_eq!(err.code(), ErrorCode::InvalidPermission, "{}", bad);
        }
    }

    #[test]
    fn test_rule_parts() {
        assert!(validate_rule_parts("scheduler:tasks", "read").is_ok());
        assert!(validate_rule_parts("scheduler:*", "*").is_ok());
        assert!(validate_rule_parts("*", "*").is_ok());
        assert!(validate_rule_parts("a:b:c", "read").is_err());
        assert!(validate_rule_parts("scheduler:tasks", "").is_err());
        assert!(validate_role_name("admin").is_ok());
        assert!(validate_role_name("*").is_err());
        assert!(validate_role_name("bad role").is_err());
    }

    #[test]
    fn test_serde_as_string() {
        let p: PermissionId = serde_json::from_str("\"scheduler:tasks:read\"").unwrap();
        assert_eq!(p.action(), "read");
        assert_eq!(serde_json::to_string(&p).unwrap(), "\"scheduler:tasks:read\"");
        assert!(serde_json::from_str::<PermissionId>("\"nope\"").is_err());
    }
}
