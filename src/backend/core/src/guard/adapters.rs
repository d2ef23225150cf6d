//! Named permission checks for domain modules.
//!
//! ```rust,ignore
//! let sitemap = DomainAdapter::new(guard.clone(), "sitemap");
//! let principal = sitemap.require_admin(&headers).await?;   // sitemap:admin:manage
//! let principal = sitemap.require(&headers, "pages", "read").await?;
//! ```

use std::sync::Arc;

use axum::http::HeaderMap;

use super::auth_guard::{AuthGuard, GuardError};
use crate::auth::Principal;

/// Thin wrapper that prefixes every permission with a domain resource.
#[derive(Debug, Clone)]
pub struct DomainAdapter {
    guard: Arc<AuthGuard>,
    resource: String,
}

impl DomainAdapter {
    pub fn new(guard: Arc<AuthGuard>, resource: impl Into<String>) -> Self {
        Self {
            guard,
            resource: resource.into(),
        }
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    /// `<resource>:<category>:<action>`.
    pub fn permission(&self, category: &str, action: &str) -> String {
        format!("{}:{}:{}", self.resource, category, action)
    }

    pub async fn require(&self, headers: &HeaderMap, category: &str, action: &str) -> Result<Principal, GuardError> {
        self.guard
            .require_permission(headers, &self.permission(category, action))
            .await
    }

    /// `<resource>:admin:manage`.
    pub async fn require_admin(&self, headers: &HeaderMap) -> Result<Principal, GuardError> {
        self.require(headers, "admin", "manage").await
    }

    /// Read access: `<resource>:admin:read` or `<resource>:admin:manage`.
    pub async fn require_read(&self, headers: &HeaderMap) -> Result<Principal, GuardError> {
        self.guard
            .require_any(
                headers,
                &[self.permission("admin", "read"), self.permission("admin", "manage")],
            )
            .await
    }

    pub async fn require_auth(&self, headers: &HeaderMap) -> Result<Principal, GuardError> {
        self.guard.require_auth(headers).await
    }
}
