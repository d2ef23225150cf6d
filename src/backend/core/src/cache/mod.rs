//! Decision and hierarchy caching.
//!
//! ```text
//!   Evaluator / Resolver / PolicyService
//!                 │
//!                 ▼
//!           AuthzCache  (namespacing, TTLs, JSON values, bulk invalidation)
//!                 │
//!                 ▼
//!          CacheBackend  (in-memory | Redis)
//! ```
//!
//! Invalidation is deliberately coarse: any policy, role or hierarchy change
//! wipes every decision entry.
//!
//! # Usage
//!
//! ```rust,ignore
//! use keystone_core::cache::{AuthzCache, CacheConfig, InMemoryBackend};
//!
//! let cache = AuthzCache::new(Arc::new(InMemoryBackend::default()), CacheConfig::default());
//! cache.set_decision(&user, "scheduler:tasks", "read", true).await?;
//! cache.invalidate_decisions().await?;
//! ```

pub mod backend;
pub mod key;

pub use backend::{
    CacheBackend, CacheEntry, CacheStats, InMemoryBackend, InMemoryConfig, RedisBackend,
    RedisBackendConfig,
};
pub use key::{hash_for_key, CacheKey, KeyType};

use crate::error::Result;
use crate::hierarchy::HierarchyContext;
use crate::models::UserId;
use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument};

// ═══════════════════════════════════════════════════════════════════════════════
// Cache Configuration
// ═══════════════════════════════════════════════════════════════════════════════

/// Authorization cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub decision_ttl: Duration,
    pub hierarchy_ttl: Duration,
    /// Prefix applied to every key, e.g. `authz:`
    pub namespace_prefix: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            decision_ttl: KeyType::Decision.default_ttl(),
            hierarchy_ttl: KeyType::Hierarchy.default_ttl(),
            namespace_prefix: "authz:".to_string(),
        }
    }
}

impl CacheConfig {
    pub fn builder() -> CacheConfigBuilder {
        CacheConfigBuilder::default()
    }
}

/// Builder for cache configuration.
#[derive(Debug, Default)]
pub struct CacheConfigBuilder {
    config: CacheConfig,
}

impl CacheConfigBuilder {
    pub fn decision_ttl(mut self, ttl: Duration) -> Self {
        self.config.decision_ttl = ttl;
        self
    }

    pub fn hierarchy_ttl(mut self, ttl: Duration) -> Self {
        self.config.hierarchy_ttl = ttl;
        self
    }

    pub fn namespace_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.config.namespace_prefix = prefix.into();
        self
    }

    pub fn build(self) -> CacheConfig {
        self.config
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Cached Values
// ═══════════════════════════════════════════════════════════════════════════════

/// A cached permission decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionCacheEntry {
    pub allowed: bool,
    pub cached_at: DateTime<Utc>,
    /// Lifetime in milliseconds
    pub ttl_ms: u64,
}

impl DecisionCacheEntry {
    /// Whether the entry has outlived its TTL; checked on every read so a
    /// store with coarse expiry can never serve a stale decision.
    pub fn is_expired(&self) -> bool {
        let age = Utc::now().signed_duration_since(self.cached_at).num_milliseconds();
        age < 0 || age as u64 >= self.ttl_ms
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Authorization Cache
// ═══════════════════════════════════════════════════════════════════════════════

/// Typed view over a [`CacheBackend`] for decisions and hierarchies.
#[derive(Clone)]
pub struct AuthzCache {
    backend: Arc<dyn CacheBackend>,
    config: CacheConfig,
}

impl std::fmt::Debug for AuthzCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthzCache")
            .field("backend", &self.backend.name())
            .field("config", &self.config)
            .finish()
    }
}

impl AuthzCache {
    pub fn new(backend: Arc<dyn CacheBackend>, config: CacheConfig) -> Self {
        Self { backend, config }
    }

    /// A cache on a fresh in-memory backend with default settings.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryBackend::default()), CacheConfig::default())
    }

    pub fn backend(&self) -> &Arc<dyn CacheBackend> {
        &self.backend
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    fn full_key(&self, key: &CacheKey) -> String {
        format!("{}{}", self.config.namespace_prefix, key)
    }

    async fn get_json<T: DeserializeOwned>(&self, key: &CacheKey) -> Result<Option<T>> {
        match self.backend.get(&self.full_key(key)).await? {
            Some(entry) => Ok(Some(serde_json::from_slice(&entry.data)?)),
            None => Ok(None),
        }
    }

    async fn set_json<T: Serialize>(&self, key: &CacheKey, value: &T, ttl: Duration) -> Result<()> {
        let data = serde_json::to_vec(value)?;
        self.backend
            .set(&self.full_key(key), CacheEntry::new(data, Some(ttl)))
            .await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Decisions
    // ─────────────────────────────────────────────────────────────────────────

    /// Cached decision, if present and unexpired.
    #[instrument(skip(self), level = "trace")]
    pub async fn get_decision(&self, user_id: &UserId, resource: &str, action: &str) -> Result<Option<bool>> {
        let key = CacheKey::decision(user_id, resource, action);
        let entry: Option<DecisionCacheEntry> = self.get_json(&key).await?;
        Ok(entry.filter(|e| !e.is_expired()).map(|e| e.allowed))
    }

    #[instrument(skip(self), level = "trace")]
    pub async fn set_decision(&self, user_id: &UserId, resource: &str, action: &str, allowed: bool) -> Result<()> {
        let key = CacheKey::decision(user_id, resource, action);
        let ttl = self.config.decision_ttl;
        let entry = DecisionCacheEntry {
            allowed,
            cached_at: Utc::now(),
            ttl_ms: ttl.as_millis() as u64,
        };
        self.set_json(&key, &entry, ttl).await
    }

    /// Drop every cached decision. Returns the number of entries removed.
    pub async fn invalidate_decisions(&self) -> Result<u64> {
        let pattern = format!("{}{}", self.config.namespace_prefix, KeyType::Decision.pattern());
        let removed = self.backend.delete_by_pattern(&pattern).await?;

        counter!("keystone_cache_invalidations_total", "scope" => "decisions").increment(1);
        info!(removed, "Decision cache invalidated");
        Ok(removed)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Hierarchies
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn get_hierarchy(&self, user_id: &UserId) -> Result<Option<HierarchyContext>> {
        self.get_json(&CacheKey::hierarchy(user_id)).await
    }

    pub async fn set_hierarchy(&self, context: &HierarchyContext) -> Result<()> {
        let key = CacheKey::hierarchy(&context.user_id);
        self.set_json(&key, context, self.config.hierarchy_ttl).await
    }

    pub async fn invalidate_hierarchy(&self, user_id: &UserId) -> Result<bool> {
        let removed = self.backend.delete(&self.full_key(&CacheKey::hierarchy(user_id))).await?;
        debug!(user_id = %user_id, removed, "Hierarchy cache invalidated");
        Ok(removed)
    }

    pub async fn stats(&self) -> Result<CacheStats> {
        self.backend.stats().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache_with_ttl(ttl: Duration) -> AuthzCache {
        AuthzCache::new(
            Arc::new(InMemoryBackend::default()),
            CacheConfig::builder().decision_ttl(ttl).build(),
        )
    }

    #[tokio::test]
    async fn test_decision_round_trip() {
        let cache = AuthzCache::in_memory();
        let user = UserId::new("u1");

        assert_eq!(cache.get_decision(&user, "r:c", "a").await.unwrap(), None);
        cache.set_decision(&user, "r:c", "a", true).await.unwrap();
        assert_eq!(cache.get_decision(&user, "r:c", "a").await.unwrap(), Some(true));
        assert_eq!(cache.get_decision(&user, "r:c", "b").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_decision_expires() {
        let cache = cache_with_ttl(Duration::from_millis(30));
        let user = UserId::new("u1");

        cache.set_decision(&user, "r:c", "a", false).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(cache.get_decision(&user, "r:c", "a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_invalidate_decisions_keeps_hierarchies() {
        let cache = AuthzCache::in_memory();
        let user = UserId::new("u1");

        cache.set_decision(&user, "r:c", "a", true).await.unwrap();
        cache.set_decision(&UserId::new("u2"), "r:c", "a", true).await.unwrap();
        cache.set_hierarchy(&HierarchyContext::empty(user.clone())).await.unwrap();

        assert_eq!(cache.invalidate_decisions().await.unwrap(), 2);
        assert_eq!(cache.get_decision(&user, "r:c", "a").await.unwrap(), None);
        assert!(cache.get_hierarchy(&user).await.unwrap().is_some());
    }

    #[test]
    fn test_entry_expiry_check() {
        let entry = DecisionCacheEntry {
            allowed: true,
            cached_at: Utc::now() - chrono::Duration::seconds(10),
            ttl_ms: 5_000,
        };
        assert!(entry.is_expired());
    }
}
