//! Read-through resolution of a user's character hierarchy.

use std::sync::Arc;

use tracing::{debug, instrument, warn};

use super::directory::CharacterDirectory;
use super::models::{HierarchyContext, ResolutionError};
use crate::cache::AuthzCache;
use crate::context::RequestContext;
use crate::models::UserId;
use crate::telemetry::GuardMetrics;

/// Expands a user into every character, corporation and alliance they control.
///
/// Cache failures are logged and treated as a miss; only directory failures
/// surface as [`ResolutionError::Unavailable`].
#[derive(Clone)]
pub struct HierarchyResolver {
    directory: Arc<dyn CharacterDirectory>,
    cache: AuthzCache,
}

impl HierarchyResolver {
    pub fn new(directory: Arc<dyn CharacterDirectory>, cache: AuthzCache) -> Self {
        Self { directory, cache }
    }

    pub fn directory(&self) -> &Arc<dyn CharacterDirectory> {
        &self.directory
    }

    #[instrument(skip(self, user_id, ctx), fields(user_id = %user_id))]
    pub async fn resolve(&self, user_id: &UserId, ctx: &RequestContext) -> Result<HierarchyContext, ResolutionError> {
        match ctx.run("hierarchy_cache.get", self.cache.get_hierarchy(user_id)).await {
            Ok(Some(cached)) => {
                GuardMetrics::hierarchy_cache(true);
                debug!("Hierarchy cache hit");
                return Ok(cached);
            }
            Ok(None) => GuardMetrics::hierarchy_cache(false),
            Err(e) => {
                GuardMetrics::hierarchy_cache(false);
                warn!(error = %e, "Hierarchy cache read failed; treating as miss");
            }
        }

        let records = ctx
            .run("directory.characters_for_user", self.directory.characters_for_user(user_id))
            .await
            .map_err(ResolutionError::Unavailable)?;

        let context = HierarchyContext::from_characters(user_id.clone(), records)?;

        if let Err(e) = ctx.run("hierarchy_cache.set", self.cache.set_hierarchy(&context)).await {
            warn!(error = %e, "Hierarchy cache write failed");
        }

        debug!(
            characters = context.characters.len(),
            corporations = context.corporation_ids.len(),
            alliances = context.alliance_ids.len(),
            "Hierarchy resolved"
        );
        Ok(context)
    }

    /// Forget the cached hierarchy of one user.
    pub async fn invalidate(&self, user_id: &UserId) {
        if let Err(e) = self.cache.invalidate_hierarchy(user_id).await {
            warn!(user_id = %user_id, error = %e, "Hierarchy cache invalidation failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorCode, KeystoneError, Result};
    use crate::hierarchy::{CharacterRecord, InMemoryDirectory};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingDirectory {
        inner: InMemoryDirectory,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CharacterDirectory for CountingDirectory {
        async fn characters_for_user(&self, user_id: &UserId) -> Result<Vec<CharacterRecord>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.characters_for_user(user_id).await
        }

        async fn replace_characters(&self, user_id: &UserId, characters: &[CharacterRecord]) -> Result<()> {
            self.inner.replace_characters(user_id, characters).await
        }

        fn name(&self) -> &'static str {
            "counting"
        }
    }

    struct DownDirectory;

    #[async_trait]
    impl CharacterDirectory for DownDirectory {
        async fn characters_for_user(&self, _: &UserId) -> Result<Vec<CharacterRecord>> {
            Err(KeystoneError::directory_unavailable("connection refused"))
        }

        async fn replace_characters(&self, _: &UserId, _: &[CharacterRecord]) -> Result<()> {
            Err(KeystoneError::directory_unavailable("connection refused"))
        }

        fn name(&self) -> &'static str {
            "down"
        }
    }

    #[tokio::test]
    async fn test_resolve_reads_through_cache() {
        let directory = Arc::new(CountingDirectory {
            inner: InMemoryDirectory::new(),
            calls: AtomicUsize::new(0),
        });
        let user = UserId::new("u1");
        directory
            .replace_characters(&user, &[CharacterRecord::new("c1", "A", "corp1").primary()])
            .await
            .unwrap();

        let resolver = HierarchyResolver::new(directory.clone(), AuthzCache::in_memory());
        let ctx = RequestContext::new();

        let first = resolver.resolve(&user, &ctx).await.unwrap();
        let second = resolver.resolve(&user, &ctx).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(directory.calls.load(Ordering::SeqCst), 1);

        resolver.invalidate(&user).await;
        resolver.resolve(&user, &ctx).await.unwrap();
        assert_eq!(directory.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_directory_failure_is_distinct_from_no_characters() {
        let resolver = HierarchyResolver::new(Arc::new(DownDirectory), AuthzCache::in_memory());
        let err = resolver
            .resolve(&UserId::new("u1"), &RequestContext::new())
            .await
            .unwrap_err();

        assert!(err.is_subsystem_failure());
        assert_eq!(KeystoneError::from(err).code(), ErrorCode::DirectoryUnavailable);

        let resolver = HierarchyResolver::new(Arc::new(InMemoryDirectory::new()), AuthzCache::in_memory());
        let ctx = resolver.resolve(&UserId::new("u1"), &RequestContext::new()).await.unwrap();
        assert!(ctx.is_empty());
    }
}
