//! Wiring: builds the guard, evaluator and policy service over one shared set
//! of collaborators.
//!
//! ```rust,ignore
//! // Tests and embedded use: everything in memory.
//! let stack = GuardStack::builder().jwt_secret("secret").build()?;
//!
//! // Server: Postgres and Redis when configured.
//! let stack = GuardStack::from_config(&config).await?;
//! ```

use std::sync::Arc;

use tracing::info;

use crate::audit::{AuditLogger, AuditSink, InMemoryAuditSink};
use crate::auth::{JwtConfig, JwtValidator, TokenValidator};
use crate::cache::{AuthzCache, CacheBackend, CacheConfig, InMemoryBackend, InMemoryConfig, RedisBackend, RedisBackendConfig};
use crate::config::Config;
use crate::db::{Database, PgAuditSink, PgCharacterDirectory, PgPolicyStore};
use crate::engine::{MemoryRuleEngine, RuleEngine};
use crate::error::{ErrorCode, KeystoneError, Result};
use crate::guard::{AuthGuard, Evaluator, GuardOptions};
use crate::hierarchy::{CharacterDirectory, HierarchyResolver, InMemoryDirectory};
use crate::policy::{InMemoryPolicyStore, PolicyService, PolicyStore};

/// Everything a service needs to authenticate, authorize and administer.
#[derive(Clone)]
pub struct GuardStack {
    pub guard: Arc<AuthGuard>,
    pub policy: Arc<PolicyService>,
    pub evaluator: Evaluator,
    pub engine: Arc<dyn RuleEngine>,
    pub cache: AuthzCache,
    pub audit: AuditLogger,
    pub database: Option<Database>,
}

impl GuardStack {
    pub fn builder() -> GuardStackBuilder {
        GuardStackBuilder::default()
    }

    /// Build from configuration, connecting to Postgres and Redis when their
    /// sections are present and falling back to in-memory collaborators
    /// otherwise.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let options = config.guard_options();
        let validator = JwtValidator::new(JwtConfig::from_settings(&config.auth))?;

        let mut builder = GuardStack::builder()
            .validator(Arc::new(validator))
            .options(options)
            .cache_config(
                CacheConfig::builder()
                    .decision_ttl(config.cache.decision_ttl)
                    .hierarchy_ttl(config.cache.hierarchy_ttl)
                    .build(),
            )
            .audit_buffer(config.audit.buffer);

        builder = match &config.redis {
            Some(redis) => {
                let backend = RedisBackend::new(RedisBackendConfig {
                    url: redis.url.clone(),
                    key_prefix: format!("{}:", redis.key_prefix.trim_end_matches(':')),
                    default_ttl: config.cache.hierarchy_ttl,
                })
                .await?;
                builder.cache_backend(Arc::new(backend))
            }
            None => builder.cache_backend(Arc::new(InMemoryBackend::new(InMemoryConfig {
                max_capacity: config.cache.max_entries as u64,
                ..InMemoryConfig::default()
            }))),
        };

        if let Some(db_config) = &config.database {
            let database = Database::connect(db_config).await?;
            if db_config.run_migrations {
                database.migrate().await?;
            }
            let pool = database.pool().clone();
            builder = builder
                .store(Arc::new(PgPolicyStore::new(pool.clone())))
                .directory(Arc::new(PgCharacterDirectory::new(pool.clone())))
                .audit_sink(Arc::new(PgAuditSink::new(pool)))
                .database(database);
        }

        builder.build()
    }
}

/// Builder for [`GuardStack`]. Unset collaborators default to in-memory
/// implementations.
#[derive(Default)]
pub struct GuardStackBuilder {
    validator: Option<Arc<dyn TokenValidator>>,
    jwt_secret: Option<String>,
    engine: Option<Arc<dyn RuleEngine>>,
    directory: Option<Arc<dyn CharacterDirectory>>,
    store: Option<Arc<dyn PolicyStore>>,
    audit_sink: Option<Arc<dyn AuditSink>>,
    cache_backend: Option<Arc<dyn CacheBackend>>,
    cache_config: Option<CacheConfig>,
    options: Option<GuardOptions>,
    inline_audit: bool,
    audit_buffer: Option<usize>,
    database: Option<Database>,
}

impl GuardStackBuilder {
    pub fn validator(mut self, validator: Arc<dyn TokenValidator>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// HS256 validator over `secret`; ignored when a validator is set.
    pub fn jwt_secret(mut self, secret: impl Into<String>) -> Self {
        self.jwt_secret = Some(secret.into());
        self
    }

    pub fn engine(mut self, engine: Arc<dyn RuleEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn directory(mut self, directory: Arc<dyn CharacterDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    pub fn store(mut self, store: Arc<dyn PolicyStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit_sink = Some(sink);
        self
    }

    pub fn cache_backend(mut self, backend: Arc<dyn CacheBackend>) -> Self {
        self.cache_backend = Some(backend);
        self
    }

    pub fn cache_config(mut self, config: CacheConfig) -> Self {
        self.cache_config = Some(config);
        self
    }

    pub fn options(mut self, options: GuardOptions) -> Self {
        self.options = Some(options);
        self
    }

    /// Write audit entries before returning instead of through the
    /// background writer.
    pub fn inline_audit(mut self) -> Self {
        self.inline_audit = true;
        self
    }

    pub fn audit_buffer(mut self, buffer: usize) -> Self {
        self.audit_buffer = Some(buffer);
        self
    }

    pub fn database(mut self, database: Database) -> Self {
        self.database = Some(database);
        self
    }

    /// Assemble the stack. The background audit writer requires a Tokio
    /// runtime unless [`inline_audit`](Self::inline_audit) is set.
    pub fn build(self) -> Result<GuardStack> {
        let validator: Arc<dyn TokenValidator> = match (self.validator, self.jwt_secret) {
            (Some(validator), _) => validator,
            (None, Some(secret)) => Arc::new(JwtValidator::new(JwtConfig::builder().jwt_secret(secret).build())?),
            (None, None) => {
                return Err(KeystoneError::new(
                    ErrorCode::MissingConfiguration,
                    "A token validator or JWT secret is required",
                ))
            }
        };

        let options = Arc::new(self.options.unwrap_or_default());
        let engine: Arc<dyn RuleEngine> = self.engine.unwrap_or_else(|| Arc::new(MemoryRuleEngine::new()));
        let directory: Arc<dyn CharacterDirectory> =
            self.directory.unwrap_or_else(|| Arc::new(InMemoryDirectory::new()));
        let store: Arc<dyn PolicyStore> = self.store.unwrap_or_else(|| Arc::new(InMemoryPolicyStore::new()));
        let sink: Arc<dyn AuditSink> = self.audit_sink.unwrap_or_else(|| Arc::new(InMemoryAuditSink::new()));
        let backend: Arc<dyn CacheBackend> =
            self.cache_backend.unwrap_or_else(|| Arc::new(InMemoryBackend::default()));

        let cache_config = self.cache_config.unwrap_or_else(|| {
            CacheConfig::builder()
                .decision_ttl(options.decision_ttl())
                .hierarchy_ttl(options.hierarchy_ttl())
                .build()
        });
        let cache = AuthzCache::new(backend, cache_config);

        let audit = if self.inline_audit {
            AuditLogger::inline(sink)
        } else {
            AuditLogger::spawn(sink, self.audit_buffer.unwrap_or(1024))
        };

        let evaluator = Evaluator::new(
            engine.clone(),
            HierarchyResolver::new(directory, cache.clone()),
            cache.clone(),
            audit.clone(),
            options.clone(),
        );
        let policy = Arc::new(PolicyService::new(engine.clone(), store, evaluator.clone()));
        let guard = Arc::new(AuthGuard::new(validator, evaluator.clone()));

        info!(
            engine = engine.name(),
            profile = ?options.profile(),
            fallback = options.fallback_to_auth_only(),
            circuit_breaker = options.circuit_breaker().is_some(),
            "Guard stack assembled"
        );

        Ok(GuardStack {
            guard,
            policy,
            evaluator,
            engine,
            cache,
            audit,
            database: self.database,
        })
    }
}
