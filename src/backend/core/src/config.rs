//! Configuration management.
//!
//! Values come from an optional file plus `KEYSTONE__*` environment variables
//! (double underscore separates sections, e.g. `KEYSTONE__AUTH__JWT_SECRET`).
//! Durations are written human-readably: `"5m"`, `"250ms"`.

use serde::Deserialize;
use std::time::Duration;

use crate::telemetry::logging::LoggingConfig;
use crate::telemetry::metrics::MetricsConfig;

/// Main application configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Deployment environment (development, production)
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Database configuration; absent means in-memory stores
    #[serde(default)]
    pub database: Option<DatabaseConfig>,

    /// Redis configuration; absent means the in-memory cache
    #[serde(default)]
    pub redis: Option<RedisConfig>,

    /// Token validation
    pub auth: AuthSettings,

    /// Cache lifetimes
    #[serde(default)]
    pub cache: CacheSettings,

    /// Guard behaviour
    #[serde(default)]
    pub guard: GuardSettings,

    /// Audit pipeline
    #[serde(default)]
    pub audit: AuditSettings,

    /// Logging
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Prometheus metrics
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// HTTP server host
    #[serde(default = "default_host")]
    pub host: String,

    /// HTTP server port
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,

    /// Maximum number of connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Run embedded migrations at startup
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Prefix applied to every key written by the cache
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthSettings {
    /// HMAC secret for HS256 tokens
    pub jwt_secret: Option<String>,

    /// PEM encoded RSA public key for RS256 tokens
    pub jwt_public_key: Option<String>,

    /// Expected issuer
    pub issuer: Option<String>,

    /// Expected audience
    pub audience: Option<String>,

    /// Clock skew tolerance
    #[serde(default = "default_leeway", with = "humantime_serde")]
    pub leeway: Duration,

    /// Cookie consulted when no Authorization header is present
    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheSettings {
    /// Lifetime of a cached permission decision
    #[serde(default = "default_decision_ttl", with = "humantime_serde")]
    pub decision_ttl: Duration,

    /// Lifetime of a cached character hierarchy
    #[serde(default = "default_hierarchy_ttl", with = "humantime_serde")]
    pub hierarchy_ttl: Duration,

    /// Upper bound on in-memory entries
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            decision_ttl: default_decision_ttl(),
            hierarchy_ttl: default_hierarchy_ttl(),
            max_entries: default_max_entries(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GuardSettings {
    /// Named profile the other fields override
    #[serde(default)]
    pub profile: crate::guard::Profile,

    /// Per-stage debug events
    pub debug_logging: Option<bool>,

    /// Degrade permission checks to auth-only when evaluation is unavailable
    pub fallback_to_auth_only: Option<bool>,

    /// Consecutive failures before the breaker opens; 0 disables it
    pub circuit_breaker_threshold: Option<u32>,

    /// Time the breaker stays open before allowing a trial call
    #[serde(default, with = "humantime_serde")]
    pub circuit_breaker_recovery: Option<Duration>,

    /// Deadline applied to each collaborator call
    #[serde(default, with = "humantime_serde")]
    pub call_timeout: Option<Duration>,

    /// Append a `check` audit entry for every evaluation
    pub audit_decisions: Option<bool>,

    /// Period of the expired-grant sweep
    #[serde(default = "default_cleanup_interval", with = "humantime_serde")]
    pub cleanup_interval: Duration,
}

impl Default for GuardSettings {
    fn default() -> Self {
        Self {
            profile: crate::guard::Profile::default(),
            debug_logging: None,
            fallback_to_auth_only: None,
            circuit_breaker_threshold: None,
            circuit_breaker_recovery: None,
            call_timeout: None,
            audit_decisions: None,
            cleanup_interval: default_cleanup_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuditSettings {
    /// Capacity of the background audit channel
    #[serde(default = "default_audit_buffer")]
    pub buffer: usize,
}

impl Default for AuditSettings {
    fn default() -> Self {
        Self {
            buffer: default_audit_buffer(),
        }
    }
}

// Default value functions
fn default_environment() -> String { "development".to_string() }
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8080 }
fn default_max_connections() -> u32 { 20 }
fn default_min_connections() -> u32 { 2 }
fn default_true() -> bool { true }
fn default_redis_url() -> String { "redis://localhost:6379".to_string() }
fn default_key_prefix() -> String { "keystone".to_string() }
fn default_leeway() -> Duration { Duration::from_secs(30) }
fn default_cookie_name() -> String { "access_token".to_string() }
fn default_decision_ttl() -> Duration { Duration::from_secs(5 * 60) }
fn default_hierarchy_ttl() -> Duration { Duration::from_secs(15 * 60) }
fn default_max_entries() -> usize { 100_000 }
fn default_audit_buffer() -> usize { 1024 }
fn default_cleanup_interval() -> Duration { Duration::from_secs(60 * 60) }

impl Config {
    /// Load configuration from the environment.
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("KEYSTONE").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }

    /// Load from a specific file path, with the environment layered on top.
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("KEYSTONE").separator("__"))
            .build()?;

        let cfg: Config = config.try_deserialize()?;
        Ok(cfg)
    }

    /// Guard options for the configured profile with explicit overrides applied.
    pub fn guard_options(&self) -> crate::guard::GuardOptions {
        let g = &self.guard;
        let mut builder = crate::guard::GuardOptions::for_profile(g.profile).to_builder();

        if let Some(v) = g.debug_logging {
            builder = builder.debug_logging(v);
        }
        if let Some(v) = g.fallback_to_auth_only {
            builder = builder.fallback_to_auth_only(v);
        }
        if let Some(threshold) = g.circuit_breaker_threshold {
            builder = if threshold == 0 {
                builder.without_circuit_breaker()
            } else {
                builder.circuit_breaker(
                    threshold,
                    g.circuit_breaker_recovery.unwrap_or(Duration::from_secs(30)),
                )
            };
        }
        if let Some(v) = g.call_timeout {
            builder = builder.call_timeout(v);
        }
        if let Some(v) = g.audit_decisions {
            builder = builder.audit_decisions(v);
        }

        builder
            .decision_ttl(self.cache.decision_ttl)
            .hierarchy_ttl(self.cache.hierarchy_ttl)
            .cookie_name(self.auth.cookie_name.clone())
            .build()
    }
}
