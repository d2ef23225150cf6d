//! Cache store backends.
//!
//! - **InMemoryBackend**: process-local store on `DashMap`
//! - **RedisBackend**: shared store for multi-instance deployments
//!
//! Both honour per-entry TTLs (an expired entry is never returned) and
//! support glob-pattern deletion (`*` and `?`) for bulk invalidation.

use crate::error::{ErrorCode, KeystoneError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use metrics::{counter, gauge};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info};

// ═══════════════════════════════════════════════════════════════════════════════
// Cache Entry
// ═══════════════════════════════════════════════════════════════════════════════

/// A cached value with its lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Serialized data
    pub data: Vec<u8>,

    /// Time-to-live
    #[serde(with = "duration_millis")]
    pub ttl: Option<Duration>,

    /// When this entry was created
    pub created_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn new(data: Vec<u8>, ttl: Option<Duration>) -> Self {
        Self {
            data,
            ttl,
            created_at: Utc::now(),
        }
    }

    /// Check if the entry has expired.
    pub fn is_expired(&self) -> bool {
        match self.ttl {
            Some(ttl) => {
                let elapsed = Utc::now()
                    .signed_duration_since(self.created_at)
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                elapsed >= ttl
            }
            None => false,
        }
    }

    /// Get the remaining TTL.
    pub fn remaining_ttl(&self) -> Option<Duration> {
        self.ttl.and_then(|ttl| {
            let elapsed = Utc::now()
                .signed_duration_since(self.created_at)
                .to_std()
                .ok()?;
            ttl.checked_sub(elapsed)
        })
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => (d.as_millis() as u64).serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis: Option<u64> = Option::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Cache Statistics
// ═══════════════════════════════════════════════════════════════════════════════

/// Cache statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: u64,
    pub evictions: u64,
    /// Hit rate (0.0 - 1.0)
    pub hit_rate: f64,
    /// Backend-specific stats
    pub backend_stats: HashMap<String, String>,
}

impl CacheStats {
    pub fn calculate_hit_rate(&mut self) {
        let total = self.hits + self.misses;
        self.hit_rate = if total > 0 {
            self.hits as f64 / total as f64
        } else {
            0.0
        };
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Cache Backend Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Cache store collaborator. Implementations must be safe for concurrent use.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Get an entry; expired entries are reported as absent.
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>>;

    /// Store an entry, replacing any previous value.
    async fn set(&self, key: &str, entry: CacheEntry) -> Result<()>;

    /// Delete an entry. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    async fn exists(&self, key: &str) -> Result<bool>;

    async fn stats(&self) -> Result<CacheStats>;

    async fn clear(&self) -> Result<()>;

    /// Delete every key matching a glob pattern (`*`, `?`). Returns the count.
    async fn delete_by_pattern(&self, pattern: &str) -> Result<u64>;

    fn name(&self) -> &'static str;
}

/// Translate a glob pattern into an anchored regex.
pub(crate) fn glob_to_regex(pattern: &str) -> Result<regex::Regex> {
    let mut re = String::with_capacity(pattern.len() * 2 + 2);
    re.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            other => re.push_str(&regex::escape(&other.to_string())),
        }
    }
    re.push('$');

    regex::Regex::new(&re)
        .map_err(|e| KeystoneError::new(ErrorCode::InvalidInput, format!("Invalid pattern: {}", e)))
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-Memory Backend
// ═══════════════════════════════════════════════════════════════════════════════

/// Configuration for the in-memory store.
#[derive(Debug, Clone)]
pub struct InMemoryConfig {
    /// Maximum number of entries before eviction kicks in
    pub max_capacity: u64,

    /// Shard count for concurrent access (power of 2)
    pub shard_count: usize,
}

impl Default for InMemoryConfig {
    fn default() -> Self {
        Self {
            max_capacity: 100_000,
            shard_count: 16,
        }
    }
}

/// Process-local cache store.
pub struct InMemoryBackend {
    entries: DashMap<String, CacheEntry>,
    config: InMemoryConfig,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new(InMemoryConfig::default())
    }
}

impl InMemoryBackend {
    pub fn new(config: InMemoryConfig) -> Self {
        Self {
            entries: DashMap::with_shard_amount(config.shard_count),
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Number of stored entries, expired ones included until swept.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Evict when at capacity: expired entries first, then the oldest tenth.
    fn maybe_evict(&self) {
        if (self.entries.len() as u64) < self.config.max_capacity {
            return;
        }

        let mut evicted = self.cleanup_expired();

        if (self.entries.len() as u64) >= self.config.max_capacity {
            let to_evict = (self.config.max_capacity / 10).max(1) as usize;
            let mut by_age: Vec<(String, DateTime<Utc>)> = self
                .entries
                .iter()
                .map(|e| (e.key().clone(), e.value().created_at))
                .collect();
            by_age.sort_by_key(|(_, created)| *created);

            for (key, _) in by_age.into_iter().take(to_evict) {
                if self.entries.remove(&key).is_some() {
                    evicted += 1;
                }
            }
        }

        self.evictions.fetch_add(evicted, Ordering::Relaxed);
        debug!("Evicted {} entries from cache", evicted);
    }

    /// Remove expired entries. Returns the count removed.
    pub fn cleanup_expired(&self) -> u64 {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired());
        (before.saturating_sub(self.entries.len())) as u64
    }
}

#[async_trait]
impl CacheBackend for InMemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let found = self.entries.get(key).map(|e| e.value().clone());

        match found {
            Some(entry) if entry.is_expired() => {
                self.entries.remove_if(key, |_, e| e.is_expired());
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(entry))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &str, entry: CacheEntry) -> Result<()> {
        if !self.entries.contains_key(key) {
            self.maybe_evict();
        }
        self.entries.insert(key.to_string(), entry);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.entries.remove(key).is_some())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.entries.get(key).map(|e| !e.is_expired()).unwrap_or(false))
    }

    async fn stats(&self) -> Result<CacheStats> {
        let entries = self.entries.len() as u64;
        let mut stats = CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries,
            evictions: self.evictions.load(Ordering::Relaxed),
            hit_rate: 0.0,
            backend_stats: HashMap::new(),
        };
        stats.calculate_hit_rate();
        stats
            .backend_stats
            .insert("max_capacity".to_string(), self.config.max_capacity.to_string());

        gauge!("keystone_cache_entries", "backend" => "in_memory").set(entries as f64);

        Ok(stats)
    }

    async fn clear(&self) -> Result<()> {
        self.entries.clear();
        Ok(())
    }

    async fn delete_by_pattern(&self, pattern: &str) -> Result<u64> {
        let regex = glob_to_regex(pattern)?;
        let before = self.entries.len();
        self.entries.retain(|key, _| !regex.is_match(key));
        Ok(before.saturating_sub(self.entries.len()) as u64)
    }

    fn name(&self) -> &'static str {
        "in_memory"
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Redis Backend
// ═══════════════════════════════════════════════════════════════════════════════

/// Configuration for the Redis store.
#[derive(Debug, Clone)]
pub struct RedisBackendConfig {
    /// Redis connection URL
    pub url: String,

    /// Prefix prepended to every key
    pub key_prefix: String,

    /// TTL used for entries stored without one
    pub default_ttl: Duration,
}

impl Default for RedisBackendConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "keystone:".to_string(),
            default_ttl: Duration::from_secs(3600),
        }
    }
}

/// Shared cache store backed by Redis.
pub struct RedisBackend {
    conn: redis::aio::ConnectionManager,
    config: RedisBackendConfig,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl RedisBackend {
    /// Connect and verify the server responds.
    pub async fn new(config: RedisBackendConfig) -> Result<Self> {
        let client = redis::Client::open(config.url.as_str()).map_err(|e| {
            KeystoneError::with_internal(
                ErrorCode::CacheConnectionFailed,
                "Failed to create Redis client",
                e.to_string(),
            )
        })?;

        let mut conn = redis::aio::ConnectionManager::new(client).await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;

        info!(prefix = %config.key_prefix, "Redis cache backend connected");

        Ok(Self {
            conn,
            config,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        })
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.config.key_prefix, key)
    }

    async fn scan_delete(&self, full_pattern: &str) -> Result<u64> {
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut total_deleted = 0;

        loop {
            let (new_cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(full_pattern)
                .arg("COUNT")
                .arg(200)
                .query_async(&mut conn)
                .await?;

            if !keys.is_empty() {
                let deleted: i64 = conn.del(&keys).await?;
                total_deleted += deleted as u64;
            }

            cursor = new_cursor;
            if cursor == 0 {
                break;
            }
        }

        Ok(total_deleted)
    }
}

#[async_trait]
impl CacheBackend for RedisBackend {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let mut conn = self.conn.clone();
        let data: Option<Vec<u8>> = conn.get(self.full_key(key)).await?;

        match data {
            Some(bytes) => {
                let entry: CacheEntry = serde_json::from_slice(&bytes)?;
                if entry.is_expired() {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    return Ok(None);
                }
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(entry))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &str, entry: CacheEntry) -> Result<()> {
        let mut conn = self.conn.clone();
        let data = serde_json::to_vec(&entry)?;
        let ttl_ms = entry.ttl.unwrap_or(self.config.default_ttl).as_millis().max(1) as u64;

        redis::cmd("SET")
            .arg(self.full_key(key))
            .arg(data)
            .arg("PX")
            .arg(ttl_ms)
            .query_async::<_, ()>(&mut conn)
            .await?;

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let deleted: i64 = conn.del(self.full_key(key)).await?;
        Ok(deleted > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let exists: bool = conn.exists(self.full_key(key)).await?;
        Ok(exists)
    }

    async fn stats(&self) -> Result<CacheStats> {
        let mut conn = self.conn.clone();
        let dbsize: u64 = redis::cmd("DBSIZE").query_async(&mut conn).await?;

        let mut stats = CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: dbsize,
            evictions: 0,
            hit_rate: 0.0,
            backend_stats: HashMap::new(),
        };
        stats.calculate_hit_rate();
        stats
            .backend_stats
            .insert("key_prefix".to_string(), self.config.key_prefix.clone());

        gauge!("keystone_cache_entries", "backend" => "redis").set(dbsize as f64);

        Ok(stats)
    }

    async fn clear(&self) -> Result<()> {
        let deleted = self.scan_delete(&format!("{}*", self.config.key_prefix)).await?;
        info!("Cleared {} Redis cache entries", deleted);
        counter!("keystone_cache_clears_total", "backend" => "redis").increment(1);
        Ok(())
    }

    async fn delete_by_pattern(&self, pattern: &str) -> Result<u64> {
        self.scan_delete(&self.full_key(pattern)).await
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
