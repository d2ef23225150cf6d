//! Cache key generation for decisions and hierarchies.
//!
//! Decision keys hash `(user, resource, action)` so identifiers of any length
//! or character set produce fixed-size keys that are safe for Redis `MATCH`.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::time::Duration;

use crate::models::UserId;

/// Namespaces stored by the authorization cache, with default lifetimes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyType {
    /// `(user, resource, action) -> allowed`
    Decision,
    /// `user -> resolved character hierarchy`
    Hierarchy,
}

impl KeyType {
    /// Hierarchies change far less often than permissions.
    pub fn default_ttl(&self) -> Duration {
        match self {
            Self::Decision => Duration::from_secs(5 * 60),
            Self::Hierarchy => Duration::from_secs(15 * 60),
        }
    }

    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Decision => "decision",
            Self::Hierarchy => "hierarchy",
        }
    }

    /// Glob matching every key of this type.
    pub fn pattern(&self) -> String {
        format!("{}:*", self.prefix())
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// A namespaced cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    key_type: KeyType,
    id: String,
}

impl CacheKey {
    /// Key for a permission decision.
    pub fn decision(user_id: &UserId, resource: &str, action: &str) -> Self {
        Self {
            key_type: KeyType::Decision,
            id: hash_for_key(&[user_id.as_str(), resource, action]),
        }
    }

    /// Key for a user's resolved hierarchy.
    pub fn hierarchy(user_id: &UserId) -> Self {
        Self {
            key_type: KeyType::Hierarchy,
            id: hash_for_key(&[user_id.as_str()]),
        }
    }

    pub fn key_type(&self) -> KeyType {
        self.key_type
    }

    pub fn ttl(&self) -> Duration {
        self.key_type.default_ttl()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.key_type.prefix(), self.id)
    }
}

/// Hash key segments into a hex digest. Segments are length-prefixed so
/// `("ab", "c")` and `("a", "bc")` never collide.
pub fn hash_for_key(segments: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for segment in segments {
        hasher.update((segment.len() as u64).to_le_bytes());
        hasher.update(segment.as_bytes());
    }
    hex::encode(&hasher.finalize()[..16])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decision_key_is_stable() {
        let user = UserId::new("u-1");
        let a = CacheKey::decision(&user, "scheduler:tasks", "read");
        let b = CacheKey::decision(&user, "scheduler:tasks", "read");
        assert_eq!(a, b);
        assert!(a.to_string().starts_with("decision:"));
        assert_eq!(a.to_string().len(), "decision:".len() + 32);
    }

    #[test]
    fn test_segments_do_not_collide() {
        assert_ne!(hash_for_key(&["ab", "c"]), hash_for_key(&["a", "bc"]));
    }

    #[test]
    fn test_default_ttls() {
        assert_eq!(KeyType::Decision.default_ttl(), Duration::from_secs(300));
        assert_eq!(KeyType::Hierarchy.default_ttl(), Duration::from_secs(900));
        assert_eq!(KeyType::Decision.pattern(), "decision:*");
    }
}
