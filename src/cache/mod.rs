//! Local cache primitives
//!
//! A domain-partitioned key/value store behind the async [`CacheStore`]
//! trait. Keys are arbitrary JSON; entries are addressed by the domain plus a
//! digest of the key's canonical form, so key objects that differ only in
//! field order address the same entry.

mod file;
mod invalidation;
mod memory;
mod permission;

pub use file::FileCacheStore;
pub use invalidation::{pattern_overlaps, InvalidationMatcher};
pub use memory::MemoryCacheStore;
pub use permission::{PermissionCache, COMMIT_DOMAIN};

use crate::canonical::canonical_digest;
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Composite cache key: a domain plus a JSON key object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheKey {
    pub domain: String,
    pub key: Value,
}

impl CacheKey {
    pub fn new(domain: impl Into<String>, key: Value) -> Self {
        Self {
            domain: domain.into(),
            key,
        }
    }

    /// Storage id: `domain:digest`
    pub fn entry_id(&self) -> String {
        format!("{}:{}", self.domain, canonical_digest(&self.key))
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.domain, canonical_digest(&self.key))
    }
}

/// A stored cache entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub domain: String,
    pub key: Value,
    pub value: Value,
}

impl CacheEntry {
    pub fn new(key: &CacheKey, value: Value) -> Self {
        Self {
            domain: key.domain.clone(),
            key: key.key.clone(),
            value,
        }
    }

    pub fn cache_key(&self) -> CacheKey {
        CacheKey::new(self.domain.clone(), self.key.clone())
    }
}

/// Predicate used for bulk removal
pub type EntryPredicate<'a> = &'a (dyn Fn(&CacheEntry) -> bool + Send + Sync);

/// Async key/value store backing the local cache
///
/// Stores may be shared by several executors; writes are last-write-wins.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Read the value stored under `key`
    async fn read(&self, key: &CacheKey) -> Result<Option<Value>>;

    /// Store `value` under `key`, replacing any previous value
    async fn write(&self, key: &CacheKey, value: Value) -> Result<()>;

    /// Remove `key`; returns whether an entry existed
    async fn remove(&self, key: &CacheKey) -> Result<bool>;

    /// Remove every entry the predicate selects; returns how many went
    async fn remove_matching(&self, predicate: EntryPredicate<'_>) -> Result<usize>;

    /// Drop entries derived from data that `written` supersedes
    async fn invalidate(&self, written: &Value) -> Result<usize> {
        let matcher = InvalidationMatcher::new(written);
        if matcher.is_empty() {
            return Ok(0);
        }
        self.remove_matching(&|entry: &CacheEntry| matcher.is_stale(entry))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_entry_id_ignores_field_order() {
        let a = CacheKey::new("social", json!({"action": "get", "keys": ["alice/**"]}));
        let b = CacheKey::new("social", json!({"keys": ["alice/**"], "action": "get"}));
        assert_eq!(a.entry_id(), b.entry_id());
        assert!(a.entry_id().starts_with("social:"));
    }

    #[test]
    fn test_entry_id_separates_domains() {
        let key = json!({"id": 1});
        assert_ne!(
            CacheKey::new("a", key.clone()).entry_id(),
            CacheKey::new("b", key).entry_id()
        );
    }
}
