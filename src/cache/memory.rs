//! In-memory cache store

use super::{CacheEntry, CacheKey, CacheStore, EntryPredicate};
use crate::error::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Cache store that lives for the process lifetime
#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Snapshot of all entries
    pub async fn entries(&self) -> Vec<CacheEntry> {
        self.entries.read().await.values().cloned().collect()
    }
}

#[async_trait]
impl CacheStore for MemoryCacheStore {
    async fn read(&self, key: &CacheKey) -> Result<Option<Value>> {
        let entries = self.entries.read().await;
        Ok(entries.get(&key.entry_id()).map(|entry| entry.value.clone()))
    }

    async fn write(&self, key: &CacheKey, value: Value) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.insert(key.entry_id(), CacheEntry::new(key, value));
        Ok(())
    }

    async fn remove(&self, key: &CacheKey) -> Result<bool> {
        let mut entries = self.entries.write().await;
        Ok(entries.remove(&key.entry_id()).is_some())
    }

    async fn remove_matching(&self, predicate: EntryPredicate<'_>) -> Result<usize> {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, entry| !predicate(&*entry));
        Ok(before - entries.len())
    }
}
