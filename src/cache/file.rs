//! JSON-file backed cache store
//!
//! Entries are held in memory and the whole set is rewritten on every
//! mutation. Writes go to a sibling temp file first and are renamed into
//! place, so a crash never leaves a truncated cache behind.

use super::{CacheEntry, CacheKey, CacheStore, EntryPredicate};
use crate::error::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Cache store persisted to a single JSON file
#[derive(Debug)]
pub struct FileCacheStore {
    path: PathBuf,
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl FileCacheStore {
    /// Open the cache at `path`, starting empty if the file does not exist
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let list: Vec<CacheEntry> = serde_json::from_slice(&bytes)?;
                info!(path = %path.display(), entries = list.len(), "Loaded cache file");
                list.into_iter()
                    .map(|entry| (entry.cache_key().entry_id(), entry))
                    .collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path,
            entries: RwLock::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(&self, entries: &HashMap<String, CacheEntry>) -> Result<()> {
        let mut ids: Vec<&String> = entries.keys().collect();
        ids.sort();
        let list: Vec<&CacheEntry> = ids.into_iter().map(|id| &entries[id]).collect();
        let bytes = serde_json::to_vec_pretty(&list)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!(path = %self.path.display(), entries = list.len(), "Persisted cache file");
        Ok(())
    }
}

#[async_trait]
impl CacheStore for FileCacheStore {
    async fn read(&self, key: &CacheKey) -> Result<Option<Value>> {
        let entries = self.entries.read().await;
        Ok(entries.get(&key.entry_id()).map(|entry| entry.value.clone()))
    }

    async fn write(&self, key: &CacheKey, value: Value) -> Result<()> {
        let mut entries = self.entries.write().await;
        let mut next = entries.clone();
        next.insert(key.entry_id(), CacheEntry::new(key, value));
        self.persist(&next).await?;
        *entries = next;
        Ok(())
    }

    async fn remove(&self, key: &CacheKey) -> Result<bool> {
        let mut entries = self.entries.write().await;
        let id = key.entry_id();
        if !entries.contains_key(&id) {
            return Ok(false);
        }
        let mut next = entries.clone();
        next.remove(&id);
        self.persist(&next).await?;
        *entries = next;
        Ok(true)
    }

    async fn remove_matching(&self, predicate: EntryPredicate<'_>) -> Result<usize> {
        let mut entries = self.entries.write().await;
        let mut next = entries.clone();
        next.retain(|_, entry| !predicate(&*entry));
        let removed = entries.len() - next.len();
        if removed > 0 {
            self.persist(&next).await?;
            *entries = next;
        }
        Ok(removed)
    }
}
