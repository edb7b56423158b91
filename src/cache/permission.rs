//! Persistent permission cache
//!
//! One entry per `(resource, account)` pair in the `commit` domain of a
//! shared [`CacheStore`].

use super::{CacheKey, CacheStore};
use crate::error::{CommitError, Result};
use crate::permission::{PermissionKey, WritePermission, WRITE_PERMISSION_TYPE};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

/// Cache domain holding write permissions
pub const COMMIT_DOMAIN: &str = "commit";

/// Write permission lookups over a shared cache store
pub struct PermissionCache<C: CacheStore> {
    store: Arc<C>,
}

impl<C: CacheStore> Clone for PermissionCache<C> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<C: CacheStore> PermissionCache<C> {
    pub fn new(store: Arc<C>) -> Self {
        Self { store }
    }

    pub fn cache_key(key: &PermissionKey) -> CacheKey {
        CacheKey::new(
            COMMIT_DOMAIN,
            json!({
                "resource_id": key.resource_id,
                "account_id": key.account_id,
                "type": WRITE_PERMISSION_TYPE,
            }),
        )
    }

    /// Read the stored permission, failing on unreadable entries
    pub async fn try_get(&self, key: &PermissionKey) -> Result<WritePermission> {
        let stored = self
            .store
            .read(&Self::cache_key(key))
            .await
            .map_err(|e| CommitError::CacheRead(e.to_string()))?;
        match stored {
            None => Ok(WritePermission::Unknown),
            Some(value) => serde_json::from_value(value)
                .map_err(|e| CommitError::CacheRead(format!("malformed entry for {}: {}", key, e))),
        }
    }

    /// Read the stored permission; failures degrade to `Unknown`
    pub async fn get(&self, key: &PermissionKey) -> WritePermission {
        match self.try_get(key).await {
            Ok(permission) => permission,
            Err(e) => {
                warn!(key = %key, error = %e, "Permission lookup failed, treating as unknown");
                WritePermission::Unknown
            }
        }
    }

    /// Overwrite the stored permission; `Unknown` clears the entry
    pub async fn set(&self, key: &PermissionKey, permission: &WritePermission) -> Result<()> {
        let cache_key = Self::cache_key(key);
        match permission {
            WritePermission::Unknown => {
                self.store.remove(&cache_key).await?;
            }
            other => {
                self.store.write(&cache_key, serde_json::to_value(other)?).await?;
            }
        }
        debug!(key = %key, ?permission, "Stored write permission");
        Ok(())
    }

    /// Drop cache entries in other domains that `written` supersedes
    pub async fn invalidate(&self, written: &Value) -> Result<usize> {
        self.store.invalidate(written).await
    }
}
