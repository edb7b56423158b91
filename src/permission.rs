//! Delegated write permissions
//!
//! After a user confirms a write, the resource that staged it may be trusted
//! to stage "similar" writes without asking again. Similarity is a key tree:
//! the grant records every key path the user has already approved, and a new
//! write is covered when it adds no new path.

use crate::canonical::{canonical_eq, canonical_json};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use tracing::debug;

/// Capability type stored alongside every permission cache key
pub const WRITE_PERMISSION_TYPE: &str = "write_permission";

/// Key tree of approved write paths
///
/// Interior nodes are objects; a `true` node covers everything beneath it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GrantScope(Value);

impl GrantScope {
    /// Scope that covers nothing
    pub fn empty() -> Self {
        Self(Value::Object(Map::new()))
    }

    pub fn from_value(value: Value) -> Self {
        Self(value)
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    /// Scope after also approving every key path in `data`
    pub fn extend(&self, data: &Value) -> GrantScope {
        GrantScope(merge_scope(Some(&self.0), data))
    }

    /// Whether approving `data` would leave the scope unchanged
    pub fn covers(&self, data: &Value) -> bool {
        self.extend(data) == *self
    }
}

impl Default for GrantScope {
    fn default() -> Self {
        Self::empty()
    }
}

impl PartialEq for GrantScope {
    fn eq(&self, other: &Self) -> bool {
        canonical_eq(&self.0, &other.0)
    }
}

impl Eq for GrantScope {}

impl fmt::Display for GrantScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&canonical_json(&self.0))
    }
}

fn merge_scope(prev: Option<&Value>, data: &Value) -> Value {
    if let Some(Value::Bool(true)) = prev {
        return Value::Bool(true);
    }
    let mut scope = match prev {
        Some(Value::Object(map)) => map.clone(),
        _ => Map::new(),
    };
    if let Value::Object(entries) = data {
        for (key, value) in entries {
            let merged = if value.is_object() {
                merge_scope(scope.get(key), value)
            } else {
                Value::Bool(true)
            };
            scope.insert(key.clone(), merged);
        }
    }
    Value::Object(scope)
}

/// Last known standing permission of a resource for an account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "state", content = "scope", rename_all = "snake_case")]
pub enum WritePermission {
    /// Nothing recorded yet
    #[default]
    Unknown,
    /// The user opted out of delegated writes for this resource
    Denied,
    /// Writes inside the scope need no confirmation
    Grant(GrantScope),
}

impl WritePermission {
    pub fn is_denied(&self) -> bool {
        matches!(self, WritePermission::Denied)
    }

    pub fn scope(&self) -> Option<&GrantScope> {
        match self {
            WritePermission::Grant(scope) => Some(scope),
            _ => None,
        }
    }

    /// Permission to persist after a successful write of `account_data`
    ///
    /// Opting out records `Denied`; otherwise the prior scope (empty when
    /// unknown or denied) is extended with the written paths.
    pub fn after_commit(&self, account_data: &Value, delegate_future: bool) -> WritePermission {
        if !delegate_future {
            return WritePermission::Denied;
        }
        let prior = self.scope().cloned().unwrap_or_default();
        WritePermission::Grant(prior.extend(account_data))
    }
}

/// Identity of a permission cache entry
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PermissionKey {
    pub resource_id: String,
    pub account_id: String,
}

impl PermissionKey {
    pub fn new(resource_id: impl Into<String>, account_id: impl Into<String>) -> Self {
        Self {
            resource_id: resource_id.into(),
            account_id: account_id.into(),
        }
    }
}

impl fmt::Display for PermissionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.account_id, self.resource_id)
    }
}

/// Permission as currently known to an executor
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "permission", rename_all = "snake_case")]
pub enum PermissionView {
    /// A lookup is outstanding
    Loading,
    Loaded(WritePermission),
}

impl PermissionView {
    pub fn is_loaded(&self) -> bool {
        matches!(self, PermissionView::Loaded(_))
    }

    pub fn permission(&self) -> Option<&WritePermission> {
        match self {
            PermissionView::Loaded(permission) => Some(permission),
            PermissionView::Loading => None,
        }
    }
}

/// Tag carried by an outstanding permission lookup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionTicket {
    pub generation: u64,
    pub key: PermissionKey,
}

/// Active permission of one executor, guarded against stale lookups
///
/// Every lookup is issued under a new generation. A result is applied only
/// if its ticket is still the latest one for the active key; anything else
/// is dropped and counted.
#[derive(Debug)]
pub struct PermissionSlot {
    active: Option<PermissionKey>,
    generation: u64,
    view: PermissionView,
    discarded: u64,
}

impl PermissionSlot {
    pub fn new() -> Self {
        Self {
            active: None,
            generation: 0,
            view: PermissionView::Loaded(WritePermission::Denied),
            discarded: 0,
        }
    }

    pub fn active(&self) -> Option<&PermissionKey> {
        self.active.as_ref()
    }

    pub fn view(&self) -> &PermissionView {
        &self.view
    }

    pub fn current(&self) -> Option<&WritePermission> {
        self.view.permission()
    }

    /// Number of lookup results dropped as stale
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// Start a lookup for `key`, superseding any outstanding one
    pub fn begin(&mut self, key: PermissionKey) -> PermissionTicket {
        self.generation += 1;
        self.active = Some(key.clone());
        self.view = PermissionView::Loading;
        PermissionTicket {
            generation: self.generation,
            key,
        }
    }

    /// No resource to delegate to: permission is fixed at `Denied`
    pub fn detach(&mut self) {
        self.generation += 1;
        self.active = None;
        self.view = PermissionView::Loaded(WritePermission::Denied);
    }

    /// Apply a lookup result; returns false when it was stale
    pub fn resolve(&mut self, ticket: &PermissionTicket, permission: WritePermission) -> bool {
        if ticket.generation != self.generation || self.active.as_ref() != Some(&ticket.key) {
            self.discarded += 1;
            debug!(
                key = %ticket.key,
                generation = ticket.generation,
                current = self.generation,
                "Discarding stale permission lookup"
            );
            return false;
        }
        self.view = PermissionView::Loaded(permission);
        true
    }

    /// Record a permission written after a commit
    ///
    /// Outstanding lookups are invalidated so an older read cannot
    /// overwrite the fresh value.
    pub fn store(&mut self, key: &PermissionKey, permission: WritePermission) {
        if self.active.as_ref() == Some(key) {
            self.generation += 1;
            self.view = PermissionView::Loaded(permission);
        }
    }
}

impl Default for PermissionSlot {
    fn default() -> Self {
        Self::new()
    }
}
