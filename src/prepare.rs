//! Commit preparation
//!
//! Turns a staged payload into a [`PreparedCommit`]: the minimal diff against
//! the ledger's current state, the storage it needs beyond what the account
//! already has available, and whether the delegated key may write it.

use crate::canonical::canonical_json;
use crate::diff::{compute_diff, estimate_data_size, extract_keys};
use crate::deposit::DepositCalculator;
use crate::error::{CommitError, Result};
use crate::ledger::LedgerClient;
use crate::permission::PermissionKey;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tracing::{debug, info};

/// One commit attempt as staged by the caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitRequest {
    pub payload: Value,
    /// Resource the write is delegated to, if any
    #[serde(default)]
    pub resource_id: Option<String>,
    /// Signed-in account; `None` when unauthenticated
    #[serde(default)]
    pub account_id: Option<String>,
    /// Write the whole payload instead of its diff
    #[serde(default)]
    pub force: bool,
}

impl CommitRequest {
    pub fn new(payload: Value) -> Self {
        Self {
            payload,
            resource_id: None,
            account_id: None,
            force: false,
        }
    }

    pub fn resource(mut self, resource_id: impl Into<String>) -> Self {
        self.resource_id = Some(resource_id.into());
        self
    }

    pub fn account(mut self, account_id: impl Into<String>) -> Self {
        self.account_id = Some(account_id.into());
        self
    }

    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }

    /// Permission cache key, when both a resource and an account are set
    pub fn permission_key(&self) -> Option<PermissionKey> {
        match (&self.resource_id, &self.account_id) {
            (Some(resource), Some(account)) => Some(PermissionKey::new(resource, account)),
            _ => None,
        }
    }

    /// Same resource and account as `other`
    pub fn same_pair(&self, other: &CommitRequest) -> bool {
        self.resource_id == other.resource_id && self.account_id == other.account_id
    }

    /// Portion of `diff` under this request's account
    pub fn account_data(&self, diff: &Value) -> Value {
        self.account_id
            .as_deref()
            .and_then(|account| diff.get(account))
            .cloned()
            .unwrap_or(Value::Null)
    }
}

/// Result of preparing a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreparedCommit {
    /// Patch to write; `None` when nothing would change
    pub diff: Option<Value>,
    /// Storage the account has to pay for, in bytes
    pub deposit_bytes: u64,
    /// Whether the delegated key may already write `diff`
    pub permission_granted: bool,
}

impl PreparedCommit {
    pub fn has_changes(&self) -> bool {
        self.diff.is_some()
    }
}

type PairKey = (Option<String>, Option<String>);

/// Prepares requests, skipping payloads already prepared for their pair
#[derive(Debug, Default)]
pub struct CommitPreparer {
    memo: HashMap<PairKey, String>,
}

impl CommitPreparer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `request` as dispatched
    ///
    /// Returns false when its payload matches the last one recorded for the
    /// same pair and the request is not forced.
    pub fn begin(&mut self, request: &CommitRequest) -> bool {
        let pair = (request.resource_id.clone(), request.account_id.clone());
        let payload = canonical_json(&request.payload);
        if !request.force && self.memo.get(&pair) == Some(&payload) {
            debug!(
                resource_id = ?request.resource_id,
                account_id = ?request.account_id,
                "Payload unchanged, skipping preparation"
            );
            return false;
        }
        self.memo.insert(pair, payload);
        true
    }

    /// Forget the memo of `request`'s pair
    pub fn forget(&mut self, request: &CommitRequest) {
        self.memo
            .remove(&(request.resource_id.clone(), request.account_id.clone()));
    }

    /// Forget every recorded payload
    pub fn reset(&mut self) {
        self.memo.clear();
    }

    /// Prepare `request`; `None` when its payload was already prepared
    pub async fn prepare<L>(&mut self, ledger: &L, request: &CommitRequest) -> Result<Option<PreparedCommit>>
    where
        L: LedgerClient + ?Sized,
    {
        if request.account_id.is_none() {
            return Err(CommitError::NotAuthenticated);
        }
        if !self.begin(request) {
            return Ok(None);
        }
        match build_commit(ledger, request).await {
            Ok(commit) => Ok(Some(commit)),
            Err(e) => {
                self.forget(request);
                Err(e)
            }
        }
    }
}

/// Compute the prepared commit for `request` against `ledger`
pub async fn build_commit<L>(ledger: &L, request: &CommitRequest) -> Result<PreparedCommit>
where
    L: LedgerClient + ?Sized,
{
    let account_id = request
        .account_id
        .as_deref()
        .ok_or(CommitError::NotAuthenticated)?;

    let keys = extract_keys(&request.payload);
    let current = ledger
        .fetch_state(&keys)
        .await
        .map_err(|e| CommitError::Preparation(format!("fetching state: {}", e)))?;

    let diff = if request.force {
        Some(request.payload.clone()).filter(|payload| !payload.is_null())
    } else {
        compute_diff(&request.payload, &current)
    };

    let Some(diff) = diff else {
        info!(account_id, keys = keys.len(), "Nothing to commit");
        return Ok(PreparedCommit {
            diff: None,
            deposit_bytes: 0,
            permission_granted: false,
        });
    };

    let data_bytes = estimate_data_size(&diff, Some(&current)).max(0) as u64;
    let calculator = DepositCalculator::new(ledger.cost_per_byte());
    let storage = ledger
        .storage_balance(account_id)
        .await
        .map_err(|e| CommitError::Preparation(format!("fetching storage balance: {}", e)))?;

    let deposit_bytes = match storage {
        Some(balance) => data_bytes.saturating_sub(calculator.bytes_covered(balance.available)),
        None => data_bytes.max(ledger.initial_storage_bytes()),
    };

    let permission_granted = ledger
        .is_write_permission_granted(account_id, &diff)
        .await
        .map_err(|e| CommitError::Preparation(format!("checking write permission: {}", e)))?;

    info!(
        account_id,
        data_bytes,
        deposit_bytes,
        permission_granted,
        force = request.force,
        "Prepared commit"
    );

    Ok(PreparedCommit {
        diff: Some(diff),
        deposit_bytes,
        permission_granted,
    })
}
