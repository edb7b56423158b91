//! In-process reference ledger
//!
//! Keeps a key tree of account data, per-account storage deposits and the
//! set of accounts that granted this client's delegated key write access.
//! Useful for tests and for dry runs from the CLI; optionally persisted as a
//! JSON snapshot after every accepted write.

use super::{LedgerClient, StorageBalance, INITIAL_ACCOUNT_STORAGE_BYTES};
use crate::deposit::{Balance, DepositCalculator};
use crate::diff::{apply_patch, estimate_data_size, select_paths};
use crate::error::{CommitError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Delegated key name used when none is configured
pub const DEFAULT_DELEGATE_KEY: &str = "ledger-commit.delegate";

/// Storage bookkeeping for one account
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountStorage {
    pub deposited: Balance,
    pub used_bytes: u64,
}

/// Complete ledger state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    #[serde(default = "empty_object")]
    pub data: Value,
    #[serde(default)]
    pub accounts: BTreeMap<String, AccountStorage>,
    /// Accounts whose data the delegated key may write
    #[serde(default)]
    pub grants: BTreeSet<String>,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

impl Default for LedgerSnapshot {
    fn default() -> Self {
        Self {
            data: empty_object(),
            accounts: BTreeMap::new(),
            grants: BTreeSet::new(),
        }
    }
}

/// Reference [`LedgerClient`] backed by process memory
pub struct LocalLedger {
    calculator: DepositCalculator,
    delegate_key: String,
    initial_storage_bytes: u64,
    state: RwLock<LedgerSnapshot>,
    path: Option<PathBuf>,
}

impl LocalLedger {
    pub fn new(cost_per_byte: Balance) -> Self {
        Self {
            calculator: DepositCalculator::new(cost_per_byte),
            delegate_key: DEFAULT_DELEGATE_KEY.to_string(),
            initial_storage_bytes: INITIAL_ACCOUNT_STORAGE_BYTES,
            state: RwLock::new(LedgerSnapshot::default()),
            path: None,
        }
    }

    pub fn with_initial_storage(mut self, bytes: u64) -> Self {
        self.initial_storage_bytes = bytes;
        self
    }

    /// Name of the key writes are signed with, used in logs and rejections
    pub fn with_delegate_key(mut self, key: impl Into<String>) -> Self {
        self.delegate_key = key.into();
        self
    }

    pub fn delegate_key(&self) -> &str {
        &self.delegate_key
    }

    pub fn with_snapshot(self, snapshot: LedgerSnapshot) -> Self {
        Self {
            state: RwLock::new(snapshot),
            ..self
        }
    }

    /// Load the snapshot at `path` (if any) and persist there after writes
    pub async fn open(path: impl Into<PathBuf>, cost_per_byte: Balance) -> Result<Self> {
        let path = path.into();
        let snapshot = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => LedgerSnapshot::default(),
            Err(e) => return Err(e.into()),
        };
        info!(path = %path.display(), "Opened local ledger");
        Ok(Self {
            path: Some(path),
            ..Self::new(cost_per_byte).with_snapshot(snapshot)
        })
    }

    pub async fn snapshot(&self) -> LedgerSnapshot {
        self.state.read().await.clone()
    }

    /// Deposit storage for `account_id` outside of any write
    pub async fn deposit_storage(&self, account_id: &str, amount: Balance) -> Result<()> {
        let mut state = self.state.write().await;
        let mut next = state.clone();
        let entry = next.accounts.entry(account_id.to_string()).or_default();
        entry.deposited = entry.deposited.saturating_add(amount);
        self.replace(&mut state, next).await
    }

    /// Grant the delegated key write access to `account_id`'s data
    pub async fn grant(&self, account_id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let mut next = state.clone();
        next.grants.insert(account_id.to_string());
        self.replace(&mut state, next).await
    }

    /// Withdraw the delegated key's write access to `account_id`'s data
    pub async fn revoke(&self, account_id: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let mut next = state.clone();
        next.grants.remove(account_id);
        self.replace(&mut state, next).await
    }

    /// Persist `next`, then make it the live state. A failed persist leaves
    /// `state` untouched.
    async fn replace(&self, state: &mut LedgerSnapshot, next: LedgerSnapshot) -> Result<()> {
        self.persist(&next).await?;
        *state = next;
        Ok(())
    }

    async fn persist(&self, state: &LedgerSnapshot) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(state)?).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    async fn apply_write(
        &self,
        account_id: &str,
        payload: &Value,
        deposit: Balance,
        grant: bool,
    ) -> Result<()> {
        let mut state = self.state.write().await;

        if !grant && !state.grants.contains(account_id) {
            warn!(account_id, delegate_key = %self.delegate_key, "Write rejected: delegated key not authorized");
            return Err(CommitError::Rejected(format!(
                "{} has no write permission for {}",
                self.delegate_key, account_id
            )));
        }
        if !writes_only_own_data(account_id, payload) {
            return Err(CommitError::Rejected(format!(
                "{} may only write its own data",
                account_id
            )));
        }

        let mut data = state.data.clone();
        apply_patch(&mut data, payload);
        let account_data = data.get(account_id).cloned().unwrap_or(Value::Null);
        let used_bytes = if account_data.is_null() {
            0
        } else {
            estimate_data_size(&account_data, None).max(0) as u64
        };

        let storage = state.accounts.get(account_id).copied();
        let deposited = storage
            .map(|s| s.deposited)
            .unwrap_or_default()
            .saturating_add(deposit);
        let mut required = self.calculator.cost_of(used_bytes);
        if storage.is_none() {
            required = required.max(self.calculator.cost_of(self.initial_storage_bytes));
        }
        if deposited < required {
            return Err(CommitError::InsufficientDeposit {
                required: required.saturating_sub(storage.map(|s| s.deposited).unwrap_or_default()),
                attached: deposit,
            });
        }

        let mut next = state.clone();
        next.data = data;
        next.accounts.insert(
            account_id.to_string(),
            AccountStorage {
                deposited,
                used_bytes,
            },
        );
        if grant {
            next.grants.insert(account_id.to_string());
        }
        self.replace(&mut state, next).await?;
        info!(account_id, used_bytes, deposit = %deposit, grant, "Write accepted");
        Ok(())
    }
}

fn writes_only_own_data(account_id: &str, payload: &Value) -> bool {
    match payload {
        Value::Object(map) => map.keys().all(|key| key == account_id),
        _ => false,
    }
}

#[async_trait]
impl LedgerClient for LocalLedger {
    fn cost_per_byte(&self) -> Balance {
        self.calculator.cost_per_byte()
    }

    fn initial_storage_bytes(&self) -> u64 {
        self.initial_storage_bytes
    }

    async fn fetch_state(&self, keys: &[String]) -> Result<Value> {
        let state = self.state.read().await;
        Ok(select_paths(&state.data, keys))
    }

    async fn storage_balance(&self, account_id: &str) -> Result<Option<StorageBalance>> {
        let state = self.state.read().await;
        Ok(state.accounts.get(account_id).map(|s| StorageBalance {
            total: s.deposited,
            available: s
                .deposited
                .saturating_sub(self.calculator.cost_of(s.used_bytes)),
        }))
    }

    async fn is_write_permission_granted(&self, account_id: &str, diff: &Value) -> Result<bool> {
        let state = self.state.read().await;
        Ok(state.grants.contains(account_id) && writes_only_own_data(account_id, diff))
    }

    async fn submit_write(&self, account_id: &str, payload: &Value, deposit: Balance) -> Result<()> {
        self.apply_write(account_id, payload, deposit, false).await
    }

    async fn submit_write_with_grant(
        &self,
        account_id: &str,
        payload: &Value,
        deposit: Balance,
    ) -> Result<()> {
        self.apply_write(account_id, payload, deposit, true).await
    }
}
