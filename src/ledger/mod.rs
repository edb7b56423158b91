//! Ledger client capability surface
//!
//! The commit engine never talks to a ledger directly. Integrators provide a
//! [`LedgerClient`] that reads state, reports storage balances, checks the
//! delegated key's write permission and submits signed writes.

mod local;

pub use local::{AccountStorage, LedgerSnapshot, LocalLedger, DEFAULT_DELEGATE_KEY};

use crate::deposit::{Balance, DEFAULT_COST_PER_BYTE};
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Minimum storage an account without a storage record must buy, in bytes
pub const INITIAL_ACCOUNT_STORAGE_BYTES: u64 = 2_000;

/// Storage deposit held by the ledger for an account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageBalance {
    /// Everything the account has deposited
    pub total: Balance,
    /// Deposit not yet backing stored bytes
    pub available: Balance,
}

/// Operations the commit engine needs from a ledger
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Storage price per byte
    fn cost_per_byte(&self) -> Balance {
        DEFAULT_COST_PER_BYTE
    }

    /// Storage an account must buy on its first write
    fn initial_storage_bytes(&self) -> u64 {
        INITIAL_ACCOUNT_STORAGE_BYTES
    }

    /// Current values at the given `/`-separated paths, as a key tree
    async fn fetch_state(&self, keys: &[String]) -> Result<Value>;

    /// Storage deposit of `account_id`; `None` when it never registered
    async fn storage_balance(&self, account_id: &str) -> Result<Option<StorageBalance>>;

    /// Whether this client's delegated key may write `diff` for `account_id`
    async fn is_write_permission_granted(&self, account_id: &str, diff: &Value) -> Result<bool>;

    /// Write `payload` with the delegated key
    async fn submit_write(&self, account_id: &str, payload: &Value, deposit: Balance) -> Result<()>;

    /// Grant the delegated key write permission and write `payload`, atomically
    async fn submit_write_with_grant(
        &self,
        account_id: &str,
        payload: &Value,
        deposit: Balance,
    ) -> Result<()>;
}
