//! Ledger Commit - write negotiation for cost-metered ledgers
//!
//! Stages structured-data writes against an append-only ledger where every
//! stored byte is paid for with a deposit.
//!
//! # Architecture
//!
//! - **Preparation**: diff the staged payload against the ledger's current
//!   state and work out the storage deposit the diff needs
//! - **Permissions**: remember, per resource and account, which key paths the
//!   user already approved for delegated writes
//! - **Execution**: a state machine that submits covered, free writes on its
//!   own and asks the user for everything else
//!
//! # Example
//!
//! ```rust,ignore
//! use ledger_commit::{CommitCallbacks, CommitExecutor, CommitRequest, DepositTier};
//!
//! let handle = CommitExecutor::spawn(ledger, cache, CommitCallbacks::new());
//! handle
//!     .set_request(CommitRequest::new(payload).resource("bob/widget/App").account("alice"))
//!     .await?;
//!
//! let snapshot = handle.wait_for(|s| !s.state.is_busy()).await?;
//! if snapshot.needs_decision() {
//!     handle.confirm(DepositTier::Small, snapshot.delegate_future).await?;
//! }
//! ```

// Canonical JSON encoding
pub mod canonical;

// Deposit arithmetic
pub mod deposit;

// Payload diffing and size estimation
pub mod diff;

// Delegated write permissions
pub mod permission;

// Local cache stores and the permission cache
pub mod cache;

// Ledger client surface
pub mod ledger;

// Commit preparation
pub mod prepare;

// State machine and async driver
pub mod executor;

// Configuration
pub mod config;

// Error types
pub mod error;

// Re-export deposit types
pub use deposit::{Balance, DepositCalculator, DepositTier, DEFAULT_COST_PER_BYTE};

// Re-export permission types
pub use permission::{GrantScope, PermissionKey, PermissionView, WritePermission};

// Re-export cache types
pub use cache::{CacheEntry, CacheKey, CacheStore, FileCacheStore, MemoryCacheStore, PermissionCache};

// Re-export ledger types
pub use ledger::{LedgerClient, LocalLedger, StorageBalance};

// Re-export commit types
pub use prepare::{CommitPreparer, CommitRequest, PreparedCommit};
pub use executor::{CommitCallbacks, CommitExecutor, CommitHandle, CommitSnapshot, CommitState};

pub use config::Config;

// Re-export error types
pub use error::{CommitError, Result};
