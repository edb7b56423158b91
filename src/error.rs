//! Error types for commit negotiation

use thiserror::Error;

use crate::deposit::Balance;
use crate::executor::CommitState;

/// Result type for commit operations
pub type Result<T> = std::result::Result<T, CommitError>;

/// Commit error types
///
/// Errors are `Clone` so they can travel inside executor events and be
/// handed to both the error callback and the published snapshot.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommitError {
    /// No account is signed in
    #[error("No authenticated account")]
    NotAuthenticated,

    /// A preparation or submission is already running
    #[error("Commit executor busy ({0})")]
    Busy(CommitState),

    /// Confirmation arrived with nothing prepared
    #[error("No prepared commit to confirm")]
    NoPreparedCommit,

    /// The prepared commit carries no diff
    #[error("No new data to save")]
    NothingToCommit,

    /// Retry requested before any request was staged
    #[error("No commit request staged")]
    NoRequest,

    /// Fetching remote state or storage info failed
    #[error("Preparation failed: {0}")]
    Preparation(String),

    /// Network or transport failure during submission
    #[error("Submission failed: {0}")]
    Submission(String),

    /// The ledger refused the write
    #[error("Ledger rejected write: {0}")]
    Rejected(String),

    /// Attached deposit does not cover the storage the write needs
    #[error("Insufficient deposit: {required} required, {attached} attached")]
    InsufficientDeposit { required: Balance, attached: Balance },

    /// Permission cache could not be read
    #[error("Permission cache read failed: {0}")]
    CacheRead(String),

    /// Storage error (cache or ledger snapshot files)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// The executor driver is no longer running
    #[error("Commit executor stopped")]
    Stopped,

    /// Byte count is not one of the extra storage tiers
    #[error("Invalid extra storage tier: {0} bytes")]
    InvalidTier(u64),
}

impl CommitError {
    /// Whether the error came back from a ledger submission
    pub fn is_submission_failure(&self) -> bool {
        matches!(
            self,
            CommitError::Submission(_)
                | CommitError::Rejected(_)
                | CommitError::InsufficientDeposit { .. }
        )
    }
}

impl From<serde_json::Error> for CommitError {
    fn from(err: serde_json::Error) -> Self {
        CommitError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for CommitError {
    fn from(err: std::io::Error) -> Self {
        CommitError::Storage(err.to_string())
    }
}

impl From<toml::de::Error> for CommitError {
    fn from(err: toml::de::Error) -> Self {
        CommitError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_busy_message_uses_state_name() {
        let err = CommitError::Busy(CommitState::AwaitingDecision);
        assert_eq!(err.to_string(), "Commit executor busy (awaiting_decision)");
    }

    #[test]
    fn test_submission_failure_classification() {
        assert!(CommitError::Submission("timeout".into()).is_submission_failure());
        assert!(CommitError::InsufficientDeposit {
            required: Balance::from_units(2),
            attached: Balance::ZERO,
        }
        .is_submission_failure());
        assert!(!CommitError::Preparation("offline".into()).is_submission_failure());
        assert!(!CommitError::Stopped.is_submission_failure());
    }
}
