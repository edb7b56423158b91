//! Configuration

use crate::deposit::{Balance, DepositTier, DEFAULT_COST_PER_BYTE};
use crate::error::{CommitError, Result};
use crate::ledger::{DEFAULT_DELEGATE_KEY, INITIAL_ACCOUNT_STORAGE_BYTES};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub commit: CommitConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Storage price per byte as a decimal token amount
    #[serde(default = "default_cost_per_byte")]
    pub cost_per_byte: String,

    /// Storage a new account must buy on its first write
    #[serde(default = "default_initial_storage")]
    pub initial_account_storage_bytes: u64,

    /// Local ledger snapshot file
    #[serde(default = "default_state_file")]
    pub state_file: PathBuf,

    /// Name of the delegated signing key
    #[serde(default = "default_delegate_key")]
    pub delegate_key: String,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            cost_per_byte: default_cost_per_byte(),
            initial_account_storage_bytes: default_initial_storage(),
            state_file: default_state_file(),
            delegate_key: default_delegate_key(),
        }
    }
}

impl LedgerConfig {
    pub fn cost_per_byte(&self) -> Result<Balance> {
        Balance::parse_tokens(&self.cost_per_byte)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Cache file shared by every executor
    #[serde(default = "default_cache_path")]
    pub path: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: default_cache_path(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitConfig {
    /// Extra storage bought with manual commits, in bytes
    #[serde(default)]
    pub extra_tier: DepositTier,

    /// Default of the "don't ask again" toggle
    #[serde(default = "default_true")]
    pub delegate_future: bool,
}

impl Default for CommitConfig {
    fn default() -> Self {
        Self {
            extra_tier: DepositTier::None,
            delegate_future: true,
        }
    }
}

// Defaults
fn default_cost_per_byte() -> String { DEFAULT_COST_PER_BYTE.to_string() }
fn default_initial_storage() -> u64 { INITIAL_ACCOUNT_STORAGE_BYTES }
fn default_state_file() -> PathBuf { PathBuf::from("ledger-state.json") }
fn default_delegate_key() -> String { DEFAULT_DELEGATE_KEY.to_string() }
fn default_cache_path() -> PathBuf { PathBuf::from("commit-cache.json") }
fn default_true() -> bool { true }

impl Config {
    /// Load from a TOML file; a missing file yields the defaults
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.ledger.cost_per_byte()?;
        if self.ledger.delegate_key.trim().is_empty() {
            return Err(CommitError::Config("ledger.delegate_key must not be empty".into()));
        }
        Ok(())
    }
}
