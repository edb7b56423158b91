//! Storage deposit arithmetic
//!
//! Every byte written to the ledger must be backed by a deposit. Amounts are
//! fixed-point `u128` values in the ledger's smallest unit so that large byte
//! counts never lose precision.

use crate::error::{CommitError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Smallest units per whole token (10^24)
pub const ONE_TOKEN: u128 = 1_000_000_000_000_000_000_000_000;

/// Default storage cost: 10^19 smallest units (0.00001 token) per byte
pub const DEFAULT_COST_PER_BYTE: Balance = Balance(10_000_000_000_000_000_000);

const TOKEN_DECIMALS: usize = 24;

/// Fixed-point token amount in smallest units
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Balance(u128);

impl Balance {
    pub const ZERO: Balance = Balance(0);

    pub const fn from_units(units: u128) -> Self {
        Self(units)
    }

    pub const fn as_units(&self) -> u128 {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }

    /// Parse an integer count of smallest units, the serialized form
    pub fn parse_units(s: &str) -> Result<Self> {
        s.trim()
            .parse::<u128>()
            .map(Balance)
            .map_err(|_| CommitError::Config(format!("invalid balance: {:?}", s)))
    }

    /// Parse a decimal token amount such as `"0.00001"` or `"1"`
    pub fn parse_tokens(s: &str) -> Result<Self> {
        let s = s.trim();
        let (whole, frac) = match s.split_once('.') {
            Some((w, f)) => (w, f),
            None => (s, ""),
        };
        if whole.is_empty() && frac.is_empty() {
            return Err(CommitError::Config(format!("invalid token amount: {:?}", s)));
        }
        if frac.len() > TOKEN_DECIMALS {
            return Err(CommitError::Config(format!(
                "token amount {:?} has more than {} decimals",
                s, TOKEN_DECIMALS
            )));
        }
        let whole: u128 = if whole.is_empty() {
            0
        } else {
            whole
                .parse()
                .map_err(|_| CommitError::Config(format!("invalid token amount: {:?}", s)))?
        };
        let frac_units: u128 = if frac.is_empty() {
            0
        } else {
            let padded = format!("{:0<width$}", frac, width = TOKEN_DECIMALS);
            padded
                .parse()
                .map_err(|_| CommitError::Config(format!("invalid token amount: {:?}", s)))?
        };
        whole
            .checked_mul(ONE_TOKEN)
            .and_then(|w| w.checked_add(frac_units))
            .map(Balance)
            .ok_or_else(|| CommitError::Config(format!("token amount {:?} overflows", s)))
    }

    pub fn saturating_add(self, other: Balance) -> Balance {
        Balance(self.0.saturating_add(other.0))
    }

    pub fn saturating_sub(self, other: Balance) -> Balance {
        Balance(self.0.saturating_sub(other.0))
    }

    /// Price `bytes` at `self` per byte
    pub fn per_byte(self, bytes: u64) -> Balance {
        Balance(self.0.saturating_mul(bytes as u128))
    }
}

impl fmt::Display for Balance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let whole = self.0 / ONE_TOKEN;
        let frac = self.0 % ONE_TOKEN;
        if frac == 0 {
            return write!(f, "{}", whole);
        }
        let digits = format!("{:0width$}", frac, width = TOKEN_DECIMALS);
        write!(f, "{}.{}", whole, digits.trim_end_matches('0'))
    }
}

impl FromStr for Balance {
    type Err = CommitError;

    /// Parses a decimal token amount, the same form `Display` prints
    fn from_str(s: &str) -> Result<Self> {
        Balance::parse_tokens(s)
    }
}

// Serialized as a decimal string: u128 does not survive JSON numbers or TOML integers.
impl Serialize for Balance {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for Balance {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Text(String),
            Int(u64),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Text(s) => Balance::parse_units(&s).map_err(serde::de::Error::custom),
            Repr::Int(n) => Ok(Balance(n as u128)),
        }
    }
}

/// Optional extra storage the user can prepay to avoid future confirmations
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u64", into = "u64")]
pub enum DepositTier {
    /// No extra deposit
    #[default]
    None,
    /// 5 KB
    Small,
    /// 20 KB
    Medium,
    /// 100 KB
    Large,
}

impl DepositTier {
    /// All tiers, smallest first
    pub const ALL: [DepositTier; 4] = [
        DepositTier::None,
        DepositTier::Small,
        DepositTier::Medium,
        DepositTier::Large,
    ];

    pub fn bytes(&self) -> u64 {
        match self {
            DepositTier::None => 0,
            DepositTier::Small => 5_000,
            DepositTier::Medium => 20_000,
            DepositTier::Large => 100_000,
        }
    }

    pub fn from_bytes(bytes: u64) -> Option<Self> {
        Self::ALL.into_iter().find(|tier| tier.bytes() == bytes)
    }
}

impl TryFrom<u64> for DepositTier {
    type Error = CommitError;

    fn try_from(bytes: u64) -> Result<Self> {
        Self::from_bytes(bytes).ok_or(CommitError::InvalidTier(bytes))
    }
}

impl From<DepositTier> for u64 {
    fn from(tier: DepositTier) -> u64 {
        tier.bytes()
    }
}

impl fmt::Display for DepositTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DepositTier::None => write!(f, "no deposit"),
            tier => write!(f, "{} bytes", tier.bytes()),
        }
    }
}

/// Turns byte counts into deposit amounts at a fixed per-byte price
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepositCalculator {
    cost_per_byte: Balance,
}

impl DepositCalculator {
    pub fn new(cost_per_byte: Balance) -> Self {
        Self { cost_per_byte }
    }

    pub fn cost_per_byte(&self) -> Balance {
        self.cost_per_byte
    }

    /// Deposit needed to store `bytes`
    pub fn cost_of(&self, bytes: u64) -> Balance {
        self.cost_per_byte.per_byte(bytes)
    }

    /// Mandatory deposit plus the chosen extra tier
    pub fn total_deposit(&self, mandatory_bytes: u64, extra: DepositTier) -> Balance {
        self.cost_of(mandatory_bytes)
            .saturating_add(self.cost_of(extra.bytes()))
    }

    /// How many whole bytes `amount` pays for
    pub fn bytes_covered(&self, amount: Balance) -> u64 {
        if self.cost_per_byte.is_zero() {
            return u64::MAX;
        }
        let bytes = amount.as_units() / self.cost_per_byte.as_units();
        u64::try_from(bytes).unwrap_or(u64::MAX)
    }
}

impl Default for DepositCalculator {
    fn default() -> Self {
        Self::new(DEFAULT_COST_PER_BYTE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cost_of_is_linear() {
        let calc = DepositCalculator::default();
        assert_eq!(calc.cost_of(0), Balance::ZERO);
        assert_eq!(calc.cost_of(1), DEFAULT_COST_PER_BYTE);
        assert_eq!(
            calc.cost_of(300).as_units(),
            DEFAULT_COST_PER_BYTE.as_units() * 300
        );
    }

    #[test]
    fn test_total_deposit_scenario() {
        let calc = DepositCalculator::new(Balance::parse_tokens("0.00001").unwrap());
        let total = calc.total_deposit(200, DepositTier::Small);
        assert_eq!(total, Balance::parse_tokens("0.052").unwrap());
        assert_eq!(total.to_string(), "0.052");
    }

    #[test]
    fn test_total_deposit_monotonic_in_tier() {
        let calc = DepositCalculator::default();
        for bytes in [0u64, 1, 200, 5_000, 1_000_000] {
            for pair in DepositTier::ALL.windows(2) {
                assert!(calc.total_deposit(bytes, pair[0]) <= calc.total_deposit(bytes, pair[1]));
            }
        }
    }

    #[test]
    fn test_large_byte_counts_keep_precision() {
        let calc = DepositCalculator::default();
        let bytes = 1_000_000_000_000u64;
        assert_eq!(
            calc.cost_of(bytes).as_units(),
            10_000_000_000_000_000_000u128 * 1_000_000_000_000u128
        );
        // Saturates rather than wrapping
        let huge = DepositCalculator::new(Balance::from_units(u128::MAX / 2));
        assert_eq!(huge.cost_of(u64::MAX), Balance::from_units(u128::MAX));
    }

    #[test]
    fn test_balance_display() {
        assert_eq!(Balance::ZERO.to_string(), "0");
        assert_eq!(Balance::from_units(ONE_TOKEN).to_string(), "1");
        assert_eq!(Balance::from_units(ONE_TOKEN / 20).to_string(), "0.05");
        assert_eq!(DEFAULT_COST_PER_BYTE.to_string(), "0.00001");
    }

    #[test]
    fn test_display_parses_back() {
        for units in [0, 1, 42, ONE_TOKEN / 20, ONE_TOKEN * 3 + 7] {
            let balance = Balance::from_units(units);
            assert_eq!(balance.to_string().parse::<Balance>().unwrap(), balance);
        }
        assert_eq!("0.00001".parse::<Balance>().unwrap(), DEFAULT_COST_PER_BYTE);
        assert_eq!(Balance::parse_units("42").unwrap(), Balance::from_units(42));
    }

    #[test]
    fn test_parse_tokens_rejects_garbage() {
        assert!(Balance::parse_tokens("abc").is_err());
        assert!(Balance::parse_tokens(".").is_err());
        assert!(Balance::parse_tokens("0.0000000000000000000000001").is_err());
        assert_eq!(Balance::parse_tokens(".5").unwrap(), Balance::from_units(ONE_TOKEN / 2));
    }

    #[test]
    fn test_balance_serde_as_string() {
        let json = serde_json::to_string(&DEFAULT_COST_PER_BYTE).unwrap();
        assert_eq!(json, "\"10000000000000000000\"");
        let back: Balance = serde_json::from_str(&json).unwrap();
        assert_eq!(back, DEFAULT_COST_PER_BYTE);
        let small: Balance = serde_json::from_str("42").unwrap();
        assert_eq!(small, Balance::from_units(42));
    }

    #[test]
    fn test_tier_from_bytes() {
        assert_eq!(DepositTier::from_bytes(20_000), Some(DepositTier::Medium));
        assert_eq!(DepositTier::from_bytes(1234), None);
        assert_eq!(DepositTier::try_from(7u64), Err(CommitError::InvalidTier(7)));
        let tier: DepositTier = serde_json::from_str("100000").unwrap();
        assert_eq!(tier, DepositTier::Large);
    }

    #[test]
    fn test_bytes_covered() {
        let calc = DepositCalculator::default();
        assert_eq!(calc.bytes_covered(calc.cost_of(1234)), 1234);
        assert_eq!(calc.bytes_covered(Balance::from_units(1)), 0);
    }
}
