//! Core domain identifiers and state machines.
//!
//! A `Chain` is the configured name of one EVM-compatible network (e.g.
//! `"mind"`), not a numeric id — the numeric `chainId` lives in
//! [`crate::config::ChainConfig`] and is verified against the adapter on
//! every reconnect. `Currency` is the configured token symbol; the native
//! asset uses the chain's `nativeCurrency` symbol.

use serde::{Deserialize, Serialize};
use std::fmt;

pub type Chain = String;
pub type Currency = String;
pub type Username = String;

/// A 20-byte EVM address, stored lowercased in hex with a `0x` prefix.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EvmAddress(String);

impl EvmAddress {
    pub fn from_hex(s: &str) -> Result<Self, String> {
        let s = s.trim();
        let stripped = s.strip_prefix("0x").unwrap_or(s);
        if stripped.len() != 40 || !stripped.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(format!("invalid EVM address: {s}"));
        }
        Ok(EvmAddress(format!("0x{}", stripped.to_lowercase())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EvmAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A transaction hash, stored lowercased in hex with a `0x` prefix.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxHash(String);

impl TxHash {
    pub fn from_hex(s: &str) -> Self {
        let s = s.trim();
        let stripped = s.strip_prefix("0x").unwrap_or(s);
        TxHash(format!("0x{}", stripped.to_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Deposit lifecycle. `pending -> confirming -> confirmed -> credited` or
/// `-> failed`. Only `credited` and `failed` are terminal; a deposit never
/// transitions backwards (invariant 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DepositStatus {
    Pending,
    Confirming,
    Confirmed,
    Credited,
    Failed,
}

impl DepositStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, DepositStatus::Credited | DepositStatus::Failed)
    }

    /// Rank used to enforce invariant 3 (no backwards transitions).
    fn rank(self) -> u8 {
        match self {
            DepositStatus::Pending => 0,
            DepositStatus::Confirming => 1,
            DepositStatus::Confirmed => 2,
            DepositStatus::Credited => 3,
            DepositStatus::Failed => 3,
        }
    }

    /// Whether moving from `self` to `next` is a legal forward transition.
    /// `failed` is reachable from any non-terminal state (abandonment), but
    /// a terminal state can never be left.
    pub fn can_transition_to(self, next: DepositStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        if next == DepositStatus::Failed {
            return true;
        }
        next.rank() >= self.rank()
    }
}

impl fmt::Display for DepositStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DepositStatus::Pending => "pending",
            DepositStatus::Confirming => "confirming",
            DepositStatus::Confirmed => "confirmed",
            DepositStatus::Credited => "credited",
            DepositStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Withdrawal lifecycle. `created -> added_to_bucket -> processing ->
/// completed` or `-> failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WithdrawalStatus {
    Created,
    AddedToBucket,
    Processing,
    Completed,
    Failed,
}

impl WithdrawalStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, WithdrawalStatus::Completed | WithdrawalStatus::Failed)
    }
}

impl fmt::Display for WithdrawalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WithdrawalStatus::Created => "created",
            WithdrawalStatus::AddedToBucket => "added_to_bucket",
            WithdrawalStatus::Processing => "processing",
            WithdrawalStatus::Completed => "completed",
            WithdrawalStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// An asset within a chain: either the chain's native coin or a configured
/// ERC-20 token, carrying the decimals needed to convert to/from on-chain
/// integer units.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Asset {
    Native,
    Token { address: EvmAddress, decimals: u8 },
}

impl Asset {
    pub fn decimals(&self, native_decimals: u8) -> u8 {
        match self {
            Asset::Native => native_decimals,
            Asset::Token { decimals, .. } => *decimals,
        }
    }
}
