//! Persistent record shapes and the key layout from spec §6.
//!
//! Every record is a JSON blob behind a `:`-separated key. The functions
//! here are the single source of truth for key construction so the rest of
//! the engine never hand-builds a key string.

use serde::{Deserialize, Serialize};

use crate::money::Amount;
use crate::types::{Chain, Currency, DepositStatus, EvmAddress, TxHash, Username, WithdrawalStatus};

pub fn account_key(username: &str) -> String {
    format!("account:{username}")
}

pub fn balance_key(username: &str, chain: &str, currency: &str) -> String {
    format!("balance:{username}:{chain}:{currency}")
}

pub fn deposit_key(tx_hash: &TxHash) -> String {
    format!("deposit:{}", tx_hash.as_str())
}

pub fn deposit_start_block_key(tx_hash: &TxHash) -> String {
    format!("depositStartBlock:{}", tx_hash.as_str())
}

pub fn withdrawal_key(id: &str) -> String {
    format!("withdrawal:{id}")
}

pub fn bucket_key(chain: &str, currency: &str, window_index: u64) -> String {
    format!("bucket:{chain}:{currency}:{window_index}")
}

pub fn block_cache_key(chain: &str, block_number: u64) -> String {
    format!("blockCache:{chain}:{block_number}")
}

pub fn gas_funding_key(tx_hash: &TxHash) -> String {
    format!("gasFundingTx:{}", tx_hash.as_str())
}

pub fn last_processed_block_key(chain: &str) -> String {
    format!("lastProcessedBlock:{chain}")
}

/// Prefix range helper matching spec §6: `[prefix, prefix + 0xFFFF]`.
pub fn prefix_range_end(prefix: &str) -> Vec<u8> {
    let mut end = prefix.as_bytes().to_vec();
    end.push(0xFF);
    end.push(0xFF);
    end
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub username: Username,
    /// One address reused across every chain in the deployment's EVM family.
    pub address: EvmAddress,
    /// `encrypt(private_key_bytes)`, hex `iv:ciphertext`.
    pub encrypted_signing_material: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Balance {
    pub available: Amount,
    pub frozen: Amount,
}

impl Balance {
    pub fn total(&self) -> Amount {
        self.available
            .checked_add(self.frozen)
            .unwrap_or(Amount::ZERO)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deposit {
    pub tx_hash: TxHash,
    pub username: Username,
    pub chain: Chain,
    pub currency: Currency,
    pub amount: Amount,
    pub sender: EvmAddress,
    pub recipient: EvmAddress,
    pub required_confirmations: u64,
    pub confirmations: u64,
    pub start_block: u64,
    pub retry_count: u32,
    pub status: DepositStatus,
    pub error_kind: Option<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Withdrawal {
    pub id: String,
    pub username: Username,
    pub chain: Chain,
    pub currency: Currency,
    pub amount: Amount,
    pub fee: Amount,
    pub destination: EvmAddress,
    pub bucket_id: Option<String>,
    pub settlement_tx_hash: Option<TxHash>,
    pub status: WithdrawalStatus,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl Withdrawal {
    /// `reserved = amount + fee`, the amount frozen at request time.
    pub fn reserved(&self) -> Amount {
        self.amount.checked_add(self.fee).unwrap_or(self.amount)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bucket {
    pub chain: Chain,
    pub currency: Currency,
    pub window_index: u64,
    pub withdrawal_ids: Vec<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub expires_at: chrono::DateTime<chrono::Utc>,
    pub settled: bool,
    /// Set once a batch transaction has been submitted on-chain for this
    /// bucket. A settlement retry that finds this already set resolves the
    /// existing submission instead of submitting a second batch call.
    pub submitted_tx_hash: Option<TxHash>,
}

impl Bucket {
    pub fn id(&self) -> String {
        bucket_key(&self.chain, &self.currency, self.window_index)
    }
}

/// A fetched block's full transaction list, cached so "block arrived" can be
/// decoupled from "block is old enough to scan for deposits."
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedBlock {
    pub chain: Chain,
    pub block_number: u64,
    pub transactions: Vec<CachedTransaction>,
    pub cached_at: chrono::DateTime<chrono::Utc>,
    pub ttl_secs: u64,
}

impl CachedBlock {
    pub fn is_expired(&self, now: chrono::DateTime<chrono::Utc>) -> bool {
        (now - self.cached_at).num_seconds() as i64 > self.ttl_secs as i64
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedTransaction {
    pub hash: TxHash,
    pub from: EvmAddress,
    pub to: Option<EvmAddress>,
    pub value: Amount,
    pub calldata_empty: bool,
}
