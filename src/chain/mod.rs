//! The chain adapter: a uniform per-chain abstraction the indexer and batch
//! processor depend on, per spec §4.2. `evm` is the production
//! implementation against `alloy`; `mock` is a deterministic test double.

pub mod contracts;
pub mod evm;
#[cfg(test)]
pub mod mock;

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::errors::Result;
use crate::types::{EvmAddress, TxHash};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub number: u64,
}

#[derive(Debug, Clone)]
pub struct Block {
    pub number: u64,
    pub transactions: Vec<Transaction>,
}

#[derive(Debug, Clone)]
pub struct Transaction {
    pub hash: TxHash,
    pub from: EvmAddress,
    pub to: Option<EvmAddress>,
    /// Native value in wei (or the chain's smallest native unit).
    pub value: u128,
    pub input_empty: bool,
}

#[derive(Debug, Clone)]
pub struct TransferEvent {
    pub tx_hash: TxHash,
    pub from: EvmAddress,
    pub to: EvmAddress,
    pub value: u128,
    pub block_number: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptStatus {
    Success,
    Reverted,
}

#[derive(Debug, Clone)]
pub struct Receipt {
    pub tx_hash: TxHash,
    pub status: ReceiptStatus,
    pub block_number: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    Receipt { status: ReceiptStatus, block_number: u64 },
    Timeout,
}

/// A uniform per-chain abstraction. Implementations own reconnection,
/// push/pull transport selection and chain-id re-verification; callers never
/// see which transport profile is currently live.
#[async_trait]
pub trait ChainAdapter: Send + Sync {
    fn chain_id(&self) -> u64;

    /// Push channel of new head numbers; resumes transparently after
    /// reconnect or after falling back to polling.
    async fn subscribe_blocks(&self) -> Result<mpsc::Receiver<BlockHeader>>;

    async fn get_block_with_txs(&self, number: u64) -> Result<Block>;

    /// Log subscription for the ERC-20 `Transfer` topic on `token`.
    async fn subscribe_erc20_transfers(
        &self,
        token: &EvmAddress,
    ) -> Result<mpsc::Receiver<TransferEvent>>;

    async fn get_transaction(&self, hash: &TxHash) -> Result<Option<Transaction>>;

    async fn current_block_number(&self) -> Result<u64>;

    async fn get_native_balance(&self, addr: &EvmAddress) -> Result<u128>;

    async fn get_token_balance(&self, token: &EvmAddress, addr: &EvmAddress) -> Result<u128>;

    async fn get_erc20_allowance(
        &self,
        token: &EvmAddress,
        owner: &EvmAddress,
        spender: &EvmAddress,
    ) -> Result<u128>;

    async fn gas_price(&self) -> Result<u128>;

    async fn estimate_gas_native_transfer(&self, to: &EvmAddress, value: u128) -> Result<u64>;

    async fn estimate_gas_erc20_transfer(
        &self,
        token: &EvmAddress,
        to: &EvmAddress,
        amount: u128,
    ) -> Result<u64>;

    /// Send `value` native units from the account owning `signing_key` to
    /// `to`. Used both for user-key sweeps and hot-wallet gas top-ups; the
    /// hot wallet's own sends are serialized by the caller, not this method.
    async fn send_native(
        &self,
        signing_key: &[u8; 32],
        to: &EvmAddress,
        value: u128,
        gas_limit: u64,
    ) -> Result<TxHash>;

    async fn send_erc20_transfer(
        &self,
        signing_key: &[u8; 32],
        token: &EvmAddress,
        to: &EvmAddress,
        amount: u128,
        gas_limit: u64,
    ) -> Result<TxHash>;

    async fn approve_erc20(
        &self,
        signing_key: &[u8; 32],
        token: &EvmAddress,
        spender: &EvmAddress,
        amount: u128,
        gas_limit: u64,
    ) -> Result<TxHash>;

    /// Submits `processBatchNative` on `processor`, gas-limited at `1.2x`
    /// the estimate, falling back to `default_gas_limit` if estimation
    /// reverts, per spec §4.5 step 7.
    async fn submit_batch_native(
        &self,
        signing_key: &[u8; 32],
        processor: &EvmAddress,
        recipients: &[EvmAddress],
        amounts: &[u128],
        total_value: u128,
        default_gas_limit: u64,
    ) -> Result<TxHash>;

    async fn submit_batch_erc20(
        &self,
        signing_key: &[u8; 32],
        processor: &EvmAddress,
        token: &EvmAddress,
        recipients: &[EvmAddress],
        amounts: &[u128],
        default_gas_limit: u64,
    ) -> Result<TxHash>;

    async fn wait_for_receipt(
        &self,
        hash: &TxHash,
        confirmations: u64,
        timeout: Duration,
    ) -> Result<WaitOutcome>;
}
