//! A deterministic, in-process [`ChainAdapter`] double used by indexer and
//! batcher unit/integration tests. No network, no real signing.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::chain::{
    Block, BlockHeader, ChainAdapter, Transaction, TransferEvent, WaitOutcome, ReceiptStatus,
};
use crate::errors::{EngineError, Result};
use crate::types::{EvmAddress, TxHash};

#[derive(Default)]
pub struct MockChainAdapter {
    pub chain_id: u64,
    pub blocks: Mutex<HashMap<u64, Block>>,
    pub transactions: Mutex<HashMap<String, Transaction>>,
    pub native_balances: Mutex<HashMap<String, u128>>,
    pub token_balances: Mutex<HashMap<(String, String), u128>>,
    pub allowances: Mutex<HashMap<(String, String, String), u128>>,
    pub current_block: Mutex<u64>,
    /// Every submitted tx hash maps to the outcome `wait_for_receipt` should
    /// report.
    pub receipts: Mutex<HashMap<String, ReceiptStatus>>,
    pub next_tx_index: Mutex<u64>,
}

impl MockChainAdapter {
    pub fn new(chain_id: u64) -> Self {
        Self {
            chain_id,
            ..Default::default()
        }
    }

    pub fn set_current_block(&self, number: u64) {
        *self.current_block.lock().unwrap() = number;
    }

    pub fn insert_block(&self, block: Block) {
        self.blocks.lock().unwrap().insert(block.number, block);
    }

    pub fn credit_native(&self, addr: &EvmAddress, amount: u128) {
        *self
            .native_balances
            .lock()
            .unwrap()
            .entry(addr.as_str().to_string())
            .or_insert(0) += amount;
    }

    pub fn credit_token(&self, token: &EvmAddress, addr: &EvmAddress, amount: u128) {
        *self
            .token_balances
            .lock()
            .unwrap()
            .entry((token.as_str().to_string(), addr.as_str().to_string()))
            .or_insert(0) += amount;
    }

    fn next_hash(&self) -> TxHash {
        let mut idx = self.next_tx_index.lock().unwrap();
        *idx += 1;
        TxHash::from_hex(&format!("0x{:064x}", *idx))
    }
}

#[async_trait]
impl ChainAdapter for MockChainAdapter {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn subscribe_blocks(&self) -> Result<mpsc::Receiver<BlockHeader>> {
        let (_tx, rx) = mpsc::channel(1);
        Ok(rx)
    }

    async fn get_block_with_txs(&self, number: u64) -> Result<Block> {
        self.blocks
            .lock()
            .unwrap()
            .get(&number)
            .cloned()
            .ok_or(EngineError::NotFound)
    }

    async fn subscribe_erc20_transfers(
        &self,
        _token: &EvmAddress,
    ) -> Result<mpsc::Receiver<TransferEvent>> {
        let (_tx, rx) = mpsc::channel(1);
        Ok(rx)
    }

    async fn get_transaction(&self, hash: &TxHash) -> Result<Option<Transaction>> {
        Ok(self
            .transactions
            .lock()
            .unwrap()
            .get(hash.as_str())
            .cloned())
    }

    async fn current_block_number(&self) -> Result<u64> {
        Ok(*self.current_block.lock().unwrap())
    }

    async fn get_native_balance(&self, addr: &EvmAddress) -> Result<u128> {
        Ok(*self
            .native_balances
            .lock()
            .unwrap()
            .get(addr.as_str())
            .unwrap_or(&0))
    }

    async fn get_token_balance(&self, token: &EvmAddress, addr: &EvmAddress) -> Result<u128> {
        Ok(*self
            .token_balances
            .lock()
            .unwrap()
            .get(&(token.as_str().to_string(), addr.as_str().to_string()))
            .unwrap_or(&0))
    }

    async fn get_erc20_allowance(
        &self,
        token: &EvmAddress,
        owner: &EvmAddress,
        spender: &EvmAddress,
    ) -> Result<u128> {
        Ok(*self
            .allowances
            .lock()
            .unwrap()
            .get(&(
                token.as_str().to_string(),
                owner.as_str().to_string(),
                spender.as_str().to_string(),
            ))
            .unwrap_or(&0))
    }

    async fn gas_price(&self) -> Result<u128> {
        Ok(1_000_000_000)
    }

    async fn estimate_gas_native_transfer(&self, _to: &EvmAddress, _value: u128) -> Result<u64> {
        Ok(21_000)
    }

    async fn estimate_gas_erc20_transfer(
        &self,
        _token: &EvmAddress,
        _to: &EvmAddress,
        _amount: u128,
    ) -> Result<u64> {
        Ok(65_000)
    }

    async fn send_native(
        &self,
        _signing_key: &[u8; 32],
        to: &EvmAddress,
        value: u128,
        _gas_limit: u64,
    ) -> Result<TxHash> {
        self.credit_native(to, value);
        let hash = self.next_hash();
        self.receipts
            .lock()
            .unwrap()
            .insert(hash.as_str().to_string(), ReceiptStatus::Success);
        Ok(hash)
    }

    async fn send_erc20_transfer(
        &self,
        _signing_key: &[u8; 32],
        token: &EvmAddress,
        to: &EvmAddress,
        amount: u128,
        _gas_limit: u64,
    ) -> Result<TxHash> {
        self.credit_token(token, to, amount);
        let hash = self.next_hash();
        self.receipts
            .lock()
            .unwrap()
            .insert(hash.as_str().to_string(), ReceiptStatus::Success);
        Ok(hash)
    }

    async fn approve_erc20(
        &self,
        _signing_key: &[u8; 32],
        token: &EvmAddress,
        spender: &EvmAddress,
        amount: u128,
        _gas_limit: u64,
    ) -> Result<TxHash> {
        // owner address is unknown in this minimal double; approvals are
        // keyed loosely by token/spender for the tests that use this mock.
        self.allowances.lock().unwrap().insert(
            (token.as_str().to_string(), String::new(), spender.as_str().to_string()),
            amount,
        );
        let hash = self.next_hash();
        self.receipts
            .lock()
            .unwrap()
            .insert(hash.as_str().to_string(), ReceiptStatus::Success);
        Ok(hash)
    }

    async fn submit_batch_native(
        &self,
        _signing_key: &[u8; 32],
        _processor: &EvmAddress,
        recipients: &[EvmAddress],
        amounts: &[u128],
        _total_value: u128,
        _default_gas_limit: u64,
    ) -> Result<TxHash> {
        for (recipient, amount) in recipients.iter().zip(amounts) {
            self.credit_native(recipient, *amount);
        }
        let hash = self.next_hash();
        self.receipts
            .lock()
            .unwrap()
            .insert(hash.as_str().to_string(), ReceiptStatus::Success);
        Ok(hash)
    }

    async fn submit_batch_erc20(
        &self,
        _signing_key: &[u8; 32],
        _processor: &EvmAddress,
        token: &EvmAddress,
        recipients: &[EvmAddress],
        amounts: &[u128],
        _default_gas_limit: u64,
    ) -> Result<TxHash> {
        for (recipient, amount) in recipients.iter().zip(amounts) {
            self.credit_token(token, recipient, *amount);
        }
        let hash = self.next_hash();
        self.receipts
            .lock()
            .unwrap()
            .insert(hash.as_str().to_string(), ReceiptStatus::Success);
        Ok(hash)
    }

    async fn wait_for_receipt(
        &self,
        hash: &TxHash,
        _confirmations: u64,
        _timeout: Duration,
    ) -> Result<WaitOutcome> {
        let status = self
            .receipts
            .lock()
            .unwrap()
            .get(hash.as_str())
            .copied()
            .unwrap_or(ReceiptStatus::Success);
        Ok(WaitOutcome::Receipt {
            status,
            block_number: *self.current_block.lock().unwrap(),
        })
    }
}
