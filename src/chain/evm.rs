//! `alloy`-backed implementation of [`ChainAdapter`].
//!
//! Two transport profiles coexist per spec §4.2: a push profile (WS) used
//! for live block and log subscriptions, and a pull profile (HTTP) used for
//! every request/response call including signed submissions. The push side
//! reconnects with exponential backoff (3s, doubling, capped at five
//! attempts) before falling back to polling `current_block_number` on a
//! fixed cadence; callers never see which one is currently delivering
//! events.

use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use alloy::network::EthereumWallet;
use alloy::primitives::{Address, U256};
use alloy::providers::{Provider, ProviderBuilder, RootProvider, WsConnect};
use alloy::rpc::types::{Filter, TransactionRequest};
use alloy::signers::local::PrivateKeySigner;
use alloy::sol_types::SolEvent;
use alloy::transports::http::{Client, Http};
use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::chain::contracts::{ERC20, WithdrawalProcessor};
use crate::chain::{
    Block, BlockHeader, ChainAdapter, ReceiptStatus, Transaction, TransferEvent, WaitOutcome,
};
use crate::errors::{EngineError, Result};
use crate::types::{EvmAddress, TxHash};

const MAX_RECONNECT_ATTEMPTS: u32 = 5;
const INITIAL_BACKOFF: Duration = Duration::from_secs(3);
const POLL_INTERVAL: Duration = Duration::from_secs(4);
const BLOCK_CHANNEL_CAPACITY: usize = 256;
const TRANSFER_CHANNEL_CAPACITY: usize = 1024;

fn to_address(addr: &EvmAddress) -> Result<Address> {
    Address::from_str(addr.as_str())
        .map_err(|e| EngineError::Validation(format!("invalid address {addr}: {e}")))
}

fn to_evm_address(addr: Address) -> EvmAddress {
    EvmAddress::from_hex(&addr.to_string()).expect("alloy Address is always 20 bytes")
}

fn to_tx_hash(hash: alloy::primitives::TxHash) -> TxHash {
    TxHash::from_hex(&format!("{hash:#x}"))
}

pub struct EvmChainAdapter {
    chain_name: String,
    http_rpc_url: String,
    ws_rpc_url: Option<String>,
    configured_chain_id: u64,
    pull_provider: RootProvider<Http<Client>>,
    /// Serializes every hot-wallet-signed send through one lane so nonces
    /// stay monotonic, per spec §5.
    hot_wallet_lane: tokio::sync::Mutex<()>,
    last_verified_chain_id: AtomicU64,
}

impl EvmChainAdapter {
    pub async fn connect(
        chain_name: String,
        http_rpc_url: String,
        ws_rpc_url: Option<String>,
        configured_chain_id: u64,
    ) -> Result<Self> {
        let url = http_rpc_url
            .parse()
            .map_err(|e| EngineError::Configuration(format!("invalid http rpc url: {e}")))?;
        let pull_provider = ProviderBuilder::new().on_http(url);

        let adapter = Self {
            chain_name,
            http_rpc_url,
            ws_rpc_url,
            configured_chain_id,
            pull_provider,
            hot_wallet_lane: tokio::sync::Mutex::new(()),
            last_verified_chain_id: AtomicU64::new(0),
        };
        adapter.verify_chain_id().await?;
        Ok(adapter)
    }

    async fn verify_chain_id(&self) -> Result<()> {
        let observed = self
            .pull_provider
            .get_chain_id()
            .await
            .map_err(|e| EngineError::ChainRpc(e.to_string()))?;
        if observed != self.configured_chain_id {
            return Err(EngineError::Configuration(format!(
                "chain {}: configured chain id {} does not match observed {observed}",
                self.chain_name, self.configured_chain_id
            )));
        }
        self.last_verified_chain_id.store(observed, Ordering::SeqCst);
        Ok(())
    }

    async fn wallet_provider(&self, signing_key: &[u8; 32]) -> Result<impl Provider<Http<Client>>> {
        let signer = PrivateKeySigner::from_bytes(signing_key.into())
            .map_err(|e| EngineError::Configuration(format!("invalid signing key: {e}")))?;
        let wallet = EthereumWallet::from(signer);
        let url = self
            .http_rpc_url
            .parse()
            .map_err(|e| EngineError::Configuration(format!("invalid http rpc url: {e}")))?;
        Ok(ProviderBuilder::new().wallet(wallet).on_http(url))
    }
}

#[async_trait]
impl ChainAdapter for EvmChainAdapter {
    fn chain_id(&self) -> u64 {
        self.configured_chain_id
    }

    async fn subscribe_blocks(&self) -> Result<mpsc::Receiver<BlockHeader>> {
        let (tx, rx) = mpsc::channel(BLOCK_CHANNEL_CAPACITY);
        let chain_name = self.chain_name.clone();
        let ws_rpc_url = self.ws_rpc_url.clone();
        let pull_provider = self.pull_provider.clone();
        let configured_chain_id = self.configured_chain_id;
        tokio::spawn(run_block_transport(
            chain_name,
            ws_rpc_url,
            pull_provider,
            configured_chain_id,
            tx,
        ));
        Ok(rx)
    }

    async fn get_block_with_txs(&self, number: u64) -> Result<Block> {
        let block = self
            .pull_provider
            .get_block_by_number(number.into(), alloy::rpc::types::BlockTransactionsKind::Full)
            .await
            .map_err(|e| EngineError::ChainRpc(e.to_string()))?
            .ok_or(EngineError::NotFound)?;

        let transactions = block
            .transactions
            .into_transactions()
            .map(|tx| Transaction {
                hash: to_tx_hash(tx.hash),
                from: to_evm_address(tx.from),
                to: tx.to.map(to_evm_address),
                value: tx.value.to::<u128>(),
                input_empty: tx.input.is_empty(),
            })
            .collect();

        Ok(Block { number, transactions })
    }

    async fn subscribe_erc20_transfers(
        &self,
        token: &EvmAddress,
    ) -> Result<mpsc::Receiver<TransferEvent>> {
        let (tx, rx) = mpsc::channel(TRANSFER_CHANNEL_CAPACITY);
        let chain_name = self.chain_name.clone();
        let ws_rpc_url = self.ws_rpc_url.clone();
        let pull_provider = self.pull_provider.clone();
        let token = token.clone();
        tokio::spawn(run_transfer_transport(
            chain_name,
            ws_rpc_url,
            pull_provider,
            token,
            tx,
        ));
        Ok(rx)
    }

    async fn get_transaction(&self, hash: &TxHash) -> Result<Option<Transaction>> {
        let h = alloy::primitives::TxHash::from_str(hash.as_str())
            .map_err(|e| EngineError::Validation(format!("invalid tx hash: {e}")))?;
        let tx = self
            .pull_provider
            .get_transaction_by_hash(h)
            .await
            .map_err(|e| EngineError::ChainRpc(e.to_string()))?;
        Ok(tx.map(|tx| Transaction {
            hash: to_tx_hash(tx.hash),
            from: to_evm_address(tx.from),
            to: tx.to.map(to_evm_address),
            value: tx.value.to::<u128>(),
            input_empty: tx.input.is_empty(),
        }))
    }

    async fn current_block_number(&self) -> Result<u64> {
        self.pull_provider
            .get_block_number()
            .await
            .map_err(|e| EngineError::ChainRpc(e.to_string()))
    }

    async fn get_native_balance(&self, addr: &EvmAddress) -> Result<u128> {
        let address = to_address(addr)?;
        let balance = self
            .pull_provider
            .get_balance(address)
            .await
            .map_err(|e| EngineError::ChainRpc(e.to_string()))?;
        Ok(balance.to::<u128>())
    }

    async fn get_token_balance(&self, token: &EvmAddress, addr: &EvmAddress) -> Result<u128> {
        let contract = ERC20::new(to_address(token)?, &self.pull_provider);
        let balance = contract
            .balanceOf(to_address(addr)?)
            .call()
            .await
            .map_err(|e| EngineError::ChainRpc(e.to_string()))?;
        Ok(balance._0.to::<u128>())
    }

    async fn get_erc20_allowance(
        &self,
        token: &EvmAddress,
        owner: &EvmAddress,
        spender: &EvmAddress,
    ) -> Result<u128> {
        let contract = ERC20::new(to_address(token)?, &self.pull_provider);
        let allowance = contract
            .allowance(to_address(owner)?, to_address(spender)?)
            .call()
            .await
            .map_err(|e| EngineError::ChainRpc(e.to_string()))?;
        Ok(allowance._0.to::<u128>())
    }

    async fn gas_price(&self) -> Result<u128> {
        self.pull_provider
            .get_gas_price()
            .await
            .map_err(|e| EngineError::ChainRpc(e.to_string()))
    }

    async fn estimate_gas_native_transfer(&self, to: &EvmAddress, value: u128) -> Result<u64> {
        let request = TransactionRequest::default()
            .to(to_address(to)?)
            .value(U256::from(value));
        self.pull_provider
            .estimate_gas(&request)
            .await
            .map_err(|e| EngineError::ChainRpc(e.to_string()))
    }

    async fn estimate_gas_erc20_transfer(
        &self,
        token: &EvmAddress,
        to: &EvmAddress,
        amount: u128,
    ) -> Result<u64> {
        let contract = ERC20::new(to_address(token)?, &self.pull_provider);
        contract
            .transfer(to_address(to)?, U256::from(amount))
            .estimate_gas()
            .await
            .map_err(|e| EngineError::ChainRpc(e.to_string()))
    }

    async fn send_native(
        &self,
        signing_key: &[u8; 32],
        to: &EvmAddress,
        value: u128,
        gas_limit: u64,
    ) -> Result<TxHash> {
        let _lane = self.hot_wallet_lane.lock().await;
        let provider = self.wallet_provider(signing_key).await?;
        let request = TransactionRequest::default()
            .to(to_address(to)?)
            .value(U256::from(value))
            .gas_limit(gas_limit);
        let pending = provider
            .send_transaction(request)
            .await
            .map_err(|e| EngineError::ChainRpc(e.to_string()))?;
        Ok(to_tx_hash(*pending.tx_hash()))
    }

    async fn send_erc20_transfer(
        &self,
        signing_key: &[u8; 32],
        token: &EvmAddress,
        to: &EvmAddress,
        amount: u128,
        gas_limit: u64,
    ) -> Result<TxHash> {
        let provider = self.wallet_provider(signing_key).await?;
        let contract = ERC20::new(to_address(token)?, &provider);
        let pending = contract
            .transfer(to_address(to)?, U256::from(amount))
            .gas(gas_limit)
            .send()
            .await
            .map_err(|e| EngineError::ChainRpc(e.to_string()))?;
        Ok(to_tx_hash(*pending.tx_hash()))
    }

    async fn approve_erc20(
        &self,
        signing_key: &[u8; 32],
        token: &EvmAddress,
        spender: &EvmAddress,
        amount: u128,
        gas_limit: u64,
    ) -> Result<TxHash> {
        let _lane = self.hot_wallet_lane.lock().await;
        let provider = self.wallet_provider(signing_key).await?;
        let contract = ERC20::new(to_address(token)?, &provider);
        let pending = contract
            .approve(to_address(spender)?, U256::from(amount))
            .gas(gas_limit)
            .send()
            .await
            .map_err(|e| EngineError::ChainRpc(e.to_string()))?;
        Ok(to_tx_hash(*pending.tx_hash()))
    }

    async fn submit_batch_native(
        &self,
        signing_key: &[u8; 32],
        processor: &EvmAddress,
        recipients: &[EvmAddress],
        amounts: &[u128],
        total_value: u128,
        default_gas_limit: u64,
    ) -> Result<TxHash> {
        let _lane = self.hot_wallet_lane.lock().await;
        let provider = self.wallet_provider(signing_key).await?;
        let contract = WithdrawalProcessor::new(to_address(processor)?, &provider);
        let recipient_addrs: Result<Vec<Address>> = recipients.iter().map(to_address).collect();
        let amount_values: Vec<U256> = amounts.iter().map(|a| U256::from(*a)).collect();

        let call = contract
            .processBatchNative(recipient_addrs?, amount_values)
            .value(U256::from(total_value));
        let gas_limit = call
            .estimate_gas()
            .await
            .map(|g| (g as f64 * 1.2) as u64)
            .unwrap_or(default_gas_limit);

        let pending = call
            .gas(gas_limit)
            .send()
            .await
            .map_err(|e| EngineError::ChainRpc(e.to_string()))?;
        Ok(to_tx_hash(*pending.tx_hash()))
    }

    async fn submit_batch_erc20(
        &self,
        signing_key: &[u8; 32],
        processor: &EvmAddress,
        token: &EvmAddress,
        recipients: &[EvmAddress],
        amounts: &[u128],
        default_gas_limit: u64,
    ) -> Result<TxHash> {
        let _lane = self.hot_wallet_lane.lock().await;
        let provider = self.wallet_provider(signing_key).await?;
        let contract = WithdrawalProcessor::new(to_address(processor)?, &provider);
        let recipient_addrs: Result<Vec<Address>> = recipients.iter().map(to_address).collect();
        let amount_values: Vec<U256> = amounts.iter().map(|a| U256::from(*a)).collect();

        let call =
            contract.processBatchErc20(to_address(token)?, recipient_addrs?, amount_values);
        let gas_limit = call
            .estimate_gas()
            .await
            .map(|g| (g as f64 * 1.2) as u64)
            .unwrap_or(default_gas_limit);

        let pending = call
            .gas(gas_limit)
            .send()
            .await
            .map_err(|e| EngineError::ChainRpc(e.to_string()))?;
        Ok(to_tx_hash(*pending.tx_hash()))
    }

    async fn wait_for_receipt(
        &self,
        hash: &TxHash,
        confirmations: u64,
        timeout: Duration,
    ) -> Result<WaitOutcome> {
        let h = alloy::primitives::TxHash::from_str(hash.as_str())
            .map_err(|e| EngineError::Validation(format!("invalid tx hash: {e}")))?;

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if tokio::time::Instant::now() >= deadline {
                return Ok(WaitOutcome::Timeout);
            }
            match self.pull_provider.get_transaction_receipt(h).await {
                Ok(Some(receipt)) => {
                    let receipt_block = receipt.block_number.unwrap_or_default();
                    let head = self.current_block_number().await.unwrap_or(receipt_block);
                    if head.saturating_sub(receipt_block) + 1 < confirmations {
                        tokio::time::sleep(Duration::from_millis(500)).await;
                        continue;
                    }
                    let status = if receipt.status() {
                        ReceiptStatus::Success
                    } else {
                        ReceiptStatus::Reverted
                    };
                    info!(tx_hash = %hash, ?status, "receipt observed");
                    return Ok(WaitOutcome::Receipt {
                        status,
                        block_number: receipt_block,
                    });
                }
                Ok(None) => {
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
                Err(e) => return Err(EngineError::ChainRpc(e.to_string())),
            }
        }
    }
}

/// Drives the block-header stream for one chain: push subscription with
/// reconnect/backoff, falling back to polling once attempts are exhausted.
/// Runs as its own task for the lifetime of the adapter.
async fn run_block_transport(
    chain_name: String,
    ws_rpc_url: Option<String>,
    pull_provider: RootProvider<Http<Client>>,
    configured_chain_id: u64,
    tx: mpsc::Sender<BlockHeader>,
) {
    let mut attempt = 0u32;
    loop {
        let Some(ws_url) = ws_rpc_url.clone() else {
            run_polling_fallback(&chain_name, &pull_provider, &tx).await;
            return;
        };
        match try_push_block_subscription(&ws_url, &tx).await {
            Ok(()) => return,
            Err(e) => {
                attempt += 1;
                warn!(chain = %chain_name, attempt, error = %e, "push subscription failed");
                if attempt > MAX_RECONNECT_ATTEMPTS {
                    warn!(chain = %chain_name, "exhausted reconnect attempts, falling back to polling");
                    run_polling_fallback(&chain_name, &pull_provider, &tx).await;
                    return;
                }
                let backoff = INITIAL_BACKOFF * 2u32.pow(attempt.saturating_sub(1));
                tokio::time::sleep(backoff).await;
                if let Err(e) = pull_provider
                    .get_chain_id()
                    .await
                    .map_err(|e| EngineError::ChainRpc(e.to_string()))
                    .and_then(|observed| {
                        if observed == configured_chain_id {
                            Ok(())
                        } else {
                            Err(EngineError::Configuration(format!(
                                "chain {chain_name}: configured chain id {configured_chain_id} does not match observed {observed}"
                            )))
                        }
                    })
                {
                    error!(chain = %chain_name, error = %e, "chain id mismatch on reconnect");
                    return;
                }
            }
        }
    }
}

async fn try_push_block_subscription(ws_url: &str, tx: &mpsc::Sender<BlockHeader>) -> Result<()> {
    let ws = WsConnect::new(ws_url);
    let provider = ProviderBuilder::new()
        .on_ws(ws)
        .await
        .map_err(|e| EngineError::ChainRpc(e.to_string()))?;
    let subscription = provider
        .subscribe_blocks()
        .await
        .map_err(|e| EngineError::ChainRpc(e.to_string()))?;
    let mut stream = subscription.into_stream();
    while let Some(header) = stream.next().await {
        if tx
            .send(BlockHeader {
                number: header.number,
            })
            .await
            .is_err()
        {
            return Ok(());
        }
    }
    Err(EngineError::ChainRpc("block subscription ended".into()))
}

async fn run_polling_fallback(
    chain_name: &str,
    pull_provider: &RootProvider<Http<Client>>,
    tx: &mpsc::Sender<BlockHeader>,
) {
    let mut last_seen = None;
    loop {
        match pull_provider.get_block_number().await {
            Ok(number) => {
                if last_seen != Some(number) {
                    last_seen = Some(number);
                    if tx.send(BlockHeader { number }).await.is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                warn!(chain = chain_name, error = %e, "polling fallback RPC error");
            }
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

async fn run_transfer_transport(
    chain_name: String,
    ws_rpc_url: Option<String>,
    pull_provider: RootProvider<Http<Client>>,
    token: EvmAddress,
    tx: mpsc::Sender<TransferEvent>,
) {
    let mut attempt = 0u32;
    loop {
        let Some(ws_url) = ws_rpc_url.clone() else {
            poll_transfer_fallback(&pull_provider, &token, &tx).await;
            return;
        };
        match try_push_transfer_subscription(&ws_url, &token, &tx).await {
            Ok(()) => return,
            Err(e) => {
                attempt += 1;
                warn!(chain = %chain_name, token = %token, attempt, error = %e, "transfer subscription failed");
                if attempt > MAX_RECONNECT_ATTEMPTS {
                    poll_transfer_fallback(&pull_provider, &token, &tx).await;
                    return;
                }
                tokio::time::sleep(INITIAL_BACKOFF * 2u32.pow(attempt.saturating_sub(1))).await;
            }
        }
    }
}

async fn try_push_transfer_subscription(
    ws_url: &str,
    token: &EvmAddress,
    tx: &mpsc::Sender<TransferEvent>,
) -> Result<()> {
    let ws = WsConnect::new(ws_url);
    let provider = ProviderBuilder::new()
        .on_ws(ws)
        .await
        .map_err(|e| EngineError::ChainRpc(e.to_string()))?;
    let filter = Filter::new()
        .address(to_address(token)?)
        .event(ERC20::Transfer::SIGNATURE);
    let subscription = provider
        .subscribe_logs(&filter)
        .await
        .map_err(|e| EngineError::ChainRpc(e.to_string()))?;
    let mut stream = subscription.into_stream();
    while let Some(log) = stream.next().await {
        let Ok(decoded) = log.log_decode::<ERC20::Transfer>() else {
            continue;
        };
        let event = TransferEvent {
            tx_hash: to_tx_hash(log.transaction_hash.unwrap_or_default()),
            from: to_evm_address(decoded.inner.from),
            to: to_evm_address(decoded.inner.to),
            value: decoded.inner.value.to::<u128>(),
            block_number: log.block_number.unwrap_or_default(),
        };
        if tx.send(event).await.is_err() {
            return Ok(());
        }
    }
    Err(EngineError::ChainRpc("transfer subscription ended".into()))
}

async fn poll_transfer_fallback(
    pull_provider: &RootProvider<Http<Client>>,
    token: &EvmAddress,
    tx: &mpsc::Sender<TransferEvent>,
) {
    let mut last_scanned = pull_provider.get_block_number().await.unwrap_or(0);
    loop {
        let Ok(head) = pull_provider.get_block_number().await else {
            tokio::time::sleep(POLL_INTERVAL).await;
            continue;
        };
        if head <= last_scanned {
            tokio::time::sleep(POLL_INTERVAL).await;
            continue;
        }
        let Ok(address) = to_address(token) else {
            return;
        };
        let filter = Filter::new()
            .address(address)
            .from_block(last_scanned + 1)
            .to_block(head)
            .event(ERC20::Transfer::SIGNATURE);
        if let Ok(logs) = pull_provider.get_logs(&filter).await {
            for log in logs {
                if let Ok(decoded) = log.log_decode::<ERC20::Transfer>() {
                    let event = TransferEvent {
                        tx_hash: to_tx_hash(log.transaction_hash.unwrap_or_default()),
                        from: to_evm_address(decoded.inner.from),
                        to: to_evm_address(decoded.inner.to),
                        value: decoded.inner.value.to::<u128>(),
                        block_number: log.block_number.unwrap_or_default(),
                    };
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }
            }
        }
        last_scanned = head;
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}
