//! The deposit indexer: turns chain events into ledger credits with
//! at-most-once semantics, per spec §4.3.
//!
//! One [`Indexer`] owns exactly one chain. It drives three kinds of task:
//! block ingest (one per chain), the periodic scan/recovery/cleanup loops
//! (one each per chain), and one `advance_deposit` task per admitted
//! deposit id, spawned by whichever loop first admits it and living until
//! the deposit reaches a terminal state. This gives "one task per
//! (chain, currency) owns its pending queue" in spirit — the owning loop is
//! the only admitter and bookkeeper — while still letting two deposits
//! confirm and sweep concurrently, which spec §5 explicitly permits.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, warn};

use crate::bounded_cache::BoundedHashCache;
use crate::chain::{Block, ChainAdapter, ReceiptStatus, WaitOutcome};
use crate::config::ChainConfig;
use crate::crypto::derive_signing_key_bytes;
use crate::errors::{EngineError, Result};
use crate::ledger::Ledger;
use crate::metrics;
use crate::models::{
    block_cache_key, deposit_key, deposit_start_block_key, gas_funding_key,
    last_processed_block_key, Account, CachedBlock, CachedTransaction, Deposit,
};
use crate::money::Amount;
use crate::notify::{Event, NotificationBus};
use crate::retry::{self, RetryAction};
use crate::store::{Store, StoreExt, WriteBatch};
use crate::types::{DepositStatus, EvmAddress, TxHash};

const SCAN_INTERVAL: Duration = Duration::from_secs(5);
const CONFIRM_INTERVAL: Duration = Duration::from_secs(5);
const RECEIPT_WAIT: Duration = Duration::from_secs(15);
const PROCESSED_CACHE_SIZE: usize = 200_000;
const PROCESSED_CACHE_TTL_SECS: u64 = 7 * 86_400;

/// The chain-wide state an [`Indexer`] needs beyond its own config: the
/// master signing seed and the hot wallet's address, both chain-agnostic.
pub struct IndexerSecrets {
    pub signing_master_seed: Vec<u8>,
    pub hot_wallet_address: EvmAddress,
    pub hot_wallet_signing_key: [u8; 32],
}

pub struct Indexer<S: Store, C: ChainAdapter> {
    chain_name: String,
    config: ChainConfig,
    store: Arc<S>,
    adapter: Arc<C>,
    ledger: Arc<Ledger<S>>,
    notify: NotificationBus,
    secrets: IndexerSecrets,
    max_retries: u32,
    /// address (lowercased) -> username. Read-mostly; grown by
    /// `register_active_address`, per spec §9's one-way registration call.
    active_addresses: Arc<RwLock<HashMap<String, String>>>,
    /// In-process dedup guard in front of the durable `deposit:`/
    /// `gasFundingTx:` records.
    processed: Arc<Mutex<BoundedHashCache>>,
    gas_funding: Arc<Mutex<HashSet<String>>>,
    /// Currently-admitted ids per currency, used only for depth bookkeeping
    /// and the "not already queued" admission check.
    pending: Arc<Mutex<HashMap<String, HashSet<String>>>>,
}

impl<S: Store + 'static, C: ChainAdapter + 'static> Indexer<S, C> {
    pub async fn new(
        chain_name: String,
        config: ChainConfig,
        store: Arc<S>,
        adapter: Arc<C>,
        ledger: Arc<Ledger<S>>,
        notify: NotificationBus,
        secrets: IndexerSecrets,
        max_retries: u32,
    ) -> Result<Arc<Self>> {
        let indexer = Arc::new(Self {
            chain_name,
            config,
            store,
            adapter,
            ledger,
            notify,
            secrets,
            max_retries,
            active_addresses: Arc::new(RwLock::new(HashMap::new())),
            processed: Arc::new(Mutex::new(BoundedHashCache::new(
                PROCESSED_CACHE_SIZE,
                PROCESSED_CACHE_TTL_SECS,
            ))),
            gas_funding: Arc::new(Mutex::new(HashSet::new())),
            pending: Arc::new(Mutex::new(HashMap::new())),
        });
        indexer.clone().recover().await?;
        Ok(indexer)
    }

    /// Rebuilds every in-process set from the persistent store: active
    /// addresses (from `account:` records), the gas-funding filter, the
    /// processed-transaction guard (from terminal deposit records), and the
    /// pending queue, respawning an `advance_deposit` task for every
    /// non-terminal deposit record. Per spec §9's crash-recovery note — a
    /// deposit that crashed mid-pipeline must resume from its persisted
    /// state, not be silently stranded or re-admitted as if new.
    async fn recover(self: Arc<Self>) -> Result<()> {
        let accounts: Vec<Account> = self.store.scan_prefix("account:").await?;
        let mut addresses = self.active_addresses.write().await;
        for account in &accounts {
            addresses.insert(account.address.as_str().to_string(), account.username.clone());
        }
        drop(addresses);
        info!(chain = %self.chain_name, count = accounts.len(), "recovered active addresses");

        let gas_funding_keys = self.store.scan_prefix_raw("gasFundingTx:").await?;
        let mut gas_funding = self.gas_funding.lock().await;
        for (key, _) in gas_funding_keys {
            if let Some(hash) = key.strip_prefix("gasFundingTx:") {
                gas_funding.insert(hash.to_string());
            }
        }
        drop(gas_funding);

        let deposits: Vec<Deposit> = self.store.scan_prefix("deposit:").await?;
        let mut processed = self.processed.lock().await;
        for deposit in &deposits {
            if deposit.status.is_terminal() {
                processed.insert(deposit.tx_hash.as_str().to_string());
            }
        }
        drop(processed);

        let resumable: Vec<&Deposit> = deposits.iter().filter(|d| !d.status.is_terminal()).collect();
        {
            let mut pending = self.pending.lock().await;
            for deposit in &resumable {
                pending
                    .entry(deposit.currency.clone())
                    .or_default()
                    .insert(deposit.tx_hash.as_str().to_string());
            }
            for currency in pending.keys().cloned().collect::<Vec<_>>() {
                let depth = pending.get(&currency).map(|s| s.len()).unwrap_or(0);
                metrics::set_pending_queue_depth(&self.chain_name, &currency, depth);
            }
        }
        for deposit in &resumable {
            tokio::spawn(self.clone().advance_deposit(deposit.tx_hash.clone()));
        }

        info!(
            chain = %self.chain_name,
            count = deposits.len(),
            resumed = resumable.len(),
            "recovered deposit records"
        );
        Ok(())
    }

    pub async fn register_active_address(&self, username: &str, address: &EvmAddress) {
        self.active_addresses
            .write()
            .await
            .insert(address.as_str().to_string(), username.to_string());
    }

    fn asset_decimals(&self, currency: &str) -> Option<u8> {
        if currency == self.config.native_currency {
            Some(self.config.native_decimals)
        } else {
            self.config.tokens.get(currency).map(|t| t.decimals)
        }
    }

    fn token_address(&self, currency: &str) -> Option<EvmAddress> {
        self.config
            .tokens
            .get(currency)
            .and_then(|t| EvmAddress::from_hex(&t.address).ok())
    }

    fn min_deposit(&self, currency: &str) -> Amount {
        let raw = if currency == self.config.native_currency {
            self.config.min_deposit.clone()
        } else {
            self.config
                .tokens
                .get(currency)
                .map(|t| t.min_deposit.clone())
                .unwrap_or_else(|| "0.00".to_string())
        };
        raw.parse().unwrap_or(Amount::ZERO)
    }

    /// Spawns the block-ingest, scan, recovery and cache-cleanup loops for
    /// this chain, plus one transfer-log subscriber per configured token.
    /// Runs until the process shuts down.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let mut handles = Vec::new();

        handles.push(tokio::spawn(self.clone().run_block_ingest()));
        handles.push(tokio::spawn(self.clone().run_scan_loop()));
        handles.push(tokio::spawn(self.clone().run_recovery_loop()));
        handles.push(tokio::spawn(self.clone().run_cache_cleanup_loop()));

        for currency in self.config.tokens.keys().cloned().collect::<Vec<_>>() {
            handles.push(tokio::spawn(self.clone().run_transfer_subscriber(currency)));
        }

        for handle in handles {
            if let Err(e) = handle.await {
                error!(chain = %self.chain_name, error = %e, "indexer task panicked");
            }
        }
        Ok(())
    }

    async fn run_block_ingest(self: Arc<Self>) {
        loop {
            let mut rx = match self.adapter.subscribe_blocks().await {
                Ok(rx) => rx,
                Err(e) => {
                    error!(chain = %self.chain_name, error = %e, "failed to subscribe to blocks");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    continue;
                }
            };
            while let Some(header) = rx.recv().await {
                if let Err(e) = self.ingest_block(header.number).await {
                    warn!(chain = %self.chain_name, block = header.number, error = %e, "block ingest failed");
                }
            }
            warn!(chain = %self.chain_name, "block subscription ended, resubscribing");
        }
    }

    async fn ingest_block(&self, number: u64) -> Result<()> {
        let block = self.adapter.get_block_with_txs(number).await?;
        self.cache_block(&block).await?;

        let head = self.adapter.current_block_number().await.unwrap_or(number);
        metrics::set_block_lag(&self.chain_name, head, number);
        Ok(())
    }

    async fn cache_block(&self, block: &Block) -> Result<()> {
        let ttl_secs = self.block_cache_ttl_secs();
        let cached = CachedBlock {
            chain: self.chain_name.clone(),
            block_number: block.number,
            transactions: block
                .transactions
                .iter()
                .map(|tx| CachedTransaction {
                    hash: tx.hash.clone(),
                    from: tx.from.clone(),
                    to: tx.to.clone(),
                    value: Amount::truncate_from_chain_units(tx.value, self.config.native_decimals),
                    calldata_empty: tx.input_empty,
                })
                .collect(),
            cached_at: chrono::Utc::now(),
            ttl_secs,
        };

        let mut batch = WriteBatch::new();
        batch.put(block_cache_key(&self.chain_name, block.number), &cached)?;
        batch.put(last_processed_block_key(&self.chain_name), &block.number)?;
        self.store.write_batch(batch).await
    }

    /// TTL must exceed `required_confirmations * average_block_time` with
    /// margin, per spec §4.3; we use a flat 10x the confirm interval per
    /// confirmation as a conservative stand-in for "average block time".
    fn block_cache_ttl_secs(&self) -> u64 {
        (self.config.required_confirmations * 30).max(300)
    }

    async fn run_scan_loop(self: Arc<Self>) {
        let mut cursor = self.recover_scan_cursor().await;
        loop {
            let head = match self.adapter.current_block_number().await {
                Ok(h) => h,
                Err(e) => {
                    warn!(chain = %self.chain_name, error = %e, "scan loop: head fetch failed");
                    tokio::time::sleep(SCAN_INTERVAL).await;
                    continue;
                }
            };
            let scan_to = head.saturating_sub(self.config.required_confirmations);
            while cursor <= scan_to {
                if let Ok(Some(cached)) = self
                    .store
                    .get::<CachedBlock>(&block_cache_key(&self.chain_name, cursor))
                    .await
                {
                    self.scan_cached_block(&cached).await;
                }
                cursor += 1;
            }
            tokio::time::sleep(SCAN_INTERVAL).await;
        }
    }

    async fn recover_scan_cursor(&self) -> u64 {
        let last_processed: u64 = self
            .store
            .get(&last_processed_block_key(&self.chain_name))
            .await
            .ok()
            .flatten()
            .unwrap_or(0);
        last_processed.saturating_sub(256)
    }

    async fn scan_cached_block(self: &Arc<Self>, block: &CachedBlock) {
        for tx in &block.transactions {
            let Some(to) = &tx.to else { continue };
            if !tx.calldata_empty {
                continue;
            }
            if tx.value.is_zero() {
                continue;
            }
            self.clone()
                .try_admit_native(tx.hash.clone(), tx.from.clone(), to.clone(), tx.value, block.block_number)
                .await;
        }
    }

    async fn run_transfer_subscriber(self: Arc<Self>, currency: String) {
        let Some(token) = self.token_address(&currency) else {
            return;
        };
        loop {
            let mut rx = match self.adapter.subscribe_erc20_transfers(&token).await {
                Ok(rx) => rx,
                Err(e) => {
                    error!(chain = %self.chain_name, currency, error = %e, "failed to subscribe to transfers");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    continue;
                }
            };
            while let Some(event) = rx.recv().await {
                let decimals = self.asset_decimals(&currency).unwrap_or(18);
                let amount = Amount::truncate_from_chain_units(event.value, decimals);
                self.clone()
                    .try_admit_token(
                        event.tx_hash.clone(),
                        event.from.clone(),
                        event.to.clone(),
                        amount,
                        currency.clone(),
                        event.block_number,
                    )
                    .await;
            }
            warn!(chain = %self.chain_name, currency, "transfer subscription ended, resubscribing");
        }
    }

    /// Whether `hash` is eligible per spec §4.3 step 2 / §4.4, irrespective
    /// of asset type.
    async fn is_admissible(&self, hash: &str, from: &EvmAddress) -> bool {
        if from.as_str() == self.secrets.hot_wallet_address.as_str() {
            return false;
        }
        if self.processed.lock().await.contains(hash) {
            return false;
        }
        if self.gas_funding.lock().await.contains(hash) {
            return false;
        }
        let pending = self.pending.lock().await;
        if pending.values().any(|set| set.contains(hash)) {
            return false;
        }
        true
    }

    async fn try_admit_native(
        self: Arc<Self>,
        hash: TxHash,
        from: EvmAddress,
        to: EvmAddress,
        amount: Amount,
        block_number: u64,
    ) {
        let currency = self.config.native_currency.clone();
        let username = {
            let addresses = self.active_addresses.read().await;
            addresses.get(to.as_str()).cloned()
        };
        let Some(username) = username else { return };
        if !self.is_admissible(hash.as_str(), &from).await {
            return;
        }
        if amount < self.min_deposit(&currency) {
            return;
        }
        self.admit(hash, username, currency, amount, from, to, block_number)
            .await;
    }

    async fn try_admit_token(
        self: Arc<Self>,
        hash: TxHash,
        from: EvmAddress,
        to: EvmAddress,
        amount: Amount,
        currency: String,
        block_number: u64,
    ) {
        let username = {
            let addresses = self.active_addresses.read().await;
            addresses.get(to.as_str()).cloned()
        };
        let Some(username) = username else { return };
        if !self.is_admissible(hash.as_str(), &from).await {
            return;
        }
        if amount < self.min_deposit(&currency) {
            return;
        }
        self.admit(hash, username, currency, amount, from, to, block_number)
            .await;
    }

    async fn admit(
        self: Arc<Self>,
        hash: TxHash,
        username: String,
        currency: String,
        amount: Amount,
        sender: EvmAddress,
        recipient: EvmAddress,
        block_number: u64,
    ) {
        let deposit = Deposit {
            tx_hash: hash.clone(),
            username: username.clone(),
            chain: self.chain_name.clone(),
            currency: currency.clone(),
            amount,
            sender,
            recipient,
            required_confirmations: self.config.required_confirmations,
            confirmations: 0,
            start_block: block_number,
            retry_count: 0,
            status: DepositStatus::Pending,
            error_kind: None,
            timestamp: chrono::Utc::now(),
        };

        let mut batch = WriteBatch::new();
        if let Err(e) = batch.put(deposit_key(&hash), &deposit) {
            error!(chain = %self.chain_name, error = %e, "failed to build admission batch");
            return;
        }
        if let Err(e) = batch.put(deposit_start_block_key(&hash), &block_number) {
            error!(chain = %self.chain_name, error = %e, "failed to build admission batch");
            return;
        }
        if let Err(e) = self.store.write_batch(batch).await {
            error!(chain = %self.chain_name, error = %e, "failed to persist admitted deposit");
            return;
        }

        {
            let mut pending = self.pending.lock().await;
            pending
                .entry(currency.clone())
                .or_default()
                .insert(hash.as_str().to_string());
            metrics::set_pending_queue_depth(
                &self.chain_name,
                &currency,
                pending.get(&currency).map(|s| s.len()).unwrap_or(0),
            );
        }
        metrics::record_deposit_admitted(&self.chain_name, &currency);
        self.notify.publish(Event::DepositUpdate { record: deposit });
        info!(chain = %self.chain_name, tx_hash = %hash, username, currency, "deposit admitted");

        tokio::spawn(self.advance_deposit(hash));
    }

    /// Drives one deposit from `pending` through `confirming` / `confirmed`
    /// / `credited` (or `failed`), with the flat retry policy from spec
    /// §4.3, until it reaches a terminal state.
    async fn advance_deposit(self: Arc<Self>, hash: TxHash) {
        loop {
            let deposit = match self.store.get::<Deposit>(&deposit_key(&hash)).await {
                Ok(Some(d)) => d,
                _ => return,
            };
            if deposit.status.is_terminal() {
                self.cleanup(&hash, &deposit.currency).await;
                return;
            }

            match self.advance_once(deposit.clone()).await {
                Ok(()) => continue,
                Err(e) => {
                    metrics::record_retry("indexer", &self.chain_name);
                    match retry::next_action(&e, deposit.retry_count, self.max_retries) {
                        RetryAction::Terminal => {
                            self.mark_failed(&hash, &e).await;
                            self.cleanup(&hash, &deposit.currency).await;
                            return;
                        }
                        RetryAction::RetryAfter { after } => {
                            self.bump_retry_count(&hash, deposit.retry_count + 1).await;
                            tokio::time::sleep(after).await;
                        }
                    }
                }
            }
        }
    }

    async fn advance_once(&self, deposit: Deposit) -> Result<()> {
        match deposit.status {
            DepositStatus::Pending | DepositStatus::Confirming => self.confirm_step(deposit).await,
            DepositStatus::Confirmed => self.sweep_step(deposit).await,
            DepositStatus::Credited | DepositStatus::Failed => Ok(()),
        }
    }

    async fn confirm_step(&self, mut deposit: Deposit) -> Result<()> {
        let head = self.adapter.current_block_number().await?;
        let confirmations = (head + 1).saturating_sub(deposit.start_block);
        deposit.confirmations = confirmations.min(deposit.required_confirmations);

        if confirmations >= deposit.required_confirmations {
            deposit.status = DepositStatus::Confirmed;
        } else if deposit.status == DepositStatus::Pending {
            deposit.status = DepositStatus::Confirming;
        }
        self.persist_and_notify(deposit).await
    }

    async fn sweep_step(&self, mut deposit: Deposit) -> Result<()> {
        let signing_key = derive_signing_key_bytes(&self.secrets.signing_master_seed, &deposit.username);

        let tx_hash = if deposit.currency == self.config.native_currency {
            self.sweep_native(&deposit, &signing_key).await?
        } else {
            self.sweep_token(&deposit, &signing_key).await?
        };

        let outcome = self
            .adapter
            .wait_for_receipt(&tx_hash, 1, RECEIPT_WAIT)
            .await?;
        match outcome {
            WaitOutcome::Receipt {
                status: ReceiptStatus::Success,
                ..
            } => {
                self.ledger
                    .credit(&deposit.username, &deposit.chain, &deposit.currency, deposit.amount)
                    .await?;
                deposit.status = DepositStatus::Credited;
                metrics::record_deposit_credited(&self.chain_name, &deposit.currency);
                self.persist_and_notify(deposit).await
            }
            WaitOutcome::Receipt {
                status: ReceiptStatus::Reverted,
                ..
            } => Err(EngineError::ChainReverted(format!("sweep tx {tx_hash} reverted"))),
            WaitOutcome::Timeout => Err(EngineError::ChainRpc("sweep receipt wait timed out".into())),
        }
    }

    async fn sweep_native(&self, deposit: &Deposit, signing_key: &[u8; 32]) -> Result<TxHash> {
        let decimals = self.config.native_decimals;
        let value_units = deposit.amount.to_chain_units(decimals);
        let gas_limit = self.config.native_gas_limit;
        let gas_price = self.adapter.gas_price().await?;
        let gas_cost = gas_price.saturating_mul(gas_limit as u128);

        if value_units <= gas_cost {
            return Err(EngineError::InsufficientAfterGas);
        }
        let send_value = value_units - gas_cost;

        let tx_hash = self
            .adapter
            .send_native(signing_key, &self.secrets.hot_wallet_address, send_value, gas_limit)
            .await?;

        self.set_deposit_amount(
            &deposit.tx_hash,
            Amount::truncate_from_chain_units(send_value, decimals),
        )
        .await?;
        Ok(tx_hash)
    }

    async fn sweep_token(&self, deposit: &Deposit, signing_key: &[u8; 32]) -> Result<TxHash> {
        let token = self
            .token_address(&deposit.currency)
            .ok_or_else(|| EngineError::Configuration(format!("unknown token {}", deposit.currency)))?;
        let decimals = self
            .asset_decimals(&deposit.currency)
            .ok_or_else(|| EngineError::Configuration(format!("unknown token {}", deposit.currency)))?;

        let gas_price = self.adapter.gas_price().await?;
        let gas_top_up = gas_price.saturating_mul(self.config.erc20_gas_limit as u128);

        let top_up_hash = self
            .adapter
            .send_native(
                &self.secrets.hot_wallet_signing_key,
                &deposit.recipient,
                gas_top_up,
                self.config.native_gas_limit,
            )
            .await?;
        self.record_gas_funding(&top_up_hash).await?;

        let amount_units = deposit.amount.to_chain_units(decimals);
        let gas_estimate = self
            .adapter
            .estimate_gas_erc20_transfer(&token, &self.secrets.hot_wallet_address, amount_units)
            .await
            .unwrap_or(self.config.erc20_gas_limit);
        let gas_limit = (gas_estimate as f64 * 1.2) as u64;

        self.adapter
            .send_erc20_transfer(signing_key, &token, &self.secrets.hot_wallet_address, amount_units, gas_limit)
            .await
    }

    async fn record_gas_funding(&self, hash: &TxHash) -> Result<()> {
        self.gas_funding.lock().await.insert(hash.as_str().to_string());
        let associated = "gas_top_up".to_string();
        self.store.put(&gas_funding_key(hash), &associated).await
    }

    async fn set_deposit_amount(&self, hash: &TxHash, amount: Amount) -> Result<()> {
        if let Some(mut deposit) = self.store.get::<Deposit>(&deposit_key(hash)).await? {
            deposit.amount = amount;
            self.store.put(&deposit_key(hash), &deposit).await?;
        }
        Ok(())
    }

    async fn bump_retry_count(&self, hash: &TxHash, retry_count: u32) {
        if let Ok(Some(mut deposit)) = self.store.get::<Deposit>(&deposit_key(hash)).await {
            deposit.retry_count = retry_count;
            let _ = self.store.put(&deposit_key(hash), &deposit).await;
        }
    }

    async fn mark_failed(&self, hash: &TxHash, error: &EngineError) {
        if let Ok(Some(mut deposit)) = self.store.get::<Deposit>(&deposit_key(hash)).await {
            if !deposit.status.can_transition_to(DepositStatus::Failed) {
                return;
            }
            deposit.status = DepositStatus::Failed;
            let kind = match error {
                EngineError::InsufficientAfterGas => "INSUFFICIENT_AFTER_GAS",
                EngineError::InsufficientBalance => "INSUFFICIENT_BALANCE",
                EngineError::ChainReverted(_) => "REVERTED",
                _ => "RETRY_EXHAUSTED",
            };
            deposit.error_kind = Some(kind.to_string());
            metrics::record_deposit_failed(&self.chain_name, &deposit.currency, kind);
            let _ = self.store.put(&deposit_key(hash), &deposit).await;
            self.notify.publish(Event::DepositUpdate { record: deposit });
        }
    }

    async fn persist_and_notify(&self, deposit: Deposit) -> Result<()> {
        self.store.put(&deposit_key(&deposit.tx_hash), &deposit).await?;
        self.notify.publish(Event::DepositUpdate { record: deposit });
        Ok(())
    }

    async fn cleanup(&self, hash: &TxHash, currency: &str) {
        self.processed.lock().await.insert(hash.as_str().to_string());
        let mut pending = self.pending.lock().await;
        if let Some(set) = pending.get_mut(currency) {
            set.remove(hash.as_str());
            metrics::set_pending_queue_depth(&self.chain_name, currency, set.len());
        }
        drop(pending);
        let mut batch = WriteBatch::new();
        batch.delete(deposit_start_block_key(hash));
        let _ = self.store.write_batch(batch).await;
    }

    async fn run_recovery_loop(self: Arc<Self>) {
        loop {
            tokio::time::sleep(Duration::from_secs(300)).await;
            if let Err(e) = self.replay_missing_blocks().await {
                warn!(chain = %self.chain_name, error = %e, "block recovery pass failed");
            }
        }
    }

    async fn replay_missing_blocks(&self) -> Result<()> {
        let last_processed: u64 = self
            .store
            .get(&last_processed_block_key(&self.chain_name))
            .await?
            .unwrap_or(0);
        let head = self.adapter.current_block_number().await?;
        let start = last_processed.saturating_sub(256);

        for number in start..=head {
            let cached = self
                .store
                .get::<CachedBlock>(&block_cache_key(&self.chain_name, number))
                .await?;
            if cached.is_none() {
                if let Err(e) = self.ingest_block(number).await {
                    warn!(chain = %self.chain_name, block = number, error = %e, "recovery ingest failed");
                }
            }
        }
        Ok(())
    }

    async fn run_cache_cleanup_loop(self: Arc<Self>) {
        loop {
            tokio::time::sleep(Duration::from_secs(60)).await;
            if let Err(e) = self.cleanup_expired_blocks().await {
                warn!(chain = %self.chain_name, error = %e, "block cache cleanup failed");
            }
        }
    }

    async fn cleanup_expired_blocks(&self) -> Result<()> {
        let prefix = format!("blockCache:{}:", self.chain_name);
        let raw = self.store.scan_prefix_raw(&prefix).await?;
        let now = chrono::Utc::now();
        for (key, bytes) in raw {
            if let Ok(cached) = serde_json::from_slice::<CachedBlock>(&bytes) {
                if cached.is_expired(now) {
                    self.store.delete_raw(&key).await?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::mock::MockChainAdapter;
    use crate::store::memory::MemoryStore;
    use std::str::FromStr;

    fn chain_config() -> ChainConfig {
        ChainConfig {
            name: "mind".to_string(),
            rpc_url: String::new(),
            http_rpc_url: "http://localhost".to_string(),
            chain_id: 1,
            native_currency: "MIND".to_string(),
            native_decimals: 18,
            required_confirmations: 10,
            min_deposit: "0.001".to_string(),
            min_withdrawal: "1.00".to_string(),
            max_withdrawal: "1000.00".to_string(),
            withdrawal_fee: "1.00".to_string(),
            withdrawal_processor_contract_address: "0x0000000000000000000000000000000000000001"
                .to_string(),
            tokens: HashMap::new(),
            window_ms: 60_000,
            native_gas_limit: 21_000,
            erc20_gas_limit: 65_000,
        }
    }

    async fn indexer() -> (Arc<Indexer<MemoryStore, MockChainAdapter>>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let adapter = Arc::new(MockChainAdapter::new(1));
        let ledger = Arc::new(Ledger::new(store.clone()));
        let secrets = IndexerSecrets {
            signing_master_seed: b"test-seed".to_vec(),
            hot_wallet_address: EvmAddress::from_hex("0x000000000000000000000000000000000000ff").unwrap(),
            hot_wallet_signing_key: [9u8; 32],
        };
        let indexer = Indexer::new(
            "mind".to_string(),
            chain_config(),
            store.clone(),
            adapter,
            ledger,
            NotificationBus::new(),
            secrets,
            5,
        )
        .await
        .unwrap();
        (indexer, store)
    }

    #[tokio::test]
    async fn unregistered_address_is_never_admitted() {
        let (indexer, _store) = indexer().await;
        let from = EvmAddress::from_hex("0x0000000000000000000000000000000000000b").unwrap();
        let to = EvmAddress::from_hex("0x000000000000000000000000000000000000aa").unwrap();
        indexer
            .clone()
            .try_admit_native(
                TxHash::from_hex("0x01"),
                from,
                to,
                Amount::from_str("5.00").unwrap(),
                100,
            )
            .await;
        let pending = indexer.pending.lock().await;
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn registered_address_admits_above_minimum_deposit() {
        let (indexer, store) = indexer().await;
        let to = EvmAddress::from_hex("0x000000000000000000000000000000000000aa").unwrap();
        indexer.register_active_address("alice", &to).await;

        let from = EvmAddress::from_hex("0x0000000000000000000000000000000000000b").unwrap();
        indexer
            .clone()
            .try_admit_native(
                TxHash::from_hex("0x01"),
                from,
                to,
                Amount::from_str("5.00").unwrap(),
                100,
            )
            .await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        let deposit: Deposit = store
            .get(&deposit_key(&TxHash::from_hex("0x01")))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(deposit.username, "alice");
        assert_eq!(deposit.status, DepositStatus::Pending);
    }

    #[tokio::test]
    async fn below_minimum_deposit_is_not_admitted() {
        let (indexer, store) = indexer().await;
        let to = EvmAddress::from_hex("0x000000000000000000000000000000000000aa").unwrap();
        indexer.register_active_address("alice", &to).await;

        let from = EvmAddress::from_hex("0x0000000000000000000000000000000000000b").unwrap();
        indexer
            .clone()
            .try_admit_native(
                TxHash::from_hex("0x02"),
                from,
                to,
                Amount::from_str("0.0005").unwrap(),
                100,
            )
            .await;

        let deposit: Option<Deposit> = store.get(&deposit_key(&TxHash::from_hex("0x02"))).await.unwrap();
        assert!(deposit.is_none());
    }

    #[tokio::test]
    async fn gas_funding_hash_is_never_admitted() {
        let (indexer, _store) = indexer().await;
        let to = EvmAddress::from_hex("0x000000000000000000000000000000000000aa").unwrap();
        indexer.register_active_address("bob", &to).await;
        indexer.record_gas_funding(&TxHash::from_hex("0x03")).await.unwrap();

        let from = EvmAddress::from_hex("0x0000000000000000000000000000000000000b").unwrap();
        indexer
            .clone()
            .try_admit_native(
                TxHash::from_hex("0x03"),
                from,
                to,
                Amount::from_str("5.00").unwrap(),
                100,
            )
            .await;

        let deposit: Option<Deposit> = _store.get(&deposit_key(&TxHash::from_hex("0x03"))).await.unwrap();
        assert!(deposit.is_none());
    }

    /// S1: once the chain head clears the confirmation window the
    /// deposit sweeps and the ledger is credited net of gas cost, truncated
    /// toward zero.
    #[tokio::test]
    async fn native_deposit_sweeps_and_credits_net_of_gas_once_confirmed() {
        let store = Arc::new(MemoryStore::new());
        let adapter = Arc::new(MockChainAdapter::new(1));
        adapter.set_current_block(109);
        let ledger = Arc::new(Ledger::new(store.clone()));
        let secrets = IndexerSecrets {
            signing_master_seed: b"test-seed".to_vec(),
            hot_wallet_address: EvmAddress::from_hex("0x000000000000000000000000000000000000ff").unwrap(),
            hot_wallet_signing_key: [9u8; 32],
        };
        let indexer = Indexer::new(
            "mind".to_string(),
            chain_config(),
            store.clone(),
            adapter,
            ledger.clone(),
            NotificationBus::new(),
            secrets,
            5,
        )
        .await
        .unwrap();

        let to = EvmAddress::from_hex("0x000000000000000000000000000000000000aa").unwrap();
        indexer.register_active_address("alice", &to).await;
        let from = EvmAddress::from_hex("0x0000000000000000000000000000000000000b").unwrap();
        indexer
            .clone()
            .try_admit_native(
                TxHash::from_hex("0x11"),
                from,
                to,
                Amount::from_str("5.00").unwrap(),
                100,
            )
            .await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        let deposit: Deposit = store
            .get(&deposit_key(&TxHash::from_hex("0x11")))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(deposit.status, DepositStatus::Credited);
        assert_eq!(deposit.confirmations, 10);
        // 5.00 MIND at 18 decimals, 1 gwei gas price, 21000 gas limit:
        // gas cost is dust at this scale, truncating 4.999999999999979 to 4.99.
        assert_eq!(deposit.amount, Amount::from_str("4.99").unwrap());

        let balance = ledger.get("alice", "mind", "MIND").await.unwrap();
        assert_eq!(balance.available, Amount::from_str("4.99").unwrap());
    }

    /// S3: a token deposit triggers a native gas top-up to the depositor's
    /// address, that top-up hash is never itself re-admitted as a deposit,
    /// and the ledger is credited the full token amount (gas is paid
    /// separately, not deducted from the token value).
    #[tokio::test]
    async fn token_deposit_tops_up_gas_and_credits_gross_amount() {
        let store = Arc::new(MemoryStore::new());
        let adapter = Arc::new(MockChainAdapter::new(1));
        adapter.set_current_block(109);
        let ledger = Arc::new(Ledger::new(store.clone()));
        let secrets = IndexerSecrets {
            signing_master_seed: b"test-seed".to_vec(),
            hot_wallet_address: EvmAddress::from_hex("0x000000000000000000000000000000000000ff").unwrap(),
            hot_wallet_signing_key: [9u8; 32],
        };

        let mut config = chain_config();
        config.tokens.insert(
            "USDT".to_string(),
            crate::config::TokenConfig {
                address: "0x0000000000000000000000000000000000dead".to_string(),
                decimals: 6,
                min_withdrawal: "1.00".to_string(),
                max_withdrawal: "1000.00".to_string(),
                withdrawal_fee: "1.00".to_string(),
                min_deposit: "0.01".to_string(),
            },
        );

        let indexer = Indexer::new(
            "mind".to_string(),
            config,
            store.clone(),
            adapter,
            ledger.clone(),
            NotificationBus::new(),
            secrets,
            5,
        )
        .await
        .unwrap();

        let to = EvmAddress::from_hex("0x000000000000000000000000000000000000bb").unwrap();
        indexer.register_active_address("bob", &to).await;
        let from = EvmAddress::from_hex("0x0000000000000000000000000000000000000c").unwrap();
        indexer
            .clone()
            .try_admit_token(
                TxHash::from_hex("0x20"),
                from,
                to,
                Amount::from_str("100.00").unwrap(),
                "USDT".to_string(),
                100,
            )
            .await;

        tokio::time::sleep(Duration::from_millis(50)).await;
        let deposit: Deposit = store
            .get(&deposit_key(&TxHash::from_hex("0x20")))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(deposit.status, DepositStatus::Credited);
        assert_eq!(deposit.amount, Amount::from_str("100.00").unwrap());

        let balance = ledger.get("bob", "mind", "USDT").await.unwrap();
        assert_eq!(balance.available, Amount::from_str("100.00").unwrap());

        // Exactly one gas-funding record exists, and the admission path
        // treats it as never-admissible even though it moved native value.
        let gas_fundings = store.scan_prefix_raw("gasFundingTx:").await.unwrap();
        assert_eq!(gas_fundings.len(), 1);
    }

    /// S6: replaying already-cached blocks through recovery never admits the
    /// same deposit twice.
    #[tokio::test]
    async fn recovery_replay_does_not_double_admit() {
        let (indexer, store) = indexer().await;
        let to = EvmAddress::from_hex("0x000000000000000000000000000000000000aa").unwrap();
        indexer.register_active_address("alice", &to).await;
        let from = EvmAddress::from_hex("0x0000000000000000000000000000000000000b").unwrap();

        indexer
            .clone()
            .try_admit_native(
                TxHash::from_hex("0x30"),
                from.clone(),
                to.clone(),
                Amount::from_str("5.00").unwrap(),
                100,
            )
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        // A second admission attempt for the same hash (as a crash-recovery
        // replay would produce) must not create a second deposit record or
        // double-count the pending queue.
        indexer
            .clone()
            .try_admit_native(TxHash::from_hex("0x30"), from, to, Amount::from_str("5.00").unwrap(), 100)
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let pending = indexer.pending.lock().await;
        let count = pending.get("MIND").map(|s| s.len()).unwrap_or(0);
        assert_eq!(count, 1);
        drop(pending);

        let deposit: Deposit = store
            .get(&deposit_key(&TxHash::from_hex("0x30")))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(deposit.username, "alice");
    }

    /// A deposit that crashed mid-pipeline (persisted in a non-terminal
    /// state) is back in the pending queue and resumes toward `credited` as
    /// soon as the owning `Indexer` is constructed, rather than being
    /// stranded until the next on-chain event re-admits its hash.
    #[tokio::test]
    async fn recover_resumes_non_terminal_deposit_on_restart() {
        let store = Arc::new(MemoryStore::new());
        let to = EvmAddress::from_hex("0x000000000000000000000000000000000000aa").unwrap();
        let from = EvmAddress::from_hex("0x0000000000000000000000000000000000000b").unwrap();
        let hash = TxHash::from_hex("0x40");

        let stranded = Deposit {
            tx_hash: hash.clone(),
            username: "alice".to_string(),
            chain: "mind".to_string(),
            currency: "MIND".to_string(),
            amount: Amount::from_str("5.00").unwrap(),
            sender: from,
            recipient: to,
            required_confirmations: 10,
            confirmations: 10,
            start_block: 100,
            retry_count: 0,
            status: DepositStatus::Confirmed,
            error_kind: None,
            timestamp: chrono::Utc::now(),
        };
        store.put(&deposit_key(&hash), &stranded).await.unwrap();

        let adapter = Arc::new(MockChainAdapter::new(1));
        adapter.set_current_block(109);
        let ledger = Arc::new(Ledger::new(store.clone()));
        let secrets = IndexerSecrets {
            signing_master_seed: b"test-seed".to_vec(),
            hot_wallet_address: EvmAddress::from_hex("0x000000000000000000000000000000000000ff").unwrap(),
            hot_wallet_signing_key: [9u8; 32],
        };
        let indexer = Indexer::new(
            "mind".to_string(),
            chain_config(),
            store.clone(),
            adapter,
            ledger.clone(),
            NotificationBus::new(),
            secrets,
            5,
        )
        .await
        .unwrap();

        // Recovery runs to completion inside `Indexer::new`, so the pending
        // queue already holds the stranded deposit the moment it returns.
        let pending = indexer.pending.lock().await;
        assert!(pending.get("MIND").is_some_and(|s| s.contains(hash.as_str())));
        drop(pending);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let deposit: Deposit = store.get(&deposit_key(&hash)).await.unwrap().unwrap();
        assert_eq!(deposit.status, DepositStatus::Credited);

        let balance = ledger.get("alice", "mind", "MIND").await.unwrap();
        assert_eq!(balance.available, Amount::from_str("4.99").unwrap());
    }
}
