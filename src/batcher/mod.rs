//! The withdrawal batch processor: time-bucketed settlement against the
//! on-chain processor contract, per spec §4.5.
//!
//! Every withdrawal request is frozen against the ledger immediately and
//! assigned to a `(chain, currency, window_index)` bucket. The bucket's own
//! expiry drives a single scheduled wake-up (never a bare polling sleep);
//! settlement itself is guarded by a per-bucket lock so a crash-and-restart
//! replay and a timer firing late can never double-submit the same bucket.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::chain::{ChainAdapter, ReceiptStatus, WaitOutcome};
use crate::config::ChainConfig;
use crate::errors::{EngineError, Result};
use crate::ledger::Ledger;
use crate::metrics;
use crate::models::{bucket_key, withdrawal_key, Bucket, Withdrawal};
use crate::money::Amount;
use crate::notify::{Event, NotificationBus};
use crate::retry::{self, RetryAction};
use crate::store::{Store, StoreExt, WriteBatch};
use crate::types::{EvmAddress, TxHash, WithdrawalStatus};

const SETTLEMENT_TIMEOUT: Duration = Duration::from_secs(120);

pub struct BatcherSecrets {
    pub hot_wallet_signing_key: [u8; 32],
    pub hot_wallet_address: EvmAddress,
}

pub struct BatchProcessor<S: Store, C: ChainAdapter> {
    chain_name: String,
    config: ChainConfig,
    store: Arc<S>,
    adapter: Arc<C>,
    ledger: Arc<Ledger<S>>,
    notify: NotificationBus,
    secrets: BatcherSecrets,
    processor_address: EvmAddress,
    max_retries: u32,
    bucket_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    id_seq: AtomicU64,
}

impl<S: Store + 'static, C: ChainAdapter + 'static> BatchProcessor<S, C> {
    pub async fn new(
        chain_name: String,
        config: ChainConfig,
        store: Arc<S>,
        adapter: Arc<C>,
        ledger: Arc<Ledger<S>>,
        notify: NotificationBus,
        secrets: BatcherSecrets,
        max_retries: u32,
    ) -> Result<Arc<Self>> {
        let processor_address = EvmAddress::from_hex(&config.withdrawal_processor_contract_address)
            .map_err(EngineError::Configuration)?;

        let processor = Arc::new(Self {
            chain_name,
            config,
            store,
            adapter,
            ledger,
            notify,
            secrets,
            processor_address,
            max_retries,
            bucket_locks: Mutex::new(HashMap::new()),
            id_seq: AtomicU64::new(0),
        });
        processor.clone().recover().await?;
        Ok(processor)
    }

    /// Reschedules settlement for every bucket that hadn't settled before
    /// the process last stopped, per spec §9's crash-recovery note: a bucket
    /// whose window already closed is settled immediately rather than
    /// waiting for a wake-up that's already in the past.
    async fn recover(self: Arc<Self>) -> Result<()> {
        let buckets: Vec<Bucket> = self.store.scan_prefix("bucket:").await?;
        let count = buckets.len();
        for bucket in buckets {
            if bucket.settled {
                continue;
            }
            self.clone().schedule_bucket(bucket.id(), bucket.expires_at);
        }
        info!(chain = %self.chain_name, count, "recovered withdrawal buckets");
        Ok(())
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

    fn withdrawal_limits(&self, currency: &str) -> Result<(Amount, Amount, Amount)> {
        let (min, max, fee) = if currency == self.config.native_currency {
            (
                self.config.min_withdrawal.clone(),
                self.config.max_withdrawal.clone(),
                self.config.withdrawal_fee.clone(),
            )
        } else {
            let token = self.config.tokens.get(currency).ok_or_else(|| {
                EngineError::Validation(format!("unsupported currency {currency} on {}", self.chain_name))
            })?;
            (
                token.min_withdrawal.clone(),
                token.max_withdrawal.clone(),
                token.withdrawal_fee.clone(),
            )
        };
        let parse = |s: &str| s.parse::<Amount>().map_err(|e| EngineError::Configuration(e.to_string()));
        Ok((parse(&min)?, parse(&max)?, parse(&fee)?))
    }

    fn next_id(&self, currency: &str) -> String {
        let seq = self.id_seq.fetch_add(1, Ordering::Relaxed);
        format!(
            "wd-{}-{}-{}-{seq}",
            self.chain_name,
            currency,
            Utc::now().timestamp_millis()
        )
    }

    fn window_index(&self, now: DateTime<Utc>) -> u64 {
        let window_ms = self.config.window_ms.max(1);
        (now.timestamp_millis() / window_ms) as u64
    }

    fn window_expiry(&self, window_index: u64) -> DateTime<Utc> {
        let window_ms = self.config.window_ms.max(1);
        let millis = (window_index as i64 + 1) * window_ms;
        Utc.timestamp_millis_opt(millis).single().unwrap_or_else(Utc::now)
    }

    /// Validates the request, freezes funds, creates the withdrawal record,
    /// and assigns it into its time bucket, per spec §4.5 steps 1-4.
    pub async fn request_withdrawal(
        self: &Arc<Self>,
        username: &str,
        currency: &str,
        destination: EvmAddress,
        amount: Amount,
    ) -> Result<Withdrawal> {
        let (min, max, fee) = self.withdrawal_limits(currency)?;
        if amount < min || amount > max {
            return Err(EngineError::Validation(format!(
                "withdrawal amount {amount} outside [{min}, {max}] for {currency}"
            )));
        }

        let id = self.next_id(currency);
        let withdrawal = Withdrawal {
            id: id.clone(),
            username: username.to_string(),
            chain: self.chain_name.clone(),
            currency: currency.to_string(),
            amount,
            fee,
            destination,
            bucket_id: None,
            settlement_tx_hash: None,
            status: WithdrawalStatus::Created,
            timestamp: Utc::now(),
        };
        let reserved = withdrawal.reserved();

        self.ledger
            .freeze(username, &self.chain_name, currency, reserved)
            .await?;

        if let Err(e) = self.store.put(&withdrawal_key(&id), &withdrawal).await {
            // Compensate the freeze so a store failure never leaves funds
            // stuck with no corresponding record.
            let _ = self.ledger.unfreeze(username, &self.chain_name, currency, reserved).await;
            return Err(e);
        }

        let withdrawal = self.clone().assign_to_bucket(withdrawal).await?;
        self.notify.publish(Event::WithdrawalUpdate {
            record: withdrawal.clone(),
        });
        Ok(withdrawal)
    }

    async fn assign_to_bucket(self: Arc<Self>, mut withdrawal: Withdrawal) -> Result<Withdrawal> {
        let now = Utc::now();
        let window_index = self.window_index(now);
        let bucket_id = bucket_key(&self.chain_name, &withdrawal.currency, window_index);

        let existing = self.store.get::<Bucket>(&bucket_id).await?;
        let is_new = existing.is_none();
        let mut bucket = existing.unwrap_or_else(|| Bucket {
            chain: self.chain_name.clone(),
            currency: withdrawal.currency.clone(),
            window_index,
            withdrawal_ids: Vec::new(),
            created_at: now,
            expires_at: self.window_expiry(window_index),
            settled: false,
            submitted_tx_hash: None,
        });
        bucket.withdrawal_ids.push(withdrawal.id.clone());
        withdrawal.bucket_id = Some(bucket_id.clone());
        withdrawal.status = WithdrawalStatus::AddedToBucket;

        let mut batch = WriteBatch::new();
        batch.put(bucket_id.clone(), &bucket)?;
        batch.put(withdrawal_key(&withdrawal.id), &withdrawal)?;
        self.store.write_batch(batch).await?;

        if is_new {
            self.schedule_bucket(bucket_id, bucket.expires_at);
        }
        Ok(withdrawal)
    }

    /// Spawns a single wake-up timer for `bucket_id`. A bucket whose expiry
    /// has already passed (recovery path) settles immediately.
    fn schedule_bucket(self: Arc<Self>, bucket_id: String, expires_at: DateTime<Utc>) {
        tokio::spawn(async move {
            let now = Utc::now();
            if expires_at > now {
                let wait = (expires_at - now)
                    .to_std()
                    .unwrap_or(Duration::from_secs(0));
                tokio::time::sleep(wait).await;
            }
            self.settle_bucket(bucket_id).await;
        });
    }

    async fn lock_for(&self, bucket_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.bucket_locks.lock().await;
        locks
            .entry(bucket_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Settles one bucket exactly once, with the flat retry policy from
    /// spec §4.3 applied to the whole bucket rather than per-withdrawal,
    /// since a bucket submits (and can fail) as a single on-chain call.
    async fn settle_bucket(self: Arc<Self>, bucket_id: String) {
        let lock = self.lock_for(&bucket_id).await;
        let _guard = lock.lock().await;

        let mut retry_count = 0u32;
        loop {
            match self.try_settle_bucket(&bucket_id).await {
                Ok(()) => break,
                Err(e) => {
                    metrics::record_retry("batcher", &self.chain_name);
                    match retry::next_action(&e, retry_count, self.max_retries) {
                        RetryAction::Terminal => {
                            error!(chain = %self.chain_name, bucket_id, error = %e, "bucket settlement terminal failure");
                            self.fail_bucket(&bucket_id, &e).await;
                            break;
                        }
                        RetryAction::RetryAfter { after } => {
                            retry_count += 1;
                            warn!(chain = %self.chain_name, bucket_id, error = %e, retry_count, "bucket settlement retrying");
                            tokio::time::sleep(after).await;
                        }
                    }
                }
            }
        }

        self.bucket_locks.lock().await.remove(&bucket_id);
    }

    async fn try_settle_bucket(&self, bucket_id: &str) -> Result<()> {
        let started = std::time::Instant::now();
        let Some(mut bucket) = self.store.get::<Bucket>(bucket_id).await? else {
            return Ok(());
        };
        if bucket.settled {
            return Ok(());
        }

        // A prior attempt already submitted a batch transaction and this
        // call is a retry after a transient failure (e.g. the receipt wait
        // itself timed out): resolve that submission rather than
        // resubmitting, and never fall through to the "nothing to settle"
        // branch below for withdrawals that are mid-flight.
        if let Some(tx_hash) = bucket.submitted_tx_hash.clone() {
            return self.resolve_submitted_batch(&mut bucket, bucket_id, &tx_hash, started).await;
        }

        let mut withdrawals = Vec::new();
        for id in &bucket.withdrawal_ids {
            if let Some(w) = self.store.get::<Withdrawal>(&withdrawal_key(id)).await? {
                if w.status == WithdrawalStatus::AddedToBucket {
                    withdrawals.push(w);
                }
            }
        }
        if withdrawals.is_empty() {
            bucket.settled = true;
            self.store.put(bucket_id, &bucket).await?;
            return Ok(());
        }

        let decimals = self
            .asset_decimals(&bucket.currency)
            .ok_or_else(|| EngineError::Configuration(format!("unknown currency {}", bucket.currency)))?;
        let recipients: Vec<EvmAddress> = withdrawals.iter().map(|w| w.destination.clone()).collect();
        let amounts: Vec<u128> = withdrawals.iter().map(|w| w.amount.to_chain_units(decimals)).collect();
        let total_value: u128 = amounts.iter().sum();

        self.check_hot_wallet_liquidity(&bucket.currency, total_value).await?;

        for w in &withdrawals {
            let mut w = w.clone();
            w.status = WithdrawalStatus::Processing;
            self.store.put(&withdrawal_key(&w.id), &w).await?;
        }

        let tx_hash = if bucket.currency == self.config.native_currency {
            let default_gas_limit = self
                .config
                .native_gas_limit
                .saturating_mul(recipients.len() as u64 + 1);
            self.adapter
                .submit_batch_native(
                    &self.secrets.hot_wallet_signing_key,
                    &self.processor_address,
                    &recipients,
                    &amounts,
                    total_value,
                    default_gas_limit,
                )
                .await?
        } else {
            let token = self
                .token_address(&bucket.currency)
                .ok_or_else(|| EngineError::Configuration(format!("unknown token {}", bucket.currency)))?;
            self.ensure_allowance(&token, total_value).await?;
            let default_gas_limit = self
                .config
                .erc20_gas_limit
                .saturating_mul(recipients.len() as u64 + 1);
            self.adapter
                .submit_batch_erc20(
                    &self.secrets.hot_wallet_signing_key,
                    &self.processor_address,
                    &token,
                    &recipients,
                    &amounts,
                    default_gas_limit,
                )
                .await?
        };

        // Persist the submitted tx before waiting on its receipt: if the
        // wait below fails (timeout, process crash), the next settlement
        // attempt must resolve this submission rather than submit a second
        // batch call against the same withdrawals.
        bucket.submitted_tx_hash = Some(tx_hash.clone());
        self.store.put(bucket_id, &bucket).await?;

        self.resolve_submitted_batch(&mut bucket, bucket_id, &tx_hash, started).await
    }

    /// Waits on a batch transaction already recorded on `bucket` and
    /// resolves every withdrawal still `processing` against its outcome.
    /// Never submits a new transaction.
    async fn resolve_submitted_batch(
        &self,
        bucket: &mut Bucket,
        bucket_id: &str,
        tx_hash: &TxHash,
        started: std::time::Instant,
    ) -> Result<()> {
        let mut withdrawals = Vec::new();
        for id in &bucket.withdrawal_ids {
            if let Some(w) = self.store.get::<Withdrawal>(&withdrawal_key(id)).await? {
                if w.status == WithdrawalStatus::Processing {
                    withdrawals.push(w);
                }
            }
        }

        let outcome = self
            .adapter
            .wait_for_receipt(tx_hash, self.config.required_confirmations.min(3).max(1), SETTLEMENT_TIMEOUT)
            .await?;

        match outcome {
            WaitOutcome::Receipt {
                status: ReceiptStatus::Success,
                ..
            } => {
                self.complete_withdrawals(&withdrawals, tx_hash).await?;
                bucket.settled = true;
                self.store.put(bucket_id, bucket).await?;
                metrics::record_withdrawal_settled(&self.chain_name, &bucket.currency, "completed");
                metrics::BUCKET_SETTLEMENT_LATENCY
                    .with_label_values(&[&self.chain_name, &bucket.currency])
                    .observe(started.elapsed().as_secs_f64());
                Ok(())
            }
            WaitOutcome::Receipt {
                status: ReceiptStatus::Reverted,
                ..
            } => Err(EngineError::ChainReverted(format!("batch settlement tx {tx_hash} reverted"))),
            WaitOutcome::Timeout => Err(EngineError::ChainRpc("batch settlement receipt wait timed out".into())),
        }
    }

    async fn check_hot_wallet_liquidity(&self, currency: &str, total_value: u128) -> Result<()> {
        let gas_price = self.adapter.gas_price().await?;
        let gas_cost = gas_price.saturating_mul(self.config.native_gas_limit as u128 * 2);

        let native_balance = self
            .adapter
            .get_native_balance(&self.secrets.hot_wallet_address)
            .await?;
        if native_balance < gas_cost {
            return Err(EngineError::InsufficientHotWalletLiquidity {
                bucket_id: format!("{}:{currency}:gas", self.chain_name),
            });
        }

        if currency == self.config.native_currency {
            if native_balance < total_value.saturating_add(gas_cost) {
                return Err(EngineError::InsufficientHotWalletLiquidity {
                    bucket_id: format!("{}:{currency}", self.chain_name),
                });
            }
        } else {
            let token = self
                .token_address(currency)
                .ok_or_else(|| EngineError::Configuration(format!("unknown token {currency}")))?;
            let balance = self
                .adapter
                .get_token_balance(&token, &self.secrets.hot_wallet_address)
                .await?;
            if balance < total_value {
                return Err(EngineError::InsufficientHotWalletLiquidity {
                    bucket_id: format!("{}:{currency}", self.chain_name),
                });
            }
        }
        Ok(())
    }

    async fn ensure_allowance(&self, token: &EvmAddress, total_value: u128) -> Result<()> {
        let allowance = self
            .adapter
            .get_erc20_allowance(token, &self.secrets.hot_wallet_address, &self.processor_address)
            .await?;
        if allowance >= total_value {
            return Ok(());
        }
        let gas_limit = (self.config.erc20_gas_limit as f64 * 1.2) as u64;
        self.adapter
            .approve_erc20(
                &self.secrets.hot_wallet_signing_key,
                token,
                &self.processor_address,
                total_value,
                gas_limit,
            )
            .await?;
        Ok(())
    }

    async fn complete_withdrawals(&self, withdrawals: &[Withdrawal], tx_hash: &crate::types::TxHash) -> Result<()> {
        for w in withdrawals {
            self.ledger
                .settle(&w.username, &w.chain, &w.currency, w.reserved())
                .await?;
            let mut w = w.clone();
            w.status = WithdrawalStatus::Completed;
            w.settlement_tx_hash = Some(tx_hash.clone());
            self.store.put(&withdrawal_key(&w.id), &w).await?;
            self.notify.publish(Event::WithdrawalUpdate { record: w });
        }
        Ok(())
    }

    async fn fail_bucket(&self, bucket_id: &str, cause: &EngineError) {
        let Ok(Some(mut bucket)) = self.store.get::<Bucket>(bucket_id).await else {
            return;
        };
        for id in &bucket.withdrawal_ids {
            let Ok(Some(mut w)) = self.store.get::<Withdrawal>(&withdrawal_key(id)).await else {
                continue;
            };
            if w.status.is_terminal() {
                continue;
            }
            if let Err(e) = self.ledger.unfreeze(&w.username, &w.chain, &w.currency, w.reserved()).await {
                error!(chain = %self.chain_name, id, error = %e, "failed to unfreeze withdrawal after bucket failure");
            }
            warn!(chain = %self.chain_name, id, cause = %cause, "withdrawal failed, settlement abandoned");
            w.status = WithdrawalStatus::Failed;
            let _ = self.store.put(&withdrawal_key(&w.id), &w).await;
            metrics::record_withdrawal_settled(&self.chain_name, &w.currency, "failed");
            self.notify.publish(Event::WithdrawalUpdate { record: w });
        }
        bucket.settled = true;
        let _ = self.store.put(bucket_id, &bucket).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::mock::MockChainAdapter;
    use crate::store::memory::MemoryStore;
    use std::collections::HashMap as StdHashMap;
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
            withdrawal_processor_contract_address: "0x0000000000000000000000000000000000000002"
                .to_string(),
            tokens: StdHashMap::new(),
            window_ms: 60_000,
            native_gas_limit: 21_000,
            erc20_gas_limit: 65_000,
        }
    }

    async fn batcher() -> (Arc<BatchProcessor<MemoryStore, MockChainAdapter>>, Arc<MemoryStore>, Arc<Ledger<MemoryStore>>) {
        let store = Arc::new(MemoryStore::new());
        let adapter = Arc::new(MockChainAdapter::new(1));
        let ledger = Arc::new(Ledger::new(store.clone()));
        let secrets = BatcherSecrets {
            hot_wallet_signing_key: [3u8; 32],
            hot_wallet_address: EvmAddress::from_hex("0x00000000000000000000000000000000000099").unwrap(),
        };
        let processor = BatchProcessor::new(
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
        (processor, store, ledger)
    }

    #[tokio::test]
    async fn request_below_minimum_is_rejected() {
        let (batcher, _store, ledger) = batcher().await;
        ledger.credit("alice", "mind", "MIND", Amount::from_str("100.00").unwrap()).await.unwrap();
        let destination = EvmAddress::from_hex("0x000000000000000000000000000000000000bb").unwrap();
        let err = batcher
            .request_withdrawal("alice", "MIND", destination, Amount::from_str("0.50").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[tokio::test]
    async fn request_freezes_amount_plus_fee() {
        let (batcher, _store, ledger) = batcher().await;
        ledger.credit("alice", "mind", "MIND", Amount::from_str("100.00").unwrap()).await.unwrap();
        let destination = EvmAddress::from_hex("0x000000000000000000000000000000000000bb").unwrap();
        let withdrawal = batcher
            .request_withdrawal("alice", "MIND", destination, Amount::from_str("10.00").unwrap())
            .await
            .unwrap();
        assert_eq!(withdrawal.status, WithdrawalStatus::AddedToBucket);
        assert_eq!(withdrawal.reserved(), Amount::from_str("11.00").unwrap());

        let balance = ledger.get("alice", "mind", "MIND").await.unwrap();
        assert_eq!(balance.available, Amount::from_str("89.00").unwrap());
        assert_eq!(balance.frozen, Amount::from_str("11.00").unwrap());
    }

    #[tokio::test]
    async fn request_with_insufficient_available_fails_cleanly() {
        let (batcher, _store, ledger) = batcher().await;
        let destination = EvmAddress::from_hex("0x000000000000000000000000000000000000bb").unwrap();
        let err = batcher
            .request_withdrawal("alice", "MIND", destination, Amount::from_str("10.00").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InsufficientAvailable { .. }));
        let balance = ledger.get("alice", "mind", "MIND").await.unwrap();
        assert_eq!(balance.frozen, Amount::ZERO);
    }

    fn short_window_config() -> ChainConfig {
        let mut config = chain_config();
        config.window_ms = 200;
        config
    }

    /// S4: a withdrawal settles once its bucket's window closes, unfreezing
    /// the reservation and marking the withdrawal completed with the batch
    /// transaction hash.
    #[tokio::test]
    async fn withdrawal_settles_when_bucket_expires() {
        let store = Arc::new(MemoryStore::new());
        let adapter = Arc::new(MockChainAdapter::new(1));
        adapter.credit_native(
            &EvmAddress::from_hex("0x00000000000000000000000000000000000099").unwrap(),
            10_u128.pow(24),
        );
        let ledger = Arc::new(Ledger::new(store.clone()));
        ledger.credit("bob", "mind", "MIND", Amount::from_str("100.00").unwrap()).await.unwrap();
        let secrets = BatcherSecrets {
            hot_wallet_signing_key: [3u8; 32],
            hot_wallet_address: EvmAddress::from_hex("0x00000000000000000000000000000000000099").unwrap(),
        };
        let batcher = BatchProcessor::new(
            "mind".to_string(),
            short_window_config(),
            store.clone(),
            adapter,
            ledger.clone(),
            NotificationBus::new(),
            secrets,
            5,
        )
        .await
        .unwrap();

        let destination = EvmAddress::from_hex("0x000000000000000000000000000000000000cc").unwrap();
        let withdrawal = batcher
            .request_withdrawal("bob", "MIND", destination, Amount::from_str("10.00").unwrap())
            .await
            .unwrap();

        let balance = ledger.get("bob", "mind", "MIND").await.unwrap();
        assert_eq!(balance.frozen, Amount::from_str("11.00").unwrap());

        tokio::time::sleep(Duration::from_millis(400)).await;

        let settled: Withdrawal = store.get(&withdrawal_key(&withdrawal.id)).await.unwrap().unwrap();
        assert_eq!(settled.status, WithdrawalStatus::Completed);
        assert!(settled.settlement_tx_hash.is_some());

        let balance = ledger.get("bob", "mind", "MIND").await.unwrap();
        assert_eq!(balance.frozen, Amount::ZERO);
        assert_eq!(balance.available, Amount::from_str("89.00").unwrap());
    }

    /// S5: when the hot wallet can't cover the bucket total, settlement
    /// never submits a batch transaction and every withdrawal in the bucket
    /// is unfrozen and marked failed exactly once.
    #[tokio::test]
    async fn withdrawal_fails_cleanly_on_insufficient_hot_wallet_liquidity() {
        let store = Arc::new(MemoryStore::new());
        // No native balance credited to the hot wallet: liquidity check fails.
        let adapter = Arc::new(MockChainAdapter::new(1));
        let ledger = Arc::new(Ledger::new(store.clone()));
        ledger.credit("bob", "mind", "MIND", Amount::from_str("100.00").unwrap()).await.unwrap();
        let secrets = BatcherSecrets {
            hot_wallet_signing_key: [3u8; 32],
            hot_wallet_address: EvmAddress::from_hex("0x00000000000000000000000000000000000099").unwrap(),
        };
        let batcher = BatchProcessor::new(
            "mind".to_string(),
            short_window_config(),
            store.clone(),
            adapter,
            ledger.clone(),
            NotificationBus::new(),
            secrets,
            1,
        )
        .await
        .unwrap();

        let destination = EvmAddress::from_hex("0x000000000000000000000000000000000000cc").unwrap();
        let withdrawal = batcher
            .request_withdrawal("bob", "MIND", destination, Amount::from_str("10.00").unwrap())
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(400)).await;

        let failed: Withdrawal = store.get(&withdrawal_key(&withdrawal.id)).await.unwrap().unwrap();
        assert_eq!(failed.status, WithdrawalStatus::Failed);
        assert!(failed.settlement_tx_hash.is_none());

        let balance = ledger.get("bob", "mind", "MIND").await.unwrap();
        assert_eq!(balance.frozen, Amount::ZERO);
        assert_eq!(balance.available, Amount::from_str("100.00").unwrap());
    }
}
