//! Per-user balances: the available/frozen split, and the only component
//! allowed to mutate a [`Balance`] record.
//!
//! Every mutation reads-modifies-writes through a single [`Store`] batch so a
//! crash between read and write never leaves `available`/`frozen` in a state
//! inconsistent with the record that motivated the change (a deposit, a
//! withdrawal, a transfer).

use std::sync::Arc;

use tracing::{debug, warn};

use crate::errors::{EngineError, Result};
use crate::models::{balance_key, Balance};
use crate::money::Amount;
use crate::store::{Store, StoreExt, WriteBatch};

pub struct Ledger<S: Store> {
    store: Arc<S>,
}

impl<S: Store> Ledger<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Returns a zero balance if none exists; never fails.
    pub async fn get(&self, username: &str, chain: &str, currency: &str) -> Result<Balance> {
        let key = balance_key(username, chain, currency);
        Ok(self.store.get::<Balance>(&key).await?.unwrap_or_default())
    }

    /// Adds `amount` to `available`.
    pub async fn credit(
        &self,
        username: &str,
        chain: &str,
        currency: &str,
        amount: Amount,
    ) -> Result<Balance> {
        let key = balance_key(username, chain, currency);
        let mut balance = self.get(username, chain, currency).await?;
        balance.available = balance
            .available
            .checked_add(amount)
            .ok_or_else(|| EngineError::Validation("credit overflows fixed-point scale".into()))?;

        let mut batch = WriteBatch::new();
        batch.put(key, &balance)?;
        self.store.write_batch(batch).await?;
        debug!(username, chain, currency, %amount, "credited");
        Ok(balance)
    }

    /// Moves `amount` from `available` to `frozen`.
    pub async fn freeze(
        &self,
        username: &str,
        chain: &str,
        currency: &str,
        amount: Amount,
    ) -> Result<Balance> {
        let key = balance_key(username, chain, currency);
        let mut balance = self.get(username, chain, currency).await?;
        if balance.available < amount {
            return Err(EngineError::InsufficientAvailable {
                username: username.to_string(),
                chain: chain.to_string(),
                currency: currency.to_string(),
                have: balance.available.to_string(),
                need: amount.to_string(),
            });
        }
        balance.available = balance.available.checked_sub(amount).unwrap_or(Amount::ZERO);
        balance.frozen = balance
            .frozen
            .checked_add(amount)
            .ok_or_else(|| EngineError::Validation("freeze overflows fixed-point scale".into()))?;

        let mut batch = WriteBatch::new();
        batch.put(key, &balance)?;
        self.store.write_batch(batch).await?;
        debug!(username, chain, currency, %amount, "froze");
        Ok(balance)
    }

    /// Moves `amount` back from `frozen` to `available`. If `amount >
    /// frozen`, moves whatever was actually there instead of failing — a
    /// deliberate policy so compensating unfreezes after retries never
    /// cascade into fatal errors.
    pub async fn unfreeze(
        &self,
        username: &str,
        chain: &str,
        currency: &str,
        amount: Amount,
    ) -> Result<Balance> {
        let key = balance_key(username, chain, currency);
        let mut balance = self.get(username, chain, currency).await?;

        let moved = if amount > balance.frozen {
            warn!(
                username,
                chain,
                currency,
                requested = %amount,
                available_to_unfreeze = %balance.frozen,
                "unfreeze exceeds frozen balance, moving only what's there"
            );
            balance.frozen
        } else {
            amount
        };

        balance.frozen = balance.frozen.checked_sub(moved).unwrap_or(Amount::ZERO);
        balance.available = balance
            .available
            .checked_add(moved)
            .ok_or_else(|| EngineError::Validation("unfreeze overflows fixed-point scale".into()))?;

        let mut batch = WriteBatch::new();
        batch.put(key, &balance)?;
        self.store.write_batch(batch).await?;
        debug!(username, chain, currency, %moved, "unfroze");
        Ok(balance)
    }

    /// Deducts `amount` from `frozen` without touching `available` — the
    /// withdrawal's funds have left custody.
    pub async fn settle(
        &self,
        username: &str,
        chain: &str,
        currency: &str,
        amount: Amount,
    ) -> Result<Balance> {
        let key = balance_key(username, chain, currency);
        let mut balance = self.get(username, chain, currency).await?;
        if balance.frozen < amount {
            return Err(EngineError::InsufficientFrozen {
                username: username.to_string(),
                chain: chain.to_string(),
                currency: currency.to_string(),
                have: balance.frozen.to_string(),
                need: amount.to_string(),
            });
        }
        balance.frozen = balance.frozen.checked_sub(amount).unwrap_or(Amount::ZERO);

        let mut batch = WriteBatch::new();
        batch.put(key, &balance)?;
        self.store.write_batch(batch).await?;
        debug!(username, chain, currency, %amount, "settled");
        Ok(balance)
    }

    /// Debits `from`'s available, credits `to`'s available; both writes land
    /// in one atomic batch.
    pub async fn transfer(
        &self,
        from: &str,
        to: &str,
        chain: &str,
        currency: &str,
        amount: Amount,
    ) -> Result<(Balance, Balance)> {
        let from_key = balance_key(from, chain, currency);
        let to_key = balance_key(to, chain, currency);

        let mut from_balance = self.get(from, chain, currency).await?;
        if from_balance.available < amount {
            return Err(EngineError::InsufficientAvailable {
                username: from.to_string(),
                chain: chain.to_string(),
                currency: currency.to_string(),
                have: from_balance.available.to_string(),
                need: amount.to_string(),
            });
        }
        let mut to_balance = self.get(to, chain, currency).await?;

        from_balance.available = from_balance
            .available
            .checked_sub(amount)
            .unwrap_or(Amount::ZERO);
        to_balance.available = to_balance
            .available
            .checked_add(amount)
            .ok_or_else(|| EngineError::Validation("transfer overflows fixed-point scale".into()))?;

        let mut batch = WriteBatch::new();
        batch.put(from_key, &from_balance)?;
        batch.put(to_key, &to_balance)?;
        self.store.write_batch(batch).await?;
        debug!(from, to, chain, currency, %amount, "transferred");
        Ok((from_balance, to_balance))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use std::str::FromStr;

    fn amt(s: &str) -> Amount {
        Amount::from_str(s).unwrap()
    }

    fn ledger() -> Ledger<MemoryStore> {
        Ledger::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn unknown_balance_is_zero() {
        let l = ledger();
        let b = l.get("alice", "mind", "MIND").await.unwrap();
        assert_eq!(b.available, Amount::ZERO);
        assert_eq!(b.frozen, Amount::ZERO);
    }

    #[tokio::test]
    async fn credit_then_freeze_then_settle() {
        let l = ledger();
        l.credit("alice", "mind", "MIND", amt("100.00")).await.unwrap();
        l.freeze("alice", "mind", "MIND", amt("40.00")).await.unwrap();
        let b = l.get("alice", "mind", "MIND").await.unwrap();
        assert_eq!(b.available, amt("60.00"));
        assert_eq!(b.frozen, amt("40.00"));

        l.settle("alice", "mind", "MIND", amt("40.00")).await.unwrap();
        let b = l.get("alice", "mind", "MIND").await.unwrap();
        assert_eq!(b.available, amt("60.00"));
        assert_eq!(b.frozen, Amount::ZERO);
    }

    #[tokio::test]
    async fn freeze_fails_when_available_is_insufficient() {
        let l = ledger();
        l.credit("alice", "mind", "MIND", amt("10.00")).await.unwrap();
        let err = l.freeze("alice", "mind", "MIND", amt("20.00")).await.unwrap_err();
        assert!(matches!(err, EngineError::InsufficientAvailable { .. }));
    }

    #[tokio::test]
    async fn settle_fails_when_frozen_is_insufficient() {
        let l = ledger();
        l.credit("alice", "mind", "MIND", amt("10.00")).await.unwrap();
        let err = l.settle("alice", "mind", "MIND", amt("5.00")).await.unwrap_err();
        assert!(matches!(err, EngineError::InsufficientFrozen { .. }));
    }

    #[tokio::test]
    async fn unfreeze_more_than_frozen_moves_only_what_exists() {
        let l = ledger();
        l.credit("alice", "mind", "MIND", amt("10.00")).await.unwrap();
        l.freeze("alice", "mind", "MIND", amt("5.00")).await.unwrap();
        let b = l.unfreeze("alice", "mind", "MIND", amt("999.00")).await.unwrap();
        assert_eq!(b.frozen, Amount::ZERO);
        assert_eq!(b.available, amt("10.00"));
    }

    #[tokio::test]
    async fn transfer_moves_available_atomically() {
        let l = ledger();
        l.credit("alice", "mind", "MIND", amt("50.00")).await.unwrap();
        l.transfer("alice", "bob", "mind", "MIND", amt("20.00")).await.unwrap();

        let a = l.get("alice", "mind", "MIND").await.unwrap();
        let b = l.get("bob", "mind", "MIND").await.unwrap();
        assert_eq!(a.available, amt("30.00"));
        assert_eq!(b.available, amt("20.00"));
    }

    #[tokio::test]
    async fn transfer_fails_cleanly_when_sender_lacks_funds() {
        let l = ledger();
        let err = l
            .transfer("alice", "bob", "mind", "MIND", amt("5.00"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InsufficientAvailable { .. }));
        let b = l.get("bob", "mind", "MIND").await.unwrap();
        assert_eq!(b.available, Amount::ZERO);
    }
}
