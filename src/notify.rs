//! The notification bus: a process-wide publish-only channel of
//! state-change events, consumed by external subscribers. Delivery is
//! best-effort — slow subscribers miss events rather than backpressuring the
//! core.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::models::{Balance, Deposit, Withdrawal};

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    DepositUpdate { record: Deposit },
    WithdrawalUpdate { record: Withdrawal },
    BalanceUpdate {
        username: String,
        chain: String,
        currency: String,
        balance: Balance,
    },
    TransferUpdate {
        from: String,
        to: String,
        chain: String,
        currency: String,
        amount: crate::money::Amount,
    },
}

impl Event {
    /// The usernames this event is relevant to; a transfer reaches both
    /// sides, per spec §4.6.
    pub fn usernames(&self) -> Vec<&str> {
        match self {
            Event::DepositUpdate { record } => vec![record.username.as_str()],
            Event::WithdrawalUpdate { record } => vec![record.username.as_str()],
            Event::BalanceUpdate { username, .. } => vec![username.as_str()],
            Event::TransferUpdate { from, to, .. } => vec![from.as_str(), to.as_str()],
        }
    }

    pub fn chain(&self) -> Option<&str> {
        match self {
            Event::DepositUpdate { record } => Some(record.chain.as_str()),
            Event::WithdrawalUpdate { record } => Some(record.chain.as_str()),
            Event::BalanceUpdate { chain, .. } => Some(chain.as_str()),
            Event::TransferUpdate { chain, .. } => Some(chain.as_str()),
        }
    }

    pub fn currency(&self) -> Option<&str> {
        match self {
            Event::DepositUpdate { record } => Some(record.currency.as_str()),
            Event::WithdrawalUpdate { record } => Some(record.currency.as_str()),
            Event::BalanceUpdate { currency, .. } => Some(currency.as_str()),
            Event::TransferUpdate { currency, .. } => Some(currency.as_str()),
        }
    }

    /// The `type` tag as it appears on the wire (matches this enum's
    /// `#[serde(tag = "type", rename_all = "snake_case")]`).
    pub fn event_type(&self) -> &'static str {
        match self {
            Event::DepositUpdate { .. } => "deposit_update",
            Event::WithdrawalUpdate { .. } => "withdrawal_update",
            Event::BalanceUpdate { .. } => "balance_update",
            Event::TransferUpdate { .. } => "transfer_update",
        }
    }

    /// The underlying record's lifecycle status, where one exists. Balance
    /// and transfer events carry no status of their own.
    pub fn status(&self) -> Option<String> {
        match self {
            Event::DepositUpdate { record } => Some(record.status.to_string()),
            Event::WithdrawalUpdate { record } => Some(record.status.to_string()),
            Event::BalanceUpdate { .. } | Event::TransferUpdate { .. } => None,
        }
    }
}

#[derive(Clone)]
pub struct NotificationBus {
    tx: broadcast::Sender<Arc<Event>>,
}

impl NotificationBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Best-effort publish: no subscribers is not an error.
    pub fn publish(&self, event: Event) {
        let _ = self.tx.send(Arc::new(event));
    }

    pub fn subscribe(&self) -> NotificationSubscriber {
        NotificationSubscriber {
            rx: self.tx.subscribe(),
            filter: Filter::default(),
        }
    }
}

impl Default for NotificationBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A client-side filter over `(username, type, chain, currency, status)`.
/// `None` fields match anything.
#[derive(Default, Clone)]
pub struct Filter {
    pub username: Option<String>,
    pub event_type: Option<String>,
    pub chain: Option<String>,
    pub currency: Option<String>,
    pub status: Option<String>,
}

impl Filter {
    fn matches(&self, event: &Event) -> bool {
        if let Some(username) = &self.username {
            if !event.usernames().contains(&username.as_str()) {
                return false;
            }
        }
        if let Some(event_type) = &self.event_type {
            if event.event_type() != event_type.as_str() {
                return false;
            }
        }
        if let Some(chain) = &self.chain {
            if event.chain() != Some(chain.as_str()) {
                return false;
            }
        }
        if let Some(currency) = &self.currency {
            if event.currency() != Some(currency.as_str()) {
                return false;
            }
        }
        if let Some(status) = &self.status {
            if event.status().as_deref() != Some(status.as_str()) {
                return false;
            }
        }
        true
    }
}

pub struct NotificationSubscriber {
    rx: broadcast::Receiver<Arc<Event>>,
    filter: Filter,
}

impl NotificationSubscriber {
    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = filter;
        self
    }

    /// Waits for the next event that matches this subscriber's filter. Skips
    /// lagged/missed-backlog markers silently: the bus promises best-effort
    /// delivery, not a durable log.
    pub async fn recv(&mut self) -> Option<Arc<Event>> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.filter.matches(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
