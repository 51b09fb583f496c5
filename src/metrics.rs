//! Prometheus metrics for the custody engine.
//!
//! Exposed on `/metrics` via [`crate::api`]. Label cardinality is kept to
//! `(chain, currency)` or `(chain,)` — never per-user, per-tx-hash or
//! per-withdrawal-id.

#![allow(dead_code)]

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram_vec, CounterVec,
    Gauge, GaugeVec, HistogramVec,
};

lazy_static! {
    pub static ref BLOCKS_INGESTED: CounterVec = register_counter_vec!(
        "custody_blocks_ingested_total",
        "Total number of blocks ingested",
        &["chain"]
    )
    .unwrap();

    pub static ref BLOCK_LAG: GaugeVec = register_gauge_vec!(
        "custody_block_lag",
        "head - last_processed_block, per chain",
        &["chain"]
    )
    .unwrap();

    pub static ref PENDING_QUEUE_DEPTH: GaugeVec = register_gauge_vec!(
        "custody_pending_queue_depth",
        "Deposits currently in the pending queue",
        &["chain", "currency"]
    )
    .unwrap();

    pub static ref DEPOSITS_ADMITTED: CounterVec = register_counter_vec!(
        "custody_deposits_admitted_total",
        "Deposits admitted into the pipeline",
        &["chain", "currency"]
    )
    .unwrap();

    pub static ref DEPOSITS_CREDITED: CounterVec = register_counter_vec!(
        "custody_deposits_credited_total",
        "Deposits that reached credited",
        &["chain", "currency"]
    )
    .unwrap();

    pub static ref DEPOSITS_FAILED: CounterVec = register_counter_vec!(
        "custody_deposits_failed_total",
        "Deposits that reached failed",
        &["chain", "currency", "reason"]
    )
    .unwrap();

    pub static ref WITHDRAWALS_SETTLED: CounterVec = register_counter_vec!(
        "custody_withdrawals_settled_total",
        "Withdrawals settled, by outcome",
        &["chain", "currency", "outcome"]
    )
    .unwrap();

    pub static ref BUCKET_SETTLEMENT_LATENCY: HistogramVec = register_histogram_vec!(
        "custody_bucket_settlement_latency_seconds",
        "Time from bucket expiry to settlement completing",
        &["chain", "currency"],
        vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0]
    )
    .unwrap();

    pub static ref RETRY_COUNT: CounterVec = register_counter_vec!(
        "custody_retries_total",
        "Retry attempts across deposit and withdrawal pipelines",
        &["component", "chain"]
    )
    .unwrap();

    pub static ref CHAIN_RECONNECTS: CounterVec = register_counter_vec!(
        "custody_chain_reconnects_total",
        "Push-transport reconnect attempts",
        &["chain"]
    )
    .unwrap();

    pub static ref POLLING_FALLBACK_ACTIVE: GaugeVec = register_gauge_vec!(
        "custody_polling_fallback_active",
        "1 if a chain's block/transfer transport is in polling fallback",
        &["chain"]
    )
    .unwrap();

    pub static ref UP: Gauge =
        register_gauge!("custody_up", "Whether the engine is up and running").unwrap();
}

pub fn set_block_lag(chain: &str, head: u64, last_processed: u64) {
    BLOCKS_INGESTED.with_label_values(&[chain]).inc();
    BLOCK_LAG
        .with_label_values(&[chain])
        .set(head.saturating_sub(last_processed) as f64);
}

pub fn set_pending_queue_depth(chain: &str, currency: &str, depth: usize) {
    PENDING_QUEUE_DEPTH
        .with_label_values(&[chain, currency])
        .set(depth as f64);
}

pub fn record_deposit_admitted(chain: &str, currency: &str) {
    DEPOSITS_ADMITTED.with_label_values(&[chain, currency]).inc();
}

pub fn record_deposit_credited(chain: &str, currency: &str) {
    DEPOSITS_CREDITED.with_label_values(&[chain, currency]).inc();
}

pub fn record_deposit_failed(chain: &str, currency: &str, reason: &str) {
    DEPOSITS_FAILED
        .with_label_values(&[chain, currency, reason])
        .inc();
}

pub fn record_withdrawal_settled(chain: &str, currency: &str, outcome: &str) {
    WITHDRAWALS_SETTLED
        .with_label_values(&[chain, currency, outcome])
        .inc();
}

pub fn record_retry(component: &str, chain: &str) {
    RETRY_COUNT.with_label_values(&[component, chain]).inc();
}

pub fn record_reconnect(chain: &str) {
    CHAIN_RECONNECTS.with_label_values(&[chain]).inc();
}

pub fn set_polling_fallback(chain: &str, active: bool) {
    POLLING_FALLBACK_ACTIVE
        .with_label_values(&[chain])
        .set(if active { 1.0 } else { 0.0 });
}
