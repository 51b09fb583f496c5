//! Retry policy for deposit confirmation and withdrawal settlement.
//!
//! Unlike a fee-market-aware submission retry (gas bumping, nonce recovery),
//! this engine's retry policy is the flat one spec §4.3 describes: a
//! `retry_count` per deposit/withdrawal, a backoff of `3s * retry_count`
//! between attempts, and two outcomes once an error surfaces —
//! `InsufficientBalance`/`InsufficientAfterGas` terminate immediately, every
//! other error counts against `MAX_RETRIES` before terminating.

use std::time::Duration;

use tracing::warn;

use crate::errors::EngineError;

/// What to do after an attempt failed with `error`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryAction {
    /// Wait `after` then retry.
    RetryAfter { after: Duration },
    /// Give up; the record transitions to `failed`.
    Terminal,
}

/// Decide the next action for a record currently at `retry_count` failed
/// attempts (not yet incremented for this failure), given `max_retries`.
pub fn next_action(error: &EngineError, retry_count: u32, max_retries: u32) -> RetryAction {
    if error.is_immediately_terminal() {
        warn!(%error, retry_count, "terminal error, not retrying");
        return RetryAction::Terminal;
    }

    let attempt = retry_count + 1;
    if attempt >= max_retries {
        warn!(%error, attempt, max_retries, "exhausted retries");
        return RetryAction::Terminal;
    }

    RetryAction::RetryAfter {
        after: backoff_for_attempt(attempt),
    }
}

/// `3s * attempt`, per spec §4.3.
pub fn backoff_for_attempt(attempt: u32) -> Duration {
    Duration::from_secs(3 * attempt as u64)
}
