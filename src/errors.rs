//! The error taxonomy for the core value-movement pipeline.
//!
//! These are kinds, not wrapper types for every library error: leaf errors
//! from the chain adapter and the store are mapped into this taxonomy at the
//! indexer/batcher boundary, per the propagation policy.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("insufficient available balance for {username}/{chain}/{currency}: have {have}, need {need}")]
    InsufficientAvailable {
        username: String,
        chain: String,
        currency: String,
        have: String,
        need: String,
    },

    #[error("insufficient frozen balance for {username}/{chain}/{currency}: have {have}, need {need}")]
    InsufficientFrozen {
        username: String,
        chain: String,
        currency: String,
        have: String,
        need: String,
    },

    #[error("insufficient hot wallet liquidity for bucket {bucket_id}")]
    InsufficientHotWalletLiquidity { bucket_id: String },

    #[error("deposit value does not cover gas cost")]
    InsufficientAfterGas,

    #[error("deposit amount below minimum")]
    InsufficientBalance,

    #[error("chain rpc error: {0}")]
    ChainRpc(String),

    #[error("transaction reverted: {0}")]
    ChainReverted(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("not found")]
    NotFound,
}

impl EngineError {
    /// Whether this error is retryable by the owning task, per the
    /// propagation policy: validation, insufficiency and configuration
    /// errors are terminal; RPC errors and reverts are retryable up to
    /// `MAX_RETRIES`.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::ChainRpc(_) | EngineError::Store(_))
    }

    /// Whether this error should force an immediate terminal transition
    /// with no retry, per spec §4.3's retry rules. A revert is final for the
    /// submission that produced it — resubmitting the same transfer again
    /// is never the right recovery, so it terminates like an insufficiency
    /// error instead of being retried like a transient RPC failure.
    pub fn is_immediately_terminal(&self) -> bool {
        matches!(
            self,
            EngineError::InsufficientBalance
                | EngineError::InsufficientAfterGas
                | EngineError::ChainReverted(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
