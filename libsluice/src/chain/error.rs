use alloy_primitives::Address;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failures surfaced by the chain-reader and chain-writer boundaries.
#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChainError {
    /// RPC-level failure. The only retryable category.
    #[error("provider failure: {0}")]
    Provider(String),
    #[error("chain {0} is not configured")]
    UnsupportedChain(u64),
    #[error("transfer definition '{0}' is not registered")]
    TransferNotRegistered(String),
    #[error("contract call reverted: {0}")]
    Reverted(String),
    /// On-chain cumulative deposits are below the processed totals recorded off-chain. The local
    /// replica cannot be trusted.
    #[error("deposit totals for asset {asset} on {channel} regressed on-chain")]
    InconsistentDeposits { channel: Address, asset: Address },
    #[error("transaction failed: {0}")]
    TransactionFailed(String),
}

impl ChainError {
    /// Whether a bounded retry is worthwhile. Only transport-level failures qualify; reverts and
    /// configuration errors are deterministic.
    pub fn can_retry(&self) -> bool {
        matches!(self, ChainError::Provider(_))
    }
}
