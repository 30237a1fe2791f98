use crate::chain::ChainError;
use alloy_primitives::{Address, Bytes, B256, U256};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Why a transaction is being submitted. Recorded alongside the response so operators can
/// correlate store entries with channel activity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionReason {
    DeployChannel,
    DepositAlice,
    DepositBob,
    Approve,
    Withdraw,
    DisputeChannel,
    DefundChannel,
}

impl Display for TransactionReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionReason::DeployChannel => write!(f, "deployChannel"),
            TransactionReason::DepositAlice => write!(f, "depositAlice"),
            TransactionReason::DepositBob => write!(f, "depositBob"),
            TransactionReason::Approve => write!(f, "approve"),
            TransactionReason::Withdraw => write!(f, "withdraw"),
            TransactionReason::DisputeChannel => write!(f, "disputeChannel"),
            TransactionReason::DefundChannel => write!(f, "defundChannel"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRequest {
    pub channel_address: Address,
    pub chain_id: u64,
    pub to: Address,
    pub value: U256,
    pub data: Bytes,
    pub reason: TransactionReason,
}

/// Returned once a transaction has been accepted by the mempool.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionResponse {
    pub transaction_hash: B256,
    pub chain_id: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionReceipt {
    pub transaction_hash: B256,
    pub chain_id: u64,
    pub block_number: u64,
    pub success: bool,
}

/// Submission boundary for on-chain writes (deploy, deposit, withdraw, approve, dispute).
///
/// Implementations sign with the engine's key and talk to the mempool; the
/// [`crate::engine::TransactionQueue`] serializes calls per signer so account nonces never
/// collide.
#[async_trait]
pub trait ChainWriter: Send + Sync {
    async fn submit(&self, request: &TransactionRequest) -> Result<TransactionResponse, ChainError>;

    async fn wait_for_confirmation(
        &self,
        response: &TransactionResponse,
    ) -> Result<TransactionReceipt, ChainError>;
}
