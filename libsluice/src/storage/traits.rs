use crate::chain::{TransactionReason, TransactionReceipt, TransactionResponse};
use crate::channel::ChannelState;
use crate::crypto::WithdrawCommitment;
use crate::identity::PublicIdentifier;
use crate::transfer::{Transfer, TransferFilter};
use alloy_primitives::{Address, B256};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A store failure, tagged with the method that raised it. Store errors are never retried by the
/// engine; the failing call is surfaced to the caller unchanged.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("store operation '{method}' failed: {reason}")]
pub struct StoreError {
    pub method: &'static str,
    pub reason: String,
}

impl StoreError {
    pub fn new(method: &'static str, reason: impl Into<String>) -> Self {
        StoreError { method, reason: reason.into() }
    }
}

/// The lifecycle record kept for each on-chain submission.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredTransaction {
    pub reason: TransactionReason,
    pub response: TransactionResponse,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receipt: Option<TransactionReceipt>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Durable persistence the engine requires.
///
/// Save operations must be atomic at channel scope: a channel state and the transfer it touches
/// land together or not at all. The engine persists only as the final step of an update, so a
/// failed save leaves the channel unchanged.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_channel_state(&self, channel: Address) -> Result<Option<ChannelState>, StoreError>;

    async fn get_channel_state_by_participants(
        &self,
        alice: &PublicIdentifier,
        bob: &PublicIdentifier,
        chain_id: u64,
    ) -> Result<Option<ChannelState>, StoreError>;

    async fn get_channel_states(&self) -> Result<Vec<ChannelState>, StoreError>;

    /// Transfers currently contributing to the channel's merkle root, in creation order.
    async fn get_active_transfers(&self, channel: Address) -> Result<Vec<Transfer>, StoreError>;

    /// A transfer by id, active or historical.
    async fn get_transfer_state(&self, transfer_id: B256) -> Result<Option<Transfer>, StoreError>;

    async fn get_transfers(&self, filter: &TransferFilter) -> Result<Vec<Transfer>, StoreError>;

    /// Persist a channel state and, when the update touched one, the affected transfer. A
    /// resolved transfer (resolver populated) leaves the active set; an unresolved one joins it.
    async fn save_channel_state(
        &self,
        channel: &ChannelState,
        transfer: Option<&Transfer>,
    ) -> Result<(), StoreError>;

    /// Replace the channel's entire active-transfer set. Used by restore flows.
    async fn save_channel_state_and_transfers(
        &self,
        channel: &ChannelState,
        active: &[Transfer],
    ) -> Result<(), StoreError>;

    async fn save_withdrawal_commitment(
        &self,
        transfer_id: B256,
        commitment: &WithdrawCommitment,
    ) -> Result<(), StoreError>;

    async fn get_withdrawal_commitment(
        &self,
        transfer_id: B256,
    ) -> Result<Option<WithdrawCommitment>, StoreError>;

    async fn get_withdrawal_commitment_by_transaction_hash(
        &self,
        transaction_hash: B256,
    ) -> Result<Option<WithdrawCommitment>, StoreError>;

    async fn save_transaction_response(
        &self,
        channel: Address,
        reason: TransactionReason,
        response: &TransactionResponse,
    ) -> Result<(), StoreError>;

    async fn save_transaction_receipt(
        &self,
        channel: Address,
        receipt: &TransactionReceipt,
    ) -> Result<(), StoreError>;

    async fn save_transaction_failure(
        &self,
        channel: Address,
        transaction_hash: B256,
        error: &str,
    ) -> Result<(), StoreError>;

    async fn get_transaction_records(&self, channel: Address) -> Result<Vec<StoredTransaction>, StoreError>;
}
