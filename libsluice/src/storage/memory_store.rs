use crate::chain::{TransactionReason, TransactionReceipt, TransactionResponse};
use crate::channel::ChannelState;
use crate::crypto::WithdrawCommitment;
use crate::identity::PublicIdentifier;
use crate::storage::{Store, StoreError, StoredTransaction};
use crate::transfer::{Transfer, TransferFilter};
use alloy_primitives::{Address, B256};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// In-memory [`Store`]. Every save takes the single write lock, so channel-scoped atomicity
/// holds trivially. Cloning shares the underlying maps.
#[derive(Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

#[derive(Default)]
struct Inner {
    channels: HashMap<Address, ChannelState>,
    transfers: HashMap<B256, Transfer>,
    /// Active transfer ids per channel, in creation order.
    active: HashMap<Address, Vec<B256>>,
    withdrawals: HashMap<B256, WithdrawCommitment>,
    transactions: HashMap<Address, Vec<StoredTransaction>>,
}

impl Clone for MemoryStore {
    fn clone(&self) -> Self {
        MemoryStore { inner: Arc::clone(&self.inner) }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }
}

fn apply_transfer(inner: &mut Inner, transfer: &Transfer) {
    let active = inner.active.entry(transfer.channel_address).or_default();
    if transfer.is_resolved() {
        active.retain(|id| *id != transfer.transfer_id);
    } else if !active.contains(&transfer.transfer_id) {
        active.push(transfer.transfer_id);
    }
    inner.transfers.insert(transfer.transfer_id, transfer.clone());
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_channel_state(&self, channel: Address) -> Result<Option<ChannelState>, StoreError> {
        Ok(self.inner.read().await.channels.get(&channel).cloned())
    }

    async fn get_channel_state_by_participants(
        &self,
        alice: &PublicIdentifier,
        bob: &PublicIdentifier,
        chain_id: u64,
    ) -> Result<Option<ChannelState>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .channels
            .values()
            .find(|c| {
                c.alice_identifier == *alice
                    && c.bob_identifier == *bob
                    && c.network_context.chain_id == chain_id
            })
            .cloned())
    }

    async fn get_channel_states(&self) -> Result<Vec<ChannelState>, StoreError> {
        Ok(self.inner.read().await.channels.values().cloned().collect())
    }

    async fn get_active_transfers(&self, channel: Address) -> Result<Vec<Transfer>, StoreError> {
        let inner = self.inner.read().await;
        let ids = inner.active.get(&channel).cloned().unwrap_or_default();
        ids.iter()
            .map(|id| {
                inner
                    .transfers
                    .get(id)
                    .cloned()
                    .ok_or_else(|| StoreError::new("get_active_transfers", format!("missing transfer {id}")))
            })
            .collect()
    }

    async fn get_transfer_state(&self, transfer_id: B256) -> Result<Option<Transfer>, StoreError> {
        Ok(self.inner.read().await.transfers.get(&transfer_id).cloned())
    }

    async fn get_transfers(&self, filter: &TransferFilter) -> Result<Vec<Transfer>, StoreError> {
        Ok(self.inner.read().await.transfers.values().filter(|t| filter.matches(t)).cloned().collect())
    }

    async fn save_channel_state(
        &self,
        channel: &ChannelState,
        transfer: Option<&Transfer>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.channels.insert(channel.channel_address, channel.clone());
        if let Some(transfer) = transfer {
            apply_transfer(&mut inner, transfer);
        }
        Ok(())
    }

    async fn save_channel_state_and_transfers(
        &self,
        channel: &ChannelState,
        active: &[Transfer],
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.channels.insert(channel.channel_address, channel.clone());
        inner.active.insert(channel.channel_address, active.iter().map(|t| t.transfer_id).collect());
        for transfer in active {
            inner.transfers.insert(transfer.transfer_id, transfer.clone());
        }
        Ok(())
    }

    async fn save_withdrawal_commitment(
        &self,
        transfer_id: B256,
        commitment: &WithdrawCommitment,
    ) -> Result<(), StoreError> {
        self.inner.write().await.withdrawals.insert(transfer_id, commitment.clone());
        Ok(())
    }

    async fn get_withdrawal_commitment(
        &self,
        transfer_id: B256,
    ) -> Result<Option<WithdrawCommitment>, StoreError> {
        Ok(self.inner.read().await.withdrawals.get(&transfer_id).cloned())
    }

    async fn get_withdrawal_commitment_by_transaction_hash(
        &self,
        transaction_hash: B256,
    ) -> Result<Option<WithdrawCommitment>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .withdrawals
            .values()
            .find(|c| c.transaction_hash == Some(transaction_hash))
            .cloned())
    }

    async fn save_transaction_response(
        &self,
        channel: Address,
        reason: TransactionReason,
        response: &TransactionResponse,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.transactions.entry(channel).or_default().push(StoredTransaction {
            reason,
            response: response.clone(),
            receipt: None,
            error: None,
        });
        Ok(())
    }

    async fn save_transaction_receipt(
        &self,
        channel: Address,
        receipt: &TransactionReceipt,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let records = inner
            .transactions
            .get_mut(&channel)
            .ok_or_else(|| StoreError::new("save_transaction_receipt", "no transactions for channel"))?;
        let record = records
            .iter_mut()
            .find(|r| r.response.transaction_hash == receipt.transaction_hash)
            .ok_or_else(|| StoreError::new("save_transaction_receipt", "unknown transaction hash"))?;
        record.receipt = Some(receipt.clone());
        Ok(())
    }

    async fn save_transaction_failure(
        &self,
        channel: Address,
        transaction_hash: B256,
        error: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let records = inner
            .transactions
            .get_mut(&channel)
            .ok_or_else(|| StoreError::new("save_transaction_failure", "no transactions for channel"))?;
        let record = records
            .iter_mut()
            .find(|r| r.response.transaction_hash == transaction_hash)
            .ok_or_else(|| StoreError::new("save_transaction_failure", "unknown transaction hash"))?;
        record.error = Some(error.to_string());
        Ok(())
    }

    async fn get_transaction_records(&self, channel: Address) -> Result<Vec<StoredTransaction>, StoreError> {
        Ok(self.inner.read().await.transactions.get(&channel).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testing::{test_channel, test_transfer};
    use serde_json::json;

    #[tokio::test]
    async fn channel_round_trip() {
        let store = MemoryStore::new();
        let channel = test_channel();
        store.save_channel_state(&channel, None).await.unwrap();

        let loaded = store.get_channel_state(channel.channel_address).await.unwrap().unwrap();
        assert_eq!(loaded, channel);
        let by_participants = store
            .get_channel_state_by_participants(
                &channel.alice_identifier,
                &channel.bob_identifier,
                channel.network_context.chain_id,
            )
            .await
            .unwrap();
        assert_eq!(by_participants, Some(channel.clone()));
        assert!(store
            .get_channel_state_by_participants(&channel.bob_identifier, &channel.alice_identifier, 1337)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn transfer_lifecycle() {
        let store = MemoryStore::new();
        let channel = test_channel();
        let transfer = test_transfer(&channel);
        store.save_channel_state(&channel, Some(&transfer)).await.unwrap();

        let active = store.get_active_transfers(channel.channel_address).await.unwrap();
        assert_eq!(active, vec![transfer.clone()]);

        let mut resolved = transfer.clone();
        resolved.transfer_resolver = Some(json!({ "preImage": "0x00" }));
        store.save_channel_state(&channel, Some(&resolved)).await.unwrap();

        assert!(store.get_active_transfers(channel.channel_address).await.unwrap().is_empty());
        // History is retained.
        let history = store.get_transfers(&TransferFilter::by_id(transfer.transfer_id)).await.unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].is_resolved());
    }

    #[tokio::test]
    async fn lookups_by_id_and_listing() {
        let store = MemoryStore::new();
        let channel = test_channel();
        let transfer = test_transfer(&channel);
        store.save_channel_state(&channel, Some(&transfer)).await.unwrap();

        assert_eq!(store.get_channel_states().await.unwrap().len(), 1);
        assert_eq!(store.get_transfer_state(transfer.transfer_id).await.unwrap(), Some(transfer.clone()));
        assert!(store.get_transfer_state(alloy_primitives::B256::ZERO).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn replace_active_set() {
        let store = MemoryStore::new();
        let channel = test_channel();
        let transfer = test_transfer(&channel);
        store.save_channel_state(&channel, Some(&transfer)).await.unwrap();
        store.save_channel_state_and_transfers(&channel, &[]).await.unwrap();
        assert!(store.get_active_transfers(channel.channel_address).await.unwrap().is_empty());
    }
}
