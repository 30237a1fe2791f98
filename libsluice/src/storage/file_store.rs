use crate::chain::{TransactionReason, TransactionReceipt, TransactionResponse};
use crate::channel::ChannelState;
use crate::crypto::WithdrawCommitment;
use crate::identity::PublicIdentifier;
use crate::storage::{Store, StoreError, StoredTransaction};
use crate::transfer::{Transfer, TransferFilter};
use alloy_primitives::{Address, B256};
use async_trait::async_trait;
use log::debug;
use ron::ser::PrettyConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

/// A file-backed [`Store`].
///
/// Each channel is kept in one ron file named after its address, e.g.
/// `0x1234….ron`, holding the channel state together with every transfer it has carried; the one
/// file is rewritten through a temp-file rename on every save, which is what makes
/// `save_channel_state` atomic at channel scope. Withdrawal commitments and transaction records
/// live in two sibling files.
pub struct FileStore {
    path: PathBuf,
    inner: RwLock<Inner>,
}

#[derive(Default)]
struct Inner {
    channels: HashMap<Address, ChannelRecord>,
    withdrawals: HashMap<B256, WithdrawCommitment>,
    transactions: HashMap<Address, Vec<StoredTransaction>>,
}

#[derive(Clone, Serialize, Deserialize)]
struct ChannelRecord {
    channel: ChannelState,
    transfers: HashMap<B256, Transfer>,
    active: Vec<B256>,
}

const WITHDRAWALS_FILE: &str = "withdrawals.ron";
const TRANSACTIONS_FILE: &str = "transactions.ron";

impl FileStore {
    /// Open a store rooted at `path`, creating the directory and loading any existing records.
    pub fn new(path: PathBuf) -> Result<Self, anyhow::Error> {
        fs::create_dir_all(&path)?;
        let mut inner = Inner::default();
        for entry in fs::read_dir(&path)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.ends_with(".ron") {
                continue;
            }
            let contents = fs::read_to_string(entry.path())?;
            match name.as_str() {
                WITHDRAWALS_FILE => inner.withdrawals = ron::de::from_str(&contents)?,
                TRANSACTIONS_FILE => inner.transactions = ron::de::from_str(&contents)?,
                _ => {
                    let record: ChannelRecord = ron::de::from_str(&contents)?;
                    inner.channels.insert(record.channel.channel_address, record);
                }
            }
        }
        debug!("file store at {} loaded {} channels", path.display(), inner.channels.len());
        Ok(FileStore { path, inner: RwLock::new(inner) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_file<T: Serialize>(&self, name: &str, value: &T, method: &'static str) -> Result<(), StoreError> {
        let config = PrettyConfig::new().compact_arrays(true);
        let serialized =
            ron::ser::to_string_pretty(value, config).map_err(|e| StoreError::new(method, e.to_string()))?;
        let target = self.path.join(name);
        let temp = self.path.join(format!("{name}.tmp"));
        fs::write(&temp, serialized).map_err(|e| StoreError::new(method, e.to_string()))?;
        fs::rename(&temp, &target).map_err(|e| StoreError::new(method, e.to_string()))?;
        Ok(())
    }

    fn write_channel(&self, record: &ChannelRecord, method: &'static str) -> Result<(), StoreError> {
        self.write_file(&format!("{}.ron", record.channel.channel_address), record, method)
    }
}

fn apply_transfer(record: &mut ChannelRecord, transfer: &Transfer) {
    if transfer.is_resolved() {
        record.active.retain(|id| *id != transfer.transfer_id);
    } else if !record.active.contains(&transfer.transfer_id) {
        record.active.push(transfer.transfer_id);
    }
    record.transfers.insert(transfer.transfer_id, transfer.clone());
}

#[async_trait]
impl Store for FileStore {
    async fn get_channel_state(&self, channel: Address) -> Result<Option<ChannelState>, StoreError> {
        Ok(self.inner.read().await.channels.get(&channel).map(|r| r.channel.clone()))
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
            .map(|r| &r.channel)
            .find(|c| {
                c.alice_identifier == *alice
                    && c.bob_identifier == *bob
                    && c.network_context.chain_id == chain_id
            })
            .cloned())
    }

    async fn get_channel_states(&self) -> Result<Vec<ChannelState>, StoreError> {
        Ok(self.inner.read().await.channels.values().map(|r| r.channel.clone()).collect())
    }

    async fn get_active_transfers(&self, channel: Address) -> Result<Vec<Transfer>, StoreError> {
        let inner = self.inner.read().await;
        let Some(record) = inner.channels.get(&channel) else {
            return Ok(Vec::new());
        };
        record
            .active
            .iter()
            .map(|id| {
                record
                    .transfers
                    .get(id)
                    .cloned()
                    .ok_or_else(|| StoreError::new("get_active_transfers", format!("missing transfer {id}")))
            })
            .collect()
    }

    async fn get_transfer_state(&self, transfer_id: B256) -> Result<Option<Transfer>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .channels
            .values()
            .find_map(|r| r.transfers.get(&transfer_id))
            .cloned())
    }

    async fn get_transfers(&self, filter: &TransferFilter) -> Result<Vec<Transfer>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .channels
            .values()
            .flat_map(|r| r.transfers.values())
            .filter(|t| filter.matches(t))
            .cloned()
            .collect())
    }

    async fn save_channel_state(
        &self,
        channel: &ChannelState,
        transfer: Option<&Transfer>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let record = inner.channels.entry(channel.channel_address).or_insert_with(|| ChannelRecord {
            channel: channel.clone(),
            transfers: HashMap::new(),
            active: Vec::new(),
        });
        record.channel = channel.clone();
        if let Some(transfer) = transfer {
            apply_transfer(record, transfer);
        }
        let record = record.clone();
        self.write_channel(&record, "save_channel_state")
    }

    async fn save_channel_state_and_transfers(
        &self,
        channel: &ChannelState,
        active: &[Transfer],
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let record = inner.channels.entry(channel.channel_address).or_insert_with(|| ChannelRecord {
            channel: channel.clone(),
            transfers: HashMap::new(),
            active: Vec::new(),
        });
        record.channel = channel.clone();
        record.active = active.iter().map(|t| t.transfer_id).collect();
        for transfer in active {
            record.transfers.insert(transfer.transfer_id, transfer.clone());
        }
        let record = record.clone();
        self.write_channel(&record, "save_channel_state_and_transfers")
    }

    async fn save_withdrawal_commitment(
        &self,
        transfer_id: B256,
        commitment: &WithdrawCommitment,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        inner.withdrawals.insert(transfer_id, commitment.clone());
        self.write_file(WITHDRAWALS_FILE, &inner.withdrawals, "save_withdrawal_commitment")
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
        self.write_file(TRANSACTIONS_FILE, &inner.transactions, "save_transaction_response")
    }

    async fn save_transaction_receipt(
        &self,
        channel: Address,
        receipt: &TransactionReceipt,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let record = inner
            .transactions
            .get_mut(&channel)
            .and_then(|records| {
                records.iter_mut().find(|r| r.response.transaction_hash == receipt.transaction_hash)
            })
            .ok_or_else(|| StoreError::new("save_transaction_receipt", "unknown transaction hash"))?;
        record.receipt = Some(receipt.clone());
        self.write_file(TRANSACTIONS_FILE, &inner.transactions, "save_transaction_receipt")
    }

    async fn save_transaction_failure(
        &self,
        channel: Address,
        transaction_hash: B256,
        error: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let record = inner
            .transactions
            .get_mut(&channel)
            .and_then(|records| records.iter_mut().find(|r| r.response.transaction_hash == transaction_hash))
            .ok_or_else(|| StoreError::new("save_transaction_failure", "unknown transaction hash"))?;
        record.error = Some(error.to_string());
        self.write_file(TRANSACTIONS_FILE, &inner.transactions, "save_transaction_failure")
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
    async fn survives_a_reload() {
        let dir = tempfile::tempdir().unwrap();
        let channel = test_channel();
        let transfer = test_transfer(&channel);
        {
            let store = FileStore::new(dir.path().to_path_buf()).unwrap();
            store.save_channel_state(&channel, Some(&transfer)).await.unwrap();
        }
        let store = FileStore::new(dir.path().to_path_buf()).unwrap();
        assert_eq!(store.get_channel_state(channel.channel_address).await.unwrap(), Some(channel.clone()));
        assert_eq!(store.get_active_transfers(channel.channel_address).await.unwrap(), vec![transfer]);
    }

    #[tokio::test]
    async fn resolved_transfers_stay_in_history_across_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let channel = test_channel();
        let mut transfer = test_transfer(&channel);
        {
            let store = FileStore::new(dir.path().to_path_buf()).unwrap();
            store.save_channel_state(&channel, Some(&transfer)).await.unwrap();
            transfer.transfer_resolver = Some(json!({}));
            store.save_channel_state(&channel, Some(&transfer)).await.unwrap();
        }
        let store = FileStore::new(dir.path().to_path_buf()).unwrap();
        assert!(store.get_active_transfers(channel.channel_address).await.unwrap().is_empty());
        let history = store.get_transfers(&TransferFilter::by_channel(channel.channel_address)).await.unwrap();
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn withdrawal_commitments_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let channel = test_channel();
        let commitment = crate::testing::test_withdraw_commitment(&channel);
        let transfer_id = B256::repeat_byte(9);
        {
            let store = FileStore::new(dir.path().to_path_buf()).unwrap();
            store.save_withdrawal_commitment(transfer_id, &commitment).await.unwrap();
        }
        let store = FileStore::new(dir.path().to_path_buf()).unwrap();
        assert_eq!(store.get_withdrawal_commitment(transfer_id).await.unwrap(), Some(commitment.clone()));
        let by_hash = store
            .get_withdrawal_commitment_by_transaction_hash(commitment.transaction_hash.unwrap())
            .await
            .unwrap();
        assert_eq!(by_hash, Some(commitment));
    }
}
