use crate::chain::{ChainError, ChainWriter, TransactionReceipt, TransactionRequest};
use crate::engine::{ChannelEvent, EventBus};
use crate::storage::{Store, StoreError};
use log::{debug, error, info};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

/// Default bound on submission attempts for on-chain writes.
pub const DEFAULT_WRITE_RETRIES: u32 = 1;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Serializes on-chain writes for one signing key.
///
/// Submissions run strictly one at a time (a concurrent submission would race the account nonce),
/// are retried up to the configured bound on retryable errors, and every lifecycle step is
/// persisted and published. A failed transaction never rolls back channel state; the channel was
/// not updated on-chain in the first place.
pub struct TransactionQueue<W, S> {
    writer: Arc<W>,
    store: Arc<S>,
    events: EventBus,
    retries: u32,
    serial: Mutex<()>,
}

impl<W: ChainWriter, S: Store> TransactionQueue<W, S> {
    pub fn new(writer: Arc<W>, store: Arc<S>, events: EventBus) -> Self {
        Self::with_retries(writer, store, events, DEFAULT_WRITE_RETRIES)
    }

    pub fn with_retries(writer: Arc<W>, store: Arc<S>, events: EventBus, retries: u32) -> Self {
        TransactionQueue { writer, store, events, retries: retries.max(1), serial: Mutex::new(()) }
    }

    /// Submit a transaction and wait until it is mined. Callers queue in FIFO order.
    pub async fn submit_and_confirm(&self, request: TransactionRequest) -> Result<TransactionReceipt, QueueError> {
        let _guard = self.serial.lock().await;

        let mut attempt = 1;
        let response = loop {
            match self.writer.submit(&request).await {
                Ok(response) => break response,
                Err(e) if e.can_retry() && attempt <= self.retries => {
                    debug!("{} submission attempt {attempt} failed: {e}", request.reason);
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        };

        self.store.save_transaction_response(request.channel_address, request.reason, &response).await?;
        info!("{} transaction {} submitted for {}", request.reason, response.transaction_hash, request.channel_address);
        self.events.publish(ChannelEvent::TransactionSubmitted {
            channel: request.channel_address,
            reason: request.reason,
            transaction_hash: response.transaction_hash,
        });

        match self.writer.wait_for_confirmation(&response).await {
            Ok(receipt) => {
                self.store.save_transaction_receipt(request.channel_address, &receipt).await?;
                self.events.publish(ChannelEvent::TransactionMined {
                    channel: request.channel_address,
                    transaction_hash: receipt.transaction_hash,
                });
                Ok(receipt)
            }
            Err(e) => {
                error!("{} transaction {} failed: {e}", request.reason, response.transaction_hash);
                self.store
                    .save_transaction_failure(request.channel_address, response.transaction_hash, &e.to_string())
                    .await?;
                self.events.publish(ChannelEvent::TransactionFailed {
                    channel: request.channel_address,
                    transaction_hash: response.transaction_hash,
                    error: e.to_string(),
                });
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::chain::TransactionReason;
    use crate::storage::MemoryStore;
    use crate::testing::{test_channel, DummyChainWriter};
    use alloy_primitives::{Bytes, U256};

    fn request(reason: TransactionReason) -> TransactionRequest {
        let channel = test_channel();
        TransactionRequest {
            channel_address: channel.channel_address,
            chain_id: channel.network_context.chain_id,
            to: channel.channel_address,
            value: U256::ZERO,
            data: Bytes::from_static(b"calldata"),
            reason,
        }
    }

    #[tokio::test]
    async fn submission_lifecycle_is_persisted_and_published() {
        let writer = Arc::new(DummyChainWriter::default());
        let store = Arc::new(MemoryStore::new());
        let events = EventBus::default();
        let mut subscriber = events.subscribe();
        let queue = TransactionQueue::new(Arc::clone(&writer), Arc::clone(&store), events);

        let request = request(TransactionReason::DepositAlice);
        let receipt = queue.submit_and_confirm(request.clone()).await.unwrap();
        assert!(receipt.success);

        let records = store.get_transaction_records(request.channel_address).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].reason, TransactionReason::DepositAlice);
        assert_eq!(records[0].receipt.as_ref().unwrap().transaction_hash, receipt.transaction_hash);
        assert!(records[0].error.is_none());

        assert!(matches!(subscriber.recv().await.unwrap(), ChannelEvent::TransactionSubmitted { .. }));
        assert!(matches!(subscriber.recv().await.unwrap(), ChannelEvent::TransactionMined { .. }));
    }

    #[tokio::test]
    async fn retryable_submit_errors_are_retried() {
        let writer = Arc::new(DummyChainWriter::default());
        writer.fail_submissions(1);
        let store = Arc::new(MemoryStore::new());
        let queue = TransactionQueue::new(Arc::clone(&writer), store, EventBus::default());
        queue.submit_and_confirm(request(TransactionReason::DeployChannel)).await.unwrap();
        assert_eq!(writer.submitted().len(), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_surface_the_error() {
        let writer = Arc::new(DummyChainWriter::default());
        writer.fail_submissions(5);
        let store = Arc::new(MemoryStore::new());
        let queue = TransactionQueue::new(Arc::clone(&writer), Arc::clone(&store), EventBus::default());
        let request = request(TransactionReason::Withdraw);
        let err = queue.submit_and_confirm(request.clone()).await.unwrap_err();
        assert!(matches!(err, QueueError::Chain(ChainError::Provider(_))));
        // Nothing was submitted, so nothing was recorded.
        assert!(store.get_transaction_records(request.channel_address).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_confirmation_is_recorded() {
        let writer = Arc::new(DummyChainWriter::default());
        writer.fail_confirmations(1);
        let store = Arc::new(MemoryStore::new());
        let events = EventBus::default();
        let mut subscriber = events.subscribe();
        let queue = TransactionQueue::new(Arc::clone(&writer), Arc::clone(&store), events);

        let request = request(TransactionReason::DisputeChannel);
        let err = queue.submit_and_confirm(request.clone()).await.unwrap_err();
        assert!(matches!(err, QueueError::Chain(ChainError::TransactionFailed(_))));

        let records = store.get_transaction_records(request.channel_address).await.unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].error.is_some());
        assert!(matches!(subscriber.recv().await.unwrap(), ChannelEvent::TransactionSubmitted { .. }));
        assert!(matches!(subscriber.recv().await.unwrap(), ChannelEvent::TransactionFailed { .. }));
    }
}
