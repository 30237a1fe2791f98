use crate::balance::Balance;
use crate::chain::{ChainError, ChainReader, ChannelDispute};
use crate::crypto::WithdrawCommitment;
use crate::transfer::{RegisteredTransfer, Transfer};
use alloy_primitives::{Address, Bytes, B256, U256};
use async_trait::async_trait;
use log::{debug, warn};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::sync::RwLock;

/// Default bound on chain-read attempts.
pub const DEFAULT_READ_RETRIES: u32 = 5;

const RETRY_DELAY: Duration = Duration::from_millis(50);

/// Wraps a [`ChainReader`] with the engine's read policy: every operation is retried up to a
/// bounded number of attempts on `can_retry` errors, and the registered-transfer list is cached
/// per chain id on first use (invalidated only on restart).
pub struct RetryingChainReader<C> {
    inner: C,
    retries: u32,
    registry_cache: RwLock<HashMap<u64, Vec<RegisteredTransfer>>>,
}

impl<C: ChainReader> RetryingChainReader<C> {
    pub fn new(inner: C) -> Self {
        Self::with_retries(inner, DEFAULT_READ_RETRIES)
    }

    pub fn with_retries(inner: C, retries: u32) -> Self {
        RetryingChainReader { inner, retries: retries.max(1), registry_cache: RwLock::new(HashMap::new()) }
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    async fn with_retry<T, F, Fut>(&self, method: &'static str, mut call: F) -> Result<T, ChainError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ChainError>>,
    {
        let mut attempt = 1;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if e.can_retry() && attempt < self.retries => {
                    debug!("{method} attempt {attempt}/{} failed: {e}", self.retries);
                    attempt += 1;
                    tokio::time::sleep(RETRY_DELAY * attempt).await;
                }
                Err(e) => {
                    if e.can_retry() {
                        warn!("{method} exhausted {} attempts: {e}", self.retries);
                    }
                    return Err(e);
                }
            }
        }
    }

    /// The registered-transfer list for a chain, fetched once and then served from memory.
    async fn registered_transfers(&self, registry: Address, chain_id: u64) -> Result<Vec<RegisteredTransfer>, ChainError> {
        if let Some(cached) = self.registry_cache.read().await.get(&chain_id) {
            return Ok(cached.clone());
        }
        let fetched = self
            .with_retry("get_registered_transfers", || self.inner.get_registered_transfers(registry, chain_id))
            .await?;
        debug!("caching {} registered transfers for chain {chain_id}", fetched.len());
        self.registry_cache.write().await.insert(chain_id, fetched.clone());
        Ok(fetched)
    }
}

#[async_trait]
impl<C: ChainReader> ChainReader for RetryingChainReader<C> {
    async fn get_code(&self, address: Address, chain_id: u64) -> Result<Bytes, ChainError> {
        self.with_retry("get_code", || self.inner.get_code(address, chain_id)).await
    }

    async fn get_total_deposits_alice(
        &self,
        channel: Address,
        chain_id: u64,
        asset_id: Address,
    ) -> Result<U256, ChainError> {
        self.with_retry("get_total_deposits_alice", || {
            self.inner.get_total_deposits_alice(channel, chain_id, asset_id)
        })
        .await
    }

    async fn get_total_deposits_bob(
        &self,
        channel: Address,
        chain_id: u64,
        asset_id: Address,
    ) -> Result<U256, ChainError> {
        self.with_retry("get_total_deposits_bob", || {
            self.inner.get_total_deposits_bob(channel, chain_id, asset_id)
        })
        .await
    }

    async fn get_channel_address(
        &self,
        alice: Address,
        bob: Address,
        factory: Address,
        chain_id: u64,
    ) -> Result<Address, ChainError> {
        self.with_retry("get_channel_address", || self.inner.get_channel_address(alice, bob, factory, chain_id))
            .await
    }

    async fn get_registered_transfer_by_name(
        &self,
        name: &str,
        registry: Address,
        chain_id: u64,
    ) -> Result<RegisteredTransfer, ChainError> {
        self.registered_transfers(registry, chain_id)
            .await?
            .into_iter()
            .find(|t| t.name == name)
            .ok_or_else(|| ChainError::TransferNotRegistered(name.to_string()))
    }

    async fn get_registered_transfer_by_definition(
        &self,
        definition: Address,
        registry: Address,
        chain_id: u64,
    ) -> Result<RegisteredTransfer, ChainError> {
        self.registered_transfers(registry, chain_id)
            .await?
            .into_iter()
            .find(|t| t.definition == definition)
            .ok_or_else(|| ChainError::TransferNotRegistered(definition.to_string()))
    }

    async fn get_registered_transfers(
        &self,
        registry: Address,
        chain_id: u64,
    ) -> Result<Vec<RegisteredTransfer>, ChainError> {
        self.registered_transfers(registry, chain_id).await
    }

    async fn create(
        &self,
        encoded_state: Bytes,
        balance: &Balance,
        definition: Address,
        registry: Address,
        chain_id: u64,
    ) -> Result<bool, ChainError> {
        self.with_retry("create", || {
            self.inner.create(encoded_state.clone(), balance, definition, registry, chain_id)
        })
        .await
    }

    async fn resolve(&self, transfer: &Transfer, chain_id: u64) -> Result<Balance, ChainError> {
        self.with_retry("resolve", || self.inner.resolve(transfer, chain_id)).await
    }

    async fn get_channel_dispute(
        &self,
        channel: Address,
        chain_id: u64,
    ) -> Result<Option<ChannelDispute>, ChainError> {
        self.with_retry("get_channel_dispute", || self.inner.get_channel_dispute(channel, chain_id)).await
    }

    async fn get_onchain_balance(
        &self,
        asset_id: Address,
        holder: Address,
        chain_id: u64,
    ) -> Result<U256, ChainError> {
        self.with_retry("get_onchain_balance", || self.inner.get_onchain_balance(asset_id, holder, chain_id))
            .await
    }

    async fn get_withdrawal_transaction_record(
        &self,
        commitment: &WithdrawCommitment,
        channel: Address,
        chain_id: u64,
    ) -> Result<bool, ChainError> {
        self.with_retry("get_withdrawal_transaction_record", || {
            self.inner.get_withdrawal_transaction_record(commitment, channel, chain_id)
        })
        .await
    }
}
