use crate::balance::Balance;
use crate::chain::ChainError;
use crate::crypto::WithdrawCommitment;
use crate::transfer::{RegisteredTransfer, Transfer};
use alloy_primitives::{Address, Bytes, B256, U256};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// On-chain dispute record for a channel, mirrored into `ChannelState::in_dispute`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelDispute {
    pub channel_state_hash: B256,
    pub nonce: u64,
    pub merkle_root: B256,
    pub consensus_expiry: u64,
    pub defund_expiry: u64,
}

/// Read-only view of on-chain facts the protocol engine depends on.
///
/// Implementations talk JSON-RPC to the chains they are configured for; `create` and `resolve`
/// evaluate transfer predicates through a sandboxed EVM executor when the contract bytecode is
/// cached locally, falling back to a live `eth_call`. Everything here may fail with a categorized
/// [`ChainError`]; callers wrap reads in [`super::RetryingChainReader`] for the bounded retry
/// policy.
#[async_trait]
pub trait ChainReader: Send + Sync {
    /// Deployed bytecode at `address`, empty if the account has no code.
    async fn get_code(&self, address: Address, chain_id: u64) -> Result<Bytes, ChainError>;

    /// Cumulative amount Alice has deposited to `channel` for `asset_id`, via the factory path.
    async fn get_total_deposits_alice(
        &self,
        channel: Address,
        chain_id: u64,
        asset_id: Address,
    ) -> Result<U256, ChainError>;

    /// Cumulative amount credited to Bob's side for `asset_id` (plain transfers to the channel).
    async fn get_total_deposits_bob(
        &self,
        channel: Address,
        chain_id: u64,
        asset_id: Address,
    ) -> Result<U256, ChainError>;

    /// Deterministic channel address for a participant pair under `factory`.
    async fn get_channel_address(
        &self,
        alice: Address,
        bob: Address,
        factory: Address,
        chain_id: u64,
    ) -> Result<Address, ChainError>;

    async fn get_registered_transfer_by_name(
        &self,
        name: &str,
        registry: Address,
        chain_id: u64,
    ) -> Result<RegisteredTransfer, ChainError>;

    async fn get_registered_transfer_by_definition(
        &self,
        definition: Address,
        registry: Address,
        chain_id: u64,
    ) -> Result<RegisteredTransfer, ChainError>;

    async fn get_registered_transfers(
        &self,
        registry: Address,
        chain_id: u64,
    ) -> Result<Vec<RegisteredTransfer>, ChainError>;

    /// Evaluate the transfer definition's `create(state, balance)` predicate against the encoded
    /// initial state.
    async fn create(
        &self,
        encoded_state: Bytes,
        balance: &Balance,
        definition: Address,
        registry: Address,
        chain_id: u64,
    ) -> Result<bool, ChainError>;

    /// Evaluate `resolve(state, resolver, balance)`, returning the post-resolution balance.
    async fn resolve(&self, transfer: &Transfer, chain_id: u64) -> Result<Balance, ChainError>;

    async fn get_channel_dispute(
        &self,
        channel: Address,
        chain_id: u64,
    ) -> Result<Option<ChannelDispute>, ChainError>;

    /// ERC20 (or native, for the zero address) balance of `holder`.
    async fn get_onchain_balance(
        &self,
        asset_id: Address,
        holder: Address,
        chain_id: u64,
    ) -> Result<U256, ChainError>;

    /// Whether the withdrawal authorised by `commitment` has already been executed on-chain.
    async fn get_withdrawal_transaction_record(
        &self,
        commitment: &WithdrawCommitment,
        channel: Address,
        chain_id: u64,
    ) -> Result<bool, ChainError>;
}
