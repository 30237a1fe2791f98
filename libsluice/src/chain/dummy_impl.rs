use crate::balance::Balance;
use crate::chain::{ChainError, ChainReader, ChannelDispute};
use crate::crypto::{hash_withdraw_commitment, WithdrawCommitment};
use crate::transfer::{RegisteredTransfer, Transfer};
use alloy_primitives::{keccak256, Address, Bytes, B256, U256};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

/// An in-memory [`ChainReader`] with programmable facts, for driving the engine hermetically.
///
/// By default nothing is deployed, all deposit totals are zero, `create` predicates pass, and
/// `resolve` returns the transfer's locked balance (for an empty resolver this is exactly the
/// cooperative-cancellation result). Tests override per-definition create verdicts, per-transfer
/// resolve results, and can inject a run of transient provider failures.
#[derive(Default)]
pub struct DummyChainReader {
    inner: Mutex<State>,
}

#[derive(Default)]
struct State {
    code: HashMap<Address, Bytes>,
    deposits_alice: HashMap<(Address, Address), U256>,
    deposits_bob: HashMap<(Address, Address), U256>,
    onchain_balances: HashMap<(Address, Address), U256>,
    registered: Vec<RegisteredTransfer>,
    create_verdicts: HashMap<Address, bool>,
    resolve_results: HashMap<B256, Balance>,
    disputes: HashMap<Address, ChannelDispute>,
    withdrawal_records: HashSet<B256>,
    failures_remaining: u32,
}

impl DummyChainReader {
    /// Mark a channel contract as deployed (non-empty code).
    pub fn deploy_channel(&self, channel: Address) {
        self.inner.lock().unwrap().code.insert(channel, Bytes::from_static(&[0x60, 0x80]));
    }

    pub fn set_deposits(&self, channel: Address, asset_id: Address, alice_total: U256, bob_total: U256) {
        let mut state = self.inner.lock().unwrap();
        state.deposits_alice.insert((channel, asset_id), alice_total);
        state.deposits_bob.insert((channel, asset_id), bob_total);
    }

    pub fn set_onchain_balance(&self, asset_id: Address, holder: Address, amount: U256) {
        self.inner.lock().unwrap().onchain_balances.insert((asset_id, holder), amount);
    }

    pub fn register_transfer(&self, registered: RegisteredTransfer) {
        self.inner.lock().unwrap().registered.push(registered);
    }

    pub fn clear_registered_transfers(&self) {
        self.inner.lock().unwrap().registered.clear();
    }

    pub fn set_create_verdict(&self, definition: Address, verdict: bool) {
        self.inner.lock().unwrap().create_verdicts.insert(definition, verdict);
    }

    pub fn set_resolve_result(&self, transfer_id: B256, balance: Balance) {
        self.inner.lock().unwrap().resolve_results.insert(transfer_id, balance);
    }

    pub fn set_dispute(&self, channel: Address, dispute: ChannelDispute) {
        self.inner.lock().unwrap().disputes.insert(channel, dispute);
    }

    pub fn record_withdrawal(&self, commitment: &WithdrawCommitment) {
        self.inner.lock().unwrap().withdrawal_records.insert(hash_withdraw_commitment(commitment));
    }

    /// Make the next `count` calls fail with a retryable provider error.
    pub fn fail_next(&self, count: u32) {
        self.inner.lock().unwrap().failures_remaining = count;
    }

    pub fn pending_failures(&self) -> u32 {
        self.inner.lock().unwrap().failures_remaining
    }

    fn check_failure(&self) -> Result<(), ChainError> {
        let mut state = self.inner.lock().unwrap();
        if state.failures_remaining > 0 {
            state.failures_remaining -= 1;
            return Err(ChainError::Provider("injected failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ChainReader for DummyChainReader {
    async fn get_code(&self, address: Address, _chain_id: u64) -> Result<Bytes, ChainError> {
        self.check_failure()?;
        Ok(self.inner.lock().unwrap().code.get(&address).cloned().unwrap_or_default())
    }

    async fn get_total_deposits_alice(
        &self,
        channel: Address,
        _chain_id: u64,
        asset_id: Address,
    ) -> Result<U256, ChainError> {
        self.check_failure()?;
        Ok(self.inner.lock().unwrap().deposits_alice.get(&(channel, asset_id)).copied().unwrap_or_default())
    }

    async fn get_total_deposits_bob(
        &self,
        channel: Address,
        _chain_id: u64,
        asset_id: Address,
    ) -> Result<U256, ChainError> {
        self.check_failure()?;
        Ok(self.inner.lock().unwrap().deposits_bob.get(&(channel, asset_id)).copied().unwrap_or_default())
    }

    async fn get_channel_address(
        &self,
        alice: Address,
        bob: Address,
        factory: Address,
        chain_id: u64,
    ) -> Result<Address, ChainError> {
        self.check_failure()?;
        Ok(derive_channel_address(alice, bob, factory, chain_id))
    }

    async fn get_registered_transfer_by_name(
        &self,
        name: &str,
        _registry: Address,
        _chain_id: u64,
    ) -> Result<RegisteredTransfer, ChainError> {
        self.check_failure()?;
        self.inner
            .lock()
            .unwrap()
            .registered
            .iter()
            .find(|t| t.name == name)
            .cloned()
            .ok_or_else(|| ChainError::TransferNotRegistered(name.to_string()))
    }

    async fn get_registered_transfer_by_definition(
        &self,
        definition: Address,
        _registry: Address,
        _chain_id: u64,
    ) -> Result<RegisteredTransfer, ChainError> {
        self.check_failure()?;
        self.inner
            .lock()
            .unwrap()
            .registered
            .iter()
            .find(|t| t.definition == definition)
            .cloned()
            .ok_or_else(|| ChainError::TransferNotRegistered(definition.to_string()))
    }

    async fn get_registered_transfers(
        &self,
        _registry: Address,
        _chain_id: u64,
    ) -> Result<Vec<RegisteredTransfer>, ChainError> {
        self.check_failure()?;
        Ok(self.inner.lock().unwrap().registered.clone())
    }

    async fn create(
        &self,
        _encoded_state: Bytes,
        _balance: &Balance,
        definition: Address,
        _registry: Address,
        _chain_id: u64,
    ) -> Result<bool, ChainError> {
        self.check_failure()?;
        Ok(self.inner.lock().unwrap().create_verdicts.get(&definition).copied().unwrap_or(true))
    }

    async fn resolve(&self, transfer: &Transfer, _chain_id: u64) -> Result<Balance, ChainError> {
        self.check_failure()?;
        if let Some(balance) = self.inner.lock().unwrap().resolve_results.get(&transfer.transfer_id) {
            return Ok(balance.clone());
        }
        // Cancellation semantics: the locked balance flows back as it was locked.
        Ok(transfer.balance.clone())
    }

    async fn get_channel_dispute(
        &self,
        channel: Address,
        _chain_id: u64,
    ) -> Result<Option<ChannelDispute>, ChainError> {
        self.check_failure()?;
        Ok(self.inner.lock().unwrap().disputes.get(&channel).cloned())
    }

    async fn get_onchain_balance(
        &self,
        asset_id: Address,
        holder: Address,
        _chain_id: u64,
    ) -> Result<U256, ChainError> {
        self.check_failure()?;
        Ok(self.inner.lock().unwrap().onchain_balances.get(&(asset_id, holder)).copied().unwrap_or_default())
    }

    async fn get_withdrawal_transaction_record(
        &self,
        commitment: &WithdrawCommitment,
        _channel: Address,
        _chain_id: u64,
    ) -> Result<bool, ChainError> {
        self.check_failure()?;
        Ok(self.inner.lock().unwrap().withdrawal_records.contains(&hash_withdraw_commitment(commitment)))
    }
}

/// CREATE2-style derivation used by the channel factory: participants and factory pin the
/// address, the chain id salts it.
pub fn derive_channel_address(alice: Address, bob: Address, factory: Address, chain_id: u64) -> Address {
    let mut buf = Vec::with_capacity(1 + 20 * 3 + 8);
    buf.push(0xff);
    buf.extend_from_slice(factory.as_slice());
    buf.extend_from_slice(alice.as_slice());
    buf.extend_from_slice(bob.as_slice());
    buf.extend_from_slice(&chain_id.to_be_bytes());
    let digest = keccak256(&buf);
    Address::from_slice(&digest[12..])
}
