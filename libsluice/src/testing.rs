//! Deterministic fixtures shared by the unit tests here and the protocol tests downstream.

use crate::abi;
use crate::balance::Balance;
use crate::chain::{
    derive_channel_address, ChainError, ChainWriter, TransactionReceipt, TransactionRequest, TransactionResponse,
};
use crate::channel::{ChannelState, NetworkContext};
use crate::crypto::{ChannelSigner, WithdrawCommitment};
use crate::transfer::{RegisteredTransfer, Transfer, TransferEncodings};
use crate::update::{ChannelUpdate, SetupUpdateDetails, UpdateDetails};
use alloy_primitives::{address, keccak256, Address, Bytes, B256, U256};
use async_trait::async_trait;
use std::sync::Mutex;

pub const TEST_CHAIN_ID: u64 = 1337;
pub const TEST_CHANNEL_TIMEOUT: u64 = 3_600;

pub const HASHLOCK_STATE_ENCODING: &str = "tuple(bytes32 lockHash, uint256 expiry)";
pub const HASHLOCK_RESOLVER_ENCODING: &str = "tuple(bytes32 preImage)";

/// A signer with a fixed secret key, stable across runs.
pub fn signer(fill: u8) -> ChannelSigner {
    ChannelSigner::from_hex(&hex::encode([fill; 32])).expect("fixed test key is valid")
}

pub fn test_network() -> NetworkContext {
    NetworkContext {
        chain_id: TEST_CHAIN_ID,
        channel_factory_address: address!("00000000000000000000000000000000000000f1"),
        transfer_registry_address: address!("00000000000000000000000000000000000000f2"),
    }
}

/// A freshly set-up channel between `signer(1)` (Alice) and `signer(2)` (Bob), carrying its
/// setup update as `latest_update`.
pub fn test_channel() -> ChannelState {
    let alice = signer(1);
    let bob = signer(2);
    let network = test_network();
    let channel_address =
        derive_channel_address(alice.address(), bob.address(), network.channel_factory_address, network.chain_id);
    let update = ChannelUpdate {
        channel_address,
        from_identifier: alice.identifier().clone(),
        to_identifier: bob.identifier().clone(),
        nonce: 1,
        balance: Balance::empty(alice.address(), bob.address()),
        asset_id: Address::ZERO,
        details: UpdateDetails::Setup(SetupUpdateDetails {
            timeout: TEST_CHANNEL_TIMEOUT,
            network_context: network.clone(),
            meta: serde_json::Value::Null,
        }),
        alice_signature: None,
        bob_signature: None,
    };
    let mut state = ChannelState::new_setup(
        channel_address,
        alice.identifier().clone(),
        bob.identifier().clone(),
        network,
        TEST_CHANNEL_TIMEOUT,
    );
    state.latest_update = Some(update);
    state
}

pub fn test_registered_transfer() -> RegisteredTransfer {
    RegisteredTransfer {
        name: "Hashlock".to_string(),
        definition: address!("00000000000000000000000000000000000000dd"),
        encodings: TransferEncodings::new(HASHLOCK_STATE_ENCODING, HASHLOCK_RESOLVER_ENCODING),
    }
}

pub fn hashlock_state(lock_hash: B256) -> serde_json::Value {
    serde_json::json!({ "lockHash": lock_hash.to_string(), "expiry": "0" })
}

pub fn hashlock_resolver(pre_image: B256) -> serde_json::Value {
    serde_json::json!({ "preImage": pre_image.to_string() })
}

/// A hashlock transfer of 3 units locked by Alice, consistent with [`test_channel`].
pub fn test_transfer(channel: &ChannelState) -> Transfer {
    let registered = test_registered_transfer();
    let state = hashlock_state(keccak256(b"preimage"));
    let initial_state_hash =
        abi::hash_payload(HASHLOCK_STATE_ENCODING, &state).expect("hashlock fixture state encodes");
    Transfer {
        transfer_id: B256::repeat_byte(0x42),
        channel_address: channel.channel_address,
        chain_id: channel.network_context.chain_id,
        channel_factory_address: channel.network_context.channel_factory_address,
        initiator: channel.alice(),
        responder: channel.bob(),
        channel_nonce: channel.nonce,
        transfer_definition: registered.definition,
        transfer_encodings: registered.encodings,
        balance: Balance::new([channel.alice(), channel.bob()], [U256::from(3u64), U256::ZERO]),
        asset_id: Address::ZERO,
        transfer_timeout: TEST_CHANNEL_TIMEOUT / 2,
        initial_state_hash,
        transfer_state: state,
        transfer_resolver: None,
        meta: serde_json::Value::Null,
        in_dispute: false,
    }
}

pub fn test_withdraw_commitment(channel: &ChannelState) -> WithdrawCommitment {
    WithdrawCommitment {
        channel_address: channel.channel_address,
        alice: channel.alice(),
        bob: channel.bob(),
        recipient: channel.alice(),
        asset_id: Address::ZERO,
        amount: U256::from(5u64),
        nonce: 1,
        call_to: Address::ZERO,
        call_data: Bytes::new(),
        alice_signature: None,
        bob_signature: None,
        transaction_hash: Some(B256::repeat_byte(0x77)),
    }
}

/// A [`ChainWriter`] that accepts everything and mines instantly. Submissions are recorded and a
/// run of failures can be injected to exercise the queue's retry policy.
#[derive(Default)]
pub struct DummyChainWriter {
    inner: Mutex<WriterState>,
}

#[derive(Default)]
struct WriterState {
    submitted: Vec<TransactionRequest>,
    submit_failures: u32,
    confirm_failures: u32,
}

impl DummyChainWriter {
    pub fn fail_submissions(&self, count: u32) {
        self.inner.lock().unwrap().submit_failures = count;
    }

    pub fn fail_confirmations(&self, count: u32) {
        self.inner.lock().unwrap().confirm_failures = count;
    }

    pub fn submitted(&self) -> Vec<TransactionRequest> {
        self.inner.lock().unwrap().submitted.clone()
    }
}

#[async_trait]
impl ChainWriter for DummyChainWriter {
    async fn submit(&self, request: &TransactionRequest) -> Result<TransactionResponse, ChainError> {
        let mut state = self.inner.lock().unwrap();
        if state.submit_failures > 0 {
            state.submit_failures -= 1;
            return Err(ChainError::Provider("injected submit failure".to_string()));
        }
        state.submitted.push(request.clone());
        let mut seed = request.data.to_vec();
        seed.extend_from_slice(request.channel_address.as_slice());
        seed.extend_from_slice(&(state.submitted.len() as u64).to_be_bytes());
        Ok(TransactionResponse { transaction_hash: keccak256(&seed), chain_id: request.chain_id })
    }

    async fn wait_for_confirmation(
        &self,
        response: &TransactionResponse,
    ) -> Result<TransactionReceipt, ChainError> {
        let mut state = self.inner.lock().unwrap();
        if state.confirm_failures > 0 {
            state.confirm_failures -= 1;
            return Err(ChainError::TransactionFailed("injected revert".to_string()));
        }
        Ok(TransactionReceipt {
            transaction_hash: response.transaction_hash,
            chain_id: response.chain_id,
            block_number: 1,
            success: true,
        })
    }
}
