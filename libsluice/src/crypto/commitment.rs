use crate::balance::ChannelSide;
use crate::channel::ChannelState;
use crate::crypto::keys::{KeyError, Signature};
use crate::update::ChannelUpdate;
use alloy_primitives::{keccak256, Address, Bytes, B256, U256};
use alloy_sol_types::{sol, SolValue};
use serde::{Deserialize, Serialize};

sol! {
    struct SolBalance {
        address[2] to;
        uint256[2] amount;
    }

    /// The core channel state both parties sign. Network context, the latest update, and any
    /// local bookkeeping are deliberately absent so the digest is identical on both replicas.
    struct SolCoreChannelState {
        address channelAddress;
        address alice;
        address bob;
        address[] assetIds;
        SolBalance[] balances;
        uint256[] processedDepositsA;
        uint256[] processedDepositsB;
        uint256[] defundNonces;
        uint256 nonce;
        bytes32 merkleRoot;
        uint256 timeout;
    }

    struct SolWithdrawData {
        address channelAddress;
        address alice;
        address bob;
        address recipient;
        address assetId;
        uint256 amount;
        uint256 nonce;
        address callTo;
        bytes callData;
    }
}

/// `keccak(abi.encode(coreChannelState))` — the digest each participant signs to make a state
/// durable.
pub fn hash_channel_commitment(state: &ChannelState) -> B256 {
    let core = SolCoreChannelState {
        channelAddress: state.channel_address,
        alice: state.alice(),
        bob: state.bob(),
        assetIds: state.asset_ids.clone(),
        balances: state
            .balances
            .iter()
            .map(|b| SolBalance { to: b.to, amount: b.amount })
            .collect(),
        processedDepositsA: state.processed_deposits_a.clone(),
        processedDepositsB: state.processed_deposits_b.clone(),
        defundNonces: state.defund_nonces.iter().map(|n| U256::from(*n)).collect(),
        nonce: U256::from(state.nonce),
        merkleRoot: state.merkle_root,
        timeout: U256::from(state.timeout),
    };
    keccak256(core.abi_encode())
}

/// Check the signatures an update carries against the commitment for `state`.
///
/// `require_both` is set on countersigned updates (durable states); otherwise only the proposer's
/// slot must verify, and a populated second slot is still checked.
pub fn verify_update_signatures(
    state: &ChannelState,
    update: &ChannelUpdate,
    proposer: ChannelSide,
    require_both: bool,
) -> Result<(), KeyError> {
    let digest = hash_channel_commitment(state);
    let check = |side: ChannelSide| -> Result<(), KeyError> {
        let expected = state.participant(side).address();
        match update.signature_of(side) {
            Some(signature) => signature.verify(digest, expected),
            None if side == proposer || require_both => Err(KeyError::WrongSigner { expected }),
            None => Ok(()),
        }
    };
    check(ChannelSide::Alice)?;
    check(ChannelSide::Bob)
}

/// A signed authorisation to withdraw funds from the channel contract. Uses the same
/// hash-and-sign discipline as channel commitments.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WithdrawCommitment {
    pub channel_address: Address,
    pub alice: Address,
    pub bob: Address,
    pub recipient: Address,
    pub asset_id: Address,
    pub amount: U256,
    pub nonce: u64,
    pub call_to: Address,
    pub call_data: Bytes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alice_signature: Option<Signature>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bob_signature: Option<Signature>,
    /// Hash of the on-chain transaction that executed this withdrawal, once submitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_hash: Option<B256>,
}

pub fn hash_withdraw_commitment(commitment: &WithdrawCommitment) -> B256 {
    let data = SolWithdrawData {
        channelAddress: commitment.channel_address,
        alice: commitment.alice,
        bob: commitment.bob,
        recipient: commitment.recipient,
        assetId: commitment.asset_id,
        amount: commitment.amount,
        nonce: U256::from(commitment.nonce),
        callTo: commitment.call_to,
        callData: commitment.call_data.clone(),
    };
    keccak256(data.abi_encode())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::balance::Balance;
    use crate::channel::NetworkContext;
    use crate::testing::{signer, test_channel};
    use alloy_primitives::address;

    #[test]
    fn commitment_ignores_network_context_and_signatures() {
        let mut state = test_channel();
        let digest = hash_channel_commitment(&state);

        state.network_context = NetworkContext {
            chain_id: 99,
            channel_factory_address: address!("00000000000000000000000000000000000000ff"),
            transfer_registry_address: address!("00000000000000000000000000000000000000fe"),
        };
        state.latest_update = None;
        assert_eq!(hash_channel_commitment(&state), digest);
    }

    #[test]
    fn commitment_tracks_core_fields() {
        let mut state = test_channel();
        let digest = hash_channel_commitment(&state);
        state.nonce += 1;
        assert_ne!(hash_channel_commitment(&state), digest);

        let mut state = test_channel();
        state.set_balance(Address::ZERO, Balance::new([state.alice(), state.bob()], [U256::from(1u64), U256::ZERO]));
        assert_ne!(hash_channel_commitment(&state), digest);
    }

    #[test]
    fn signature_collection_order_is_immaterial() {
        let state = test_channel();
        let alice = signer(1);
        let bob = signer(2);
        let digest = hash_channel_commitment(&state);

        let mut first = state.latest_update.clone().expect("test channel has an update");
        first.attach_signature(ChannelSide::Alice, alice.sign(digest));
        first.attach_signature(ChannelSide::Bob, bob.sign(digest));
        let mut second = first.unsigned();
        second.attach_signature(ChannelSide::Bob, bob.sign(digest));
        second.attach_signature(ChannelSide::Alice, alice.sign(digest));

        verify_update_signatures(&state, &first, ChannelSide::Alice, true).unwrap();
        verify_update_signatures(&state, &second, ChannelSide::Alice, true).unwrap();
    }

    #[test]
    fn missing_countersignature_is_rejected_when_required() {
        let state = test_channel();
        let alice = signer(1);
        let digest = hash_channel_commitment(&state);
        let mut update = state.latest_update.clone().unwrap().unsigned();
        update.attach_signature(ChannelSide::Alice, alice.sign(digest));

        verify_update_signatures(&state, &update, ChannelSide::Alice, false).unwrap();
        assert!(verify_update_signatures(&state, &update, ChannelSide::Alice, true).is_err());
    }

    #[test]
    fn forged_signature_is_rejected() {
        let state = test_channel();
        let outsider = signer(9);
        let digest = hash_channel_commitment(&state);
        let mut update = state.latest_update.clone().unwrap().unsigned();
        update.attach_signature(ChannelSide::Alice, outsider.sign(digest));
        assert!(verify_update_signatures(&state, &update, ChannelSide::Alice, false).is_err());
    }

    #[test]
    fn withdraw_commitment_hash_round_trip() {
        let commitment = WithdrawCommitment {
            channel_address: address!("0000000000000000000000000000000000000123"),
            alice: signer(1).address(),
            bob: signer(2).address(),
            recipient: signer(1).address(),
            asset_id: Address::ZERO,
            amount: U256::from(100u64),
            nonce: 1,
            call_to: Address::ZERO,
            call_data: Bytes::new(),
            alice_signature: None,
            bob_signature: None,
            transaction_hash: None,
        };
        let digest = hash_withdraw_commitment(&commitment);
        let mut other = commitment.clone();
        other.amount = U256::from(101u64);
        assert_ne!(hash_withdraw_commitment(&other), digest);
        // Signatures are not part of the digest.
        let mut signed = commitment.clone();
        signed.alice_signature = Some(signer(1).sign(digest));
        assert_eq!(hash_withdraw_commitment(&signed), digest);
    }
}
