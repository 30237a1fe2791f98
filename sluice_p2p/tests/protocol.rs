//! End-to-end protocol scenarios: two engines wired back-to-back over the in-process transport,
//! sharing one simulated chain.

use alloy_primitives::{keccak256, Address, B256, U256};
use libsluice::abi;
use libsluice::balance::Balance;
use libsluice::chain::{DummyChainReader, RetryingChainReader};
use libsluice::channel::ChannelState;
use libsluice::crypto::{hash_channel_commitment, verify_update_signatures};
use libsluice::engine::{EngineConfig, EngineError, UpdateEngine};
use libsluice::external_validation::AcceptAll;
use libsluice::messaging::{ProtocolErrorReason, ProtocolHandler, ProtocolResponse, ProtocolUpdate};
use libsluice::storage::{MemoryStore, Store};
use libsluice::testing::{
    hashlock_resolver, hashlock_state, signer, test_network, test_registered_transfer, TEST_CHANNEL_TIMEOUT,
};
use libsluice::transfer::TransferFilter;
use libsluice::update::{CreateParams, DepositParams, ResolveParams, SetupParams};
use libsluice::validation::ValidationError;
use sluice_p2p::{direct_pair, DirectEndpoint};
use std::sync::Arc;
use std::time::Duration;

type Engine = UpdateEngine<MemoryStore, RetryingChainReader<DummyChainReader>, DirectEndpoint, AcceptAll>;

const ASSET: Address = Address::ZERO;

struct Harness {
    alice: Arc<Engine>,
    bob: Arc<Engine>,
    chain: Arc<RetryingChainReader<DummyChainReader>>,
    alice_store: Arc<MemoryStore>,
    bob_store: Arc<MemoryStore>,
    /// Alice's endpoint: serves requests *from Bob*.
    alice_end: Arc<DirectEndpoint>,
    /// Bob's endpoint: serves requests *from Alice*.
    bob_end: Arc<DirectEndpoint>,
}

fn harness() -> Harness {
    let _ = env_logger::builder().is_test(true).try_init();
    let alice_signer = signer(1);
    let bob_signer = signer(2);
    let chain = Arc::new(RetryingChainReader::new(DummyChainReader::default()));
    chain.inner().register_transfer(test_registered_transfer());

    let (alice_end, bob_end) = direct_pair(alice_signer.identifier().clone(), bob_signer.identifier().clone());
    let (alice_end, bob_end) = (Arc::new(alice_end), Arc::new(bob_end));
    let config = EngineConfig { message_timeout: Some(Duration::from_millis(500)) };

    let alice_store = Arc::new(MemoryStore::new());
    let alice = Arc::new(UpdateEngine::new(
        alice_signer,
        Arc::clone(&alice_store),
        Arc::clone(&chain),
        Arc::clone(&alice_end),
        Arc::new(AcceptAll),
        config.clone(),
    ));
    alice_end.serve(Arc::clone(&alice) as Arc<dyn ProtocolHandler>);

    let bob_store = Arc::new(MemoryStore::new());
    let bob = Arc::new(UpdateEngine::new(
        bob_signer,
        Arc::clone(&bob_store),
        Arc::clone(&chain),
        Arc::clone(&bob_end),
        Arc::new(AcceptAll),
        config,
    ));
    bob_end.serve(Arc::clone(&bob) as Arc<dyn ProtocolHandler>);

    Harness { alice, bob, chain, alice_store, bob_store, alice_end, bob_end }
}

impl Harness {
    async fn setup_channel(&self) -> ChannelState {
        self.alice
            .setup(SetupParams {
                counterparty_identifier: self.bob.identifier().clone(),
                timeout: TEST_CHANNEL_TIMEOUT,
                network_context: test_network(),
                meta: serde_json::Value::Null,
            })
            .await
            .expect("setup succeeds")
    }

    /// Set up and fund the channel with 10 units of the zero asset on Alice's side.
    async fn funded_channel(&self) -> ChannelState {
        let state = self.setup_channel().await;
        self.chain.inner().deploy_channel(state.channel_address);
        self.chain.inner().set_deposits(state.channel_address, ASSET, U256::from(10u64), U256::ZERO);
        self.alice
            .deposit(DepositParams {
                channel_address: state.channel_address,
                asset_id: ASSET,
                meta: serde_json::Value::Null,
            })
            .await
            .expect("deposit succeeds")
    }

    async fn assert_converged(&self, channel: Address) -> ChannelState {
        let ours = self.alice_store.get_channel_state(channel).await.unwrap().expect("alice has the channel");
        let theirs = self.bob_store.get_channel_state(channel).await.unwrap().expect("bob has the channel");
        assert_eq!(ours.nonce, theirs.nonce, "replicas disagree on nonce");
        assert_eq!(hash_channel_commitment(&ours), hash_channel_commitment(&theirs), "commitments diverge");
        // Every durable state carries a bilaterally signed latest update.
        for state in [&ours, &theirs] {
            let update = state.latest_update.as_ref().expect("durable state has an update");
            assert!(update.is_double_signed());
            let proposer = state.side_of(&update.from_identifier).unwrap();
            verify_update_signatures(state, update, proposer, true).expect("both signatures verify");
        }
        ours
    }
}

#[tokio::test]
async fn setup_deposit_transfer_round_trip() {
    let h = harness();
    let state = h.setup_channel().await;
    assert_eq!(state.nonce, 1);
    h.assert_converged(state.channel_address).await;

    // Alice deposits 10 of the zero asset on-chain, then folds it into the channel.
    h.chain.inner().deploy_channel(state.channel_address);
    h.chain.inner().set_deposits(state.channel_address, ASSET, U256::from(10u64), U256::ZERO);
    let state = h
        .alice
        .deposit(DepositParams {
            channel_address: state.channel_address,
            asset_id: ASSET,
            meta: serde_json::Value::Null,
        })
        .await
        .unwrap();
    assert_eq!(state.nonce, 2);
    assert_eq!(state.balance_for(ASSET).amount, [U256::from(10u64), U256::ZERO]);
    h.assert_converged(state.channel_address).await;

    // Alice locks 3 into a hashlock transfer for Bob.
    let pre_image = B256::from(keccak256(b"open sesame"));
    let lock_hash = keccak256(pre_image);
    let initial_state = hashlock_state(lock_hash);
    let state = h
        .alice
        .create_transfer(CreateParams {
            channel_address: state.channel_address,
            asset_id: ASSET,
            transfer_definition: test_registered_transfer().definition,
            balance: Balance::new([state.alice(), state.bob()], [U256::from(3u64), U256::ZERO]),
            transfer_initial_state: initial_state.clone(),
            transfer_timeout: TEST_CHANNEL_TIMEOUT / 2,
            meta: serde_json::Value::Null,
        })
        .await
        .unwrap();
    assert_eq!(state.nonce, 3);
    assert_eq!(state.balance_for(ASSET).amount, [U256::from(7u64), U256::ZERO]);

    let active = h.bob_store.get_active_transfers(state.channel_address).await.unwrap();
    assert_eq!(active.len(), 1);
    let transfer = &active[0];
    let expected_hash = abi::hash_payload(&transfer.transfer_encodings.state, &initial_state).unwrap();
    assert_eq!(transfer.initial_state_hash, expected_hash);
    assert_eq!(state.merkle_root, expected_hash);
    h.assert_converged(state.channel_address).await;

    // Bob resolves with the preimage; the predicate releases the lock to him.
    h.chain.inner().set_resolve_result(
        transfer.transfer_id,
        Balance::new([state.bob(), state.alice()], [U256::from(3u64), U256::ZERO]),
    );
    let state = h
        .bob
        .resolve_transfer(ResolveParams {
            channel_address: state.channel_address,
            transfer_id: transfer.transfer_id,
            transfer_resolver: hashlock_resolver(pre_image),
            meta: serde_json::Value::Null,
        })
        .await
        .unwrap();
    assert_eq!(state.nonce, 4);
    assert_eq!(state.balance_for(ASSET).amount, [U256::from(7u64), U256::from(3u64)]);
    assert_eq!(state.merkle_root, B256::ZERO);

    for store in [&h.alice_store, &h.bob_store] {
        assert!(store.get_active_transfers(state.channel_address).await.unwrap().is_empty());
        let history = store.get_transfers(&TransferFilter::by_id(transfer.transfer_id)).await.unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].is_resolved());
    }
    h.assert_converged(state.channel_address).await;
}

#[tokio::test]
async fn stale_outbound_proposal_syncs_and_retries_once() {
    let h = harness();
    let state = h.funded_channel().await;
    let channel = state.channel_address;

    // Bob proposes a deposit but the countersigned reply is lost: Alice lands on nonce 3, Bob
    // stays on nonce 2.
    h.alice_end.drop_next_replies(1);
    let err = h
        .bob
        .deposit(DepositParams { channel_address: channel, asset_id: ASSET, meta: serde_json::Value::Null })
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Messaging(_)));
    assert_eq!(h.alice_store.get_channel_state(channel).await.unwrap().unwrap().nonce, 3);
    assert_eq!(h.bob_store.get_channel_state(channel).await.unwrap().unwrap().nonce, 2);

    // Bob proposes again at what he thinks is the next nonce. Alice replies StaleUpdate with her
    // latest, Bob syncs it, re-derives at nonce 4, and the retry lands.
    let state = h
        .bob
        .deposit(DepositParams { channel_address: channel, asset_id: ASSET, meta: serde_json::Value::Null })
        .await
        .unwrap();
    assert_eq!(state.nonce, 4);
    let converged = h.assert_converged(channel).await;
    assert_eq!(converged.nonce, 4);

    // Alice saw exactly three requests: the one whose reply was lost, the stale proposal, and
    // the successful retry at nonce 4.
    let nonces: Vec<u64> = h.alice_end.handled_requests().iter().map(|r| r.update.nonce).collect();
    assert_eq!(nonces, vec![3, 3, 4]);
}

#[tokio::test]
async fn inbound_sync_catches_up_a_missed_update() {
    let h = harness();
    let state = h.funded_channel().await;
    let channel = state.channel_address;

    // Lose Bob's countersigned reply: Alice 3, Bob 2.
    h.alice_end.drop_next_replies(1);
    let _ = h
        .bob
        .deposit(DepositParams { channel_address: channel, asset_id: ASSET, meta: serde_json::Value::Null })
        .await
        .unwrap_err();

    // Now Alice proposes nonce 4. Her request carries her nonce-3 latest update; Bob applies it
    // through the sync path and then the nonce-4 update on top.
    let state = h
        .alice
        .deposit(DepositParams { channel_address: channel, asset_id: ASSET, meta: serde_json::Value::Null })
        .await
        .unwrap();
    assert_eq!(state.nonce, 4);
    let converged = h.assert_converged(channel).await;
    assert_eq!(converged.nonce, 4);
}

#[tokio::test]
async fn far_ahead_nonce_requires_restore() {
    let h = harness();
    let state = h.funded_channel().await;
    let channel = state.channel_address;
    let local_nonce = h.bob_store.get_channel_state(channel).await.unwrap().unwrap().nonce;

    let mut crafted = state.latest_update.clone().unwrap();
    crafted.nonce = local_nonce + 5;
    crafted.from_identifier = h.alice.identifier().clone();
    crafted.to_identifier = h.bob.identifier().clone();
    let response = h
        .bob
        .handle_protocol_update(
            h.alice.identifier(),
            ProtocolUpdate { update: crafted, previous_update: None },
        )
        .await;
    match response {
        ProtocolResponse::Error(err) => assert_eq!(err.reason, ProtocolErrorReason::RestoreNeeded),
        other => panic!("expected a restore-needed reply, got {other:?}"),
    }
    // Nothing was persisted.
    assert_eq!(h.bob_store.get_channel_state(channel).await.unwrap().unwrap().nonce, local_nonce);
}

#[tokio::test]
async fn replayed_update_is_rejected_as_stale() {
    let h = harness();
    let state = h.funded_channel().await;
    let channel = state.channel_address;

    // The deposit request Alice sent to Bob, replayed verbatim.
    let replay = h
        .bob_end
        .handled_requests()
        .into_iter()
        .rev()
        .find(|r| r.update.nonce == 2)
        .expect("bob handled the deposit");
    let response = h.bob.handle_protocol_update(h.alice.identifier(), replay).await;
    match response {
        ProtocolResponse::Error(err) => {
            assert_eq!(err.reason, ProtocolErrorReason::StaleUpdate);
            // The reply carries Bob's latest so the peer could sync.
            assert_eq!(err.latest_update.unwrap().nonce, 2);
        }
        other => panic!("expected a stale-update reply, got {other:?}"),
    }
}

#[tokio::test]
async fn concurrent_proposals_serialize_one_wins() {
    let h = harness();
    let state = h.funded_channel().await;
    let channel = state.channel_address;

    // Bob answers slowly so the second proposal is queued behind the first's round-trip.
    h.bob_end.set_handling_delay(Duration::from_millis(200));
    let first = {
        let alice = Arc::clone(&h.alice);
        tokio::spawn(async move {
            alice
                .deposit(DepositParams { channel_address: channel, asset_id: ASSET, meta: serde_json::Value::Null })
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    let second = {
        let alice = Arc::clone(&h.alice);
        tokio::spawn(async move {
            alice
                .deposit(DepositParams { channel_address: channel, asset_id: ASSET, meta: serde_json::Value::Null })
                .await
        })
    };

    let first = first.await.unwrap();
    let second = second.await.unwrap();
    let winner = first.expect("the first proposal wins");
    assert_eq!(winner.nonce, 3);
    match second {
        Err(EngineError::StaleProposal { observed, .. }) => assert_eq!(observed, 3),
        other => panic!("expected the second proposal to be stale, got {other:?}"),
    }

    let converged = h.assert_converged(channel).await;
    assert_eq!(converged.nonce, 3);
    converged.verify_invariants().unwrap();
}

#[tokio::test]
async fn create_rejected_by_predicate_never_reaches_the_peer() {
    let h = harness();
    let state = h.funded_channel().await;
    let channel = state.channel_address;
    let definition = test_registered_transfer().definition;
    let requests_before = h.bob_end.handled_requests().len();

    h.chain.inner().set_create_verdict(definition, false);
    let err = h
        .alice
        .create_transfer(CreateParams {
            channel_address: channel,
            asset_id: ASSET,
            transfer_definition: definition,
            balance: Balance::new([state.alice(), state.bob()], [U256::from(3u64), U256::ZERO]),
            transfer_initial_state: hashlock_state(keccak256(b"nope")),
            transfer_timeout: TEST_CHANNEL_TIMEOUT / 2,
            meta: serde_json::Value::Null,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(ValidationError::CreateRejected { .. })));

    // No message was sent, nothing was persisted.
    assert_eq!(h.bob_end.handled_requests().len(), requests_before);
    assert_eq!(h.alice_store.get_channel_state(channel).await.unwrap().unwrap().nonce, 2);
    assert!(h.alice_store.get_transfers(&TransferFilter::by_channel(channel)).await.unwrap().is_empty());
}

#[tokio::test]
async fn resolver_with_mismatched_total_is_rejected_locally() {
    let h = harness();
    let state = h.funded_channel().await;
    let channel = state.channel_address;
    let state = h
        .alice
        .create_transfer(CreateParams {
            channel_address: channel,
            asset_id: ASSET,
            transfer_definition: test_registered_transfer().definition,
            balance: Balance::new([state.alice(), state.bob()], [U256::from(3u64), U256::ZERO]),
            transfer_initial_state: hashlock_state(keccak256(b"mismatch")),
            transfer_timeout: TEST_CHANNEL_TIMEOUT / 2,
            meta: serde_json::Value::Null,
        })
        .await
        .unwrap();
    let transfer = &h.bob_store.get_active_transfers(channel).await.unwrap()[0];
    let requests_before = h.alice_end.handled_requests().len();

    // The simulated predicate releases 4 although only 3 were locked.
    h.chain.inner().set_resolve_result(
        transfer.transfer_id,
        Balance::new([state.bob(), state.alice()], [U256::from(4u64), U256::ZERO]),
    );
    let err = h
        .bob
        .resolve_transfer(ResolveParams {
            channel_address: channel,
            transfer_id: transfer.transfer_id,
            transfer_resolver: serde_json::Value::Null,
            meta: serde_json::Value::Null,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(ValidationError::InvalidResolve(_))));

    // No counterparty round-trip happened and the transfer is still active.
    assert_eq!(h.alice_end.handled_requests().len(), requests_before);
    assert_eq!(h.bob_store.get_active_transfers(channel).await.unwrap().len(), 1);
}

#[tokio::test]
async fn dispute_status_is_mirrored_from_chain() {
    let h = harness();
    let state = h.funded_channel().await;
    let channel = state.channel_address;
    assert!(!state.in_dispute);

    h.chain.inner().set_dispute(
        channel,
        libsluice::chain::ChannelDispute {
            channel_state_hash: hash_channel_commitment(&state),
            nonce: state.nonce,
            merkle_root: state.merkle_root,
            consensus_expiry: 1_000,
            defund_expiry: 2_000,
        },
    );
    let state = h.bob.sync_dispute(channel).await.unwrap();
    assert!(state.in_dispute);
    assert!(h.bob_store.get_channel_state(channel).await.unwrap().unwrap().in_dispute);
    // Alice has not looked yet; her replica is unchanged.
    assert!(!h.alice_store.get_channel_state(channel).await.unwrap().unwrap().in_dispute);
}

#[tokio::test]
async fn setup_cannot_be_recovered_through_sync() {
    let h = harness();

    // Alice's setup lands on Bob but the reply is lost: Bob has the channel, Alice does not.
    h.bob_end.drop_next_replies(1);
    let err = h
        .alice
        .setup(SetupParams {
            counterparty_identifier: h.bob.identifier().clone(),
            timeout: TEST_CHANNEL_TIMEOUT,
            network_context: test_network(),
            meta: serde_json::Value::Null,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Messaging(_)));

    // Retrying gets a StaleUpdate whose latest is the setup update, which may not be synced.
    let err = h
        .alice
        .setup(SetupParams {
            counterparty_identifier: h.bob.identifier().clone(),
            timeout: TEST_CHANNEL_TIMEOUT,
            network_context: test_network(),
            meta: serde_json::Value::Null,
        })
        .await
        .unwrap_err();
    match err {
        EngineError::Protocol { reason, .. } => assert_eq!(reason, ProtocolErrorReason::CannotSyncSetup),
        other => panic!("expected a cannot-sync-setup failure, got {other:?}"),
    }
}

#[tokio::test]
async fn single_signed_updates_cannot_be_synced() {
    let h = harness();
    let state = h.funded_channel().await;
    let channel = state.channel_address;
    let local_nonce = h.bob_store.get_channel_state(channel).await.unwrap().unwrap().nonce;

    let latest = h.alice_store.get_channel_state(channel).await.unwrap().unwrap().latest_update.unwrap();
    let mut stripped = latest.clone();
    stripped.nonce = local_nonce + 1;
    stripped.bob_signature = None;
    let mut head = latest;
    head.nonce = local_nonce + 2;
    head.from_identifier = h.alice.identifier().clone();
    head.to_identifier = h.bob.identifier().clone();

    let response = h
        .bob
        .handle_protocol_update(
            h.alice.identifier(),
            ProtocolUpdate { update: head, previous_update: Some(stripped) },
        )
        .await;
    match response {
        ProtocolResponse::Error(err) => {
            assert_eq!(err.reason, ProtocolErrorReason::CannotSyncSingleSigned);
        }
        other => panic!("expected a cannot-sync reply, got {other:?}"),
    }
    assert_eq!(h.bob_store.get_channel_state(channel).await.unwrap().unwrap().nonce, local_nonce);
}
