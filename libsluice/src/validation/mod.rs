//! Rule checking and state derivation for the four update types.
//!
//! [`validate_params`] turns a locally proposed parameter set into a single-signed update and the
//! state it produces; [`validate_inbound`] checks an update received from the peer against the
//! same rules, recomputing every derived quantity (balances, merkle roots, state hashes) rather
//! than trusting the sender. Both paths funnel through [`apply_update`] so the replicas cannot
//! drift.

mod apply;
mod error;

pub use apply::apply_update;
pub use error::ValidationError;

use crate::abi;
use crate::balance::{Balance, ChannelSide};
use crate::chain::{reconcile_deposit, ChainReader};
use crate::channel::ChannelState;
use crate::crypto::{hash_channel_commitment, merkle_root, verify_update_signatures, ChannelSigner};
use crate::transfer::{Transfer, TransferEncodings};
use crate::update::{
    ChannelUpdate, CreateUpdateDetails, DepositUpdateDetails, ResolveUpdateDetails, SetupUpdateDetails,
    UpdateDetails, UpdateParams,
};
use alloy_primitives::{Address, B256, U256};
use log::debug;

/// Dispute windows tighter than an hour leave no margin for chain reorgs and gas spikes.
pub const MIN_CHANNEL_TIMEOUT: u64 = 3_600;
pub const MAX_CHANNEL_TIMEOUT: u64 = 14 * 86_400;
pub const DEFAULT_CHANNEL_TIMEOUT: u64 = 2 * 86_400;

/// The outcome of validating an update: the update itself, the state it produces, the transfer it
/// touched (for create/resolve), and the resulting active-transfer set.
#[derive(Clone, Debug)]
pub struct ValidatedUpdate {
    pub update: ChannelUpdate,
    pub next_state: ChannelState,
    pub updated_transfer: Option<Transfer>,
    pub next_active: Vec<Transfer>,
}

impl ValidatedUpdate {
    /// Attach the local signer's signature over the commitment of `next_state`, on whichever
    /// side of the channel the signer occupies.
    pub fn countersign(&mut self, signer: &ChannelSigner) -> Result<(), ValidationError> {
        let side = self.next_state.side_of(signer.identifier())?;
        let digest = hash_channel_commitment(&self.next_state);
        self.update.attach_signature(side, signer.sign(digest));
        self.next_state.latest_update = Some(self.update.clone());
        Ok(())
    }
}

/// Validate a locally proposed parameter set against the previous state and on-chain facts,
/// producing the derived update single-signed by `signer`.
pub async fn validate_params<C: ChainReader + ?Sized>(
    signer: &ChannelSigner,
    chain: &C,
    previous: Option<&ChannelState>,
    active: &[Transfer],
    params: &UpdateParams,
) -> Result<ValidatedUpdate, ValidationError> {
    match params {
        UpdateParams::Setup(p) => {
            if let Some(state) = previous {
                return Err(ValidationError::ChannelAlreadyExists(state.channel_address));
            }
            check_timeout(p.timeout)?;
            if p.counterparty_identifier == *signer.identifier() {
                return Err(ValidationError::SelfChannel);
            }
            let derived = chain
                .get_channel_address(
                    signer.address(),
                    p.counterparty_identifier.address(),
                    p.network_context.channel_factory_address,
                    p.network_context.chain_id,
                )
                .await?;
            let update = ChannelUpdate {
                channel_address: derived,
                from_identifier: signer.identifier().clone(),
                to_identifier: p.counterparty_identifier.clone(),
                nonce: 1,
                balance: Balance::empty(signer.address(), p.counterparty_identifier.address()),
                asset_id: Address::ZERO,
                details: UpdateDetails::Setup(SetupUpdateDetails {
                    timeout: p.timeout,
                    network_context: p.network_context.clone(),
                    meta: p.meta.clone(),
                }),
                alice_signature: None,
                bob_signature: None,
            };
            finalize(signer, previous, update, None, Vec::new())
        }
        UpdateParams::Deposit(p) => {
            let state = required_channel(previous, p.channel_address)?;
            let side = state.side_of(signer.identifier())?;
            let reconciled = reconcile_deposit(chain, state, p.asset_id).await?;
            let update = ChannelUpdate {
                channel_address: state.channel_address,
                from_identifier: signer.identifier().clone(),
                to_identifier: state.participant(side.other()).clone(),
                nonce: state.nonce + 1,
                balance: reconciled.balance,
                asset_id: p.asset_id,
                details: UpdateDetails::Deposit(DepositUpdateDetails {
                    total_deposits_alice: reconciled.total_deposits_alice,
                    total_deposits_bob: reconciled.total_deposits_bob,
                    meta: p.meta.clone(),
                }),
                alice_signature: None,
                bob_signature: None,
            };
            finalize(signer, previous, update, None, active.to_vec())
        }
        UpdateParams::Create(p) => {
            let state = required_channel(previous, p.channel_address)?;
            let side = state.side_of(signer.identifier())?;
            let registered = chain
                .get_registered_transfer_by_definition(
                    p.transfer_definition,
                    state.network_context.transfer_registry_address,
                    state.network_context.chain_id,
                )
                .await?;
            let derived = build_create(
                chain,
                state,
                active,
                side,
                CreateInputs {
                    transfer_id: B256::from(rand::random::<[u8; 32]>()),
                    asset_id: p.asset_id,
                    balance: &p.balance,
                    transfer_definition: p.transfer_definition,
                    transfer_timeout: p.transfer_timeout,
                    transfer_initial_state: &p.transfer_initial_state,
                    encodings: &registered.encodings,
                    meta: &p.meta,
                },
            )
            .await?;
            let update = ChannelUpdate {
                channel_address: state.channel_address,
                from_identifier: signer.identifier().clone(),
                to_identifier: state.participant(side.other()).clone(),
                nonce: state.nonce + 1,
                balance: derived.channel_balance.clone(),
                asset_id: p.asset_id,
                details: UpdateDetails::Create(CreateUpdateDetails {
                    transfer_id: derived.transfer.transfer_id,
                    balance: p.balance.clone(),
                    transfer_definition: p.transfer_definition,
                    transfer_timeout: p.transfer_timeout,
                    transfer_initial_state: p.transfer_initial_state.clone(),
                    transfer_encodings: registered.encodings.clone(),
                    merkle_root: derived.merkle_root,
                    meta: p.meta.clone(),
                }),
                alice_signature: None,
                bob_signature: None,
            };
            finalize(signer, previous, update, Some(derived.transfer), derived.next_active)
        }
        UpdateParams::Resolve(p) => {
            let state = required_channel(previous, p.channel_address)?;
            let side = state.side_of(signer.identifier())?;
            let derived = build_resolve(chain, state, active, p.transfer_id, &p.transfer_resolver).await?;
            let update = ChannelUpdate {
                channel_address: state.channel_address,
                from_identifier: signer.identifier().clone(),
                to_identifier: state.participant(side.other()).clone(),
                nonce: state.nonce + 1,
                balance: derived.channel_balance.clone(),
                asset_id: derived.transfer.asset_id,
                details: UpdateDetails::Resolve(ResolveUpdateDetails {
                    transfer_id: p.transfer_id,
                    transfer_definition: derived.transfer.transfer_definition,
                    transfer_resolver: p.transfer_resolver.clone(),
                    merkle_root: derived.merkle_root,
                    meta: p.meta.clone(),
                }),
                alice_signature: None,
                bob_signature: None,
            };
            finalize(signer, previous, update, Some(derived.transfer), derived.next_active)
        }
    }
}

/// Validate an update received from the peer against the local prior state and on-chain facts.
/// Every derived quantity the update claims is recomputed locally and compared; the proposer's
/// signature must verify against the commitment of the resulting state.
pub async fn validate_inbound<C: ChainReader + ?Sized>(
    chain: &C,
    previous: Option<&ChannelState>,
    active: &[Transfer],
    update: &ChannelUpdate,
) -> Result<ValidatedUpdate, ValidationError> {
    if update.from_identifier == update.to_identifier {
        return Err(ValidationError::SelfChannel);
    }
    if !matches!(update.details, UpdateDetails::Setup(_)) {
        let state = inbound_channel(previous, update)?;
        if update.nonce != state.nonce + 1 {
            return Err(ValidationError::InvalidUpdateNonce { expected: state.nonce + 1, got: update.nonce });
        }
    }
    let (updated_transfer, next_active) = match &update.details {
        UpdateDetails::Setup(details) => {
            if let Some(state) = previous {
                return Err(ValidationError::ChannelAlreadyExists(state.channel_address));
            }
            if update.nonce != 1 {
                return Err(ValidationError::InvalidUpdateNonce { expected: 1, got: update.nonce });
            }
            check_timeout(details.timeout)?;
            let derived = chain
                .get_channel_address(
                    update.from_identifier.address(),
                    update.to_identifier.address(),
                    details.network_context.channel_factory_address,
                    details.network_context.chain_id,
                )
                .await?;
            if derived != update.channel_address {
                return Err(ValidationError::ChannelAddressMismatch {
                    expected: update.channel_address,
                    derived,
                });
            }
            (None, Vec::new())
        }
        UpdateDetails::Deposit(details) => {
            let state = inbound_channel(previous, update)?;
            let reconciled = reconcile_deposit(chain, state, update.asset_id).await?;
            if details.total_deposits_alice != reconciled.total_deposits_alice
                || details.total_deposits_bob != reconciled.total_deposits_bob
            {
                return Err(ValidationError::DepositTotalsMismatch(format!(
                    "update says ({}, {}), chain says ({}, {})",
                    details.total_deposits_alice,
                    details.total_deposits_bob,
                    reconciled.total_deposits_alice,
                    reconciled.total_deposits_bob,
                )));
            }
            if update.balance != reconciled.balance {
                return Err(ValidationError::BalanceMismatch("reconciled deposit balance differs".to_string()));
            }
            (None, active.to_vec())
        }
        UpdateDetails::Create(details) => {
            let state = inbound_channel(previous, update)?;
            let side = state.side_of(&update.from_identifier)?;
            let registered = chain
                .get_registered_transfer_by_definition(
                    details.transfer_definition,
                    state.network_context.transfer_registry_address,
                    state.network_context.chain_id,
                )
                .await?;
            if registered.encodings != details.transfer_encodings {
                return Err(ValidationError::EncodingMismatch);
            }
            let derived = build_create(
                chain,
                state,
                active,
                side,
                CreateInputs {
                    transfer_id: details.transfer_id,
                    asset_id: update.asset_id,
                    balance: &details.balance,
                    transfer_definition: details.transfer_definition,
                    transfer_timeout: details.transfer_timeout,
                    transfer_initial_state: &details.transfer_initial_state,
                    encodings: &details.transfer_encodings,
                    meta: &details.meta,
                },
            )
            .await?;
            if derived.merkle_root != details.merkle_root {
                return Err(ValidationError::MerkleRootMismatch);
            }
            if derived.channel_balance != update.balance {
                return Err(ValidationError::BalanceMismatch("create deduction differs".to_string()));
            }
            (Some(derived.transfer), derived.next_active)
        }
        UpdateDetails::Resolve(details) => {
            let state = inbound_channel(previous, update)?;
            state.side_of(&update.from_identifier)?;
            let derived = build_resolve(chain, state, active, details.transfer_id, &details.transfer_resolver).await?;
            if derived.transfer.transfer_definition != details.transfer_definition {
                return Err(ValidationError::InvalidResolve("transfer definition mismatch".to_string()));
            }
            if derived.merkle_root != details.merkle_root {
                return Err(ValidationError::MerkleRootMismatch);
            }
            if derived.channel_balance != update.balance {
                return Err(ValidationError::BalanceMismatch("resolve credit differs".to_string()));
            }
            if derived.transfer.asset_id != update.asset_id {
                return Err(ValidationError::InvalidResolve("asset id mismatch".to_string()));
            }
            (Some(derived.transfer), derived.next_active)
        }
    };

    let next_state = apply_update(previous, update)?;
    let proposer = next_state.side_of(&update.from_identifier)?;
    verify_update_signatures(&next_state, update, proposer, false)?;
    debug!("inbound {update} validated");
    Ok(ValidatedUpdate { update: update.clone(), next_state, updated_transfer, next_active })
}

fn check_timeout(timeout: u64) -> Result<(), ValidationError> {
    if !(MIN_CHANNEL_TIMEOUT..=MAX_CHANNEL_TIMEOUT).contains(&timeout) {
        return Err(ValidationError::InvalidTimeout {
            timeout,
            min: MIN_CHANNEL_TIMEOUT,
            max: MAX_CHANNEL_TIMEOUT,
        });
    }
    Ok(())
}

fn required_channel(previous: Option<&ChannelState>, expected: Address) -> Result<&ChannelState, ValidationError> {
    let state = previous.ok_or(ValidationError::ChannelNotFound(expected))?;
    if state.channel_address != expected {
        return Err(ValidationError::WrongChannel { expected: state.channel_address, got: expected });
    }
    Ok(state)
}

fn inbound_channel<'a>(
    previous: Option<&'a ChannelState>,
    update: &ChannelUpdate,
) -> Result<&'a ChannelState, ValidationError> {
    let state = previous.ok_or(ValidationError::ChannelNotFound(update.channel_address))?;
    if state.channel_address != update.channel_address {
        return Err(ValidationError::WrongChannel {
            expected: state.channel_address,
            got: update.channel_address,
        });
    }
    Ok(state)
}

struct CreateInputs<'a> {
    transfer_id: B256,
    asset_id: Address,
    balance: &'a Balance,
    transfer_definition: Address,
    transfer_timeout: u64,
    transfer_initial_state: &'a serde_json::Value,
    encodings: &'a TransferEncodings,
    meta: &'a serde_json::Value,
}

struct DerivedTransfer {
    transfer: Transfer,
    next_active: Vec<Transfer>,
    merkle_root: B256,
    channel_balance: Balance,
}

/// Shared create derivation: rule checks, predicate simulation, and the resulting transfer,
/// active set, root, and channel balance.
async fn build_create<C: ChainReader + ?Sized>(
    chain: &C,
    state: &ChannelState,
    active: &[Transfer],
    initiator: ChannelSide,
    inputs: CreateInputs<'_>,
) -> Result<DerivedTransfer, ValidationError> {
    let locked = inputs.balance.total();
    if locked == U256::ZERO {
        return Err(ValidationError::ZeroLockedBalance);
    }
    if inputs.transfer_timeout > state.timeout {
        return Err(ValidationError::TransferTimeoutTooLong {
            transfer: inputs.transfer_timeout,
            channel: state.timeout,
        });
    }
    let encoded_state = abi::encode_payload(&inputs.encodings.state, inputs.transfer_initial_state)?;
    let initial_state_hash = alloy_primitives::keccak256(&encoded_state);

    let channel_balance = state.balance_for(inputs.asset_id).debit(initiator, locked)?;

    let approved = chain
        .create(
            encoded_state.into(),
            inputs.balance,
            inputs.transfer_definition,
            state.network_context.transfer_registry_address,
            state.network_context.chain_id,
        )
        .await?;
    if !approved {
        return Err(ValidationError::CreateRejected { definition: inputs.transfer_definition });
    }

    let transfer = Transfer {
        transfer_id: inputs.transfer_id,
        channel_address: state.channel_address,
        chain_id: state.network_context.chain_id,
        channel_factory_address: state.network_context.channel_factory_address,
        initiator: state.participant(initiator).address(),
        responder: state.participant(initiator.other()).address(),
        channel_nonce: state.nonce + 1,
        transfer_definition: inputs.transfer_definition,
        transfer_encodings: inputs.encodings.clone(),
        balance: inputs.balance.clone(),
        asset_id: inputs.asset_id,
        transfer_timeout: inputs.transfer_timeout,
        initial_state_hash,
        transfer_state: inputs.transfer_initial_state.clone(),
        transfer_resolver: None,
        meta: inputs.meta.clone(),
        in_dispute: false,
    };
    let mut next_active = active.to_vec();
    next_active.push(transfer.clone());
    let root = merkle_root(next_active.iter().map(|t| t.initial_state_hash));
    Ok(DerivedTransfer { transfer, next_active, merkle_root: root, channel_balance })
}

/// Shared resolve derivation: predicate simulation, credit of the resolved amounts by address,
/// and the shrunken active set.
async fn build_resolve<C: ChainReader + ?Sized>(
    chain: &C,
    state: &ChannelState,
    active: &[Transfer],
    transfer_id: B256,
    resolver: &serde_json::Value,
) -> Result<DerivedTransfer, ValidationError> {
    let transfer = active
        .iter()
        .find(|t| t.transfer_id == transfer_id)
        .ok_or(ValidationError::TransferNotActive(transfer_id))?;

    // An empty resolver is an explicit cooperative cancellation; anything else must decode under
    // the registered resolver encoding.
    if !abi::is_empty_payload(resolver) {
        abi::validate_payload(&transfer.transfer_encodings.resolver, resolver)?;
    }

    let mut resolved_transfer = transfer.clone();
    resolved_transfer.transfer_resolver = Some(resolver.clone());
    let resolved = chain.resolve(&resolved_transfer, state.network_context.chain_id).await?;

    if resolved.total() != transfer.balance.total() {
        return Err(ValidationError::InvalidResolve(format!(
            "resolved amounts sum to {}, transfer locked {}",
            resolved.total(),
            transfer.balance.total(),
        )));
    }

    // Credit by address, not by initiator order: the resolved `to` entries decide which channel
    // side receives each amount.
    let mut channel_balance = state.balance_for(transfer.asset_id);
    for (holder, amount) in resolved.to.iter().zip(resolved.amount.iter()) {
        if amount.is_zero() {
            continue;
        }
        let side = state
            .side_of_address(*holder)
            .ok_or_else(|| ValidationError::InvalidResolve(format!("recipient {holder} is not a participant")))?;
        channel_balance = channel_balance.credit(side, *amount)?;
    }
    resolved_transfer.balance = resolved;

    let next_active: Vec<Transfer> = active.iter().filter(|t| t.transfer_id != transfer_id).cloned().collect();
    let root = merkle_root(next_active.iter().map(|t| t.initial_state_hash));
    Ok(DerivedTransfer { transfer: resolved_transfer, next_active, merkle_root: root, channel_balance })
}

fn finalize(
    signer: &ChannelSigner,
    previous: Option<&ChannelState>,
    update: ChannelUpdate,
    updated_transfer: Option<Transfer>,
    next_active: Vec<Transfer>,
) -> Result<ValidatedUpdate, ValidationError> {
    let next_state = apply_update(previous, &update)?;
    let mut validated = ValidatedUpdate { update, next_state, updated_transfer, next_active };
    validated.countersign(signer)?;
    Ok(validated)
}
