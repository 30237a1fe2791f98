use crate::balance::{Balance, ChannelSide};
use crate::channel::NetworkContext;
use crate::crypto::Signature;
use crate::identity::PublicIdentifier;
use crate::transfer::TransferEncodings;
use alloy_primitives::{Address, B256, U256};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// The four state transitions a channel supports.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateType {
    Setup,
    Deposit,
    Create,
    Resolve,
}

impl Display for UpdateType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            UpdateType::Setup => write!(f, "setup"),
            UpdateType::Deposit => write!(f, "deposit"),
            UpdateType::Create => write!(f, "create"),
            UpdateType::Resolve => write!(f, "resolve"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SetupUpdateDetails {
    pub timeout: u64,
    pub network_context: NetworkContext,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub meta: serde_json::Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DepositUpdateDetails {
    /// Cumulative on-chain deposit total for Alice at the time this update was proposed.
    pub total_deposits_alice: U256,
    pub total_deposits_bob: U256,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub meta: serde_json::Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CreateUpdateDetails {
    pub transfer_id: B256,
    /// The balance locked into the transfer, deducted from the initiator's channel balance.
    pub balance: Balance,
    pub transfer_definition: Address,
    pub transfer_timeout: u64,
    pub transfer_initial_state: serde_json::Value,
    pub transfer_encodings: TransferEncodings,
    /// Root over the active-transfer set with the new transfer included.
    pub merkle_root: B256,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub meta: serde_json::Value,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResolveUpdateDetails {
    pub transfer_id: B256,
    pub transfer_definition: Address,
    /// Structured resolver shaped by the transfer's resolver encoding. An empty object is a
    /// cooperative cancellation.
    pub transfer_resolver: serde_json::Value,
    /// Root over the active-transfer set with the transfer removed.
    pub merkle_root: B256,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub meta: serde_json::Value,
}

/// Per-type payload of a [`ChannelUpdate`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum UpdateDetails {
    Setup(SetupUpdateDetails),
    Deposit(DepositUpdateDetails),
    Create(CreateUpdateDetails),
    Resolve(ResolveUpdateDetails),
}

impl UpdateDetails {
    pub fn update_type(&self) -> UpdateType {
        match self {
            UpdateDetails::Setup(_) => UpdateType::Setup,
            UpdateDetails::Deposit(_) => UpdateType::Deposit,
            UpdateDetails::Create(_) => UpdateType::Create,
            UpdateDetails::Resolve(_) => UpdateType::Resolve,
        }
    }
}

/// A single state transition, proposed by one participant and countersigned by the other. The
/// `nonce` is the nonce the channel will have *after* the update applies, and `balance` is the
/// post-update balance for `asset_id`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChannelUpdate {
    pub channel_address: Address,
    pub from_identifier: PublicIdentifier,
    pub to_identifier: PublicIdentifier,
    pub nonce: u64,
    pub balance: Balance,
    pub asset_id: Address,
    pub details: UpdateDetails,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alice_signature: Option<Signature>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bob_signature: Option<Signature>,
}

impl ChannelUpdate {
    pub fn update_type(&self) -> UpdateType {
        self.details.update_type()
    }

    pub fn signature_of(&self, side: ChannelSide) -> Option<&Signature> {
        match side {
            ChannelSide::Alice => self.alice_signature.as_ref(),
            ChannelSide::Bob => self.bob_signature.as_ref(),
        }
    }

    pub fn attach_signature(&mut self, side: ChannelSide, signature: Signature) {
        match side {
            ChannelSide::Alice => self.alice_signature = Some(signature),
            ChannelSide::Bob => self.bob_signature = Some(signature),
        }
    }

    pub fn is_double_signed(&self) -> bool {
        self.alice_signature.is_some() && self.bob_signature.is_some()
    }

    /// The same update with both signature slots cleared. Commitment hashing operates on this
    /// form so that the digest does not depend on which signatures have been collected.
    pub fn unsigned(&self) -> ChannelUpdate {
        ChannelUpdate { alice_signature: None, bob_signature: None, ..self.clone() }
    }
}

impl Display for ChannelUpdate {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} update (nonce {}) on {} from {}",
            self.update_type(),
            self.nonce,
            self.channel_address,
            self.from_identifier.abbreviated()
        )
    }
}

/// Parameters for proposing a `setup` update. The channel address is derived, not chosen.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SetupParams {
    pub counterparty_identifier: PublicIdentifier,
    pub timeout: u64,
    pub network_context: NetworkContext,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub meta: serde_json::Value,
}

/// Parameters for folding pending on-chain deposits of one asset into the channel balance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DepositParams {
    pub channel_address: Address,
    pub asset_id: Address,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub meta: serde_json::Value,
}

/// Parameters for locking a new conditional transfer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CreateParams {
    pub channel_address: Address,
    pub asset_id: Address,
    pub transfer_definition: Address,
    /// Amounts locked into the transfer; `to` is usually `[initiator, responder]`.
    pub balance: Balance,
    pub transfer_initial_state: serde_json::Value,
    pub transfer_timeout: u64,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub meta: serde_json::Value,
}

/// Parameters for resolving (or cooperatively cancelling) an active transfer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResolveParams {
    pub channel_address: Address,
    pub transfer_id: B256,
    /// Shaped by the transfer's resolver encoding; null or `{}` cancels.
    pub transfer_resolver: serde_json::Value,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub meta: serde_json::Value,
}

/// A locally proposed state transition, before validation derives the [`ChannelUpdate`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum UpdateParams {
    Setup(SetupParams),
    Deposit(DepositParams),
    Create(CreateParams),
    Resolve(ResolveParams),
}

impl UpdateParams {
    pub fn update_type(&self) -> UpdateType {
        match self {
            UpdateParams::Setup(_) => UpdateType::Setup,
            UpdateParams::Deposit(_) => UpdateType::Deposit,
            UpdateParams::Create(_) => UpdateType::Create,
            UpdateParams::Resolve(_) => UpdateType::Resolve,
        }
    }

    /// The channel the proposal targets; `None` for setup, whose address is derived during
    /// validation.
    pub fn channel_address(&self) -> Option<Address> {
        match self {
            UpdateParams::Setup(_) => None,
            UpdateParams::Deposit(p) => Some(p.channel_address),
            UpdateParams::Create(p) => Some(p.channel_address),
            UpdateParams::Resolve(p) => Some(p.channel_address),
        }
    }
}
