use crate::balance::Balance;
use alloy_primitives::{Address, B256};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// ABI type strings describing a transfer's on-chain state and resolver structures, as published
/// by the transfer registry. Index 0 is the state encoding, index 1 the resolver encoding.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferEncodings {
    pub state: String,
    pub resolver: String,
}

impl TransferEncodings {
    pub fn new(state: impl Into<String>, resolver: impl Into<String>) -> Self {
        TransferEncodings { state: state.into(), resolver: resolver.into() }
    }
}

/// Metadata for a transfer definition approved in the on-chain registry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredTransfer {
    pub name: String,
    pub definition: Address,
    pub encodings: TransferEncodings,
}

/// A conditional transfer locked inside a channel. Created by a `create` update, removed from the
/// active set by a `resolve` update, and retained in history afterwards.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Transfer {
    pub transfer_id: B256,
    pub channel_address: Address,
    pub chain_id: u64,
    pub channel_factory_address: Address,
    /// Account address of the party that locked the funds.
    pub initiator: Address,
    pub responder: Address,
    /// Channel nonce at the time the transfer was created.
    pub channel_nonce: u64,
    pub transfer_definition: Address,
    pub transfer_encodings: TransferEncodings,
    pub balance: Balance,
    pub asset_id: Address,
    pub transfer_timeout: u64,
    /// keccak of the ABI-encoded initial state, the transfer's merkle leaf.
    pub initial_state_hash: B256,
    /// Opaque structured state initialising the on-chain predicate; shaped by
    /// `transfer_encodings.state`.
    pub transfer_state: serde_json::Value,
    /// Populated only once the transfer has been resolved.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer_resolver: Option<serde_json::Value>,
    /// Free-form application data, not covered by any commitment.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub meta: serde_json::Value,
    pub in_dispute: bool,
}

impl Transfer {
    pub fn is_resolved(&self) -> bool {
        self.transfer_resolver.is_some()
    }
}

impl Display for Transfer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Transfer({} on {}, asset {}, locked {})",
            self.transfer_id, self.channel_address, self.asset_id, self.balance.total()
        )
    }
}

/// Filter for historical transfer queries against the store.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferFilter {
    pub transfer_id: Option<B256>,
    pub channel_address: Option<Address>,
    pub transfer_definition: Option<Address>,
}

impl TransferFilter {
    pub fn by_id(transfer_id: B256) -> Self {
        TransferFilter { transfer_id: Some(transfer_id), ..Default::default() }
    }

    pub fn by_channel(channel_address: Address) -> Self {
        TransferFilter { channel_address: Some(channel_address), ..Default::default() }
    }

    pub fn matches(&self, transfer: &Transfer) -> bool {
        self.transfer_id.is_none_or(|id| transfer.transfer_id == id)
            && self.channel_address.is_none_or(|c| transfer.channel_address == c)
            && self.transfer_definition.is_none_or(|d| transfer.transfer_definition == d)
    }
}
