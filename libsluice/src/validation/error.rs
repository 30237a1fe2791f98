use crate::abi::AbiError;
use crate::balance::BalanceError;
use crate::chain::ChainError;
use crate::channel::ChannelStateError;
use crate::crypto::KeyError;
use crate::update::UpdateType;
use alloy_primitives::{Address, B256};
use thiserror::Error;

/// Per-type rule violations. These are never retried and never persisted; a validation failure
/// leaves the channel exactly as it was.
#[derive(Debug, Clone, Error)]
pub enum ValidationError {
    #[error("channel {0} does not exist")]
    ChannelNotFound(Address),
    #[error("channel {0} already exists")]
    ChannelAlreadyExists(Address),
    #[error("update targets channel {got}, expected {expected}")]
    WrongChannel { expected: Address, got: Address },
    #[error("derived channel address {derived} does not match {expected}")]
    ChannelAddressMismatch { expected: Address, derived: Address },
    #[error("update nonce {got}, expected {expected}")]
    InvalidUpdateNonce { expected: u64, got: u64 },
    #[error("invalid channel timeout {timeout}: must be within [{min}, {max}] seconds")]
    InvalidTimeout { timeout: u64, min: u64, max: u64 },
    #[error("cannot open a channel with yourself")]
    SelfChannel,
    #[error("expected {expected} details, got {got}")]
    MismatchedDetails { expected: UpdateType, got: UpdateType },
    #[error("transfer timeout {transfer} exceeds channel timeout {channel}")]
    TransferTimeoutTooLong { transfer: u64, channel: u64 },
    #[error("cannot lock a transfer with a zero balance")]
    ZeroLockedBalance,
    #[error("transfer {0} is not active")]
    TransferNotActive(B256),
    #[error("transfer encodings do not match the registry entry")]
    EncodingMismatch,
    #[error("transfer definition {definition} rejected the initial state")]
    CreateRejected { definition: Address },
    #[error("invalid resolve: {0}")]
    InvalidResolve(String),
    #[error("merkle root in update does not match the recomputed active-transfer root")]
    MerkleRootMismatch,
    #[error("update balance does not match the locally derived balance: {0}")]
    BalanceMismatch(String),
    #[error("deposit totals in update do not match the on-chain totals: {0}")]
    DepositTotalsMismatch(String),
    #[error(transparent)]
    InvalidPayload(#[from] AbiError),
    #[error(transparent)]
    Balance(#[from] BalanceError),
    #[error(transparent)]
    State(#[from] ChannelStateError),
    #[error(transparent)]
    Signature(#[from] KeyError),
    #[error(transparent)]
    Chain(#[from] ChainError),
}
