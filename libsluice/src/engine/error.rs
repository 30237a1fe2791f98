use crate::crypto::KeyError;
use crate::external_validation::ExternalValidationError;
use crate::messaging::{MessagingError, ProtocolErrorReason};
use crate::storage::StoreError;
use crate::validation::ValidationError;
use alloy_primitives::Address;
use thiserror::Error;

/// Failures surfaced by the update engine. Any error raised before the final persistence step
/// leaves the channel unchanged.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("timed out acquiring the lock for channel {0}")]
    LockTimeout(Address),
    /// The channel advanced between proposal and lock acquisition; the caller should re-propose
    /// against the new state.
    #[error("channel {channel} advanced to nonce {observed} while the proposal was pending")]
    StaleProposal { channel: Address, observed: u64 },
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    External(#[from] ExternalValidationError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Messaging(#[from] MessagingError),
    /// The counterparty replied with a protocol error we could not recover from.
    #[error("counterparty replied '{reason}' for channel {channel}")]
    Protocol { channel: Address, reason: ProtocolErrorReason },
    /// Non-recoverable: the countersigned update failed signature verification.
    #[error("countersigned update carries bad signatures: {0}")]
    BadSignatures(KeyError),
    /// Non-recoverable: the peer is two or more updates ahead; a restore flow must run before
    /// the channel can be used again.
    #[error("channel {channel} requires a restore from the counterparty")]
    RestoreNeeded { channel: Address },
    #[error("acknowledgement does not match the proposed update for channel {0}")]
    AckMismatch(Address),
}

impl EngineError {
    /// The protocol-error reason this failure maps to when it has to cross the wire.
    pub fn protocol_reason(&self) -> ProtocolErrorReason {
        match self {
            EngineError::Validation(ValidationError::Signature(_)) | EngineError::BadSignatures(_) => {
                ProtocolErrorReason::BadSignatures
            }
            EngineError::Validation(e) => ProtocolErrorReason::ValidationFailed(e.to_string()),
            EngineError::External(e) => ProtocolErrorReason::ValidationFailed(e.to_string()),
            EngineError::Store(e) => ProtocolErrorReason::ValidationFailed(format!("store failure: {e}")),
            EngineError::RestoreNeeded { .. } => ProtocolErrorReason::RestoreNeeded,
            EngineError::Protocol { reason, .. } => reason.clone(),
            EngineError::LockTimeout(_) => ProtocolErrorReason::Transport("lock timeout".to_string()),
            EngineError::StaleProposal { .. } => ProtocolErrorReason::StaleUpdate,
            EngineError::Messaging(e) => ProtocolErrorReason::Transport(e.to_string()),
            EngineError::AckMismatch(_) => ProtocolErrorReason::BadSignatures,
        }
    }
}
