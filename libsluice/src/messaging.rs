use crate::identity::PublicIdentifier;
use crate::update::ChannelUpdate;
use alloy_primitives::Address;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::time::Duration;
use thiserror::Error;

/// Request one peer sends the other to advance a channel: the single-signed update, plus the
/// sender's previous double-signed update so a peer that missed it can sync.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProtocolUpdate {
    pub update: ChannelUpdate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_update: Option<ChannelUpdate>,
}

/// Success reply: the same update countersigned, plus the responder's previous `latest_update`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProtocolUpdateAck {
    pub update: ChannelUpdate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_update: Option<ChannelUpdate>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolErrorReason {
    /// The receiver's nonce is at or ahead of the proposed update; the reply carries its
    /// `latest_update` so the proposer can sync.
    StaleUpdate,
    /// The receiver is behind by two or more updates and needs a full snapshot.
    RestoreNeeded,
    /// Setup updates cannot be applied through the sync path.
    CannotSyncSetup,
    /// Only double-signed updates may be synced.
    CannotSyncSingleSigned,
    BadSignatures,
    ValidationFailed(String),
    Transport(String),
}

impl Display for ProtocolErrorReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtocolErrorReason::StaleUpdate => write!(f, "stale update"),
            ProtocolErrorReason::RestoreNeeded => write!(f, "restore needed"),
            ProtocolErrorReason::CannotSyncSetup => write!(f, "cannot sync a setup update"),
            ProtocolErrorReason::CannotSyncSingleSigned => write!(f, "cannot sync a single-signed update"),
            ProtocolErrorReason::BadSignatures => write!(f, "bad signatures"),
            ProtocolErrorReason::ValidationFailed(reason) => write!(f, "validation failed: {reason}"),
            ProtocolErrorReason::Transport(reason) => write!(f, "transport failure: {reason}"),
        }
    }
}

/// Error reply. `latest_update` gives the counterparty enough context to sync or diagnose.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProtocolError {
    pub reason: ProtocolErrorReason,
    pub channel_address: Address,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_update: Option<ChannelUpdate>,
}

impl Display for ProtocolError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (channel {})", self.reason, self.channel_address)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum ProtocolResponse {
    Ack(ProtocolUpdateAck),
    Error(ProtocolError),
}

impl From<ProtocolUpdateAck> for ProtocolResponse {
    fn from(ack: ProtocolUpdateAck) -> Self {
        ProtocolResponse::Ack(ack)
    }
}

impl From<ProtocolError> for ProtocolResponse {
    fn from(err: ProtocolError) -> Self {
        ProtocolResponse::Error(err)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MessagingError {
    #[error("no reply from {0} within the deadline")]
    Timeout(PublicIdentifier),
    #[error("peer {identifier} is unreachable: {reason}")]
    Unreachable { identifier: PublicIdentifier, reason: String },
    #[error("transport failure: {0}")]
    Transport(String),
}

/// Reliable request/response channel to the counterparty. The transport correlates each reply to
/// its request; the engine only ever has one request in flight per channel.
#[async_trait]
pub trait MessagingService: Send + Sync {
    async fn send_protocol_update(
        &self,
        to: &PublicIdentifier,
        request: ProtocolUpdate,
        timeout: Duration,
    ) -> Result<ProtocolResponse, MessagingError>;
}

/// The receiving side of the protocol: transports deliver each inbound [`ProtocolUpdate`] here
/// and send the returned response back to the requester.
#[async_trait]
pub trait ProtocolHandler: Send + Sync {
    async fn handle_protocol_update(
        &self,
        from: &PublicIdentifier,
        request: ProtocolUpdate,
    ) -> ProtocolResponse;
}
