use crate::channel::ChannelState;
use crate::transfer::Transfer;
use crate::update::{ChannelUpdate, UpdateParams};
use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("rejected by external validation: {0}")]
pub struct ExternalValidationError(pub String);

/// Additional predicates applied to every update on top of the protocol rules, e.g. an
/// application-level allowlist of transfer definitions or per-channel exposure limits.
#[async_trait]
pub trait ExternalValidator: Send + Sync {
    async fn validate_outbound(
        &self,
        params: &UpdateParams,
        previous: Option<&ChannelState>,
        active: &[Transfer],
    ) -> Result<(), ExternalValidationError>;

    async fn validate_inbound(
        &self,
        update: &ChannelUpdate,
        previous: Option<&ChannelState>,
        active: &[Transfer],
    ) -> Result<(), ExternalValidationError>;
}

/// The default validator: everything passes.
#[derive(Clone, Copy, Debug, Default)]
pub struct AcceptAll;

#[async_trait]
impl ExternalValidator for AcceptAll {
    async fn validate_outbound(
        &self,
        _params: &UpdateParams,
        _previous: Option<&ChannelState>,
        _active: &[Transfer],
    ) -> Result<(), ExternalValidationError> {
        Ok(())
    }

    async fn validate_inbound(
        &self,
        _update: &ChannelUpdate,
        _previous: Option<&ChannelState>,
        _active: &[Transfer],
    ) -> Result<(), ExternalValidationError> {
        Ok(())
    }
}
