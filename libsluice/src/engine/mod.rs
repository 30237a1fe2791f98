//! The update engine: orchestrates outbound proposals, inbound updates, and stale-nonce
//! synchronization over the validator, the store, the chain reader, and the messaging boundary.
//!
//! Processing is single-file per channel (a per-channel lock bounded by the protocol message
//! timeout) and parallel across channels. Persistence is always the last step of a flow, so any
//! failure leaves the local replica untouched.

mod error;
mod events;
mod locks;
mod queue;

pub use error::EngineError;
pub use events::{ChannelEvent, EventBus};
pub use locks::ChannelLocks;
pub use queue::{QueueError, TransactionQueue, DEFAULT_WRITE_RETRIES};

use crate::chain::ChainReader;
use crate::channel::ChannelState;
use crate::crypto::{verify_update_signatures, ChannelSigner};
use crate::external_validation::ExternalValidator;
use crate::identity::PublicIdentifier;
use crate::messaging::{
    MessagingService, ProtocolError, ProtocolErrorReason, ProtocolHandler, ProtocolResponse, ProtocolUpdate,
    ProtocolUpdateAck,
};
use crate::storage::Store;
use crate::transfer::Transfer;
use crate::update::{
    ChannelUpdate, CreateParams, DepositParams, ResolveParams, SetupParams, UpdateDetails, UpdateParams,
    UpdateType,
};
use crate::validation::{
    validate_inbound, validate_params, ValidatedUpdate, ValidationError, DEFAULT_CHANNEL_TIMEOUT,
};
use alloy_primitives::Address;
use async_trait::async_trait;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

#[derive(Clone, Debug, Default)]
pub struct EngineConfig {
    /// Overrides the protocol message timeout (and with it the lock TTL). When unset, each
    /// channel uses a tenth of its dispute timeout.
    pub message_timeout: Option<Duration>,
}

/// The protocol engine for one participant. Generic over its four collaborators so tests can
/// drive it hermetically and deployments can swap transports and stores.
pub struct UpdateEngine<S, C, M, V> {
    signer: ChannelSigner,
    store: Arc<S>,
    chain: Arc<C>,
    messaging: Arc<M>,
    external: Arc<V>,
    locks: ChannelLocks,
    events: EventBus,
    config: EngineConfig,
}

impl<S, C, M, V> UpdateEngine<S, C, M, V>
where
    S: Store,
    C: ChainReader,
    M: MessagingService,
    V: ExternalValidator,
{
    pub fn new(
        signer: ChannelSigner,
        store: Arc<S>,
        chain: Arc<C>,
        messaging: Arc<M>,
        external: Arc<V>,
        config: EngineConfig,
    ) -> Self {
        UpdateEngine {
            signer,
            store,
            chain,
            messaging,
            external,
            locks: ChannelLocks::new(),
            events: EventBus::default(),
            config,
        }
    }

    pub fn identifier(&self) -> &PublicIdentifier {
        self.signer.identifier()
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    pub async fn setup(&self, params: SetupParams) -> Result<ChannelState, EngineError> {
        self.propose_update(UpdateParams::Setup(params)).await
    }

    pub async fn deposit(&self, params: DepositParams) -> Result<ChannelState, EngineError> {
        self.propose_update(UpdateParams::Deposit(params)).await
    }

    pub async fn create_transfer(&self, params: CreateParams) -> Result<ChannelState, EngineError> {
        self.propose_update(UpdateParams::Create(params)).await
    }

    pub async fn resolve_transfer(&self, params: ResolveParams) -> Result<ChannelState, EngineError> {
        self.propose_update(UpdateParams::Resolve(params)).await
    }

    /// Mirror the on-chain dispute status into the local replica. `in_dispute` is local
    /// bookkeeping, so no counterparty round-trip or signature is involved.
    pub async fn sync_dispute(&self, channel: Address) -> Result<ChannelState, EngineError> {
        let snapshot = self.store.get_channel_state(channel).await?;
        let channel_timeout = snapshot.map(|c| c.timeout).unwrap_or(DEFAULT_CHANNEL_TIMEOUT);
        let _guard = self.locks.acquire(channel, self.message_timeout(channel_timeout)).await?;
        let (previous, _) = self.load_channel(channel).await?;
        let mut state = previous.ok_or(ValidationError::ChannelNotFound(channel))?;
        let dispute = self
            .chain
            .get_channel_dispute(channel, state.network_context.chain_id)
            .await
            .map_err(ValidationError::from)?;
        let in_dispute = dispute.is_some();
        if state.in_dispute != in_dispute {
            info!("channel {channel} dispute status changed to {in_dispute}");
            state.in_dispute = in_dispute;
            self.store.save_channel_state(&state, None).await?;
        }
        Ok(state)
    }

    /// Propose an update to the counterparty and drive it to a bilaterally signed, persisted
    /// state. On a `StaleUpdate` reply the engine syncs the peer's latest update and retries the
    /// proposal exactly once.
    pub async fn propose_update(&self, params: UpdateParams) -> Result<ChannelState, EngineError> {
        let channel_address = match params.channel_address() {
            Some(address) => address,
            None => self.derive_setup_address(&params).await?,
        };

        // Pre-lock snapshot: if another task advances the channel while we wait for the lock,
        // the proposal is stale and the caller must re-derive it.
        let snapshot = self.store.get_channel_state(channel_address).await?;
        let snapshot_nonce = snapshot.as_ref().map(|c| c.nonce);
        let channel_timeout = match (&params, &snapshot) {
            (UpdateParams::Setup(p), _) => p.timeout,
            (_, Some(channel)) => channel.timeout,
            (_, None) => DEFAULT_CHANNEL_TIMEOUT,
        };
        let timeout = self.message_timeout(channel_timeout);

        let _guard = self.locks.acquire(channel_address, timeout).await?;
        let (previous, active) = self.load_channel(channel_address).await?;
        if previous.as_ref().map(|c| c.nonce) != snapshot_nonce {
            let observed = previous.as_ref().map(|c| c.nonce).unwrap_or(0);
            return Err(EngineError::StaleProposal { channel: channel_address, observed });
        }

        self.external.validate_outbound(&params, previous.as_ref(), &active).await?;
        let validated =
            validate_params(&self.signer, self.chain.as_ref(), previous.as_ref(), &active, &params).await?;
        debug!("proposing {}", validated.update);

        let request = ProtocolUpdate {
            update: validated.update.clone(),
            previous_update: previous.as_ref().and_then(|c| c.latest_update.clone()),
        };
        let to = validated.update.to_identifier.clone();
        let response = self.messaging.send_protocol_update(&to, request, timeout).await?;

        let (validated, ack) = match response {
            ProtocolResponse::Ack(ack) => (validated, ack),
            ProtocolResponse::Error(err) if err.reason == ProtocolErrorReason::StaleUpdate => {
                self.resync_and_retry(&params, previous.as_ref(), &active, err, timeout).await?
            }
            ProtocolResponse::Error(err) => {
                return Err(protocol_failure(channel_address, err.reason));
            }
        };
        self.finish_outbound(validated, ack).await
    }

    async fn derive_setup_address(&self, params: &UpdateParams) -> Result<Address, EngineError> {
        let UpdateParams::Setup(p) = params else {
            // Every non-setup params variant carries its channel address.
            return Err(EngineError::Validation(ValidationError::ChannelNotFound(Address::ZERO)));
        };
        let derived = self
            .chain
            .get_channel_address(
                self.signer.address(),
                p.counterparty_identifier.address(),
                p.network_context.channel_factory_address,
                p.network_context.chain_id,
            )
            .await
            .map_err(ValidationError::from)?;
        Ok(derived)
    }

    /// §4.2 step 5: the peer told us we are stale. Apply their latest double-signed update, then
    /// re-derive the proposal against the synced state and retry once.
    async fn resync_and_retry(
        &self,
        params: &UpdateParams,
        previous: Option<&ChannelState>,
        active: &[Transfer],
        err: ProtocolError,
        timeout: Duration,
    ) -> Result<(ValidatedUpdate, ProtocolUpdateAck), EngineError> {
        let channel = err.channel_address;
        let peer_latest = err
            .latest_update
            .ok_or_else(|| protocol_failure(channel, ProtocolErrorReason::StaleUpdate))?;
        let local_nonce = previous.map(|c| c.nonce).unwrap_or(0);
        if peer_latest.nonce <= local_nonce {
            // The peer called us stale but is not actually ahead. Nothing to sync.
            return Err(protocol_failure(channel, ProtocolErrorReason::StaleUpdate));
        }
        if peer_latest.nonce > local_nonce + 1 {
            return Err(EngineError::RestoreNeeded { channel });
        }

        info!("syncing channel {channel} from nonce {local_nonce} to {}", peer_latest.nonce);
        let (synced, synced_active) = self.apply_sync(previous, active, peer_latest).await?;

        self.external.validate_outbound(params, Some(&synced), &synced_active).await?;
        let validated =
            validate_params(&self.signer, self.chain.as_ref(), Some(&synced), &synced_active, params).await?;
        debug!("retrying proposal as {}", validated.update);
        let request = ProtocolUpdate {
            update: validated.update.clone(),
            previous_update: synced.latest_update.clone(),
        };
        let to = validated.update.to_identifier.clone();
        match self.messaging.send_protocol_update(&to, request, timeout).await? {
            ProtocolResponse::Ack(ack) => Ok((validated, ack)),
            ProtocolResponse::Error(err) => Err(protocol_failure(channel, err.reason)),
        }
    }

    /// §4.4: apply a peer's double-signed update through the inbound validation pipeline and
    /// persist the result. Callers decide what happens afterwards; the syncer never retries.
    async fn apply_sync(
        &self,
        previous: Option<&ChannelState>,
        active: &[Transfer],
        update: ChannelUpdate,
    ) -> Result<(ChannelState, Vec<Transfer>), EngineError> {
        let channel = update.channel_address;
        if update.update_type() == UpdateType::Setup {
            return Err(protocol_failure(channel, ProtocolErrorReason::CannotSyncSetup));
        }
        if !update.is_double_signed() {
            return Err(protocol_failure(channel, ProtocolErrorReason::CannotSyncSingleSigned));
        }
        let validated = validate_inbound(self.chain.as_ref(), previous, active, &update).await?;
        let proposer = validated.next_state.side_of(&update.from_identifier).map_err(ValidationError::from)?;
        verify_update_signatures(&validated.next_state, &update, proposer, true)
            .map_err(EngineError::BadSignatures)?;
        self.store.save_channel_state(&validated.next_state, validated.updated_transfer.as_ref()).await?;
        info!("synced channel {channel} to nonce {}", validated.next_state.nonce);
        Ok((validated.next_state, validated.next_active))
    }

    async fn finish_outbound(
        &self,
        validated: ValidatedUpdate,
        ack: ProtocolUpdateAck,
    ) -> Result<ChannelState, EngineError> {
        let channel = validated.next_state.channel_address;
        if ack.update.unsigned() != validated.update.unsigned() {
            return Err(EngineError::AckMismatch(channel));
        }
        let proposer = validated
            .next_state
            .side_of(self.signer.identifier())
            .map_err(ValidationError::from)?;
        verify_update_signatures(&validated.next_state, &ack.update, proposer, true)
            .map_err(EngineError::BadSignatures)?;

        let mut next_state = validated.next_state;
        next_state.latest_update = Some(ack.update.clone());
        self.store.save_channel_state(&next_state, validated.updated_transfer.as_ref()).await?;
        info!("applied {} on channel {channel}", ack.update);
        self.publish_update_event(&next_state, &validated.updated_transfer);
        Ok(next_state)
    }

    async fn process_inbound(
        &self,
        from: &PublicIdentifier,
        request: ProtocolUpdate,
    ) -> Result<ProtocolUpdateAck, InboundFailure> {
        let ProtocolUpdate { update, previous_update } = request;
        let channel_address = update.channel_address;
        if update.to_identifier != *self.signer.identifier() {
            return Err(InboundFailure::validation("update is not addressed to this participant"));
        }
        if update.from_identifier != *from {
            return Err(InboundFailure::validation("sender does not match the update proposer"));
        }

        let snapshot = self.store.get_channel_state(channel_address).await.map_err(EngineError::from)?;
        let channel_timeout = match (&snapshot, &update.details) {
            (Some(channel), _) => channel.timeout,
            (None, UpdateDetails::Setup(details)) => details.timeout,
            (None, _) => DEFAULT_CHANNEL_TIMEOUT,
        };
        let timeout = self.message_timeout(channel_timeout);
        let _guard = self.locks.acquire(channel_address, timeout).await.map_err(InboundFailure::from)?;

        let (mut previous, mut active) = self.load_channel(channel_address).await?;
        let local_nonce = previous.as_ref().map(|c| c.nonce).unwrap_or(0);
        let diff = i128::from(update.nonce) - i128::from(local_nonce);

        if diff <= 0 {
            debug!("inbound nonce {} at or behind local {local_nonce}; replying stale", update.nonce);
            return Err(InboundFailure {
                reason: ProtocolErrorReason::StaleUpdate,
                latest_update: previous.and_then(|c| c.latest_update),
            });
        }
        if diff >= 3 {
            warn!("inbound nonce {} is {diff} ahead of local {local_nonce}; restore required", update.nonce);
            return Err(InboundFailure::reason(ProtocolErrorReason::RestoreNeeded));
        }
        if diff == 2 {
            // We missed exactly one update; the request carries it.
            let prev_update = previous_update
                .ok_or_else(|| InboundFailure::validation("missing previous update for sync"))?;
            if prev_update.update_type() == UpdateType::Setup {
                return Err(InboundFailure::reason(ProtocolErrorReason::CannotSyncSetup));
            }
            if prev_update.nonce != local_nonce + 1 {
                return Err(InboundFailure::validation("previous update does not follow the local state"));
            }
            let (synced, synced_active) = self.apply_sync(previous.as_ref(), &active, prev_update).await?;
            previous = Some(synced);
            active = synced_active;
        }

        self.external
            .validate_inbound(&update, previous.as_ref(), &active)
            .await
            .map_err(EngineError::from)?;
        let mut validated = validate_inbound(self.chain.as_ref(), previous.as_ref(), &active, &update)
            .await
            .map_err(EngineError::from)?;
        let reply_previous = previous.as_ref().and_then(|c| c.latest_update.clone());
        validated.countersign(&self.signer).map_err(EngineError::from)?;
        self.store
            .save_channel_state(&validated.next_state, validated.updated_transfer.as_ref())
            .await
            .map_err(EngineError::from)?;
        info!("accepted {}", validated.update);
        self.publish_update_event(&validated.next_state, &validated.updated_transfer);
        Ok(ProtocolUpdateAck { update: validated.update, previous_update: reply_previous })
    }

    async fn load_channel(
        &self,
        channel: Address,
    ) -> Result<(Option<ChannelState>, Vec<Transfer>), EngineError> {
        let Some(mut state) = self.store.get_channel_state(channel).await? else {
            return Ok((None, Vec::new()));
        };
        // One-time merge of duplicate asset entries, written back immediately.
        if state.normalize_assets() {
            self.store.save_channel_state(&state, None).await?;
        }
        let active = self.store.get_active_transfers(channel).await?;
        Ok((Some(state), active))
    }

    fn message_timeout(&self, channel_timeout: u64) -> Duration {
        self.config
            .message_timeout
            .unwrap_or_else(|| Duration::from_secs((channel_timeout / 10).max(1)))
    }

    fn publish_update_event(&self, state: &ChannelState, transfer: &Option<Transfer>) {
        let channel = state.channel_address;
        let Some(update) = state.latest_update.as_ref() else {
            return;
        };
        let event = match (&update.details, transfer) {
            (UpdateDetails::Setup(_), _) => ChannelEvent::ChannelSetup { channel },
            (UpdateDetails::Deposit(_), _) => ChannelEvent::Deposited {
                channel,
                asset_id: update.asset_id,
                balance: update.balance.clone(),
            },
            (UpdateDetails::Create(_), Some(t)) => {
                ChannelEvent::TransferCreated { channel, transfer: Box::new(t.clone()) }
            }
            (UpdateDetails::Resolve(_), Some(t)) => {
                ChannelEvent::TransferResolved { channel, transfer: Box::new(t.clone()) }
            }
            _ => return,
        };
        self.events.publish(event);
    }
}

#[async_trait]
impl<S, C, M, V> ProtocolHandler for UpdateEngine<S, C, M, V>
where
    S: Store,
    C: ChainReader,
    M: MessagingService,
    V: ExternalValidator,
{
    async fn handle_protocol_update(
        &self,
        from: &PublicIdentifier,
        request: ProtocolUpdate,
    ) -> ProtocolResponse {
        let channel_address = request.update.channel_address;
        match self.process_inbound(from, request).await {
            Ok(ack) => ProtocolResponse::Ack(ack),
            Err(failure) => {
                warn!("inbound update on {channel_address} rejected: {}", failure.reason);
                ProtocolResponse::Error(ProtocolError {
                    reason: failure.reason,
                    channel_address,
                    latest_update: failure.latest_update,
                })
            }
        }
    }
}

fn protocol_failure(channel: Address, reason: ProtocolErrorReason) -> EngineError {
    match reason {
        ProtocolErrorReason::RestoreNeeded => EngineError::RestoreNeeded { channel },
        reason => EngineError::Protocol { channel, reason },
    }
}

struct InboundFailure {
    reason: ProtocolErrorReason,
    latest_update: Option<ChannelUpdate>,
}

impl InboundFailure {
    fn reason(reason: ProtocolErrorReason) -> Self {
        InboundFailure { reason, latest_update: None }
    }

    fn validation(message: &str) -> Self {
        InboundFailure::reason(ProtocolErrorReason::ValidationFailed(message.to_string()))
    }
}

impl From<EngineError> for InboundFailure {
    fn from(err: EngineError) -> Self {
        InboundFailure { reason: err.protocol_reason(), latest_update: None }
    }
}
