use crate::channel::ChannelState;
use crate::update::{ChannelUpdate, UpdateDetails};
use crate::validation::ValidationError;

/// Deterministically derive the next channel state from a validated update.
///
/// This is the single application path shared by the outbound proposer, the inbound receiver,
/// and the syncer, so replicas that accept the same update can never diverge. The update is
/// trusted here; all rule checking happens before this call.
pub fn apply_update(
    previous: Option<&ChannelState>,
    update: &ChannelUpdate,
) -> Result<ChannelState, ValidationError> {
    let mut next = match (&update.details, previous) {
        (UpdateDetails::Setup(details), None) => ChannelState::new_setup(
            update.channel_address,
            update.from_identifier.clone(),
            update.to_identifier.clone(),
            details.network_context.clone(),
            details.timeout,
        ),
        (UpdateDetails::Setup(_), Some(previous)) => {
            return Err(ValidationError::ChannelAlreadyExists(previous.channel_address));
        }
        (_, None) => return Err(ValidationError::ChannelNotFound(update.channel_address)),
        (UpdateDetails::Deposit(details), Some(previous)) => {
            let mut next = previous.clone();
            next.set_asset_entry(
                update.asset_id,
                update.balance.clone(),
                details.total_deposits_alice,
                details.total_deposits_bob,
            );
            next
        }
        (UpdateDetails::Create(details), Some(previous)) => {
            let mut next = previous.clone();
            next.set_balance(update.asset_id, update.balance.clone());
            next.merkle_root = details.merkle_root;
            next
        }
        (UpdateDetails::Resolve(details), Some(previous)) => {
            let mut next = previous.clone();
            next.set_balance(update.asset_id, update.balance.clone());
            next.merkle_root = details.merkle_root;
            next
        }
    };
    next.nonce = update.nonce;
    next.latest_update = Some(update.clone());
    next.verify_invariants()?;
    Ok(next)
}
