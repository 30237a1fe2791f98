use crate::balance::Balance;
use crate::chain::TransactionReason;
use crate::transfer::Transfer;
use alloy_primitives::{Address, B256};
use std::fmt::{Display, Formatter};
use tokio::sync::broadcast;

/// Lifecycle notifications published by the engine after an update or transaction submission has
/// been made durable.
#[derive(Clone, Debug)]
pub enum ChannelEvent {
    ChannelSetup {
        channel: Address,
    },
    Deposited {
        channel: Address,
        asset_id: Address,
        balance: Balance,
    },
    TransferCreated {
        channel: Address,
        transfer: Box<Transfer>,
    },
    TransferResolved {
        channel: Address,
        transfer: Box<Transfer>,
    },
    TransactionSubmitted {
        channel: Address,
        reason: TransactionReason,
        transaction_hash: B256,
    },
    TransactionMined {
        channel: Address,
        transaction_hash: B256,
    },
    TransactionFailed {
        channel: Address,
        transaction_hash: B256,
        error: String,
    },
}

impl Display for ChannelEvent {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelEvent::ChannelSetup { channel } => write!(f, "ChannelSetup({channel})"),
            ChannelEvent::Deposited { channel, asset_id, .. } => write!(f, "Deposited({channel}, {asset_id})"),
            ChannelEvent::TransferCreated { channel, transfer } => {
                write!(f, "TransferCreated({channel}, {})", transfer.transfer_id)
            }
            ChannelEvent::TransferResolved { channel, transfer } => {
                write!(f, "TransferResolved({channel}, {})", transfer.transfer_id)
            }
            ChannelEvent::TransactionSubmitted { channel, reason, .. } => {
                write!(f, "TransactionSubmitted({channel}, {reason})")
            }
            ChannelEvent::TransactionMined { channel, transaction_hash } => {
                write!(f, "TransactionMined({channel}, {transaction_hash})")
            }
            ChannelEvent::TransactionFailed { channel, error, .. } => {
                write!(f, "TransactionFailed({channel}, {error})")
            }
        }
    }
}

/// Bounded fan-out of [`ChannelEvent`]s. Publishing never blocks the protocol core: with no
/// subscribers events are dropped, and a lagging subscriber loses old events rather than
/// backpressuring the engine.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ChannelEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        EventBus { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: ChannelEvent) {
        // An Err here only means nobody is listening.
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        EventBus::new(64)
    }
}
