use crate::balance::{Balance, ChannelSide};
use crate::identity::PublicIdentifier;
use crate::update::ChannelUpdate;
use alloy_primitives::{Address, B256, U256};
use log::debug;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use thiserror::Error;

/// Where this channel lives on-chain.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkContext {
    pub chain_id: u64,
    pub channel_factory_address: Address,
    pub transfer_registry_address: Address,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelStateError {
    #[error("asset arrays have mismatched lengths: {0}")]
    MismatchedArrays(String),
    #[error("duplicate asset id {0}")]
    DuplicateAsset(Address),
    #[error("{0} is not a participant of channel {1}")]
    NotAParticipant(PublicIdentifier, Address),
}

/// The authoritative off-chain channel record. Both peers hold an equivalent replica; every
/// durable copy (apart from the genesis setup before the first countersignature) carries a
/// bilaterally signed `latest_update`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChannelState {
    pub channel_address: Address,
    pub alice_identifier: PublicIdentifier,
    pub bob_identifier: PublicIdentifier,
    pub network_context: NetworkContext,
    /// Strictly increases by 1 per applied update.
    pub nonce: u64,
    /// Every asset ever transacted on this channel, in insertion order, no duplicates. The
    /// parallel arrays below are indexed identically.
    pub asset_ids: Vec<Address>,
    pub balances: Vec<Balance>,
    pub processed_deposits_a: Vec<U256>,
    pub processed_deposits_b: Vec<U256>,
    pub defund_nonces: Vec<u64>,
    /// Commitment to the currently-active transfer set.
    pub merkle_root: B256,
    /// Channel-wide dispute window, seconds.
    pub timeout: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_update: Option<ChannelUpdate>,
    pub in_dispute: bool,
}

impl ChannelState {
    /// The state a `setup` update produces: no assets, no transfers, nonce 1.
    pub fn new_setup(
        channel_address: Address,
        alice_identifier: PublicIdentifier,
        bob_identifier: PublicIdentifier,
        network_context: NetworkContext,
        timeout: u64,
    ) -> Self {
        ChannelState {
            channel_address,
            alice_identifier,
            bob_identifier,
            network_context,
            nonce: 1,
            asset_ids: Vec::new(),
            balances: Vec::new(),
            processed_deposits_a: Vec::new(),
            processed_deposits_b: Vec::new(),
            defund_nonces: Vec::new(),
            merkle_root: B256::ZERO,
            timeout,
            latest_update: None,
            in_dispute: false,
        }
    }

    pub fn alice(&self) -> Address {
        self.alice_identifier.address()
    }

    pub fn bob(&self) -> Address {
        self.bob_identifier.address()
    }

    pub fn participant(&self, side: ChannelSide) -> &PublicIdentifier {
        match side {
            ChannelSide::Alice => &self.alice_identifier,
            ChannelSide::Bob => &self.bob_identifier,
        }
    }

    pub fn side_of(&self, identifier: &PublicIdentifier) -> Result<ChannelSide, ChannelStateError> {
        if identifier == &self.alice_identifier {
            Ok(ChannelSide::Alice)
        } else if identifier == &self.bob_identifier {
            Ok(ChannelSide::Bob)
        } else {
            Err(ChannelStateError::NotAParticipant(identifier.clone(), self.channel_address))
        }
    }

    pub fn side_of_address(&self, address: Address) -> Option<ChannelSide> {
        if address == self.alice() {
            Some(ChannelSide::Alice)
        } else if address == self.bob() {
            Some(ChannelSide::Bob)
        } else {
            None
        }
    }

    pub fn asset_index(&self, asset_id: Address) -> Option<usize> {
        self.asset_ids.iter().position(|a| *a == asset_id)
    }

    /// The channel balance for `asset_id`, or an all-zero balance if the asset has never been
    /// transacted here.
    pub fn balance_for(&self, asset_id: Address) -> Balance {
        match self.asset_index(asset_id) {
            Some(i) => self.balances[i].clone(),
            None => Balance::empty(self.alice(), self.bob()),
        }
    }

    /// `(processedDepositsA, processedDepositsB)` for `asset_id`, zero for unknown assets.
    pub fn processed_deposits_for(&self, asset_id: Address) -> (U256, U256) {
        match self.asset_index(asset_id) {
            Some(i) => (self.processed_deposits_a[i], self.processed_deposits_b[i]),
            None => (U256::ZERO, U256::ZERO),
        }
    }

    /// Replace the balance for an asset, registering the asset if it is new.
    pub fn set_balance(&mut self, asset_id: Address, balance: Balance) {
        match self.asset_index(asset_id) {
            Some(i) => self.balances[i] = balance,
            None => self.push_asset(asset_id, balance, U256::ZERO, U256::ZERO),
        }
    }

    /// Replace the balance and processed-deposit totals for an asset, registering it if new.
    pub fn set_asset_entry(&mut self, asset_id: Address, balance: Balance, processed_a: U256, processed_b: U256) {
        match self.asset_index(asset_id) {
            Some(i) => {
                self.balances[i] = balance;
                self.processed_deposits_a[i] = processed_a;
                self.processed_deposits_b[i] = processed_b;
            }
            None => self.push_asset(asset_id, balance, processed_a, processed_b),
        }
    }

    fn push_asset(&mut self, asset_id: Address, balance: Balance, processed_a: U256, processed_b: U256) {
        self.asset_ids.push(asset_id);
        self.balances.push(balance);
        self.processed_deposits_a.push(processed_a);
        self.processed_deposits_b.push(processed_b);
        self.defund_nonces.push(1);
    }

    /// Merge duplicate asset entries in place. Externally produced records may carry the same
    /// asset twice (historically, hex casing differences); amounts and processed-deposit totals
    /// are summed, the defund nonce takes the maximum, and the first occurrence keeps its slot.
    ///
    /// Returns `true` if anything was merged, in which case the caller must write the record back.
    pub fn normalize_assets(&mut self) -> bool {
        let mut merged = false;
        let mut i = 0;
        while i < self.asset_ids.len() {
            let mut j = i + 1;
            while j < self.asset_ids.len() {
                if self.asset_ids[j] == self.asset_ids[i] {
                    debug!(
                        "merging duplicate asset {} on channel {}",
                        self.asset_ids[i], self.channel_address
                    );
                    let balance = self.balances.remove(j);
                    self.balances[i].amount[0] = self.balances[i].amount[0].saturating_add(balance.amount[0]);
                    self.balances[i].amount[1] = self.balances[i].amount[1].saturating_add(balance.amount[1]);
                    let pa = self.processed_deposits_a.remove(j);
                    self.processed_deposits_a[i] = self.processed_deposits_a[i].saturating_add(pa);
                    let pb = self.processed_deposits_b.remove(j);
                    self.processed_deposits_b[i] = self.processed_deposits_b[i].saturating_add(pb);
                    let dn = self.defund_nonces.remove(j);
                    self.defund_nonces[i] = self.defund_nonces[i].max(dn);
                    self.asset_ids.remove(j);
                    merged = true;
                } else {
                    j += 1;
                }
            }
            i += 1;
        }
        merged
    }

    /// Structural invariants every well-formed state satisfies: equal-length parallel arrays and
    /// no duplicate asset ids.
    pub fn verify_invariants(&self) -> Result<(), ChannelStateError> {
        let n = self.asset_ids.len();
        if self.balances.len() != n
            || self.processed_deposits_a.len() != n
            || self.processed_deposits_b.len() != n
            || self.defund_nonces.len() != n
        {
            return Err(ChannelStateError::MismatchedArrays(format!(
                "assets {}, balances {}, depositsA {}, depositsB {}, defundNonces {}",
                n,
                self.balances.len(),
                self.processed_deposits_a.len(),
                self.processed_deposits_b.len(),
                self.defund_nonces.len(),
            )));
        }
        for (i, asset) in self.asset_ids.iter().enumerate() {
            if self.asset_ids[i + 1..].contains(asset) {
                return Err(ChannelStateError::DuplicateAsset(*asset));
            }
        }
        Ok(())
    }
}

impl Display for ChannelState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Channel {} (nonce {}, {} assets, {})",
            self.channel_address,
            self.nonce,
            self.asset_ids.len(),
            if self.in_dispute { "in dispute" } else { "not disputed" }
        )
    }
}
