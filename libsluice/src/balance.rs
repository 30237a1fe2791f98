use alloy_primitives::{Address, U256};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Which side of the channel a participant occupies. Alice deploys the channel contract and funds
/// through the factory; Bob funds by plain transfer to the channel address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelSide {
    Alice,
    Bob,
}

impl ChannelSide {
    pub fn other(&self) -> Self {
        match self {
            ChannelSide::Alice => ChannelSide::Bob,
            ChannelSide::Bob => ChannelSide::Alice,
        }
    }

    pub fn index(&self) -> usize {
        match self {
            ChannelSide::Alice => 0,
            ChannelSide::Bob => 1,
        }
    }
}

impl std::fmt::Display for ChannelSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelSide::Alice => write!(f, "Alice"),
            ChannelSide::Bob => write!(f, "Bob"),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BalanceError {
    #[error("debiting {amount} would leave holder {holder} with a negative balance")]
    InsufficientFunds { holder: Address, amount: U256 },
    #[error("amount overflow while crediting {holder}")]
    Overflow { holder: Address },
    #[error("address {0} does not hold a slot in this balance")]
    UnknownHolder(Address),
}

/// An ordered two-slot allocation of a single asset. Slot 0 is Alice's side, slot 1 is Bob's.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub to: [Address; 2],
    pub amount: [U256; 2],
}

impl Balance {
    pub fn new(to: [Address; 2], amount: [U256; 2]) -> Self {
        Balance { to, amount }
    }

    /// A zero-valued balance for the given pair of holders.
    pub fn empty(alice: Address, bob: Address) -> Self {
        Balance { to: [alice, bob], amount: [U256::ZERO, U256::ZERO] }
    }

    pub fn total(&self) -> U256 {
        self.amount[0].saturating_add(self.amount[1])
    }

    pub fn credit(&self, side: ChannelSide, amount: U256) -> Result<Self, BalanceError> {
        let i = side.index();
        let mut next = self.clone();
        next.amount[i] =
            self.amount[i].checked_add(amount).ok_or(BalanceError::Overflow { holder: self.to[i] })?;
        Ok(next)
    }

    pub fn debit(&self, side: ChannelSide, amount: U256) -> Result<Self, BalanceError> {
        let i = side.index();
        let mut next = self.clone();
        next.amount[i] = self.amount[i]
            .checked_sub(amount)
            .ok_or(BalanceError::InsufficientFunds { holder: self.to[i], amount })?;
        Ok(next)
    }

    /// Credit `amount` to whichever slot `holder` occupies.
    pub fn credit_address(&self, holder: Address, amount: U256) -> Result<Self, BalanceError> {
        let side = self.side_of(holder)?;
        self.credit(side, amount)
    }

    pub fn side_of(&self, holder: Address) -> Result<ChannelSide, BalanceError> {
        if self.to[0] == holder {
            Ok(ChannelSide::Alice)
        } else if self.to[1] == holder {
            Ok(ChannelSide::Bob)
        } else {
            Err(BalanceError::UnknownHolder(holder))
        }
    }

    pub fn amount_of(&self, side: ChannelSide) -> U256 {
        self.amount[side.index()]
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use alloy_primitives::address;

    const ALICE: Address = address!("00000000000000000000000000000000000000aa");
    const BOB: Address = address!("00000000000000000000000000000000000000bb");

    fn default_balance() -> Balance {
        Balance::new([ALICE, BOB], [U256::from(10u64), U256::from(4u64)])
    }

    #[test]
    fn credit_and_debit() {
        let balance = default_balance();
        let balance = balance.credit(ChannelSide::Bob, U256::from(3u64)).unwrap();
        assert_eq!(balance.amount, [U256::from(10u64), U256::from(7u64)]);
        let balance = balance.debit(ChannelSide::Alice, U256::from(10u64)).unwrap();
        assert_eq!(balance.amount, [U256::ZERO, U256::from(7u64)]);
        assert_eq!(balance.total(), U256::from(7u64));
    }

    #[test]
    fn debit_insufficient() {
        let balance = default_balance();
        let err = balance.debit(ChannelSide::Bob, U256::from(5u64)).unwrap_err();
        assert_eq!(err, BalanceError::InsufficientFunds { holder: BOB, amount: U256::from(5u64) });
    }

    #[test]
    fn credit_overflow() {
        let balance = default_balance();
        let err = balance.credit(ChannelSide::Alice, U256::MAX).unwrap_err();
        assert_eq!(err, BalanceError::Overflow { holder: ALICE });
    }

    #[test]
    fn credit_by_address() {
        let balance = default_balance();
        let balance = balance.credit_address(BOB, U256::from(1u64)).unwrap();
        assert_eq!(balance.amount_of(ChannelSide::Bob), U256::from(5u64));
        let err = balance.credit_address(Address::ZERO, U256::from(1u64)).unwrap_err();
        assert_eq!(err, BalanceError::UnknownHolder(Address::ZERO));
    }

    #[test]
    fn side_lookup() {
        let balance = default_balance();
        assert_eq!(balance.side_of(ALICE).unwrap(), ChannelSide::Alice);
        assert_eq!(balance.side_of(BOB).unwrap(), ChannelSide::Bob);
        assert_eq!(ChannelSide::Alice.other(), ChannelSide::Bob);
    }
}
