use crate::balance::Balance;
use crate::chain::{ChainError, ChainReader};
use crate::channel::ChannelState;
use alloy_primitives::{Address, U256};
use log::debug;

/// The outcome of reconciling a channel's off-chain balance for one asset against the on-chain
/// cumulative deposit totals.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconciledDeposit {
    /// Existing balance plus the deposits that have not been processed off-chain yet.
    pub balance: Balance,
    pub total_deposits_alice: U256,
    pub total_deposits_bob: U256,
}

/// Fold pending on-chain deposits for `asset_id` into the channel balance.
///
/// While the channel contract is not yet deployed there is no factory record for Alice, so her
/// total is zero and the channel address's entire on-chain balance counts as Bob's: Alice must
/// always fund through the factory's deploy-and-deposit path.
pub async fn reconcile_deposit<C: ChainReader + ?Sized>(
    chain: &C,
    channel: &ChannelState,
    asset_id: Address,
) -> Result<ReconciledDeposit, ChainError> {
    let chain_id = channel.network_context.chain_id;
    let code = chain.get_code(channel.channel_address, chain_id).await?;
    let (total_alice, total_bob) = if code.is_empty() {
        let onchain = chain.get_onchain_balance(asset_id, channel.channel_address, chain_id).await?;
        debug!(
            "channel {} not deployed; crediting on-chain balance {onchain} of asset {asset_id} to Bob",
            channel.channel_address
        );
        (U256::ZERO, onchain)
    } else {
        let alice = chain.get_total_deposits_alice(channel.channel_address, chain_id, asset_id).await?;
        let bob = chain.get_total_deposits_bob(channel.channel_address, chain_id, asset_id).await?;
        (alice, bob)
    };

    let (processed_a, processed_b) = channel.processed_deposits_for(asset_id);
    let pending_alice = total_alice
        .checked_sub(processed_a)
        .ok_or(ChainError::InconsistentDeposits { channel: channel.channel_address, asset: asset_id })?;
    let pending_bob = total_bob
        .checked_sub(processed_b)
        .ok_or(ChainError::InconsistentDeposits { channel: channel.channel_address, asset: asset_id })?;

    let existing = channel.balance_for(asset_id);
    let balance = Balance {
        to: existing.to,
        amount: [
            existing.amount[0].saturating_add(pending_alice),
            existing.amount[1].saturating_add(pending_bob),
        ],
    };
    Ok(ReconciledDeposit { balance, total_deposits_alice: total_alice, total_deposits_bob: total_bob })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::chain::DummyChainReader;
    use crate::testing::test_channel;

    const ASSET: Address = Address::ZERO;

    #[tokio::test]
    async fn undeployed_channel_credits_bob() {
        let chain = DummyChainReader::default();
        let channel = test_channel();
        chain.set_onchain_balance(ASSET, channel.channel_address, U256::from(25u64));

        let reconciled = reconcile_deposit(&chain, &channel, ASSET).await.unwrap();
        assert_eq!(reconciled.total_deposits_alice, U256::ZERO);
        assert_eq!(reconciled.total_deposits_bob, U256::from(25u64));
        assert_eq!(reconciled.balance.amount, [U256::ZERO, U256::from(25u64)]);
    }

    #[tokio::test]
    async fn deployed_channel_uses_factory_totals() {
        let chain = DummyChainReader::default();
        let mut channel = test_channel();
        chain.deploy_channel(channel.channel_address);
        chain.set_deposits(channel.channel_address, ASSET, U256::from(10u64), U256::from(4u64));
        let mut balance = channel.balance_for(ASSET);
        balance.amount = [U256::from(2u64), U256::from(1u64)];
        channel.set_asset_entry(ASSET, balance, U256::from(7u64), U256::from(4u64));

        let reconciled = reconcile_deposit(&chain, &channel, ASSET).await.unwrap();
        // 3 pending for Alice, 0 for Bob.
        assert_eq!(reconciled.balance.amount, [U256::from(5u64), U256::from(1u64)]);
        assert_eq!(reconciled.total_deposits_alice, U256::from(10u64));
        assert_eq!(reconciled.total_deposits_bob, U256::from(4u64));
    }

    #[tokio::test]
    async fn regressed_totals_are_rejected() {
        let chain = DummyChainReader::default();
        let mut channel = test_channel();
        chain.deploy_channel(channel.channel_address);
        chain.set_deposits(channel.channel_address, ASSET, U256::from(1u64), U256::ZERO);
        let balance = channel.balance_for(ASSET);
        channel.set_asset_entry(ASSET, balance, U256::from(5u64), U256::ZERO);

        let err = reconcile_deposit(&chain, &channel, ASSET).await.unwrap_err();
        assert_eq!(err, ChainError::InconsistentDeposits { channel: channel.channel_address, asset: ASSET });
    }
}
