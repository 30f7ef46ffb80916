//! Deposit reconciliation.
//!
//! Builds the exact balance pair and deposit nonce a deposit update must
//! carry, from the on-chain view of the channel. Participant 0 absorbs any
//! deposit record newer than what the state has seen; participant 1 gets
//! whatever collateral remains once participant 0's share and the locked
//! balance are accounted for.

use crate::abiencode::types::{Address, U256};
use crate::chain::ChainReader;
use crate::channel::{Balance, FullChannelState};
use crate::error::{ProtocolError, ValidationError};

/// The fields a deposit update carries, as computed from chain state.
#[derive(Debug, Clone, PartialEq)]
pub struct DepositReconciliation {
    pub balance: Balance,
    pub latest_deposit_nonce: u64,
}

pub async fn reconcile_deposit<C: ChainReader>(
    chain: &C,
    state: &FullChannelState,
    asset_id: Address,
) -> Result<DepositReconciliation, ProtocolError> {
    let channel = state.channel_address();
    let chain_id = state.network_context.chain_id;

    let onchain_balance = chain
        .get_channel_onchain_balance(channel, chain_id, asset_id)
        .await?;
    let deposit = chain
        .get_latest_deposit_by_asset(channel, chain_id, asset_id, state.core.latest_deposit_nonce)
        .await?;

    let (free_0, locked) = match state.core.asset_index(asset_id) {
        Some(idx) => (
            state.core.balances[idx].amount[0],
            state.core.locked_balance[idx],
        ),
        None => (U256::zero(), U256::zero()),
    };

    let conservation = || ValidationError::ConservationViolated { asset: asset_id };

    // A deposit record the state has already absorbed changes nothing for
    // participant 0.
    let new_0 = if deposit.nonce > state.core.latest_deposit_nonce {
        deposit.amount.checked_add(free_0).ok_or_else(conservation)?
    } else {
        free_0
    };

    let new_1 = onchain_balance
        .checked_sub(new_0)
        .and_then(|rest| rest.checked_sub(locked))
        .ok_or_else(conservation)?;

    Ok(DepositReconciliation {
        balance: Balance {
            to: state.core.participants,
            amount: [new_0, new_1],
        },
        latest_deposit_nonce: deposit.nonce,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MockChain;
    use crate::channel::{
        derive_channel_address, ChannelUpdate, Identifier, NetworkContext, SetupDetails,
        UpdateDetails,
    };
    use crate::transition::{apply_update, UpdateContext};

    fn empty_channel() -> FullChannelState {
        let participants = [Address([0x11; 20]), Address([0x22; 20])];
        let network = NetworkContext {
            chain_id: U256::from(1),
            adjudicator_address: Address([0xaa; 20]),
        };
        let update = ChannelUpdate {
            channel_address: derive_channel_address(&participants, &network),
            from_identifier: Identifier::new("alice"),
            to_identifier: Identifier::new("bob"),
            nonce: 1,
            balance: Balance::empty(participants),
            asset_id: Address::default(),
            details: UpdateDetails::Setup(SetupDetails {
                timeout: 86_400,
                network_context: network,
                participants,
            }),
            signatures: [None, None],
        };
        apply_update(None, &update, &UpdateContext::default())
            .unwrap()
            .state
    }

    #[tokio::test]
    async fn fresh_deposit_goes_to_participant_zero() {
        let chain = MockChain::new();
        let state = empty_channel();
        let asset = Address::default();
        chain.deposit(state.channel_address(), asset, U256::from(100), 1);

        let rec = reconcile_deposit(&chain, &state, asset).await.unwrap();
        assert_eq!(rec.latest_deposit_nonce, 1);
        assert_eq!(rec.balance.amount, [U256::from(100), U256::zero()]);
    }

    #[tokio::test]
    async fn already_absorbed_record_leaves_participant_zero_unchanged() {
        let chain = MockChain::new();
        let mut state = empty_channel();
        let asset = Address::default();

        chain.deposit(state.channel_address(), asset, U256::from(100), 1);
        state.core.ensure_asset(asset);
        state.core.balances[0].amount = [U256::from(100), U256::zero()];
        state.core.latest_deposit_nonce = 1;

        // Collateral arrives without a new deposit record: it accrues to
        // participant 1.
        chain.deposit(state.channel_address(), asset, U256::from(30), 1);

        let rec = reconcile_deposit(&chain, &state, asset).await.unwrap();
        assert_eq!(rec.latest_deposit_nonce, 1);
        assert_eq!(rec.balance.amount, [U256::from(100), U256::from(30)]);
    }

    #[tokio::test]
    async fn locked_balance_is_held_out_of_participant_one() {
        let chain = MockChain::new();
        let mut state = empty_channel();
        let asset = Address::default();

        chain.deposit(state.channel_address(), asset, U256::from(100), 1);
        state.core.ensure_asset(asset);
        state.core.balances[0].amount = [U256::from(40), U256::zero()];
        state.core.locked_balance[0] = U256::from(20);
        state.core.latest_deposit_nonce = 1;

        chain.deposit(state.channel_address(), asset, U256::from(50), 2);

        let rec = reconcile_deposit(&chain, &state, asset).await.unwrap();
        assert_eq!(rec.latest_deposit_nonce, 2);
        // 150 on chain, 90 to participant 0 (40 + 50), 20 locked.
        assert_eq!(rec.balance.amount, [U256::from(90), U256::from(40)]);
    }
}
