//! Pure state transitions, one clause per update kind.
//!
//! `apply_update` never touches I/O. The one transition that depends on an
//! external verdict (resolve, whose balance split comes from the condition
//! program) receives that verdict through [UpdateContext], computed by the
//! driver before the transition runs.

use crate::abiencode::types::U256;
use crate::channel::{
    active_transfer_root, derive_channel_address, Balance, ChannelUpdate, CoreChannelState,
    FullChannelState, FullTransferState, UpdateDetails,
};
use crate::error::ValidationError;

/// Everything a transition may consult besides the previous state and the
/// update itself.
#[derive(Debug, Clone, Copy, Default)]
pub struct UpdateContext<'a> {
    /// The channel's currently active transfers (pre-update).
    pub active: &'a [FullTransferState],
    /// Final balance split returned by the condition program, required for
    /// resolve updates.
    pub resolve_balance: Option<&'a Balance>,
}

/// Side effect of a transition on the active-transfer set.
#[derive(Debug, Clone)]
pub enum TransferEffect {
    Created(FullTransferState),
    Resolved {
        transfer: FullTransferState,
        final_balance: Balance,
    },
}

/// Result of a successful transition.
#[derive(Debug, Clone)]
pub struct Applied {
    pub state: FullChannelState,
    pub effect: Option<TransferEffect>,
}

/// Apply `update` to `prev`, producing the next state.
///
/// Deterministic: equal inputs produce equal outputs. Kind-specific
/// preconditions are enforced here and surface as structured rejections.
pub fn apply_update(
    prev: Option<&FullChannelState>,
    update: &ChannelUpdate,
    ctx: &UpdateContext<'_>,
) -> Result<Applied, ValidationError> {
    match &update.details {
        UpdateDetails::Setup(details) => {
            if prev.is_some() {
                return Err(ValidationError::ChannelExists);
            }
            apply_setup(update, details)
        }
        UpdateDetails::Deposit(details) => {
            let prev = prev.ok_or(ValidationError::ChannelNotFound)?;
            apply_deposit(prev, update, details)
        }
        UpdateDetails::Create(details) => {
            let prev = prev.ok_or(ValidationError::ChannelNotFound)?;
            apply_create(prev, update, details, ctx)
        }
        UpdateDetails::Resolve(details) => {
            let prev = prev.ok_or(ValidationError::ChannelNotFound)?;
            apply_resolve(prev, update, details, ctx)
        }
    }
}

fn apply_setup(
    update: &ChannelUpdate,
    details: &crate::channel::SetupDetails,
) -> Result<Applied, ValidationError> {
    let channel_address = derive_channel_address(&details.participants, &details.network_context);

    let core = CoreChannelState {
        channel_address,
        participants: details.participants,
        timeout: details.timeout,
        balances: Vec::new(),
        locked_balance: Vec::new(),
        asset_ids: Vec::new(),
        nonce: 1,
        latest_deposit_nonce: 0,
        merkle_root: Default::default(),
    };

    let state = FullChannelState {
        core,
        public_identifiers: [update.from_identifier.clone(), update.to_identifier.clone()],
        network_context: details.network_context.clone(),
        latest_update: Some(update.clone()),
    };

    Ok(Applied {
        state,
        effect: None,
    })
}

fn apply_deposit(
    prev: &FullChannelState,
    update: &ChannelUpdate,
    details: &crate::channel::DepositDetails,
) -> Result<Applied, ValidationError> {
    if details.latest_deposit_nonce <= prev.core.latest_deposit_nonce {
        return Err(ValidationError::BadDepositNonce {
            current: prev.core.latest_deposit_nonce,
            proposed: details.latest_deposit_nonce,
        });
    }
    if update.balance.to != prev.core.participants {
        return Err(ValidationError::BadParticipants);
    }

    let mut state = prev.clone();
    let idx = state.core.ensure_asset(update.asset_id);
    // The proposer computed this balance pair from the on-chain view; the
    // transition takes it as given and replaces the asset's entries.
    state.core.balances[idx] = update.balance.clone();
    state.core.latest_deposit_nonce = details.latest_deposit_nonce;
    state.core.nonce = prev.core.nonce + 1;
    state.latest_update = Some(update.clone());

    Ok(Applied {
        state,
        effect: None,
    })
}

fn apply_create(
    prev: &FullChannelState,
    update: &ChannelUpdate,
    details: &crate::channel::CreateDetails,
    ctx: &UpdateContext<'_>,
) -> Result<Applied, ValidationError> {
    if ctx.active.iter().any(|t| t.transfer_id == details.transfer_id) {
        return Err(ValidationError::TransferAlreadyActive {
            transfer_id: details.transfer_id,
        });
    }
    if details.transfer_timeout > prev.core.timeout {
        return Err(ValidationError::TransferTimeoutExceedsChannel);
    }

    let locked = details
        .balance
        .total()
        .ok_or(ValidationError::ConservationViolated {
            asset: update.asset_id,
        })?;
    let proposer = prev
        .index_of_identifier(&update.from_identifier)
        .ok_or(ValidationError::BadParticipants)?;

    let mut state = prev.clone();
    let idx = state.core.ensure_asset(update.asset_id);

    let free = &mut state.core.balances[idx];
    free.amount[proposer] =
        free.amount[proposer]
            .checked_sub(locked)
            .ok_or(ValidationError::InsufficientFunds {
                asset: update.asset_id,
            })?;
    state.core.locked_balance[idx] = state.core.locked_balance[idx]
        .checked_add(locked)
        .ok_or(ValidationError::ConservationViolated {
            asset: update.asset_id,
        })?;

    let transfer =
        FullTransferState::from_create(prev.core.channel_address, update.asset_id, details);

    let mut active: Vec<FullTransferState> = ctx.active.to_vec();
    active.push(transfer.clone());
    state.core.merkle_root = active_transfer_root(&active);
    state.core.nonce = prev.core.nonce + 1;
    state.latest_update = Some(update.clone());

    Ok(Applied {
        state,
        effect: Some(TransferEffect::Created(transfer)),
    })
}

fn apply_resolve(
    prev: &FullChannelState,
    update: &ChannelUpdate,
    details: &crate::channel::ResolveDetails,
    ctx: &UpdateContext<'_>,
) -> Result<Applied, ValidationError> {
    let transfer = ctx
        .active
        .iter()
        .find(|t| t.transfer_id == details.transfer_id)
        .ok_or(ValidationError::TransferNotActive {
            transfer_id: details.transfer_id,
        })?;
    if update.asset_id != transfer.asset_id {
        return Err(ValidationError::ConservationViolated {
            asset: update.asset_id,
        });
    }

    let final_balance = ctx
        .resolve_balance
        .ok_or(ValidationError::ProgramVerdictMissing)?;
    let locked = transfer
        .locked_value()
        .ok_or(ValidationError::LockedBalanceMismatch {
            asset: transfer.asset_id,
        })?;
    // The program redistributes exactly what was locked, nothing more.
    let released = final_balance
        .total()
        .ok_or(ValidationError::ConservationViolated {
            asset: update.asset_id,
        })?;
    if released != locked {
        return Err(ValidationError::ConservationViolated {
            asset: update.asset_id,
        });
    }

    let mut state = prev.clone();
    let idx = state
        .core
        .asset_index(transfer.asset_id)
        .ok_or(ValidationError::LockedBalanceMismatch {
            asset: transfer.asset_id,
        })?;

    state.core.locked_balance[idx] = state.core.locked_balance[idx]
        .checked_sub(locked)
        .ok_or(ValidationError::LockedBalanceMismatch {
            asset: transfer.asset_id,
        })?;

    for slot in 0..final_balance.to.len() {
        let amount = final_balance.amount[slot];
        if amount == U256::zero() {
            continue;
        }
        let pidx = state
            .core
            .participant_index(final_balance.to[slot])
            .ok_or(ValidationError::ConservationViolated {
                asset: update.asset_id,
            })?;
        let free = &mut state.core.balances[idx];
        free.amount[pidx] =
            free.amount[pidx]
                .checked_add(amount)
                .ok_or(ValidationError::ConservationViolated {
                    asset: update.asset_id,
                })?;
    }

    let active: Vec<FullTransferState> = ctx
        .active
        .iter()
        .filter(|t| t.transfer_id != details.transfer_id)
        .cloned()
        .collect();
    state.core.merkle_root = active_transfer_root(&active);
    state.core.nonce = prev.core.nonce + 1;
    state.latest_update = Some(update.clone());

    let mut resolved = transfer.clone();
    resolved.transfer_resolver = Some(details.transfer_resolver.clone());

    Ok(Applied {
        state,
        effect: Some(TransferEffect::Resolved {
            transfer: resolved,
            final_balance: final_balance.clone(),
        }),
    })
}
