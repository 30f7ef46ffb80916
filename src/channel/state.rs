//! Core and full channel state.
//!
//! Only [CoreChannelState] enters the commitment preimage; the full state
//! adds off-chain bookkeeping (identifiers, network context, the last
//! accepted update) that never gets signed.

use serde::{Deserialize, Serialize};

use super::{ChannelUpdate, Identifier, PartIdx, PARTICIPANTS};
use crate::abiencode::{
    keccak256,
    ser::{Token, Tokenize},
    types::{Address, Hash, U256},
};

/// Per-asset two-slot balance. Slot order matches participant order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub to: [Address; PARTICIPANTS],
    pub amount: [U256; PARTICIPANTS],
}

impl Balance {
    pub fn empty(participants: [Address; PARTICIPANTS]) -> Self {
        Balance {
            to: participants,
            amount: [U256::zero(); PARTICIPANTS],
        }
    }

    /// Sum of both slots, or `None` on overflow.
    pub fn total(&self) -> Option<U256> {
        self.amount[0].checked_add(self.amount[1])
    }
}

impl Tokenize for Balance {
    fn tokenize(&self) -> Token {
        Token::Tuple(vec![
            Token::Array(self.to.iter().copied().map(Token::Address).collect()),
            Token::Array(self.amount.iter().copied().map(Token::Uint).collect()),
        ])
    }
}

/// Chain id and adjudicator contract that will rule on this channel's signed
/// commitments if a dispute occurs. Immutable for the life of the channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkContext {
    pub chain_id: U256,
    pub adjudicator_address: Address,
}

/// The state both participants actually sign.
///
/// Field order is part of the commitment encoding; do not reorder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoreChannelState {
    pub channel_address: Address,
    pub participants: [Address; PARTICIPANTS],
    pub timeout: u64,
    pub balances: Vec<Balance>,
    pub locked_balance: Vec<U256>,
    pub asset_ids: Vec<Address>,
    pub nonce: u64,
    pub latest_deposit_nonce: u64,
    pub merkle_root: Hash,
}

impl CoreChannelState {
    pub fn asset_index(&self, asset_id: Address) -> Option<usize> {
        self.asset_ids.iter().position(|a| *a == asset_id)
    }

    /// Index for `asset_id`, appending zeroed entries to every parallel
    /// list if the asset is not yet known.
    pub fn ensure_asset(&mut self, asset_id: Address) -> usize {
        match self.asset_index(asset_id) {
            Some(idx) => idx,
            None => {
                self.asset_ids.push(asset_id);
                self.balances.push(Balance::empty(self.participants));
                self.locked_balance.push(U256::zero());
                self.asset_ids.len() - 1
            }
        }
    }

    pub fn participant_index(&self, addr: Address) -> Option<PartIdx> {
        self.participants.iter().position(|p| *p == addr)
    }
}

impl Tokenize for CoreChannelState {
    fn tokenize(&self) -> Token {
        Token::Tuple(vec![
            Token::Address(self.channel_address),
            Token::Array(self.participants.iter().copied().map(Token::Address).collect()),
            Token::uint(self.timeout),
            Token::Array(self.balances.iter().map(Tokenize::tokenize).collect()),
            Token::Array(self.locked_balance.iter().copied().map(Token::Uint).collect()),
            Token::Array(self.asset_ids.iter().copied().map(Token::Address).collect()),
            Token::uint(self.nonce),
            Token::uint(self.latest_deposit_nonce),
            Token::FixedBytes(crate::abiencode::types::Bytes32(self.merkle_root.0)),
        ])
    }
}

/// Deterministic channel id: a function of the participant pair and the
/// network context, so both peers derive the same address without talking.
pub fn derive_channel_address(
    participants: &[Address; PARTICIPANTS],
    network_context: &NetworkContext,
) -> Address {
    let preimage = Token::Tuple(vec![
        Token::Array(participants.iter().copied().map(Token::Address).collect()),
        Token::Uint(network_context.chain_id),
        Token::Address(network_context.adjudicator_address),
    ]);
    let hash = keccak256(&crate::abiencode::ser::encode(&preimage));
    let mut addr = Address::default();
    addr.0.copy_from_slice(&hash.0[32 - 20..]);
    addr
}

/// Core state plus the off-chain bookkeeping that never enters the
/// commitment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FullChannelState {
    #[serde(flatten)]
    pub core: CoreChannelState,
    pub public_identifiers: [Identifier; PARTICIPANTS],
    pub network_context: NetworkContext,
    pub latest_update: Option<ChannelUpdate>,
}

impl FullChannelState {
    pub fn channel_address(&self) -> Address {
        self.core.channel_address
    }

    pub fn nonce(&self) -> u64 {
        self.core.nonce
    }

    /// Participant index of a routing identifier.
    pub fn index_of_identifier(&self, id: &Identifier) -> Option<PartIdx> {
        self.public_identifiers.iter().position(|p| p == id)
    }

    pub fn counterparty_of(&self, id: &Identifier) -> Option<&Identifier> {
        match self.index_of_identifier(id)? {
            0 => Some(&self.public_identifiers[1]),
            _ => Some(&self.public_identifiers[0]),
        }
    }
}
