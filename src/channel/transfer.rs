//! Conditionally locked sub-balances within a channel.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Balance, PARTICIPANTS};
use crate::abiencode::{
    keccak256, to_hash,
    ser::{Token, Tokenize},
    types::{Address, Bytes32, Hash, U256},
};

/// A transfer created by a CREATE update and removed again by RESOLVE.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FullTransferState {
    pub transfer_id: Bytes32,
    pub channel_address: Address,
    pub transfer_definition: Address,
    pub transfer_encodings: [String; 2],
    pub transfer_initial_state: Value,
    /// Set once the transfer has been resolved.
    pub transfer_resolver: Option<Value>,
    pub transfer_timeout: u64,
    pub asset_id: Address,
    /// Expected payout of the two participants; the sum is the locked
    /// amount.
    pub balance: Balance,
}

impl FullTransferState {
    /// The transfer a CREATE update describes, before it is applied.
    pub fn from_create(
        channel_address: Address,
        asset_id: Address,
        details: &super::CreateDetails,
    ) -> Self {
        FullTransferState {
            transfer_id: details.transfer_id,
            channel_address,
            transfer_definition: details.transfer_definition,
            transfer_encodings: details.transfer_encodings.clone(),
            transfer_initial_state: details.transfer_initial_state.clone(),
            transfer_resolver: None,
            transfer_timeout: details.transfer_timeout,
            asset_id,
            balance: details.balance.clone(),
        }
    }

    /// Amount held out of the free balance while this transfer is active.
    pub fn locked_value(&self) -> Option<U256> {
        self.balance.total()
    }

    /// Digest of the program-defined initial state.
    ///
    /// The initial state is opaque to the channel core, so it enters the
    /// leaf as the hash of its canonical JSON bytes rather than as typed
    /// ABI fields.
    pub fn initial_state_digest(&self) -> Hash {
        let bytes = serde_json::to_vec(&self.transfer_initial_state).unwrap_or_default();
        keccak256(&bytes)
    }

    /// The leaf this transfer contributes to the channel's merkle root.
    pub fn commitment_hash(&self) -> Hash {
        to_hash(&Token::Tuple(vec![
            Token::Address(self.channel_address),
            Token::FixedBytes(self.transfer_id),
            Token::Address(self.transfer_definition),
            Token::uint(self.transfer_timeout),
            Token::Address(self.asset_id),
            self.balance.tokenize(),
            Token::FixedBytes(Bytes32(self.initial_state_digest().0)),
        ]))
    }

    /// Participant addresses in slot order, as recorded at creation.
    pub fn participants(&self) -> [Address; PARTICIPANTS] {
        self.balance.to
    }
}
