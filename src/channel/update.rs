//! The tagged union of channel updates.
//!
//! Every state advance is one of four kinds. Keeping the kind-specific
//! payload in a sum type makes the transition total by case analysis
//! instead of relying on an untyped details bag.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Balance, Identifier, NetworkContext, PartIdx, PARTICIPANTS};
use crate::abiencode::types::{Address, Bytes32, Signature};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupDetails {
    pub timeout: u64,
    pub network_context: NetworkContext,
    pub participants: [Address; PARTICIPANTS],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepositDetails {
    /// The on-chain deposit nonce this update incorporates.
    pub latest_deposit_nonce: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateDetails {
    pub transfer_id: Bytes32,
    /// Address of the condition program governing this transfer.
    pub transfer_definition: Address,
    pub transfer_initial_state: Value,
    /// ABI encodings of the program's state and resolver types.
    pub transfer_encodings: [String; 2],
    pub transfer_timeout: u64,
    /// The transfer's own balance: what is locked, and who stands to be
    /// paid out. Slot order matches participant order.
    pub balance: Balance,
    #[serde(default)]
    pub meta: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveDetails {
    pub transfer_id: Bytes32,
    /// Witness handed to the condition program (preimage, verdict, ...).
    pub transfer_resolver: Value,
    #[serde(default)]
    pub meta: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "details", rename_all = "lowercase")]
pub enum UpdateDetails {
    Setup(SetupDetails),
    Deposit(DepositDetails),
    Create(CreateDetails),
    Resolve(ResolveDetails),
}

impl UpdateDetails {
    pub fn kind(&self) -> &'static str {
        match self {
            UpdateDetails::Setup(_) => "setup",
            UpdateDetails::Deposit(_) => "deposit",
            UpdateDetails::Create(_) => "create",
            UpdateDetails::Resolve(_) => "resolve",
        }
    }
}

/// One proposed state advance, exchanged between the peers.
///
/// `signatures[0]` always belongs to participant 0 and `signatures[1]` to
/// participant 1, regardless of who proposed the update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelUpdate {
    pub channel_address: Address,
    pub from_identifier: Identifier,
    pub to_identifier: Identifier,
    /// Nonce of the state this update produces.
    pub nonce: u64,
    /// Post-update free balance for `asset_id`.
    pub balance: Balance,
    pub asset_id: Address,
    #[serde(flatten)]
    pub details: UpdateDetails,
    pub signatures: [Option<Signature>; PARTICIPANTS],
}

impl ChannelUpdate {
    pub fn kind(&self) -> &'static str {
        self.details.kind()
    }

    pub fn signature_count(&self) -> usize {
        self.signatures.iter().filter(|s| s.is_some()).count()
    }

    pub fn set_signature(&mut self, idx: PartIdx, sig: Signature) {
        self.signatures[idx] = Some(sig);
    }
}
