//! The channel data model: states, updates, transfers and commitments.

mod commitment;
mod merkle;
mod state;
mod transfer;
mod update;

use core::fmt;

use serde::{Deserialize, Serialize};

pub use commitment::{ChannelCommitment, SignedCommitment};
pub use merkle::{active_transfer_root, merkle_root};
pub use state::{derive_channel_address, Balance, CoreChannelState, FullChannelState, NetworkContext};
pub use transfer::FullTransferState;
pub use update::{
    ChannelUpdate, CreateDetails, DepositDetails, ResolveDetails, SetupDetails, UpdateDetails,
};

/// Index of a participant in the channel.
///
/// `0` ("alice") is the participant that initiated setup; `1` ("bob") is the
/// counterparty. The order never changes for the life of the channel and is
/// the index used in every signature array.
pub type PartIdx = usize;

pub const PARTICIPANTS: usize = 2;

/// Long-lived public identifier of a participant, used for routing protocol
/// messages. Distinct from the short on-chain [Address][crate::Address] used
/// for signature recovery.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identifier(pub String);

impl Identifier {
    pub fn new(s: impl Into<String>) -> Self {
        Identifier(s.into())
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
