//! Error taxonomy of the protocol core.
//!
//! The validator and the transitions never panic; they return structured
//! rejections. The driver folds messaging and collaborator failures into
//! [ProtocolError] with enough context for the caller to decide whether to
//! retry. Everything that arrives over the wire is a recoverable rejection.

use std::collections::BTreeMap;

use serde_json::Value;
use thiserror::Error;

use crate::abiencode::types::{Address, Bytes32};
use crate::channel::{ChannelUpdate, FullChannelState};

/// Structural rejection of a proposed update.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("update nonce {got} does not follow channel nonce (expected {expected})")]
    BadNonce { expected: u64, got: u64 },

    #[error("participant set or channel address changed across the transition")]
    BadParticipants,

    #[error("signature slot {slot} does not recover to its participant")]
    BadSignature { slot: usize },

    #[error("{got} signature(s) present, {required} required")]
    TooFewSignatures { required: usize, got: usize },

    #[error("balances do not conserve for asset {asset:?}")]
    ConservationViolated { asset: Address },

    #[error("locked balance does not match the active transfer set for asset {asset:?}")]
    LockedBalanceMismatch { asset: Address },

    #[error("merkle root does not match the active transfer set")]
    MerkleRootMismatch,

    #[error("deposit nonce {proposed} does not advance past {current}")]
    BadDepositNonce { current: u64, proposed: u64 },

    #[error("insufficient free balance for asset {asset:?}")]
    InsufficientFunds { asset: Address },

    #[error("transfer timeout exceeds the channel dispute window")]
    TransferTimeoutExceedsChannel,

    #[error("setup proposed for a channel that already exists")]
    ChannelExists,

    #[error("no channel state for a non-setup update")]
    ChannelNotFound,

    #[error("transfer {transfer_id:?} is already active")]
    TransferAlreadyActive { transfer_id: Bytes32 },

    #[error("transfer {transfer_id:?} is not active in this channel")]
    TransferNotActive { transfer_id: Bytes32 },

    #[error("condition program verdict missing for a resolve update")]
    ProgramVerdictMissing,
}

/// Messaging-layer failures. Retriable at the driver's discretion, always
/// with a fresh inbox.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MessagingError {
    #[error("timed out waiting for a protocol reply")]
    Timeout,

    #[error("messaging failure: {0}")]
    Unknown(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("chain read failed: {0}")]
pub struct ChainError(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("storage operation failed: {0}")]
pub struct StorageError(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("signer failure: {0}")]
pub struct SignerError(pub String);

/// Everything a protocol round can fail with.
#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Messaging(#[from] MessagingError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The responder's nonce is ahead of ours. Carries the responder's
    /// latest accepted update and double-signed state, which one
    /// resynchronization attempt may absorb.
    #[error("counterparty state is ahead of ours")]
    StaleUpdate {
        latest_update: Option<Box<ChannelUpdate>>,
        latest_state: Option<Box<FullChannelState>>,
    },

    /// The responder is behind us and has to catch up before this update
    /// can land.
    #[error("counterparty is missing updates (their nonce: {counterparty_nonce})")]
    MissingUpdates { counterparty_nonce: u64 },

    #[error("condition program rejected the transfer: {0}")]
    TransferNotAccepted(String),

    /// A rejection reported by the counterparty that does not map onto a
    /// local variant. Surfaced unaltered.
    #[error("counterparty rejected the update: {}", .0.reason)]
    Rejected(WireError),

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Signer(#[from] SignerError),
}

/// The single structured error object every failed operation surfaces, and
/// the error payload of a protocol reply.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct WireError {
    pub reason: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub context: BTreeMap<String, Value>,
}

impl WireError {
    pub fn new(reason: impl Into<String>) -> Self {
        WireError {
            reason: reason.into(),
            context: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.context.insert(key.to_string(), value.into());
        self
    }

    pub fn with_json<T: serde::Serialize>(mut self, key: &str, value: &T) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.to_string(), v);
        }
        self
    }
}

impl ProtocolError {
    /// Stable reason tag used on the wire.
    pub fn reason(&self) -> &'static str {
        match self {
            ProtocolError::Messaging(MessagingError::Timeout) => "MessagingTimeout",
            ProtocolError::Messaging(MessagingError::Unknown(_)) => "MessagingUnknown",
            ProtocolError::Validation(e) => match e {
                ValidationError::BadNonce { .. } => "BadNonce",
                ValidationError::BadParticipants => "BadParticipants",
                ValidationError::BadSignature { .. }
                | ValidationError::TooFewSignatures { .. } => "BadSignature",
                ValidationError::ConservationViolated { .. }
                | ValidationError::InsufficientFunds { .. } => "ConservationViolated",
                ValidationError::LockedBalanceMismatch { .. } => "LockedBalanceMismatch",
                ValidationError::MerkleRootMismatch => "MerkleRootMismatch",
                ValidationError::BadDepositNonce { .. } => "BadDepositNonce",
                ValidationError::TransferTimeoutExceedsChannel => "TransferTimeoutExceedsChannel",
                ValidationError::ChannelExists => "ChannelExists",
                ValidationError::ChannelNotFound => "ChannelNotFound",
                ValidationError::TransferAlreadyActive { .. } => "TransferAlreadyActive",
                ValidationError::TransferNotActive { .. } => "TransferNotActive",
                ValidationError::ProgramVerdictMissing => "ProgramVerdictMissing",
            },
            ProtocolError::StaleUpdate { .. } => "StaleUpdate",
            ProtocolError::MissingUpdates { .. } => "MissingUpdates",
            ProtocolError::TransferNotAccepted(_) => "TransferNotAccepted",
            ProtocolError::Rejected(_) => "Rejected",
            ProtocolError::Chain(_) => "ChainError",
            ProtocolError::Storage(_) => "StorageError",
            ProtocolError::Signer(_) => "SignerError",
        }
    }

    /// Lower into the wire error object sent back to the counterparty.
    pub fn to_wire(&self) -> WireError {
        let mut wire = WireError::new(self.reason()).with("message", self.to_string());
        match self {
            ProtocolError::StaleUpdate {
                latest_update,
                latest_state,
            } => {
                if let Some(u) = latest_update {
                    wire = wire.with_json("update", u);
                }
                if let Some(s) = latest_state {
                    wire = wire.with_json("state", s);
                }
            }
            ProtocolError::MissingUpdates { counterparty_nonce } => {
                wire = wire.with("nonce", *counterparty_nonce);
            }
            _ => {}
        }
        wire
    }

    /// Raise a received wire error back into a protocol error. Reasons
    /// without a local counterpart stay [ProtocolError::Rejected].
    pub fn from_wire(wire: WireError) -> Self {
        match wire.reason.as_str() {
            "StaleUpdate" => {
                let latest_update = wire
                    .context
                    .get("update")
                    .and_then(|v| serde_json::from_value(v.clone()).ok())
                    .map(Box::new);
                let latest_state = wire
                    .context
                    .get("state")
                    .and_then(|v| serde_json::from_value(v.clone()).ok())
                    .map(Box::new);
                ProtocolError::StaleUpdate {
                    latest_update,
                    latest_state,
                }
            }
            "MissingUpdates" => ProtocolError::MissingUpdates {
                counterparty_nonce: wire
                    .context
                    .get("nonce")
                    .and_then(Value::as_u64)
                    .unwrap_or_default(),
            },
            "MessagingTimeout" => ProtocolError::Messaging(MessagingError::Timeout),
            _ => ProtocolError::Rejected(wire),
        }
    }
}
