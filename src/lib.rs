//! Off-chain two-party state-channel protocol core.
//!
//! Two participants advance a shared channel state through signed updates
//! (setup, deposit, transfer create/resolve). Every accepted update yields
//! a double-signed commitment that either side could hand to the on-chain
//! adjudicator if the other disappears. This crate owns the parts where
//! correctness is hard: the commitment encoding and signature discipline,
//! the update state machine and its invariants, the correlated update
//! exchange, deposit reconciliation and the transfer lifecycle. Transports,
//! storage backends, chain access and policy stay behind the traits in
//! [messaging], [storage] and [chain].

pub mod abiencode {
    pub mod ser;
    pub mod types;

    mod hashing;
    pub use hashing::{keccak256, to_hash};

    #[cfg(test)]
    mod tests;
}

pub mod sig;

pub mod channel;

pub mod error;

pub mod transition;

pub mod validate;

pub mod reconcile;

pub mod chain;

pub mod storage;

pub mod programs;

pub mod messaging;

pub mod engine;

pub use abiencode::types::{Address, Bytes32, Hash, Signature, U256};
pub use channel::{FullChannelState, FullTransferState, Identifier};
pub use engine::{ChannelEngine, ChannelEvent, EngineConfig};
pub use error::{ProtocolError, ValidationError};
