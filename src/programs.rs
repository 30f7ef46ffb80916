//! Condition program execution.
//!
//! A transfer's `transfer_definition` names a program whose `create` and
//! `resolve` behaviors define the transfer's semantics. Execution prefers
//! the local mode: a registry of native implementations keyed by definition
//! address, the channel's own copy of the program. Any local failure or an
//! unknown definition falls back to invoking the deployed contract through
//! the chain reader; both modes must agree for a well-formed program.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use sha3::{Digest, Keccak256};
use thiserror::Error;
use tracing::debug;

use crate::abiencode::types::{Address, Bytes32, U256};
use crate::chain::ChainReader;
use crate::channel::Balance;
use crate::error::ProtocolError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProgramError {
    #[error("malformed program state: {0}")]
    State(String),

    #[error("malformed resolver: {0}")]
    Resolver(String),
}

/// A condition program executed locally.
///
/// `create` vets a proposed lock; `resolve` turns the initial state and a
/// resolver witness into the final balance split. Both must be pure.
pub trait TransferProgram: Send + Sync + 'static {
    fn create(&self, initial_state: &Value, balance: &Balance) -> Result<bool, ProgramError>;

    fn resolve(
        &self,
        initial_state: &Value,
        balance: &Balance,
        resolver: &Value,
    ) -> Result<Balance, ProgramError>;
}

/// Local copies of condition programs, keyed by definition address.
#[derive(Default, Clone)]
pub struct ProgramRegistry {
    programs: HashMap<Address, Arc<dyn TransferProgram>>,
}

impl ProgramRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, definition: Address, program: Arc<dyn TransferProgram>) {
        self.programs.insert(definition, program);
    }

    pub fn get(&self, definition: Address) -> Option<&Arc<dyn TransferProgram>> {
        self.programs.get(&definition)
    }
}

/// Two-mode executor: local registry first, chain reader on any miss or
/// error.
pub struct ProgramExecutor<C: ChainReader> {
    registry: ProgramRegistry,
    chain: Arc<C>,
}

impl<C: ChainReader> ProgramExecutor<C> {
    pub fn new(registry: ProgramRegistry, chain: Arc<C>) -> Self {
        ProgramExecutor { registry, chain }
    }

    pub async fn create(
        &self,
        definition: Address,
        chain_id: U256,
        initial_state: &Value,
        balance: &Balance,
    ) -> Result<bool, ProtocolError> {
        if let Some(program) = self.registry.get(definition) {
            match program.create(initial_state, balance) {
                Ok(verdict) => return Ok(verdict),
                Err(e) => {
                    debug!(?definition, error = %e, "local create failed, falling back to chain");
                }
            }
        }
        self.require_deployed(definition, chain_id).await?;
        Ok(self
            .chain
            .call_transfer_create(definition, chain_id, initial_state, balance)
            .await?)
    }

    pub async fn resolve(
        &self,
        definition: Address,
        chain_id: U256,
        initial_state: &Value,
        balance: &Balance,
        resolver: &Value,
    ) -> Result<Balance, ProtocolError> {
        if let Some(program) = self.registry.get(definition) {
            match program.resolve(initial_state, balance, resolver) {
                Ok(split) => return Ok(split),
                Err(e) => {
                    debug!(?definition, error = %e, "local resolve failed, falling back to chain");
                }
            }
        }
        self.require_deployed(definition, chain_id).await?;
        Ok(self
            .chain
            .call_transfer_resolve(definition, chain_id, initial_state, balance, resolver)
            .await?)
    }

    async fn require_deployed(
        &self,
        definition: Address,
        chain_id: U256,
    ) -> Result<(), ProtocolError> {
        let code = self.chain.get_code(definition, chain_id).await?;
        if code.is_empty() {
            return Err(crate::error::ChainError(format!(
                "no program deployed at {definition:?}"
            ))
            .into());
        }
        Ok(())
    }
}

/// Preimage-reveal program: locks against a Keccak-256 hash, pays the
/// recipient slot in full on a matching preimage, refunds the sender on the
/// all-zero cancel preimage.
///
/// Initial state: `{"lockHash": "0x…32 bytes"}`. Resolver:
/// `{"preImage": "0x…32 bytes"}`. Slot 0 of the transfer balance is the
/// sender, slot 1 the recipient.
pub struct HashlockProgram;

impl HashlockProgram {
    fn lock_hash(initial_state: &Value) -> Result<Bytes32, ProgramError> {
        let raw = initial_state
            .get("lockHash")
            .and_then(Value::as_str)
            .ok_or_else(|| ProgramError::State("missing lockHash".into()))?;
        Bytes32::from_hex(raw).map_err(|e| ProgramError::State(e.to_string()))
    }

    fn preimage(resolver: &Value) -> Result<Bytes32, ProgramError> {
        let raw = resolver
            .get("preImage")
            .and_then(Value::as_str)
            .ok_or_else(|| ProgramError::Resolver("missing preImage".into()))?;
        Bytes32::from_hex(raw).map_err(|e| ProgramError::Resolver(e.to_string()))
    }
}

impl TransferProgram for HashlockProgram {
    fn create(&self, initial_state: &Value, balance: &Balance) -> Result<bool, ProgramError> {
        let lock = Self::lock_hash(initial_state)?;
        // Nothing may be pre-allocated to the recipient.
        Ok(!lock.is_zero() && balance.amount[1].is_zero())
    }

    fn resolve(
        &self,
        initial_state: &Value,
        balance: &Balance,
        resolver: &Value,
    ) -> Result<Balance, ProgramError> {
        let lock = Self::lock_hash(initial_state)?;
        let preimage = Self::preimage(resolver)?;

        // The all-zero preimage cancels: the sender keeps the lock.
        if preimage.is_zero() {
            return Ok(balance.clone());
        }

        let digest: [u8; 32] = Keccak256::digest(preimage.0).into();
        if digest != lock.0 {
            return Err(ProgramError::Resolver("preimage does not open the lock".into()));
        }

        let total = balance
            .total()
            .ok_or_else(|| ProgramError::State("locked amount overflows".into()))?;
        Ok(Balance {
            to: balance.to,
            amount: [U256::zero(), total],
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn lock_for(preimage: Bytes32) -> Bytes32 {
        Bytes32(Keccak256::digest(preimage.0).into())
    }

    fn balance(locked: u64) -> Balance {
        Balance {
            to: [rand::random(), rand::random()],
            amount: [U256::from(locked), U256::zero()],
        }
    }

    #[test]
    fn create_accepts_a_real_lock() {
        let preimage: Bytes32 = rand::random();
        let state = json!({ "lockHash": lock_for(preimage).to_hex() });
        assert!(HashlockProgram.create(&state, &balance(40)).unwrap());
    }

    #[test]
    fn create_rejects_zero_lock() {
        let state = json!({ "lockHash": Bytes32::default().to_hex() });
        assert!(!HashlockProgram.create(&state, &balance(40)).unwrap());
    }

    #[test]
    fn correct_preimage_pays_the_recipient() {
        let preimage: Bytes32 = rand::random();
        let state = json!({ "lockHash": lock_for(preimage).to_hex() });
        let resolver = json!({ "preImage": preimage.to_hex() });

        let split = HashlockProgram
            .resolve(&state, &balance(40), &resolver)
            .unwrap();
        assert_eq!(split.amount, [U256::zero(), U256::from(40)]);
    }

    #[test]
    fn wrong_preimage_is_rejected() {
        let preimage: Bytes32 = rand::random();
        let state = json!({ "lockHash": lock_for(preimage).to_hex() });
        let resolver = json!({ "preImage": Bytes32([0x11; 32]).to_hex() });

        assert!(HashlockProgram
            .resolve(&state, &balance(40), &resolver)
            .is_err());
    }

    #[test]
    fn zero_preimage_cancels_back_to_sender() {
        let preimage: Bytes32 = rand::random();
        let state = json!({ "lockHash": lock_for(preimage).to_hex() });
        let resolver = json!({ "preImage": Bytes32::default().to_hex() });

        let initial = balance(40);
        let split = HashlockProgram.resolve(&state, &initial, &resolver).unwrap();
        assert_eq!(split, initial);
    }
}
