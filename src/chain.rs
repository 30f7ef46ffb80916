//! Read-only view of the chain.
//!
//! The core never submits transactions; it only reads balances, deposit
//! records and contract code, and invokes condition programs on deployed
//! contracts as the fallback execution mode.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;

use crate::abiencode::types::{Address, U256};
use crate::channel::Balance;
use crate::error::ChainError;

/// The latest on-chain deposit the chain knows about for one asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OnchainDeposit {
    pub amount: U256,
    pub nonce: u64,
}

#[async_trait]
pub trait ChainReader: Send + Sync + 'static {
    /// Current collateral held by the adjudicator for this channel/asset.
    async fn get_channel_onchain_balance(
        &self,
        channel: Address,
        chain_id: U256,
        asset_id: Address,
    ) -> Result<U256, ChainError>;

    /// Latest deposit record with a nonce greater than or equal to
    /// `since_nonce`, or the record at `since_nonce` if nothing newer
    /// exists.
    async fn get_latest_deposit_by_asset(
        &self,
        channel: Address,
        chain_id: U256,
        asset_id: Address,
        since_nonce: u64,
    ) -> Result<OnchainDeposit, ChainError>;

    /// Deployed bytecode at `address`; empty bytes mean undeployed.
    async fn get_code(&self, address: Address, chain_id: U256) -> Result<Vec<u8>, ChainError>;

    async fn get_gas_price(&self, chain_id: U256) -> Result<U256, ChainError>;

    /// Invoke `create` on a deployed condition program.
    async fn call_transfer_create(
        &self,
        definition: Address,
        chain_id: U256,
        initial_state: &Value,
        balance: &Balance,
    ) -> Result<bool, ChainError>;

    /// Invoke `resolve` on a deployed condition program.
    async fn call_transfer_resolve(
        &self,
        definition: Address,
        chain_id: U256,
        initial_state: &Value,
        balance: &Balance,
        resolver: &Value,
    ) -> Result<Balance, ChainError>;
}

/// Scriptable chain fake for tests and loopback deployments.
#[derive(Default)]
pub struct MockChain {
    inner: Mutex<MockChainInner>,
}

#[derive(Default)]
struct MockChainInner {
    balances: HashMap<(Address, Address), U256>,
    deposits: HashMap<(Address, Address), OnchainDeposit>,
    code: HashMap<Address, Vec<u8>>,
    gas_price: U256,
}

impl MockChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a deposit: bumps the channel's on-chain balance and the
    /// per-asset deposit record.
    pub fn deposit(&self, channel: Address, asset_id: Address, amount: U256, nonce: u64) {
        let mut inner = self.inner.lock();
        let balance = inner.balances.entry((channel, asset_id)).or_default();
        *balance = balance.saturating_add(amount);
        inner
            .deposits
            .insert((channel, asset_id), OnchainDeposit { amount, nonce });
    }

    pub fn set_code(&self, address: Address, code: Vec<u8>) {
        self.inner.lock().code.insert(address, code);
    }
}

#[async_trait]
impl ChainReader for MockChain {
    async fn get_channel_onchain_balance(
        &self,
        channel: Address,
        _chain_id: U256,
        asset_id: Address,
    ) -> Result<U256, ChainError> {
        Ok(self
            .inner
            .lock()
            .balances
            .get(&(channel, asset_id))
            .copied()
            .unwrap_or_default())
    }

    async fn get_latest_deposit_by_asset(
        &self,
        channel: Address,
        _chain_id: U256,
        asset_id: Address,
        _since_nonce: u64,
    ) -> Result<OnchainDeposit, ChainError> {
        Ok(self
            .inner
            .lock()
            .deposits
            .get(&(channel, asset_id))
            .copied()
            .unwrap_or_default())
    }

    async fn get_code(&self, address: Address, _chain_id: U256) -> Result<Vec<u8>, ChainError> {
        Ok(self.inner.lock().code.get(&address).cloned().unwrap_or_default())
    }

    async fn get_gas_price(&self, _chain_id: U256) -> Result<U256, ChainError> {
        Ok(self.inner.lock().gas_price)
    }

    async fn call_transfer_create(
        &self,
        definition: Address,
        _chain_id: U256,
        _initial_state: &Value,
        _balance: &Balance,
    ) -> Result<bool, ChainError> {
        Err(ChainError(format!(
            "no deployed program at {definition:?} in mock chain"
        )))
    }

    async fn call_transfer_resolve(
        &self,
        definition: Address,
        _chain_id: U256,
        _initial_state: &Value,
        _balance: &Balance,
        _resolver: &Value,
    ) -> Result<Balance, ChainError> {
        Err(ChainError(format!(
            "no deployed program at {definition:?} in mock chain"
        )))
    }
}
