//! Persistence seam.
//!
//! The core hands every accepted round to a storage collaborator: the new
//! full state, the double-signed commitment, and the transfer the round
//! created or removed. The reference implementation here is in-memory; it
//! additionally keeps the append-only commitment log a durable backend
//! would keep, so the replay property stays testable.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;

use crate::abiencode::types::{Address, Bytes32};
use crate::channel::{ChannelUpdate, FullChannelState, FullTransferState, SignedCommitment};
use crate::error::StorageError;

#[async_trait]
pub trait Storage: Send + Sync + 'static {
    async fn load_channel(&self, address: Address) -> Result<Option<FullChannelState>, StorageError>;

    /// Persist a newly accepted state together with its commitment.
    /// Implementations must apply this atomically with respect to
    /// [load_channel][Storage::load_channel].
    async fn save_channel(
        &self,
        state: FullChannelState,
        commitment: SignedCommitment,
    ) -> Result<(), StorageError>;

    async fn load_active_transfers(
        &self,
        channel: Address,
    ) -> Result<Vec<FullTransferState>, StorageError>;

    async fn save_transfer(&self, transfer: FullTransferState) -> Result<(), StorageError>;

    async fn remove_transfer(
        &self,
        channel: Address,
        transfer_id: Bytes32,
    ) -> Result<Option<FullTransferState>, StorageError>;
}

/// One entry of the per-channel commitment log.
#[derive(Debug, Clone)]
pub struct CommitmentRecord {
    pub commitment: SignedCommitment,
    pub update: ChannelUpdate,
}

#[derive(Default)]
struct MemoryInner {
    channels: HashMap<Address, FullChannelState>,
    log: HashMap<Address, Vec<CommitmentRecord>>,
    transfers: HashMap<Address, BTreeMap<Bytes32, FullTransferState>>,
}

/// In-memory storage, one mutex over the whole store so a round's writes
/// are atomic.
#[derive(Default)]
pub struct MemoryStore {
    inner: parking_lot::Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The append-only log of accepted commitments for a channel.
    pub fn commitment_log(&self, channel: Address) -> Vec<CommitmentRecord> {
        self.inner.lock().log.get(&channel).cloned().unwrap_or_default()
    }

    /// Rebuild the latest core state from the log alone and check the
    /// nonce chain along the way. Returns `None` for an unknown channel or
    /// a corrupt log.
    pub fn replay_channel(&self, channel: Address) -> Option<FullChannelState> {
        let inner = self.inner.lock();
        let log = inner.log.get(&channel)?;

        let mut previous_nonce = 0u64;
        for record in log {
            let nonce = record.commitment.commitment.state.nonce;
            if nonce != previous_nonce + 1 {
                return None;
            }
            if record.update.nonce != nonce {
                return None;
            }
            previous_nonce = nonce;
        }

        let last = log.last()?;
        let current = inner.channels.get(&channel)?;
        if current.core != last.commitment.commitment.state {
            return None;
        }
        Some(current.clone())
    }

    /// Directly install a channel state, bypassing the protocol. Test
    /// seam for constructing divergent peers.
    pub fn seed_channel(&self, state: FullChannelState) {
        self.inner
            .lock()
            .channels
            .insert(state.channel_address(), state);
    }
}

#[async_trait]
impl Storage for MemoryStore {
    async fn load_channel(&self, address: Address) -> Result<Option<FullChannelState>, StorageError> {
        Ok(self.inner.lock().channels.get(&address).cloned())
    }

    async fn save_channel(
        &self,
        state: FullChannelState,
        commitment: SignedCommitment,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        let address = state.channel_address();
        if let Some(update) = state.latest_update.clone() {
            inner
                .log
                .entry(address)
                .or_default()
                .push(CommitmentRecord { commitment, update });
        }
        inner.channels.insert(address, state);
        Ok(())
    }

    async fn load_active_transfers(
        &self,
        channel: Address,
    ) -> Result<Vec<FullTransferState>, StorageError> {
        Ok(self
            .inner
            .lock()
            .transfers
            .get(&channel)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn save_transfer(&self, transfer: FullTransferState) -> Result<(), StorageError> {
        self.inner
            .lock()
            .transfers
            .entry(transfer.channel_address)
            .or_default()
            .insert(transfer.transfer_id, transfer);
        Ok(())
    }

    async fn remove_transfer(
        &self,
        channel: Address,
        transfer_id: Bytes32,
    ) -> Result<Option<FullTransferState>, StorageError> {
        Ok(self
            .inner
            .lock()
            .transfers
            .get_mut(&channel)
            .and_then(|m| m.remove(&transfer_id)))
    }
}
