//! The protocol driver.
//!
//! Orchestrates full update rounds between the two peers. The initiator
//! builds and signs an update, sends it, and persists the counter-signed
//! result; the responder validates, counter-signs or rejects. At most one
//! round is in flight per channel: every round runs under the channel's
//! exclusive lease, and concurrent attempts on the same channel queue
//! behind it. Different channels advance independently.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::broadcast;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, warn};

use crate::abiencode::types::{Address, Bytes32};
use crate::chain::ChainReader;
use crate::channel::{
    derive_channel_address, Balance, ChannelCommitment, ChannelUpdate, CreateDetails,
    DepositDetails, FullChannelState, FullTransferState, Identifier, NetworkContext,
    ResolveDetails, SetupDetails, SignedCommitment, UpdateDetails,
};
use crate::error::{MessagingError, ProtocolError, ValidationError};
use crate::messaging::{InboundUpdate, ProtocolMessaging, Transport};
use crate::programs::ProgramExecutor;
use crate::reconcile::reconcile_deposit;
use crate::sig::Signer;
use crate::storage::Storage;
use crate::transition::{apply_update, Applied, TransferEffect, UpdateContext};
use crate::validate::validate_update;

/// Tuning knobs for a protocol round.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub reply_timeout: Duration,
    pub max_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            reply_timeout: Duration::from_secs(10),
            max_retries: 1,
        }
    }
}

/// Events published after every persisted round, in per-channel nonce
/// order.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    ChannelSetup {
        state: FullChannelState,
    },
    DepositReconciled {
        state: FullChannelState,
    },
    TransferCreated {
        state: FullChannelState,
        transfer: FullTransferState,
    },
    TransferResolved {
        state: FullChannelState,
        transfer_id: Bytes32,
        final_balance: Balance,
    },
}

#[derive(Debug, Clone)]
pub struct SetupParams {
    pub counterparty_identifier: Identifier,
    pub counterparty_address: Address,
    pub timeout: u64,
    pub network_context: NetworkContext,
}

#[derive(Debug, Clone)]
pub struct CreateParams {
    pub channel_address: Address,
    pub asset_id: Address,
    pub transfer_id: Bytes32,
    pub transfer_definition: Address,
    pub transfer_initial_state: Value,
    pub transfer_encodings: [String; 2],
    pub transfer_timeout: u64,
    /// The transfer's payout baseline. Slot 0 is the transfer initiator.
    pub balance: Balance,
    pub meta: Value,
}

#[derive(Debug, Clone)]
pub struct ResolveParams {
    pub channel_address: Address,
    pub transfer_id: Bytes32,
    pub transfer_resolver: Value,
    pub meta: Value,
}

enum Operation {
    Setup(SetupParams),
    Deposit { asset_id: Address },
    Create(CreateParams),
    Resolve(ResolveParams),
}

/// Owned form of [UpdateContext], kept alive for the whole round so the
/// reply can be validated against the same inputs the proposal used.
struct RoundContext {
    active: Vec<FullTransferState>,
    resolve_balance: Option<Balance>,
}

impl RoundContext {
    fn empty() -> Self {
        RoundContext {
            active: Vec::new(),
            resolve_balance: None,
        }
    }

    fn borrowed(&self) -> UpdateContext<'_> {
        UpdateContext {
            active: &self.active,
            resolve_balance: self.resolve_balance.as_ref(),
        }
    }
}

pub struct ChannelEngine<S, C, T>
where
    S: Storage,
    C: ChainReader,
    T: Transport,
{
    public_identifier: Identifier,
    signer: Signer,
    store: Arc<S>,
    chain: Arc<C>,
    messaging: Arc<ProtocolMessaging<T>>,
    programs: ProgramExecutor<C>,
    config: EngineConfig,
    leases: parking_lot::Mutex<HashMap<Address, Arc<tokio::sync::Mutex<()>>>>,
    events: broadcast::Sender<ChannelEvent>,
}

impl<S, C, T> ChannelEngine<S, C, T>
where
    S: Storage,
    C: ChainReader,
    T: Transport,
{
    pub fn new(
        signer: Signer,
        store: Arc<S>,
        chain: Arc<C>,
        messaging: Arc<ProtocolMessaging<T>>,
        programs: ProgramExecutor<C>,
        config: EngineConfig,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(256);
        Arc::new(ChannelEngine {
            public_identifier: messaging.identifier().clone(),
            signer,
            store,
            chain,
            messaging,
            programs,
            config,
            leases: parking_lot::Mutex::new(HashMap::new()),
            events,
        })
    }

    pub fn public_identifier(&self) -> &Identifier {
        &self.public_identifier
    }

    pub fn signer_address(&self) -> Address {
        self.signer.address()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    /// Consume inbound protocol requests, acting as responder for each.
    pub fn spawn(self: &Arc<Self>, mut rx: UnboundedReceiver<InboundUpdate>) -> tokio::task::JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(inbound) = rx.recv().await {
                engine.handle_inbound(inbound).await;
            }
        })
    }

    /// The channel address a setup with these parameters will produce.
    pub fn channel_address_for(&self, params: &SetupParams) -> Address {
        derive_channel_address(
            &[self.signer.address(), params.counterparty_address],
            &params.network_context,
        )
    }

    pub async fn setup(&self, params: SetupParams) -> Result<FullChannelState, ProtocolError> {
        let channel = self.channel_address_for(&params);
        self.initiate(channel, Operation::Setup(params)).await
    }

    pub async fn deposit(
        &self,
        channel_address: Address,
        asset_id: Address,
    ) -> Result<FullChannelState, ProtocolError> {
        self.initiate(channel_address, Operation::Deposit { asset_id })
            .await
    }

    pub async fn create_transfer(
        &self,
        params: CreateParams,
    ) -> Result<FullChannelState, ProtocolError> {
        self.initiate(params.channel_address, Operation::Create(params))
            .await
    }

    pub async fn resolve_transfer(
        &self,
        params: ResolveParams,
    ) -> Result<FullChannelState, ProtocolError> {
        self.initiate(params.channel_address, Operation::Resolve(params))
            .await
    }

    fn lease(&self, channel: Address) -> Arc<tokio::sync::Mutex<()>> {
        self.leases
            .lock()
            .entry(channel)
            .or_default()
            .clone()
    }

    /// Run one full round as initiator. On a StaleUpdate rejection the
    /// round absorbs the counterparty's latest state and restarts exactly
    /// once.
    async fn initiate(
        &self,
        channel: Address,
        op: Operation,
    ) -> Result<FullChannelState, ProtocolError> {
        let lease = self.lease(channel);
        let _guard = lease.lock().await;

        let mut resynced = false;
        loop {
            let prev = self.store.load_channel(channel).await?;
            let (mut update, round) = self.build_update(channel, prev.as_ref(), &op).await?;

            // Structural check of our own proposal, then fill in the
            // derived balance and sign.
            let candidate = apply_update(prev.as_ref(), &update, &round.borrowed())?;
            finalize_balance(&mut update, &candidate.state);
            validate_update(prev.as_ref(), &update, &candidate.state, &round.borrowed(), 0)?;

            let our_idx = candidate
                .state
                .core
                .participant_index(self.signer.address())
                .ok_or(ValidationError::BadParticipants)?;
            let digest = ChannelCommitment::for_state(&candidate.state).hash();
            update.set_signature(our_idx, self.signer.sign_message(digest));

            debug!(
                channel = ?channel,
                nonce = update.nonce,
                kind = update.kind(),
                "sending protocol update"
            );
            let counterparty = update.to_identifier.clone();
            let previous = prev.as_ref().and_then(|s| s.latest_update.clone());
            let sent = self
                .messaging
                .send_protocol(
                    &counterparty,
                    update.clone(),
                    previous,
                    self.config.reply_timeout,
                    self.config.max_retries,
                )
                .await;

            match sent {
                Ok(reply) => {
                    let applied = apply_update(prev.as_ref(), &reply.update, &round.borrowed())?;
                    validate_update(
                        prev.as_ref(),
                        &reply.update,
                        &applied.state,
                        &round.borrowed(),
                        2,
                    )?;
                    let state = self.persist(applied, &reply.update).await?;
                    info!(
                        channel = ?channel,
                        nonce = state.nonce(),
                        kind = reply.update.kind(),
                        "round complete"
                    );
                    return Ok(state);
                }
                Err(ProtocolError::StaleUpdate {
                    latest_update,
                    latest_state,
                }) if !resynced => {
                    warn!(channel = ?channel, "counterparty ahead, absorbing their latest state");
                    self.absorb_counterparty_state(channel, latest_update, latest_state)
                        .await?;
                    resynced = true;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Build the unsigned update and the round context for one operation.
    async fn build_update(
        &self,
        channel: Address,
        prev: Option<&FullChannelState>,
        op: &Operation,
    ) -> Result<(ChannelUpdate, RoundContext), ProtocolError> {
        match op {
            Operation::Setup(params) => {
                if prev.is_some() {
                    return Err(ValidationError::ChannelExists.into());
                }
                let participants = [self.signer.address(), params.counterparty_address];
                let update = ChannelUpdate {
                    channel_address: channel,
                    from_identifier: self.public_identifier.clone(),
                    to_identifier: params.counterparty_identifier.clone(),
                    nonce: 1,
                    balance: Balance::empty(participants),
                    asset_id: Address::default(),
                    details: UpdateDetails::Setup(SetupDetails {
                        timeout: params.timeout,
                        network_context: params.network_context.clone(),
                        participants,
                    }),
                    signatures: [None, None],
                };
                Ok((update, RoundContext::empty()))
            }

            Operation::Deposit { asset_id } => {
                let prev = prev.ok_or(ValidationError::ChannelNotFound)?;
                let reconciliation = reconcile_deposit(self.chain.as_ref(), prev, *asset_id).await?;
                let update = self.next_update(
                    prev,
                    *asset_id,
                    reconciliation.balance,
                    UpdateDetails::Deposit(DepositDetails {
                        latest_deposit_nonce: reconciliation.latest_deposit_nonce,
                    }),
                )?;
                Ok((update, RoundContext::empty()))
            }

            Operation::Create(params) => {
                let prev = prev.ok_or(ValidationError::ChannelNotFound)?;
                let active = self.store.load_active_transfers(channel).await?;
                let accepted = self
                    .programs
                    .create(
                        params.transfer_definition,
                        prev.network_context.chain_id,
                        &params.transfer_initial_state,
                        &params.balance,
                    )
                    .await?;
                if !accepted {
                    return Err(ProtocolError::TransferNotAccepted(
                        "condition program rejected the proposed lock".into(),
                    ));
                }
                let update = self.next_update(
                    prev,
                    params.asset_id,
                    // Placeholder; the derived post-update balance is
                    // filled in after the transition runs.
                    Balance::empty(prev.core.participants),
                    UpdateDetails::Create(CreateDetails {
                        transfer_id: params.transfer_id,
                        transfer_definition: params.transfer_definition,
                        transfer_initial_state: params.transfer_initial_state.clone(),
                        transfer_encodings: params.transfer_encodings.clone(),
                        transfer_timeout: params.transfer_timeout,
                        balance: params.balance.clone(),
                        meta: params.meta.clone(),
                    }),
                )?;
                Ok((
                    update,
                    RoundContext {
                        active,
                        resolve_balance: None,
                    },
                ))
            }

            Operation::Resolve(params) => {
                let prev = prev.ok_or(ValidationError::ChannelNotFound)?;
                let active = self.store.load_active_transfers(channel).await?;
                let transfer = active
                    .iter()
                    .find(|t| t.transfer_id == params.transfer_id)
                    .ok_or(ValidationError::TransferNotActive {
                        transfer_id: params.transfer_id,
                    })?
                    .clone();
                let final_balance = self
                    .programs
                    .resolve(
                        transfer.transfer_definition,
                        prev.network_context.chain_id,
                        &transfer.transfer_initial_state,
                        &transfer.balance,
                        &params.transfer_resolver,
                    )
                    .await?;
                let update = self.next_update(
                    prev,
                    transfer.asset_id,
                    Balance::empty(prev.core.participants),
                    UpdateDetails::Resolve(ResolveDetails {
                        transfer_id: params.transfer_id,
                        transfer_resolver: params.transfer_resolver.clone(),
                        meta: params.meta.clone(),
                    }),
                )?;
                Ok((
                    update,
                    RoundContext {
                        active,
                        resolve_balance: Some(final_balance),
                    },
                ))
            }
        }
    }

    /// Skeleton of a non-setup update addressed to the counterparty.
    fn next_update(
        &self,
        prev: &FullChannelState,
        asset_id: Address,
        balance: Balance,
        details: UpdateDetails,
    ) -> Result<ChannelUpdate, ProtocolError> {
        let counterparty = prev
            .counterparty_of(&self.public_identifier)
            .ok_or(ValidationError::BadParticipants)?
            .clone();
        Ok(ChannelUpdate {
            channel_address: prev.channel_address(),
            from_identifier: self.public_identifier.clone(),
            to_identifier: counterparty,
            nonce: prev.nonce() + 1,
            balance,
            asset_id,
            details,
            signatures: [None, None],
        })
    }

    /// Responder entry point for one inbound request. Rejections are sent
    /// back on the request's inbox.
    pub async fn handle_inbound(&self, inbound: InboundUpdate) {
        let channel = inbound.update.channel_address;
        let from = inbound.from.clone();
        let inbox = inbound.inbox.clone();

        if let Err(e) = self.respond_to_update(inbound).await {
            warn!(
                channel = ?channel,
                reason = e.reason(),
                "rejecting inbound update"
            );
            if let Err(send_err) = self.messaging.respond_error(&from, &inbox, e.to_wire()).await {
                debug!(error = %send_err, "failed to deliver rejection");
            }
        }
    }

    async fn respond_to_update(&self, inbound: InboundUpdate) -> Result<(), ProtocolError> {
        let update = inbound.update;
        let channel = update.channel_address;

        let lease = self.lease(channel);
        let _guard = lease.lock().await;

        let prev = self.store.load_channel(channel).await?;
        let local_nonce = prev.as_ref().map(|s| s.nonce()).unwrap_or(0);

        if update.nonce <= local_nonce {
            return Err(ProtocolError::StaleUpdate {
                latest_update: prev
                    .as_ref()
                    .and_then(|s| s.latest_update.clone())
                    .map(Box::new),
                latest_state: prev.map(Box::new),
            });
        }
        if update.nonce > local_nonce + 1 {
            return Err(ProtocolError::MissingUpdates {
                counterparty_nonce: local_nonce,
            });
        }

        if update.to_identifier != self.public_identifier
            || update.from_identifier != inbound.from
        {
            return Err(ValidationError::BadParticipants.into());
        }
        if let Some(prev) = prev.as_ref() {
            if prev.index_of_identifier(&update.from_identifier).is_none() {
                return Err(ValidationError::BadParticipants.into());
            }
        }

        let round = self.responder_context(prev.as_ref(), &update).await?;

        let applied = apply_update(prev.as_ref(), &update, &round.borrowed())?;
        validate_update(prev.as_ref(), &update, &applied.state, &round.borrowed(), 1)?;

        let our_idx = applied
            .state
            .core
            .participant_index(self.signer.address())
            .ok_or(ValidationError::BadParticipants)?;
        let digest = ChannelCommitment::for_state(&applied.state).hash();
        let mut signed = update;
        signed.set_signature(our_idx, self.signer.sign_message(digest));

        let previous = prev.as_ref().and_then(|s| s.latest_update.clone());
        let state = self.persist(applied, &signed).await?;
        info!(
            channel = ?channel,
            nonce = state.nonce(),
            kind = signed.kind(),
            "counter-signed inbound update"
        );

        self.messaging
            .respond(&inbound.from, &inbound.inbox, signed, previous)
            .await
            .map_err(ProtocolError::from)
    }

    /// Gather what the validator needs for an inbound update: the active
    /// transfer set, a create verdict, or the resolve balance split.
    async fn responder_context(
        &self,
        prev: Option<&FullChannelState>,
        update: &ChannelUpdate,
    ) -> Result<RoundContext, ProtocolError> {
        let active = match prev {
            Some(prev) => {
                self.store
                    .load_active_transfers(prev.channel_address())
                    .await?
            }
            None => Vec::new(),
        };

        match &update.details {
            UpdateDetails::Create(details) => {
                let prev = prev.ok_or(ValidationError::ChannelNotFound)?;
                let accepted = self
                    .programs
                    .create(
                        details.transfer_definition,
                        prev.network_context.chain_id,
                        &details.transfer_initial_state,
                        &details.balance,
                    )
                    .await?;
                if !accepted {
                    return Err(ProtocolError::TransferNotAccepted(
                        "condition program rejected the proposed lock".into(),
                    ));
                }
                Ok(RoundContext {
                    active,
                    resolve_balance: None,
                })
            }
            UpdateDetails::Resolve(details) => {
                let prev = prev.ok_or(ValidationError::ChannelNotFound)?;
                let transfer = active
                    .iter()
                    .find(|t| t.transfer_id == details.transfer_id)
                    .ok_or(ValidationError::TransferNotActive {
                        transfer_id: details.transfer_id,
                    })?
                    .clone();
                let final_balance = self
                    .programs
                    .resolve(
                        transfer.transfer_definition,
                        prev.network_context.chain_id,
                        &transfer.transfer_initial_state,
                        &transfer.balance,
                        &details.transfer_resolver,
                    )
                    .await?;
                Ok(RoundContext {
                    active,
                    resolve_balance: Some(final_balance),
                })
            }
            _ => Ok(RoundContext {
                active,
                resolve_balance: None,
            }),
        }
    }

    /// Write the accepted round: transfer effect first, then state and
    /// commitment, then the event. Runs under the channel lease.
    async fn persist(
        &self,
        applied: Applied,
        update: &ChannelUpdate,
    ) -> Result<FullChannelState, ProtocolError> {
        let mut state = applied.state;
        state.latest_update = Some(update.clone());

        let commitment = SignedCommitment {
            commitment: ChannelCommitment::for_state(&state),
            signatures: update.signatures,
        };

        match &applied.effect {
            Some(TransferEffect::Created(transfer)) => {
                self.store.save_transfer(transfer.clone()).await?;
            }
            Some(TransferEffect::Resolved { transfer, .. }) => {
                self.store
                    .remove_transfer(state.channel_address(), transfer.transfer_id)
                    .await?;
            }
            None => {}
        }
        self.store.save_channel(state.clone(), commitment).await?;

        let event = match (&update.details, &applied.effect) {
            (UpdateDetails::Setup(_), _) => ChannelEvent::ChannelSetup {
                state: state.clone(),
            },
            (UpdateDetails::Deposit(_), _) => ChannelEvent::DepositReconciled {
                state: state.clone(),
            },
            (UpdateDetails::Create(_), Some(TransferEffect::Created(transfer))) => {
                ChannelEvent::TransferCreated {
                    state: state.clone(),
                    transfer: transfer.clone(),
                }
            }
            (
                UpdateDetails::Resolve(_),
                Some(TransferEffect::Resolved {
                    transfer,
                    final_balance,
                }),
            ) => ChannelEvent::TransferResolved {
                state: state.clone(),
                transfer_id: transfer.transfer_id,
                final_balance: final_balance.clone(),
            },
            _ => return Ok(state),
        };
        let _ = self.events.send(event);

        Ok(state)
    }

    /// One-shot resynchronization after a StaleUpdate rejection: verify
    /// the counterparty's double-signed latest state and adopt it.
    async fn absorb_counterparty_state(
        &self,
        channel: Address,
        latest_update: Option<Box<ChannelUpdate>>,
        latest_state: Option<Box<FullChannelState>>,
    ) -> Result<(), ProtocolError> {
        let (Some(update), Some(state)) = (latest_update, latest_state) else {
            return Err(MessagingError::Unknown(
                "stale rejection carried no state to resynchronize from".into(),
            )
            .into());
        };
        let update = *update;
        let state = *state;

        let prev = self.store.load_channel(channel).await?;
        let our_nonce = prev.as_ref().map(|s| s.nonce()).unwrap_or(0);

        if state.channel_address() != channel
            || update.channel_address != channel
            || update.nonce != state.nonce()
            || state.nonce() <= our_nonce
        {
            return Err(MessagingError::Unknown(
                "counterparty state does not advance ours".into(),
            )
            .into());
        }
        if let Some(prev) = prev.as_ref() {
            if state.core.participants != prev.core.participants
                || state.public_identifiers != prev.public_identifiers
            {
                return Err(ValidationError::BadParticipants.into());
            }
        }

        let commitment = SignedCommitment {
            commitment: ChannelCommitment::for_state(&state),
            signatures: update.signatures,
        };
        commitment.verify(2)?;

        // Reconstruct what we can of the transfer set. Only the effect of
        // the final skipped update is recoverable from the attachment; a
        // wider gap leaves earlier transfers unknown until their resolve.
        let gap = state.nonce() - our_nonce;
        if gap > 1 {
            warn!(channel = ?channel, gap, "adopting state across a gap, transfer set may lag");
        }
        match &update.details {
            UpdateDetails::Create(details) if gap == 1 => {
                self.store
                    .save_transfer(FullTransferState::from_create(
                        channel,
                        update.asset_id,
                        details,
                    ))
                    .await?;
            }
            UpdateDetails::Resolve(details) => {
                self.store.remove_transfer(channel, details.transfer_id).await?;
            }
            _ => {}
        }

        let mut state = state;
        state.latest_update = Some(update);
        self.store.save_channel(state.clone(), commitment).await?;
        info!(channel = ?channel, nonce = state.nonce(), "resynchronized from counterparty");
        Ok(())
    }
}

/// For create and resolve the update restates the post-update free balance
/// derived by the transition; fill it in once the candidate state exists.
fn finalize_balance(update: &mut ChannelUpdate, candidate: &FullChannelState) {
    match update.details {
        UpdateDetails::Create(_) | UpdateDetails::Resolve(_) => {
            if let Some(idx) = candidate.core.asset_index(update.asset_id) {
                update.balance = candidate.core.balances[idx].clone();
            }
        }
        _ => {}
    }
}
