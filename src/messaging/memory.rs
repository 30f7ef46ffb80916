//! In-process transport: peers keyed by identifier, envelopes forwarded
//! over unbounded channels. Used by the scenario tests and for loopback
//! channels between co-located participants.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::debug;

use super::{Envelope, Transport};
use crate::channel::Identifier;
use crate::error::MessagingError;

#[derive(Default)]
pub struct MemoryBus {
    peers: Mutex<HashMap<Identifier, mpsc::UnboundedSender<(String, Envelope)>>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a peer. Feed the returned receiver into
    /// [ProtocolMessaging::spawn_delivery][super::ProtocolMessaging::spawn_delivery].
    pub fn attach(&self, identifier: Identifier) -> mpsc::UnboundedReceiver<(String, Envelope)> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.peers.lock().insert(identifier, tx);
        rx
    }

    pub fn detach(&self, identifier: &Identifier) {
        self.peers.lock().remove(identifier);
    }
}

#[async_trait]
impl Transport for MemoryBus {
    async fn publish(&self, subject: &str, envelope: Envelope) -> Result<(), MessagingError> {
        // Both request and reply subjects resolve to the recipient named in
        // the envelope; an unattached recipient is a silent drop, like any
        // real network.
        let target = envelope.to.clone();
        let peers = self.peers.lock();
        match peers.get(&target) {
            Some(tx) => {
                let _ = tx.send((subject.to_string(), envelope));
            }
            None => debug!(%target, "no peer attached for subject, envelope dropped"),
        }
        Ok(())
    }
}
