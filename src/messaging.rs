//! Correlated request/response over an abstract bus.
//!
//! Each outbound update is published to the counterparty's identifier
//! subject with a freshly generated inbox; the reply comes back on the
//! inbox subject and is handed to exactly one waiter. Late replies,
//! duplicate replies and replies from the wrong peer are dropped. Retries
//! always use a new inbox, never the old one.

mod memory;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

pub use memory::MemoryBus;

use crate::channel::{ChannelUpdate, Identifier};
use crate::error::{MessagingError, ProtocolError, WireError};

/// Single-use correlation id routing a protocol reply back to its waiter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Inbox(pub String);

impl Inbox {
    /// A cryptographically random 32-byte value, hex encoded.
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Inbox(format!("0x{}", hex::encode(bytes)))
    }
}

/// Payload of a protocol message. Exactly one of `update` or `error` is
/// present.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update: Option<ChannelUpdate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_update: Option<ChannelUpdate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

/// Wire format of one protocol message. Field names and order are part of
/// the interface; do not rename.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub to: Identifier,
    pub from: Identifier,
    pub inbox: Inbox,
    pub sent_by: Identifier,
    pub data: Payload,
}

/// The concrete transport: in-memory bus, broker, socket. It only has to
/// move envelopes; correlation lives above it.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Publish an envelope on a subject. Requests go to the recipient's
    /// identifier subject, replies to the inbox subject.
    async fn publish(&self, subject: &str, envelope: Envelope) -> Result<(), MessagingError>;
}

/// A successful protocol reply.
#[derive(Debug, Clone)]
pub struct ProtocolReply {
    pub update: ChannelUpdate,
    pub previous_update: Option<ChannelUpdate>,
}

/// An inbound request delivered to the responder.
#[derive(Debug, Clone)]
pub struct InboundUpdate {
    pub from: Identifier,
    pub inbox: Inbox,
    pub update: ChannelUpdate,
    pub previous_update: Option<ChannelUpdate>,
}

struct Waiter {
    expect_from: Identifier,
    tx: oneshot::Sender<Payload>,
}

type WaiterMap = Arc<Mutex<HashMap<Inbox, Waiter>>>;

/// Removes the waiter if the send is cancelled or times out before a reply
/// lands. A delivered waiter is already gone; removing again is a no-op.
struct WaiterGuard {
    waiters: WaiterMap,
    inbox: Inbox,
}

impl Drop for WaiterGuard {
    fn drop(&mut self) {
        self.waiters.lock().remove(&self.inbox);
    }
}

/// The protocol endpoint of one participant.
pub struct ProtocolMessaging<T: Transport> {
    identifier: Identifier,
    transport: Arc<T>,
    waiters: WaiterMap,
    inbound: mpsc::UnboundedSender<InboundUpdate>,
}

impl<T: Transport> ProtocolMessaging<T> {
    /// Create the endpoint. The returned receiver is the subscription for
    /// inbound requests addressed to `identifier`.
    pub fn new(
        identifier: Identifier,
        transport: Arc<T>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<InboundUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(ProtocolMessaging {
                identifier,
                transport,
                waiters: Arc::new(Mutex::new(HashMap::new())),
                inbound: tx,
            }),
            rx,
        )
    }

    pub fn identifier(&self) -> &Identifier {
        &self.identifier
    }

    /// Feed an envelope received from the transport into the endpoint.
    ///
    /// `subject` decides the route: the endpoint's own identifier subject
    /// carries requests, anything else is treated as an inbox reply.
    pub fn deliver(&self, subject: &str, envelope: Envelope) {
        if envelope.to != self.identifier {
            trace!(%subject, "envelope for someone else dropped");
            return;
        }

        if subject == self.identifier.0 {
            match envelope.data.update {
                Some(update) => {
                    let _ = self.inbound.send(InboundUpdate {
                        from: envelope.from,
                        inbox: envelope.inbox,
                        update,
                        previous_update: envelope.data.previous_update,
                    });
                }
                None => debug!("request without an update dropped"),
            }
            return;
        }

        let key = Inbox(subject.to_string());
        let mut waiters = self.waiters.lock();
        match waiters.remove(&key) {
            Some(waiter)
                if envelope.inbox == key
                    && envelope.from == waiter.expect_from
                    && envelope.sent_by == waiter.expect_from =>
            {
                drop(waiters);
                if waiter.tx.send(envelope.data).is_err() {
                    debug!("reply raced waiter cancellation, dropped");
                }
            }
            Some(waiter) => {
                // Wrong peer on a live inbox: keep waiting for the real
                // reply.
                waiters.insert(key, waiter);
                debug!("reply from unexpected sender dropped");
            }
            None => debug!("reply without a registered waiter dropped"),
        }
    }

    /// Send a protocol update and wait for the single correlated reply.
    ///
    /// `max_retries = 0` means one attempt. Every retry generates a fresh
    /// inbox; a reply to an expired inbox is discarded.
    pub async fn send_protocol(
        &self,
        to: &Identifier,
        update: ChannelUpdate,
        previous_update: Option<ChannelUpdate>,
        timeout: Duration,
        max_retries: u32,
    ) -> Result<ProtocolReply, ProtocolError> {
        let mut attempt = 0u32;
        loop {
            let inbox = Inbox::random();
            let (tx, rx) = oneshot::channel();
            self.waiters.lock().insert(
                inbox.clone(),
                Waiter {
                    expect_from: to.clone(),
                    tx,
                },
            );
            let _guard = WaiterGuard {
                waiters: self.waiters.clone(),
                inbox: inbox.clone(),
            };

            let envelope = Envelope {
                to: to.clone(),
                from: self.identifier.clone(),
                inbox: inbox.clone(),
                sent_by: self.identifier.clone(),
                data: Payload {
                    update: Some(update.clone()),
                    previous_update: previous_update.clone(),
                    error: None,
                },
            };
            self.transport.publish(&to.0, envelope).await?;

            match tokio::time::timeout(timeout, rx).await {
                Ok(Ok(payload)) => {
                    if let Some(error) = payload.error {
                        return Err(ProtocolError::from_wire(error));
                    }
                    let Some(update) = payload.update else {
                        return Err(MessagingError::Unknown(
                            "reply carried neither update nor error".into(),
                        )
                        .into());
                    };
                    return Ok(ProtocolReply {
                        update,
                        previous_update: payload.previous_update,
                    });
                }
                Ok(Err(_)) | Err(_) => {
                    if attempt >= max_retries {
                        return Err(MessagingError::Timeout.into());
                    }
                    attempt += 1;
                    debug!(attempt, %to, "no reply in time, retrying with a fresh inbox");
                }
            }
        }
    }

    /// Publish a positive reply bound to `inbox`.
    pub async fn respond(
        &self,
        to: &Identifier,
        inbox: &Inbox,
        update: ChannelUpdate,
        previous_update: Option<ChannelUpdate>,
    ) -> Result<(), MessagingError> {
        let envelope = Envelope {
            to: to.clone(),
            from: self.identifier.clone(),
            inbox: inbox.clone(),
            sent_by: self.identifier.clone(),
            data: Payload {
                update: Some(update),
                previous_update,
                error: None,
            },
        };
        self.transport.publish(&inbox.0, envelope).await
    }

    /// Publish a negative reply bound to `inbox`.
    pub async fn respond_error(
        &self,
        to: &Identifier,
        inbox: &Inbox,
        error: WireError,
    ) -> Result<(), MessagingError> {
        let envelope = Envelope {
            to: to.clone(),
            from: self.identifier.clone(),
            inbox: inbox.clone(),
            sent_by: self.identifier.clone(),
            data: Payload {
                update: None,
                previous_update: None,
                error: Some(error),
            },
        };
        self.transport.publish(&inbox.0, envelope).await
    }

    /// Drive this endpoint from a stream of `(subject, envelope)` pairs,
    /// e.g. the receiver handed out by [MemoryBus::attach].
    pub fn spawn_delivery(
        self: &Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<(String, Envelope)>,
    ) -> tokio::task::JoinHandle<()> {
        let endpoint = Arc::clone(self);
        tokio::spawn(async move {
            while let Some((subject, envelope)) = rx.recv().await {
                endpoint.deliver(&subject, envelope);
            }
        })
    }
}
