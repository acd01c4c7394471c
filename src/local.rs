// In-process bus used by tests and demos.
//
// `LocalBus` plays the broker role behind the `Transport`/`Connector` seams:
// it keeps an association table, delivers envelopes to their targets, drops
// expired messages, and answers inventory requests from the table. It is not
// a production transport.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    Connector, Envelope, EnvelopeBuilder, Error, Identity, InboundMessage, InventoryQuery,
    InventoryReply, MessageType, Result, Transport,
};

const PEER_QUEUE_DEPTH: usize = 1024;

/// In-process pub/sub router keyed by peer identity.
pub struct LocalBus {
    peers: DashMap<Identity, mpsc::Sender<InboundMessage>>,
    server: Identity,
}

impl LocalBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            peers: DashMap::new(),
            server: Identity::server(),
        })
    }

    /// Associates a peer and hands back its connection pair. A later attach
    /// under the same identity replaces the earlier association.
    pub fn attach(
        self: &Arc<Self>,
        identity: Identity,
    ) -> (Arc<dyn Transport>, mpsc::Receiver<InboundMessage>) {
        let (tx, rx) = mpsc::channel(PEER_QUEUE_DEPTH);
        self.peers.insert(identity.clone(), tx);
        info!(peer = %identity, "peer associated");
        let transport = Arc::new(LocalTransport {
            bus: Arc::clone(self),
            identity,
            closed: AtomicBool::new(false),
        });
        (transport, rx)
    }

    pub fn detach(&self, identity: &Identity) {
        if self.peers.remove(identity).is_some() {
            info!(peer = %identity, "peer dissociated");
        }
    }

    /// Identities currently associated, as the inventory authority sees them.
    pub fn associated(&self) -> Vec<Identity> {
        self.peers.iter().map(|e| e.key().clone()).collect()
    }

    async fn route(&self, sender: &Identity, envelope: Envelope) {
        if envelope.is_expired() {
            warn!(sender = %sender, message_type = envelope.message_type.as_tag(), "dropping expired envelope");
            return;
        }
        for target in &envelope.targets {
            if *target == self.server && envelope.message_type == MessageType::InventoryRequest {
                self.answer_inventory(sender, &envelope).await;
                continue;
            }
            let Some(tx) = self.peers.get(target).map(|e| e.value().clone()) else {
                debug!(target = %target, "target not associated, envelope dropped");
                continue;
            };
            let msg = InboundMessage {
                sender: sender.clone(),
                message_type: envelope.message_type,
                data: envelope.data.clone(),
                in_reply_to: envelope.correlation_id.clone(),
            };
            if tx.send(msg).await.is_err() {
                warn!(target = %target, "peer receiver gone, envelope dropped");
            }
        }
    }

    async fn answer_inventory(&self, requester: &Identity, envelope: &Envelope) {
        let query: InventoryQuery = match serde_json::from_value(envelope.data.clone()) {
            Ok(q) => q,
            Err(err) => {
                warn!(requester = %requester, error = %err, "malformed inventory query");
                return;
            }
        };
        let mut uris: Vec<Identity> = self
            .peers
            .iter()
            .map(|e| e.key().clone())
            .filter(|id| query.query.iter().any(|pattern| id.matches(pattern)))
            .collect();
        uris.sort();
        let Some(tx) = self.peers.get(requester).map(|e| e.value().clone()) else {
            return;
        };
        let reply = InboundMessage {
            sender: self.server.clone(),
            message_type: MessageType::InventoryResponse,
            data: match serde_json::to_value(InventoryReply { uris }) {
                Ok(v) => v,
                Err(err) => {
                    warn!(error = %err, "failed to encode inventory reply");
                    return;
                }
            },
            in_reply_to: envelope.correlation_id.clone(),
        };
        let _ = tx.send(reply).await;
    }
}

/// Builds a reply envelope addressed back at a request's sender, echoing the
/// request's correlation token. For peers simulated on the local bus.
pub fn reply_to(
    request: &InboundMessage,
    message_type: MessageType,
    data: serde_json::Value,
) -> Result<Envelope> {
    let mut builder = EnvelopeBuilder::new(message_type)
        .target(request.sender.clone())
        .data(data);
    if let Some(corr) = request.correlation_id() {
        builder = builder.correlation_id(corr);
    }
    builder.build()
}

struct LocalTransport {
    bus: Arc<LocalBus>,
    identity: Identity,
    closed: AtomicBool,
}

#[async_trait]
impl Transport for LocalTransport {
    async fn send(&self, envelope: Envelope) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Connection(format!(
                "connection for {} already closed",
                self.identity
            )));
        }
        self.bus.route(&self.identity, envelope).await;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.bus.detach(&self.identity);
        }
        Ok(())
    }
}

impl Drop for LocalTransport {
    fn drop(&mut self) {
        // Release the association exactly once on every exit path
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.bus.detach(&self.identity);
        }
    }
}

/// Connector that associates peers with a [`LocalBus`].
pub struct LocalConnector {
    bus: Arc<LocalBus>,
}

impl LocalConnector {
    pub fn new(bus: Arc<LocalBus>) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl Connector for LocalConnector {
    async fn connect(
        &self,
        identity: &Identity,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<InboundMessage>)> {
        Ok(self.bus.attach(identity.clone()))
    }
}
