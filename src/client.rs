// Controller client: one connection, one correlation table
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::collector::{CompletionPolicy, ResponseCollector};
use crate::poll::try_poll_until;
use crate::transport::{connect_with_retry, Connector, Transport};
use crate::{
    ActionRequest, Config, Envelope, EnvelopeBuilder, Error, Identity, InboundMessage,
    InventoryQuery, InventoryReply, MessageType, Result,
};

/// A controller's client-side view of the bus: owns the connection, its
/// single receive pump, and the correlation table shared by every operation
/// issued through it.
///
/// Operations multiplex over the one connection by correlation token, so any
/// number of them may be outstanding concurrently without cross-talk.
pub struct Client {
    identity: Identity,
    config: Config,
    transport: Arc<dyn Transport>,
    collector: Arc<ResponseCollector>,
    pump: JoinHandle<()>,
    closed: AtomicBool,
}

impl Client {
    /// Connects and associates with the bus, retrying per
    /// `config.connection_retries`. The inbound pump is running before this
    /// returns, so no early reply can be lost.
    pub async fn connect(
        connector: &dyn Connector,
        identity: Identity,
        config: Config,
    ) -> Result<Self> {
        let (transport, mut inbound) = connect_with_retry(
            connector,
            &identity,
            config.connection_retries,
            config.connect_attempt_timeout(),
        )
        .await?;
        let collector = Arc::new(ResponseCollector::new());
        let pump = tokio::spawn({
            let collector = Arc::clone(&collector);
            async move {
                while let Some(msg) = inbound.recv().await {
                    collector.dispatch(msg);
                }
                debug!("inbound pump finished");
            }
        });
        Ok(Self {
            identity,
            config,
            transport,
            collector,
            pump,
            closed: AtomicBool::new(false),
        })
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Releases the connection. Safe to call more than once; later calls are
    /// no-ops.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.pump.abort();
        self.transport.close().await?;
        info!(identity = %self.identity, "client closed");
        Ok(())
    }

    /// Queries the bus server's inventory of associated identities matching
    /// `query` (e.g. `bus://*/agent`).
    pub async fn inventory(&self, query: &str) -> Result<Vec<Identity>> {
        let server = Identity::server();
        // Each inventory carries its own correlation token so that
        // concurrent queries on one connection cannot satisfy each other.
        let envelope = EnvelopeBuilder::new(MessageType::InventoryRequest)
            .target(server.clone())
            .ttl(self.config.message_expiry())
            .payload(&InventoryQuery {
                query: vec![query.to_string()],
            })?
            .correlated()
            .build()?;
        let handle = self.collector.register(
            [server],
            CompletionPolicy::AnyOne,
            envelope.correlation_id.clone(),
        );
        self.transport.send(envelope).await?;
        let responses = handle.wait(self.config.operation_expiry()).await?;
        let reply = responses
            .into_values()
            .next()
            .ok_or_else(|| Error::Protocol("inventory response missing".to_string()))?;
        let inventory: InventoryReply = reply.payload()?;
        Ok(inventory.uris)
    }

    /// Polls the inventory until `identity` appears, using the configured
    /// poll interval and retry budget.
    pub async fn is_associated(&self, identity: &Identity) -> Result<bool> {
        self.is_associated_with_retries(identity, self.config.inventory_poll_retries)
            .await
    }

    /// [`Client::is_associated`] with an explicit retry budget, once per
    /// `inventory_poll_interval`. `retries == 0` checks exactly once.
    pub async fn is_associated_with_retries(
        &self,
        identity: &Identity,
        retries: u32,
    ) -> Result<bool> {
        try_poll_until(
            || async move {
                let uris = self.inventory(identity.as_str()).await?;
                Ok(uris.contains(identity))
            },
            self.config.inventory_poll_interval(),
            retries,
        )
        .await
    }

    /// Polls the inventory until `identity` is absent; counterpart of
    /// [`Client::is_associated`] that avoids needless retries when absence is
    /// the expected state.
    pub async fn is_not_associated(&self, identity: &Identity) -> Result<bool> {
        self.is_not_associated_with_retries(identity, self.config.inventory_poll_retries)
            .await
    }

    /// [`Client::is_not_associated`] with an explicit retry budget.
    pub async fn is_not_associated_with_retries(
        &self,
        identity: &Identity,
        retries: u32,
    ) -> Result<bool> {
        try_poll_until(
            || async move {
                let uris = self.inventory(identity.as_str()).await?;
                Ok(!uris.contains(identity))
            },
            self.config.inventory_poll_interval(),
            retries,
        )
        .await
    }

    /// Dispatches a blocking action to `targets` and waits for every target's
    /// reply within the operation deadline. The per-sender response map is
    /// returned; a timeout names the targets that never answered and carries
    /// the replies that did arrive.
    pub async fn request(
        &self,
        targets: &[Identity],
        module: &str,
        action: &str,
        params: Value,
    ) -> Result<HashMap<Identity, InboundMessage>> {
        self.rpc(targets, module, action, params, true).await
    }

    /// Dispatches a non-blocking action and waits only for each target's
    /// provisional acknowledgment, within the shorter ack deadline.
    pub async fn request_non_blocking(
        &self,
        targets: &[Identity],
        module: &str,
        action: &str,
        params: Value,
    ) -> Result<HashMap<Identity, InboundMessage>> {
        self.rpc(targets, module, action, params, false).await
    }

    async fn rpc(
        &self,
        targets: &[Identity],
        module: &str,
        action: &str,
        params: Value,
        blocking: bool,
    ) -> Result<HashMap<Identity, InboundMessage>> {
        let transaction_id = uuid::Uuid::new_v4().to_string();
        let message_type = if blocking {
            MessageType::BlockingRequest
        } else {
            MessageType::NonBlockingRequest
        };
        let request = ActionRequest {
            transaction_id: transaction_id.clone(),
            module: module.to_string(),
            action: action.to_string(),
            params,
            notify_outcome: (!blocking).then_some(false),
        };
        let envelope = EnvelopeBuilder::new(message_type)
            .targets(targets.iter().cloned())
            .ttl(self.config.message_expiry())
            .payload(&request)?
            .correlation_id(transaction_id.clone())
            .build()?;
        let handle = self.collector.register(
            targets.iter().cloned(),
            CompletionPolicy::AllTargets,
            Some(transaction_id.clone()),
        );
        debug!(
            transaction = %transaction_id,
            module,
            action,
            targets = targets.len(),
            blocking,
            "dispatching action request"
        );
        self.send(envelope).await?;
        let deadline = if blocking {
            self.config.operation_expiry()
        } else {
            self.config.ack_expiry()
        };
        handle.wait(deadline).await
    }

    /// Sends a pre-built envelope over the connection.
    pub async fn send(&self, envelope: Envelope) -> Result<()> {
        self.transport.send(envelope).await
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("identity", &self.identity)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        // Stop the pump; the transport releases its association on drop.
        self.pump.abort();
    }
}
