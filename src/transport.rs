// Transport seam: the connection library is an external collaborator
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::{Envelope, Error, Identity, InboundMessage, Result};

/// One authenticated, associated connection to the bus.
///
/// Implementations provide send and close; the inbound side is the mpsc
/// receiver handed out at connect time. Exactly one receive pump may drain
/// it, and it must be running before any send that expects replies.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, envelope: Envelope) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

/// Dials and associates a connection for a given client identity.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        identity: &Identity,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<InboundMessage>)>;
}

/// Connects through `connector`, retrying up to `retries` attempts with a
/// per-attempt timeout covering both the handshake and the association step.
pub async fn connect_with_retry(
    connector: &dyn Connector,
    identity: &Identity,
    retries: u32,
    per_attempt: Duration,
) -> Result<(Arc<dyn Transport>, mpsc::Receiver<InboundMessage>)> {
    let attempts = retries.max(1);
    for attempt in 1..=attempts {
        match timeout(per_attempt, connector.connect(identity)).await {
            Ok(Ok(connection)) => {
                info!(%identity, attempt, "associated with bus");
                return Ok(connection);
            }
            Ok(Err(err)) => {
                warn!(%identity, attempt, error = %err, "association attempt failed");
            }
            Err(_) => {
                warn!(%identity, attempt, "association attempt timed out");
            }
        }
    }
    Err(Error::Connection(format!(
        "failed to associate {identity} with the bus after {attempts} attempts"
    )))
}
