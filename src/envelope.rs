use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::{Error, Identity, Result};

/// Closed set of message discriminants carried on the wire.
///
/// Every inbound message is validated against this set on receipt; a tag
/// outside it is a protocol error, never an opportunistically-parsed payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    #[serde(rename = "bus/inventory_request")]
    InventoryRequest,
    #[serde(rename = "bus/inventory_response")]
    InventoryResponse,
    #[serde(rename = "bus/blocking_request")]
    BlockingRequest,
    #[serde(rename = "bus/non_blocking_request")]
    NonBlockingRequest,
    #[serde(rename = "bus/provisional_response")]
    ProvisionalResponse,
    #[serde(rename = "bus/action_response")]
    ActionResponse,
    #[serde(rename = "bus/error")]
    Error,
}

impl MessageType {
    pub fn as_tag(self) -> &'static str {
        match self {
            MessageType::InventoryRequest => "bus/inventory_request",
            MessageType::InventoryResponse => "bus/inventory_response",
            MessageType::BlockingRequest => "bus/blocking_request",
            MessageType::NonBlockingRequest => "bus/non_blocking_request",
            MessageType::ProvisionalResponse => "bus/provisional_response",
            MessageType::ActionResponse => "bus/action_response",
            MessageType::Error => "bus/error",
        }
    }

    pub fn from_tag(tag: &str) -> Result<Self> {
        match tag {
            "bus/inventory_request" => Ok(MessageType::InventoryRequest),
            "bus/inventory_response" => Ok(MessageType::InventoryResponse),
            "bus/blocking_request" => Ok(MessageType::BlockingRequest),
            "bus/non_blocking_request" => Ok(MessageType::NonBlockingRequest),
            "bus/provisional_response" => Ok(MessageType::ProvisionalResponse),
            "bus/action_response" => Ok(MessageType::ActionResponse),
            "bus/error" => Ok(MessageType::Error),
            other => Err(Error::Protocol(format!("unknown message type '{other}'"))),
        }
    }
}

/// Inventory request payload: identity patterns to match against the bus
/// server's association table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryQuery {
    pub query: Vec<String>,
}

/// Inventory response payload: the matching associated identities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryReply {
    pub uris: Vec<Identity>,
}

/// Action request payload for blocking and non-blocking dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRequest {
    pub transaction_id: String,
    pub module: String,
    pub action: String,
    pub params: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notify_outcome: Option<bool>,
}

/// Immediate acknowledgment that a non-blocking action was accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionalAck {
    pub transaction_id: String,
}

/// Reply to a blocking request. `results` is the structured outcome container;
/// its absence in a reply that should carry one is a protocol error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionReply {
    pub transaction_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<Value>,
}

/// Structured outcome of one action on one target, as reported by a status
/// query. `stdout` empty or absent means the outcome is not yet available.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
}

impl ActionOutcome {
    /// True once the remote action has produced output to interpret.
    pub fn has_output(&self) -> bool {
        self.stdout.as_deref().map(|s| !s.is_empty()).unwrap_or(false)
    }
}

/// Outbound message: type tag, ordered target set, absolute expiry, payload,
/// and an optional correlation token for asynchronous actions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub message_type: MessageType,
    pub targets: Vec<Identity>,
    pub expires: DateTime<Utc>,
    pub data: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl Envelope {
    /// True once the envelope's expiry has passed; the bus drops such messages
    /// instead of delivering them.
    pub fn is_expired(&self) -> bool {
        self.expires <= Utc::now()
    }
}

/// Pure envelope construction, no I/O.
///
/// # Examples
///
/// ```
/// use muster::{EnvelopeBuilder, Identity, InventoryQuery, MessageType};
/// use std::time::Duration;
///
/// let env = EnvelopeBuilder::new(MessageType::InventoryRequest)
///     .target(Identity::server())
///     .ttl(Duration::from_secs(10))
///     .payload(&InventoryQuery { query: vec!["bus://*/agent".into()] })
///     .unwrap()
///     .build()
///     .unwrap();
/// assert_eq!(env.targets.len(), 1);
/// assert!(!env.is_expired());
/// assert!(env.correlation_id.is_none());
/// ```
#[derive(Debug, Clone)]
pub struct EnvelopeBuilder {
    message_type: MessageType,
    targets: Vec<Identity>,
    ttl: Duration,
    data: Value,
    correlation_id: Option<String>,
}

impl EnvelopeBuilder {
    pub fn new(message_type: MessageType) -> Self {
        Self {
            message_type,
            targets: Vec::new(),
            ttl: Duration::from_secs(10),
            data: Value::Null,
            correlation_id: None,
        }
    }

    pub fn target(mut self, target: Identity) -> Self {
        self.targets.push(target);
        self
    }

    pub fn targets(mut self, targets: impl IntoIterator<Item = Identity>) -> Self {
        self.targets.extend(targets);
        self
    }

    /// Time-to-live relative to build time; `expires = now + ttl`.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn payload<T: Serialize>(mut self, payload: &T) -> Result<Self> {
        self.data = serde_json::to_value(payload)?;
        Ok(self)
    }

    pub fn data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    /// Attaches a freshly generated, globally-unique correlation token.
    /// Required for asynchronous actions whose replies are matched out of band.
    pub fn correlated(mut self) -> Self {
        self.correlation_id = Some(uuid::Uuid::new_v4().to_string());
        self
    }

    /// Reuses an existing correlation token instead of generating one.
    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Builds the envelope. An empty target set or a zero ttl is a caller
    /// error, not a transport error: the expiry must be strictly in the
    /// future at send time or the bus drops the message undelivered.
    pub fn build(self) -> Result<Envelope> {
        if self.targets.is_empty() {
            return Err(Error::EmptyTargets);
        }
        if self.ttl.is_zero() {
            return Err(Error::Protocol(
                "envelope ttl must be strictly positive".to_string(),
            ));
        }
        let ttl = ChronoDuration::from_std(self.ttl)
            .map_err(|e| Error::Protocol(format!("invalid ttl: {e}")))?;
        Ok(Envelope {
            message_type: self.message_type,
            targets: self.targets,
            expires: Utc::now() + ttl,
            data: self.data,
            correlation_id: self.correlation_id,
        })
    }
}

/// A message delivered by the bus: who sent it, what kind it is, and its
/// structured payload. Arrival is asynchronous and unordered across senders.
///
/// `in_reply_to` echoes the correlation token of the request this message
/// answers, when the sender carries one; provisional acknowledgments rely on
/// it because their payload `transaction_id` is a fresh per-target token, not
/// the request's.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub sender: Identity,
    pub message_type: MessageType,
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<String>,
}

impl InboundMessage {
    /// Deserializes the payload into its expected shape. A payload missing an
    /// expected field is surfaced as a protocol error, never silently
    /// defaulted.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.data.clone()).map_err(|e| {
            Error::Protocol(format!(
                "malformed {} payload from {}: {e}",
                self.message_type.as_tag(),
                self.sender
            ))
        })
    }

    /// The token this message correlates under: the envelope-level echo when
    /// present, otherwise the transaction id embedded in the payload.
    pub fn correlation_id(&self) -> Option<&str> {
        self.in_reply_to
            .as_deref()
            .or_else(|| self.data.get("transaction_id").and_then(Value::as_str))
    }
}
