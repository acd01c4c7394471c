// Muster
// Client-side request/response correlation over a pub/sub message bus

pub mod broker;
pub mod client;
pub mod collector;
pub mod config;
pub mod envelope;
pub mod identity;
pub mod local;
pub mod poll;
pub mod telemetry;
pub mod tracker;
pub mod transport;

// Export core types
pub use broker::{BrokerMonitor, BrokerState};
pub use client::Client;
pub use collector::{CompletionPolicy, InFlightHandle, ResponseCollector};
pub use config::Config;
pub use envelope::{
    ActionOutcome, ActionReply, ActionRequest, Envelope, EnvelopeBuilder, InboundMessage,
    InventoryQuery, InventoryReply, MessageType, ProvisionalAck,
};
pub use identity::Identity;
pub use local::{LocalBus, LocalConnector};
pub use poll::{poll_until, try_poll_until};
pub use tracker::{ActionTracker, Transaction, TransactionStatus};
pub use transport::{connect_with_retry, Connector, Transport};

use std::collections::HashMap;

// Error types
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("timed out after {elapsed_ms}ms waiting for replies from {missing:?}")]
    Timeout {
        missing: Vec<Identity>,
        received: HashMap<Identity, InboundMessage>,
        elapsed_ms: u64,
    },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("action on {target} finished with status '{status}'")]
    Action {
        target: Identity,
        status: String,
        outcome: ActionOutcome,
    },

    #[error("action on {target} unresolved after {attempts} attempts in {elapsed_ms}ms")]
    ActionUnresolved {
        target: Identity,
        attempts: u32,
        elapsed_ms: u64,
    },

    #[error("request requires at least one target")]
    EmptyTargets,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
