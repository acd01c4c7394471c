use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Recognized tuning options for a controller client. No persisted state and
/// no CLI surface; the surrounding harness owns both.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Seconds before an individual message is considered failed.
    pub message_expiry_secs: u64,
    /// Seconds before a whole blocking operation is considered failed.
    pub operation_expiry_secs: u64,
    /// Seconds to wait for every provisional acknowledgment of a
    /// non-blocking action.
    pub ack_expiry_secs: u64,
    /// Connection/association attempts before giving up.
    pub connection_retries: u32,
    /// Per-attempt handshake and association timeout, in seconds.
    pub connect_attempt_timeout_secs: u64,
    /// Inventory presence/absence polls before giving up.
    pub inventory_poll_retries: u32,
    /// Seconds between inventory polls.
    pub inventory_poll_interval_secs: u64,
    /// Status queries per transaction before reporting it unresolved.
    pub status_poll_retries: u32,
    /// Seconds between status queries.
    pub status_poll_interval_secs: u64,
    /// Consecutive `unknown` statuses tolerated before a transaction is
    /// considered genuinely unresolved.
    pub unknown_status_tolerance: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            message_expiry_secs: 10,
            operation_expiry_secs: 60,
            ack_expiry_secs: 10,
            connection_retries: 10,
            connect_attempt_timeout_secs: 5,
            inventory_poll_retries: 60,
            inventory_poll_interval_secs: 1,
            status_poll_retries: 30,
            status_poll_interval_secs: 1,
            unknown_status_tolerance: 3,
        }
    }
}

impl Config {
    pub fn message_expiry(&self) -> Duration {
        Duration::from_secs(self.message_expiry_secs)
    }

    pub fn operation_expiry(&self) -> Duration {
        Duration::from_secs(self.operation_expiry_secs)
    }

    pub fn ack_expiry(&self) -> Duration {
        Duration::from_secs(self.ack_expiry_secs)
    }

    pub fn connect_attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_attempt_timeout_secs)
    }

    pub fn inventory_poll_interval(&self) -> Duration {
        Duration::from_secs(self.inventory_poll_interval_secs)
    }

    pub fn status_poll_interval(&self) -> Duration {
        Duration::from_secs(self.status_poll_interval_secs)
    }
}
