// Broker readiness: polled status endpoint, never pushed
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::poll::poll_until;
use crate::{Error, Result};

/// Broker service state as reported by its status endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerState {
    Starting,
    Running,
    Error,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct StatusDocument {
    state: BrokerState,
}

/// Polls a broker's HTTPS status endpoint. An unreachable endpoint or an
/// undecodable body reads as [`BrokerState::Unknown`] rather than an error,
/// since both are expected while the broker is still coming up.
pub struct BrokerMonitor {
    status_url: String,
    http: reqwest::Client,
}

impl BrokerMonitor {
    /// `status_url` is the full status document URL, e.g.
    /// `https://broker:8142/status/v1/services/broker-service`. Certificate
    /// verification is disabled; the harness provisions throwaway certs.
    pub fn new(status_url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| Error::Connection(format!("failed to build status client: {e}")))?;
        Ok(Self {
            status_url: status_url.into(),
            http,
        })
    }

    /// One status poll.
    pub async fn state(&self) -> BrokerState {
        let response = match self.http.get(&self.status_url).send().await {
            Ok(response) => response,
            Err(err) => {
                debug!(url = %self.status_url, error = %err, "status endpoint unreachable");
                return BrokerState::Unknown;
            }
        };
        match response.json::<StatusDocument>().await {
            Ok(document) => document.state,
            Err(err) => {
                debug!(url = %self.status_url, error = %err, "undecodable status document");
                BrokerState::Unknown
            }
        }
    }

    /// Polls until the broker reports `running`, at most `max_attempts`
    /// times.
    pub async fn await_running(&self, interval: Duration, max_attempts: u32) -> bool {
        poll_until(
            || async move { self.state().await == BrokerState::Running },
            interval,
            max_attempts,
        )
        .await
    }
}
