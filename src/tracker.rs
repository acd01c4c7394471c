// Tracking of non-blocking actions through provisional acks and status polling
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::poll::try_poll_until;
use crate::{
    ActionOutcome, ActionReply, Client, Error, Identity, MessageType, ProvisionalAck, Result,
};

/// Lifecycle state of one asynchronous action on one target. Transitions are
/// monotone toward a terminal value; a terminal state is never downgraded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Acknowledged, no output observed yet.
    Pending,
    /// The target keeps reporting it does not know the outcome.
    Unknown,
    /// Terminal: the remote action finished successfully.
    Success,
    /// Terminal: the remote action itself failed.
    Failure,
}

impl TransactionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TransactionStatus::Success | TransactionStatus::Failure)
    }
}

/// The tracked lifecycle of one asynchronous action on one target,
/// identified by the transaction id from its provisional acknowledgment.
#[derive(Debug, Clone)]
pub struct Transaction {
    pub id: String,
    pub target: Identity,
    pub status: TransactionStatus,
}

impl Transaction {
    fn advance(&mut self, next: TransactionStatus) {
        if !self.status.is_terminal() {
            self.status = next;
        }
    }
}

struct PollState {
    attempts: u32,
    unknown_streak: u32,
    outcome: Option<ActionOutcome>,
}

/// Drives fire-and-forget actions: dispatch, collect provisional
/// acknowledgments, then poll each target's status out of band until a
/// terminal outcome or an exhausted retry budget.
pub struct ActionTracker<'a> {
    client: &'a Client,
}

impl<'a> ActionTracker<'a> {
    pub fn new(client: &'a Client) -> Self {
        Self { client }
    }

    /// Dispatches a non-blocking action to `targets` and consumes the
    /// provisional acknowledgment from every one of them, within the ack
    /// deadline. An acknowledgment of any other message type is a protocol
    /// error. Returns one pending transaction per target.
    pub async fn start_action(
        &self,
        targets: &[Identity],
        module: &str,
        action: &str,
        params: Value,
    ) -> Result<Vec<Transaction>> {
        let acks = self
            .client
            .request_non_blocking(targets, module, action, params)
            .await?;
        let mut transactions = Vec::with_capacity(targets.len());
        for target in targets {
            let msg = acks.get(target).ok_or_else(|| {
                Error::Protocol(format!("no acknowledgment recorded for {target}"))
            })?;
            if msg.message_type != MessageType::ProvisionalResponse {
                return Err(Error::Protocol(format!(
                    "expected provisional response from {target}, got {}",
                    msg.message_type.as_tag()
                )));
            }
            let ack: ProvisionalAck = msg.payload()?;
            debug!(target = %target, transaction = %ack.transaction_id, "action acknowledged");
            transactions.push(Transaction {
                id: ack.transaction_id,
                target: target.clone(),
                status: TransactionStatus::Pending,
            });
        }
        Ok(transactions)
    }

    /// Polls the target's status using the configured status poll interval
    /// and retry budget.
    pub async fn await_outcome(&self, transaction: &mut Transaction) -> Result<ActionOutcome> {
        let interval = self.client.config().status_poll_interval();
        let max_retries = self.client.config().status_poll_retries;
        self.await_outcome_with(transaction, interval, max_retries)
            .await
    }

    /// Polls the target's status-query action until a terminal outcome is
    /// observed or `max_retries` queries have been made.
    ///
    /// A reply whose output is still empty means the outcome is not yet
    /// available. An `unknown` status is tolerated for a few consecutive
    /// cycles (the remote action may not have started); past that tolerance
    /// the transaction is marked unresolved but polling continues until the
    /// budget runs out. A terminal `success` returns the structured outcome;
    /// any other terminal status is surfaced as an action error carrying it.
    pub async fn await_outcome_with(
        &self,
        transaction: &mut Transaction,
        interval: Duration,
        max_retries: u32,
    ) -> Result<ActionOutcome> {
        let start = Instant::now();
        let state = Mutex::new(PollState {
            attempts: 0,
            unknown_streak: 0,
            outcome: None,
        });
        let target = transaction.target.clone();
        let id = transaction.id.clone();

        let (target_ref, id_ref, state_ref) = (&target, id.as_str(), &state);
        let resolved = try_poll_until(
            move || self.query_once(target_ref, id_ref, state_ref),
            interval,
            max_retries,
        )
        .await?;

        let state = state
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner);
        if resolved {
            let outcome = state.outcome.ok_or_else(|| {
                Error::Protocol(format!("terminal status for {target} without an outcome"))
            })?;
            if outcome.status == "success" {
                transaction.advance(TransactionStatus::Success);
                Ok(outcome)
            } else {
                transaction.advance(TransactionStatus::Failure);
                Err(Error::Action {
                    target,
                    status: outcome.status.clone(),
                    outcome,
                })
            }
        } else {
            if state.unknown_streak > self.client.config().unknown_status_tolerance {
                transaction.advance(TransactionStatus::Unknown);
            }
            Err(Error::ActionUnresolved {
                target,
                attempts: state.attempts,
                elapsed_ms: start.elapsed().as_millis() as u64,
            })
        }
    }

    // One status-query cycle: a blocking request to the `status` module,
    // keyed by the tracked transaction id.
    async fn query_once(
        &self,
        target: &Identity,
        transaction_id: &str,
        state: &Mutex<PollState>,
    ) -> Result<bool> {
        let replies = self
            .client
            .request(
                std::slice::from_ref(target),
                "status",
                "query",
                json!({ "transaction_id": transaction_id }),
            )
            .await?;
        let reply = replies
            .get(target)
            .ok_or_else(|| Error::Protocol(format!("no status reply recorded for {target}")))?;
        let action_reply: ActionReply = reply.payload()?;
        let results = action_reply.results.ok_or_else(|| {
            Error::Protocol(format!("status reply from {target} missing results"))
        })?;
        let outcome: ActionOutcome = serde_json::from_value(results).map_err(|e| {
            Error::Protocol(format!("malformed status results from {target}: {e}"))
        })?;

        let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
        state.attempts += 1;
        if !outcome.has_output() {
            debug!(target = %target, transaction = transaction_id, "outcome not yet available");
            return Ok(false);
        }
        if outcome.status == "unknown" {
            state.unknown_streak += 1;
            if state.unknown_streak > self.client.config().unknown_status_tolerance {
                warn!(
                    target = %target,
                    transaction = transaction_id,
                    streak = state.unknown_streak,
                    "status still unknown past tolerance"
                );
            }
            return Ok(false);
        }
        state.outcome = Some(outcome);
        Ok(true)
    }
}
