// Response collection and completion waiting
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Notify;
use tokio::time::{timeout, Instant};
use tracing::{debug, warn};

use crate::{Error, Identity, InboundMessage, Result};

/// Rule deciding when an in-flight request counts as answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionPolicy {
    /// Every target must reply.
    AllTargets,
    /// A single reply from any target suffices.
    AnyOne,
}

// Shared state of one registered request. Mutated only by the collector's
// dispatch path; read by the single waiter that owns the handle.
struct InFlight {
    targets: HashSet<Identity>,
    policy: CompletionPolicy,
    responses: Mutex<HashMap<Identity, InboundMessage>>,
    notify: Notify,
}

impl InFlight {
    fn is_complete(&self, responses: &HashMap<Identity, InboundMessage>) -> bool {
        match self.policy {
            CompletionPolicy::AllTargets => self.targets.iter().all(|t| responses.contains_key(t)),
            CompletionPolicy::AnyOne => !responses.is_empty(),
        }
    }

    // Records a reply if the sender belongs to the target set. Last write
    // wins for a sender that replies more than once.
    fn accept(&self, msg: &InboundMessage) -> bool {
        if !self.targets.contains(&msg.sender) {
            return false;
        }
        let mut responses = self
            .responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        responses.insert(msg.sender.clone(), msg.clone());
        drop(responses);
        self.notify.notify_waiters();
        true
    }

    fn snapshot(&self) -> HashMap<Identity, InboundMessage> {
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn completed(&self) -> Option<HashMap<Identity, InboundMessage>> {
        let responses = self
            .responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if self.is_complete(&responses) {
            Some(responses.clone())
        } else {
            None
        }
    }
}

/// The correlation core: a table of in-flight requests fed by the single
/// inbound pump of a connection.
///
/// Requests that carry a correlation token are keyed by it; replies echoing
/// the token dispatch with a direct lookup. Requests without one (inventory)
/// fall back to target-set membership. Multiple operations can therefore be
/// outstanding on one connection without cross-talk.
#[derive(Default)]
pub struct ResponseCollector {
    by_correlation: DashMap<String, Arc<InFlight>>,
    uncorrelated: DashMap<u64, Arc<InFlight>>,
    serial: AtomicU64,
}

impl ResponseCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an in-flight request; the returned handle deregisters it on
    /// drop, so a correlation lives no longer than its owner.
    pub fn register(
        self: &Arc<Self>,
        targets: impl IntoIterator<Item = Identity>,
        policy: CompletionPolicy,
        correlation_id: Option<String>,
    ) -> InFlightHandle {
        let shared = Arc::new(InFlight {
            targets: targets.into_iter().collect(),
            policy,
            responses: Mutex::new(HashMap::new()),
            notify: Notify::new(),
        });
        let key = match correlation_id {
            Some(corr) => {
                self.by_correlation.insert(corr.clone(), Arc::clone(&shared));
                RequestKey::Correlation(corr)
            }
            None => {
                let serial = self.serial.fetch_add(1, Ordering::Relaxed);
                self.uncorrelated.insert(serial, Arc::clone(&shared));
                RequestKey::Serial(serial)
            }
        };
        InFlightHandle {
            key,
            shared,
            collector: Arc::clone(self),
        }
    }

    /// Feeds one inbound message into the matching in-flight request(s) and
    /// wakes their waiters. Called serially from the connection's receive
    /// path.
    pub fn dispatch(&self, msg: InboundMessage) {
        if let Some(corr) = msg.correlation_id() {
            if let Some(entry) = self.by_correlation.get(corr) {
                if entry.accept(&msg) {
                    debug!(sender = %msg.sender, correlation = corr, "correlated reply recorded");
                } else {
                    warn!(sender = %msg.sender, correlation = corr, "reply from non-target sender ignored");
                }
                return;
            }
        }
        let mut matched = 0usize;
        for entry in self.uncorrelated.iter() {
            if entry.accept(&msg) {
                matched += 1;
            }
        }
        if matched == 0 {
            debug!(sender = %msg.sender, message_type = msg.message_type.as_tag(), "unmatched inbound message dropped");
        }
    }

    fn deregister(&self, key: &RequestKey) {
        match key {
            RequestKey::Correlation(corr) => {
                self.by_correlation.remove(corr);
            }
            RequestKey::Serial(serial) => {
                self.uncorrelated.remove(serial);
            }
        }
    }
}

enum RequestKey {
    Correlation(String),
    Serial(u64),
}

/// Owner's view of one registered request: waits for completion and carries
/// the correlation lifetime.
pub struct InFlightHandle {
    key: RequestKey,
    shared: Arc<InFlight>,
    collector: Arc<ResponseCollector>,
}

impl InFlightHandle {
    /// Blocks the caller until the completion predicate holds or the deadline
    /// elapses.
    ///
    /// The predicate is re-evaluated after every wake; wakes are never taken
    /// as proof of completion. Returns as soon as the final reply is
    /// processed, with no residual sleep. On deadline expiry exactly one more
    /// predicate check closes the race with a reply landing at the boundary;
    /// an incomplete outcome reports the missing targets and the partial
    /// responses collected so far.
    pub async fn wait(&self, deadline: Duration) -> Result<HashMap<Identity, InboundMessage>> {
        let start = Instant::now();
        let end = start + deadline;
        loop {
            // Arm the notification before checking, so a reply landing
            // between check and await still wakes us.
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(responses) = self.shared.completed() {
                return Ok(responses);
            }
            let remaining = end.saturating_duration_since(Instant::now());
            if remaining.is_zero() || timeout(remaining, notified).await.is_err() {
                break;
            }
        }

        // One final check: the last reply may have arrived at the boundary.
        if let Some(responses) = self.shared.completed() {
            return Ok(responses);
        }
        let received = self.shared.snapshot();
        let mut missing: Vec<Identity> = self
            .shared
            .targets
            .iter()
            .filter(|t| !received.contains_key(*t))
            .cloned()
            .collect();
        missing.sort();
        Err(Error::Timeout {
            missing,
            received,
            elapsed_ms: start.elapsed().as_millis() as u64,
        })
    }

    /// The responses recorded so far, complete or not.
    pub fn responses(&self) -> HashMap<Identity, InboundMessage> {
        self.shared.snapshot()
    }
}

impl Drop for InFlightHandle {
    fn drop(&mut self) {
        self.collector.deregister(&self.key);
    }
}
