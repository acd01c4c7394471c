use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use muster::local::reply_to;
use muster::{
    ActionRequest, Client, Config, Connector, Error, Identity, InboundMessage, LocalBus,
    LocalConnector, MessageType, Transport,
};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::Instant;

fn controller() -> Identity {
    Identity::new("bus://local/controller")
}

fn agent(n: u32) -> Identity {
    Identity::new(format!("bus://host{n}/agent"))
}

// Worker peer answering blocking requests with a success outcome after a
// fixed delay. Silent for everything else.
fn spawn_worker(bus: &Arc<LocalBus>, identity: Identity, delay: Duration) {
    let (transport, mut rx) = bus.attach(identity);
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if msg.message_type != MessageType::BlockingRequest {
                continue;
            }
            let req: ActionRequest = msg.payload().unwrap();
            tokio::time::sleep(delay).await;
            let reply = reply_to(
                &msg,
                MessageType::ActionResponse,
                json!({
                    "transaction_id": req.transaction_id,
                    "results": { "status": "success", "stdout": "done" }
                }),
            )
            .unwrap();
            transport.send(reply).await.unwrap();
        }
    });
}

#[tokio::test]
async fn inventory_returns_matching_identities() {
    muster::telemetry::init();
    let bus = LocalBus::new();
    let _keep_a = bus.attach(agent(1));
    let _keep_b = bus.attach(agent(2));
    let _keep_c = bus.attach(Identity::new("bus://host3/controller"));

    let connector = LocalConnector::new(Arc::clone(&bus));
    let client = Client::connect(&connector, controller(), Config::default())
        .await
        .unwrap();

    let uris = client.inventory("bus://*/agent").await.unwrap();
    assert_eq!(uris, vec![agent(1), agent(2)]);

    client.close().await.unwrap();
}

#[tokio::test]
async fn concurrent_inventories_get_their_own_replies() {
    let bus = LocalBus::new();
    let _keep_a = bus.attach(agent(1));
    let _keep_b = bus.attach(Identity::new("bus://host2/controller"));

    let connector = LocalConnector::new(Arc::clone(&bus));
    let client = Client::connect(&connector, controller(), Config::default())
        .await
        .unwrap();

    // Two queries in flight on one connection; each must resolve against
    // its own reply, not whichever lands last.
    let (agents, controllers) = tokio::join!(
        client.inventory("bus://*/agent"),
        client.inventory("bus://*/controller")
    );
    assert_eq!(agents.unwrap(), vec![agent(1)]);
    assert_eq!(
        controllers.unwrap(),
        vec![Identity::new("bus://host2/controller"), controller()]
    );
}

#[tokio::test]
async fn client_debug_names_its_identity() {
    let bus = LocalBus::new();
    let connector = LocalConnector::new(Arc::clone(&bus));
    let client = Client::connect(&connector, controller(), Config::default())
        .await
        .unwrap();

    let rendered = format!("{client:?}");
    assert!(rendered.contains("bus://local/controller"));
}

#[tokio::test]
async fn is_associated_single_check_with_zero_retries() {
    let bus = LocalBus::new();
    let _keep = bus.attach(agent(1));

    let connector = LocalConnector::new(Arc::clone(&bus));
    let client = Client::connect(&connector, controller(), Config::default())
        .await
        .unwrap();

    assert!(client.is_associated_with_retries(&agent(1), 0).await.unwrap());
    assert!(!client.is_associated_with_retries(&agent(9), 0).await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn is_associated_waits_for_late_association() {
    let bus = LocalBus::new();
    let connector = LocalConnector::new(Arc::clone(&bus));
    let client = Client::connect(&connector, controller(), Config::default())
        .await
        .unwrap();

    {
        let bus = Arc::clone(&bus);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            let (_transport, _rx) = bus.attach(agent(1));
            // Keep the association alive past the assertion
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
    }

    assert!(client.is_associated(&agent(1)).await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn association_polling_defaults_come_from_config() {
    let bus = LocalBus::new();
    let connector = LocalConnector::new(Arc::clone(&bus));
    let config = Config {
        inventory_poll_retries: 3,
        ..Config::default()
    };
    let client = Client::connect(&connector, controller(), config)
        .await
        .unwrap();

    let start = Instant::now();
    assert!(!client.is_associated(&agent(1)).await.unwrap());
    assert_eq!(
        start.elapsed(),
        Duration::from_secs(2),
        "three polls, sleeping only between them"
    );
}

#[tokio::test(start_paused = true)]
async fn is_not_associated_returns_on_first_poll_without_sleeping() {
    let bus = LocalBus::new();
    let connector = LocalConnector::new(Arc::clone(&bus));
    let client = Client::connect(&connector, controller(), Config::default())
        .await
        .unwrap();

    let start = Instant::now();
    assert!(client
        .is_not_associated_with_retries(&agent(7), 5)
        .await
        .unwrap());
    assert_eq!(start.elapsed(), Duration::ZERO, "no extra sleeps after a positive check");
}

#[tokio::test(start_paused = true)]
async fn blocking_request_returns_when_the_slowest_target_replies() {
    let bus = LocalBus::new();
    spawn_worker(&bus, agent(1), Duration::from_secs(1));
    spawn_worker(&bus, agent(2), Duration::from_secs(1));
    spawn_worker(&bus, agent(3), Duration::from_secs(9));

    let connector = LocalConnector::new(Arc::clone(&bus));
    let config = Config {
        operation_expiry_secs: 10,
        ..Config::default()
    };
    let client = Client::connect(&connector, controller(), config)
        .await
        .unwrap();

    let targets = [agent(1), agent(2), agent(3)];
    let start = Instant::now();
    let responses = client
        .request(&targets, "runner", "run", json!({ "noop": true }))
        .await
        .unwrap();
    let elapsed = start.elapsed();

    assert_eq!(responses.len(), 3);
    for target in &targets {
        assert_eq!(
            responses[target].message_type,
            MessageType::ActionResponse
        );
    }
    assert!(elapsed >= Duration::from_secs(9));
    assert!(elapsed < Duration::from_secs(10), "no residual wait past the last reply");
}

#[tokio::test(start_paused = true)]
async fn silent_target_is_named_in_the_timeout() {
    let bus = LocalBus::new();
    spawn_worker(&bus, agent(1), Duration::from_secs(1));
    // agent(2) is associated but never replies
    let _keep = bus.attach(agent(2));

    let connector = LocalConnector::new(Arc::clone(&bus));
    let config = Config {
        operation_expiry_secs: 5,
        ..Config::default()
    };
    let client = Client::connect(&connector, controller(), config)
        .await
        .unwrap();

    let err = client
        .request(&[agent(1), agent(2)], "runner", "run", json!({}))
        .await
        .unwrap_err();
    match err {
        Error::Timeout {
            missing, received, ..
        } => {
            assert_eq!(missing, vec![agent(2)]);
            assert!(received.contains_key(&agent(1)));
        }
        other => panic!("expected Timeout, got {other:?}"),
    }
}

#[tokio::test]
async fn empty_target_set_is_rejected_before_sending() {
    let bus = LocalBus::new();
    let connector = LocalConnector::new(Arc::clone(&bus));
    let client = Client::connect(&connector, controller(), Config::default())
        .await
        .unwrap();

    let err = client.request(&[], "runner", "run", json!({})).await.unwrap_err();
    assert!(matches!(err, Error::EmptyTargets));
}

struct RefusingConnector {
    attempts: AtomicU32,
}

#[async_trait]
impl Connector for RefusingConnector {
    async fn connect(
        &self,
        _identity: &Identity,
    ) -> muster::Result<(Arc<dyn Transport>, mpsc::Receiver<InboundMessage>)> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(Error::Connection("association refused".into()))
    }
}

#[tokio::test]
async fn connect_gives_up_after_the_retry_bound() {
    let connector = RefusingConnector {
        attempts: AtomicU32::new(0),
    };
    let config = Config {
        connection_retries: 3,
        ..Config::default()
    };

    let err = Client::connect(&connector, controller(), config)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Connection(_)));
    assert_eq!(connector.attempts.load(Ordering::SeqCst), 3);
}
