use std::sync::Arc;
use std::time::Duration;

use muster::{
    CompletionPolicy, Error, Identity, InboundMessage, MessageType, ResponseCollector,
};
use serde_json::json;
use tokio::time::Instant;

fn agent(n: u32) -> Identity {
    Identity::new(format!("bus://host{n}/agent"))
}

fn reply(sender: &Identity, correlation: Option<&str>) -> InboundMessage {
    InboundMessage {
        sender: sender.clone(),
        message_type: MessageType::ActionResponse,
        data: json!({ "results": { "status": "success", "stdout": "done" } }),
        in_reply_to: correlation.map(str::to_string),
    }
}

#[tokio::test]
async fn responses_stay_within_target_set() {
    let collector = Arc::new(ResponseCollector::new());
    let handle = collector.register([agent(1), agent(2)], CompletionPolicy::AllTargets, None);

    collector.dispatch(reply(&agent(3), None));
    collector.dispatch(reply(&agent(1), None));

    let recorded = handle.responses();
    assert_eq!(recorded.len(), 1);
    assert!(recorded.contains_key(&agent(1)));
    assert!(!recorded.contains_key(&agent(3)));
}

#[tokio::test(start_paused = true)]
async fn all_targets_returns_at_the_last_reply() {
    let collector = Arc::new(ResponseCollector::new());
    let targets = [agent(1), agent(2), agent(3)];
    let handle = collector.register(targets.clone(), CompletionPolicy::AllTargets, None);

    for (delay_secs, target) in [(1u64, agent(1)), (1, agent(2)), (9, agent(3))] {
        let collector = Arc::clone(&collector);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(delay_secs)).await;
            collector.dispatch(reply(&target, None));
        });
    }

    let start = Instant::now();
    let responses = handle.wait(Duration::from_secs(10)).await.unwrap();
    let elapsed = start.elapsed();

    assert_eq!(responses.len(), 3);
    assert!(elapsed >= Duration::from_secs(9));
    assert!(elapsed < Duration::from_secs(10), "no residual sleep past completion");
}

#[tokio::test(start_paused = true)]
async fn timeout_names_missing_targets_and_keeps_partials() {
    let collector = Arc::new(ResponseCollector::new());
    let handle = collector.register([agent(1), agent(2)], CompletionPolicy::AllTargets, None);

    {
        let collector = Arc::clone(&collector);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            collector.dispatch(reply(&agent(1), None));
        });
    }

    let err = handle.wait(Duration::from_secs(5)).await.unwrap_err();
    match err {
        Error::Timeout {
            missing,
            received,
            elapsed_ms,
        } => {
            assert_eq!(missing, vec![agent(2)]);
            assert_eq!(received.len(), 1);
            assert!(received.contains_key(&agent(1)));
            assert!(elapsed_ms >= 5_000);
        }
        other => panic!("expected Timeout, got {other:?}"),
    }
}

#[tokio::test]
async fn any_one_completes_on_first_reply() {
    let collector = Arc::new(ResponseCollector::new());
    let handle = collector.register([agent(1), agent(2)], CompletionPolicy::AnyOne, None);

    collector.dispatch(reply(&agent(2), None));

    let responses = handle.wait(Duration::from_secs(1)).await.unwrap();
    assert_eq!(responses.len(), 1);
    assert!(responses.contains_key(&agent(2)));
}

#[tokio::test]
async fn concurrent_requests_never_leak_responses() {
    let collector = Arc::new(ResponseCollector::new());
    // Same target set, different correlation tokens
    let handle_a = collector.register(
        [agent(1)],
        CompletionPolicy::AllTargets,
        Some("corr-a".to_string()),
    );
    let handle_b = collector.register(
        [agent(1)],
        CompletionPolicy::AllTargets,
        Some("corr-b".to_string()),
    );

    collector.dispatch(reply(&agent(1), Some("corr-a")));

    let responses = handle_a.wait(Duration::from_millis(200)).await.unwrap();
    assert_eq!(responses.len(), 1);
    assert!(handle_b
        .wait(Duration::from_millis(200))
        .await
        .is_err(), "a reply for request A must never satisfy request B");
}

#[tokio::test]
async fn later_reply_from_same_sender_wins() {
    let collector = Arc::new(ResponseCollector::new());
    let handle = collector.register([agent(1), agent(2)], CompletionPolicy::AllTargets, None);

    let mut first = reply(&agent(1), None);
    first.data = json!({ "results": { "status": "unknown" } });
    collector.dispatch(first);
    collector.dispatch(reply(&agent(1), None));

    let recorded = handle.responses();
    assert_eq!(recorded.len(), 1);
    let status = recorded[&agent(1)].data["results"]["status"].as_str().unwrap();
    assert_eq!(status, "success");
}

#[tokio::test(start_paused = true)]
async fn waiter_recheck_tolerates_wakes_before_completion() {
    let collector = Arc::new(ResponseCollector::new());
    let handle = collector.register([agent(1), agent(2)], CompletionPolicy::AllTargets, None);

    // First reply wakes the waiter but the predicate does not hold yet
    for (delay_ms, target) in [(10u64, agent(1)), (50, agent(2))] {
        let collector = Arc::clone(&collector);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            collector.dispatch(reply(&target, None));
        });
    }

    let responses = handle.wait(Duration::from_secs(1)).await.unwrap();
    assert_eq!(responses.len(), 2);
}

#[tokio::test]
async fn reply_landing_at_the_deadline_boundary_is_kept() {
    let collector = Arc::new(ResponseCollector::new());
    let handle = collector.register([agent(1)], CompletionPolicy::AllTargets, None);

    // Deadline of zero forces the final recheck path
    collector.dispatch(reply(&agent(1), None));
    let responses = handle.wait(Duration::ZERO).await.unwrap();
    assert_eq!(responses.len(), 1);
}
