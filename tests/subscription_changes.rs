//! Subscription watcher flows: delivery-type changes and deletions arriving
//! through the service entry point.

mod common;

use common::{status, wait_until, wait_until_async, TestEnv};
use polaris::breaker::BreakerStatus;
use polaris::health::HealthKey;
use polaris::message::MessageStatus;
use polaris::registry::BreakerRegistry;
use polaris::subscription::{
    DeliveryType, ProbeMethod, SubscriptionEvent, SubscriptionEventKind, SubscriptionProjection,
};

const URL: &str = "https://subscriber.example.test/callback";

fn key() -> HealthKey {
    HealthKey::new(URL, ProbeMethod::Head)
}

fn sse_projection(id: &str) -> SubscriptionProjection {
    SubscriptionProjection {
        subscription_id: id.to_string(),
        publisher_id: "pub--acme".to_string(),
        subscriber_id: "sub--acme".to_string(),
        environment: "integration".to_string(),
        callback_url: None,
        delivery_type: DeliveryType::Sse,
        probe_method: ProbeMethod::Head,
        circuit_breaker_opt_out: false,
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn switch_to_sse_republishes_parked_events_as_sse() {
    let env = TestEnv::new(vec![status(503, "Service Unavailable")], 0);
    let old = env.projection("s1", URL);
    let mut record = env.open_breaker("s1", URL).await;
    record.status = BreakerStatus::Checking;
    record.assigned_owner = Some("pod-a".to_string());
    env.registry.update(record).await.unwrap();
    env.polaris.health().add(&key(), "s1");
    env.seed_waiting_event("s1", 0, 5);

    let new = sse_projection("s1");
    env.polaris
        .on_subscription_event(SubscriptionEvent {
            kind: SubscriptionEventKind::Updated,
            old: Some(old),
            new: Some(new),
        })
        .await;

    wait_until("event republished", || env.bus.published().len() == 1).await;
    let (_, message) = &env.bus.published()[0];
    assert_eq!(message.status, MessageStatus::Processed);
    assert_eq!(message.delivery_type, DeliveryType::Sse, "delivery type rewritten");

    assert!(!env.polaris.health().subscription_ids(&key()).contains(&"s1".to_string()));
    wait_until_async("breaker closed", || async {
        env.breaker_status("s1").await.is_none()
    })
    .await;
}

#[tokio::test(flavor = "multi_thread")]
async fn deletion_cleans_the_health_entry() {
    let env = TestEnv::new(vec![status(503, "Service Unavailable")], 0);
    let old = env.projection("s1", URL);
    env.polaris.health().add(&key(), "s1");

    env.polaris
        .on_subscription_event(SubscriptionEvent {
            kind: SubscriptionEventKind::Removed,
            old: Some(old),
            new: None,
        })
        .await;

    wait_until("entry drained", || env.polaris.health().subscription_ids(&key()).is_empty())
        .await;
    assert!(!env.polaris.health().thread_open(&key()));
    assert!(env.polaris.view().get("s1").is_none(), "projection dropped from the view");
}

#[tokio::test(flavor = "multi_thread")]
async fn orphaned_breaker_closes_on_the_next_scan() {
    // The projection is gone entirely; the scan closes the breaker rather
    // than reconciling it.
    let env = TestEnv::new(vec![status(200, "OK")], 4);
    env.open_breaker("s1", URL).await;

    env.polaris.orchestrator().run_open_scan().await.unwrap();

    wait_until_async("breaker closed", || async {
        env.breaker_status("s1").await.is_none()
    })
    .await;
    assert!(env.prober.requests().is_empty(), "nothing to probe");
}
