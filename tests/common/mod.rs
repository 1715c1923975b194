//! Shared fixtures for the end-to-end suites: an assembled control plane on
//! in-process backends, a scriptable prober, and a sleeper that freezes the
//! probe loop after a set number of steps.

// Each suite uses a different slice of these helpers.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use polaris::breaker::{BreakerRecord, BreakerStatus};
use polaris::bus::MemoryBus;
use polaris::cluster::InProcessCluster;
use polaris::message::{MessageCoord, MessageStatus, SubscriptionEventMessage};
use polaris::probe::{EndpointProber, ProbeOutcome, ProbeRequest};
use polaris::registry::{BreakerRegistry, InMemoryBreakerRegistry};
use polaris::store::InMemoryMessageStore;
use polaris::subscription::{DeliveryType, ProbeMethod, SubscriptionProjection};
use polaris::time::Sleeper;
use polaris::{Polaris, PolarisConfig};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Plays back a fixed list of probe outcomes, then repeats the last one.
/// Every request is recorded.
#[derive(Debug)]
pub struct ScriptedProber {
    outcomes: Mutex<VecDeque<ProbeOutcome>>,
    fallback: ProbeOutcome,
    requests: Mutex<Vec<ProbeRequest>>,
}

impl ScriptedProber {
    pub fn new(outcomes: Vec<ProbeOutcome>) -> Self {
        let fallback = outcomes
            .last()
            .cloned()
            .unwrap_or(ProbeOutcome { status_code: Some(200), reason: "OK".to_string() });
        Self {
            outcomes: Mutex::new(outcomes.into()),
            fallback,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<ProbeRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl EndpointProber for ScriptedProber {
    async fn probe(&self, request: &ProbeRequest) -> ProbeOutcome {
        self.requests.lock().unwrap().push(request.clone());
        self.outcomes.lock().unwrap().pop_front().unwrap_or_else(|| self.fallback.clone())
    }
}

pub fn status(code: u16, reason: &str) -> ProbeOutcome {
    ProbeOutcome { status_code: Some(code), reason: reason.to_string() }
}

/// Returns instantly for the first `budget` sleeps, records every requested
/// delay, then parks forever. Freezing the loop keeps assertions stable.
#[derive(Debug)]
pub struct SteppedSleeper {
    budget: Mutex<usize>,
    delays: Mutex<Vec<Duration>>,
}

impl SteppedSleeper {
    pub fn new(budget: usize) -> Self {
        Self { budget: Mutex::new(budget), delays: Mutex::new(Vec::new()) }
    }

    pub fn delays(&self) -> Vec<Duration> {
        self.delays.lock().unwrap().clone()
    }
}

#[async_trait]
impl Sleeper for SteppedSleeper {
    async fn sleep(&self, duration: Duration) {
        self.delays.lock().unwrap().push(duration);
        let exhausted = {
            let mut budget = self.budget.lock().unwrap();
            if *budget == 0 {
                true
            } else {
                *budget -= 1;
                false
            }
        };
        if exhausted {
            std::future::pending::<()>().await;
        }
    }
}

pub struct TestEnv {
    pub polaris: Arc<Polaris>,
    pub cluster: Arc<InProcessCluster>,
    pub registry: Arc<InMemoryBreakerRegistry>,
    pub store: Arc<InMemoryMessageStore>,
    pub bus: Arc<MemoryBus>,
    pub prober: Arc<ScriptedProber>,
    pub sleeper: Arc<SteppedSleeper>,
}

impl TestEnv {
    pub fn new(outcomes: Vec<ProbeOutcome>, sleep_budget: usize) -> Self {
        // RUST_LOG=polaris=debug makes a failing suite narrate itself.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();

        let cluster = Arc::new(InProcessCluster::new("pod-a"));
        let registry = Arc::new(InMemoryBreakerRegistry::new());
        let store = Arc::new(InMemoryMessageStore::new());
        let bus = Arc::new(MemoryBus::new());
        let prober = Arc::new(ScriptedProber::new(outcomes));
        let sleeper = Arc::new(SteppedSleeper::new(sleep_budget));

        // Mirror the downstream consumer: the delivery path applies whatever
        // status the re-emitted record carries.
        let store_hook = Arc::clone(&store);
        bus.on_publish(move |_, message: &SubscriptionEventMessage| {
            store_hook.set_status(message.uuid, message.status);
        });

        let polaris = Polaris::builder(PolarisConfig::default())
            .bus(Arc::clone(&bus) as _)
            .store(Arc::clone(&store) as _)
            .cluster(Arc::clone(&cluster) as _)
            .registry(Arc::clone(&registry) as _)
            .prober(Arc::clone(&prober) as _)
            .sleeper(Arc::clone(&sleeper) as _)
            .build()
            .expect("all components supplied");

        Self { polaris, cluster, registry, store, bus, prober, sleeper }
    }

    pub fn projection(&self, id: &str, url: &str) -> SubscriptionProjection {
        let projection = SubscriptionProjection {
            subscription_id: id.to_string(),
            publisher_id: "pub--acme".to_string(),
            subscriber_id: "sub--acme".to_string(),
            environment: "integration".to_string(),
            callback_url: Some(url.to_string()),
            delivery_type: DeliveryType::Callback,
            probe_method: ProbeMethod::Head,
            circuit_breaker_opt_out: false,
        };
        self.polaris.view().upsert(projection.clone());
        projection
    }

    pub async fn open_breaker(&self, id: &str, url: &str) -> BreakerRecord {
        let record = BreakerRecord::open(id, url, "integration", "sub--acme", Utc::now());
        self.registry.update(record.clone()).await.unwrap();
        record
    }

    /// Park one WAITING event for `id` at exact bus coordinates, with the
    /// original record seeded so a pick can succeed.
    pub fn seed_waiting_event(&self, id: &str, partition: i32, offset: i64) -> MessageCoord {
        let coord = self.seed_waiting_state(id, partition, offset);
        let original = SubscriptionEventMessage {
            uuid: coord.uuid,
            status: MessageStatus::Waiting,
            delivery_type: DeliveryType::Callback,
            subscription_id: id.to_string(),
            environment: "integration".to_string(),
            event: serde_json::json!({"id": coord.event_ref}),
            retention_topic: None,
            error_type: None,
            error_message: None,
            modified: Utc::now(),
        };
        self.bus.seed("subscribed", partition, offset, serde_json::to_value(&original).unwrap());
        coord
    }

    /// Park one WAITING state whose bus record is gone: any pick will fail.
    pub fn seed_waiting_state(&self, id: &str, partition: i32, offset: i64) -> MessageCoord {
        let coord = MessageCoord {
            uuid: uuid::Uuid::new_v4(),
            subscription_id: id.to_string(),
            topic: "subscribed".to_string(),
            partition: Some(partition),
            offset: Some(offset),
            delivery_type: DeliveryType::Callback,
            event_ref: format!("evt-{offset}"),
            status: MessageStatus::Waiting,
            error_class: None,
            timestamp: Utc::now(),
        };
        self.store.insert(coord.clone());
        coord
    }

    pub async fn breaker_status(&self, id: &str) -> Option<BreakerStatus> {
        self.registry.get(id).await.unwrap().map(|record| record.status)
    }
}

/// Poll until `predicate` holds, failing the test after five seconds.
pub async fn wait_until<F>(what: &str, predicate: F)
where
    F: Fn() -> bool,
{
    for _ in 0..500 {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {what}");
}

/// Async-predicate variant of [`wait_until`].
pub async fn wait_until_async<F, Fut>(what: &str, predicate: F)
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..500 {
        if predicate().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {what}");
}
