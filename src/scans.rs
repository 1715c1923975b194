//! Periodic state-store sweeps outside the breaker lifecycle: events stuck
//! in DELIVERING, and FAILED events carrying a delivery-side callback
//! exception.

use crate::cluster::ClusterCoordinator;
use crate::error::RoundError;
use crate::republish::Republisher;
use crate::store::{MessageQuery, MessageStore};
use crate::time::Clock;
use chrono::Duration as ChronoDuration;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

const LOCK_WAIT: Duration = Duration::from_secs(10);

/// Re-emit callback events that sat in DELIVERING longer than the configured
/// offset; their delivery attempt died with the worker that ran it. One
/// worker at a time, guarded by the global lock.
pub struct DeliveringScan {
    cluster: Arc<dyn ClusterCoordinator>,
    store: Arc<dyn MessageStore>,
    republisher: Arc<Republisher>,
    clock: Arc<dyn Clock>,
    offset: Duration,
    batch_size: usize,
}

impl std::fmt::Debug for DeliveringScan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveringScan").field("offset", &self.offset).finish()
    }
}

impl DeliveringScan {
    pub fn new(
        cluster: Arc<dyn ClusterCoordinator>,
        store: Arc<dyn MessageStore>,
        republisher: Arc<Republisher>,
        clock: Arc<dyn Clock>,
        offset: Duration,
        batch_size: usize,
    ) -> Self {
        Self { cluster, store, republisher, clock, offset, batch_size: batch_size.max(1) }
    }

    pub async fn run(&self) -> Result<(), RoundError> {
        if !self.cluster.try_global_lock(LOCK_WAIT).await? {
            return Err(RoundError::LockTimeout(LOCK_WAIT));
        }
        let result = self.sweep().await;
        self.cluster.global_unlock().await;
        result
    }

    async fn sweep(&self) -> Result<(), RoundError> {
        let cutoff = self.clock.now()
            - ChronoDuration::from_std(self.offset).unwrap_or(ChronoDuration::zero());
        let query = MessageQuery::delivering_before(cutoff);
        let mut total = 0usize;
        let mut previous_head = None;
        loop {
            let page = self.store.query(&query, 0, self.batch_size).await?;
            let Some(head) = page.first().map(|coord| coord.uuid) else {
                break;
            };
            if previous_head == Some(head) {
                break;
            }
            previous_head = Some(head);
            total += page.len();
            self.republisher.republish_batch(&page).await;
        }
        if total > 0 {
            tracing::info!(total, "stuck DELIVERING events re-emitted");
        }
        Ok(())
    }
}

/// Re-emit FAILED events whose failure was a delivery-side callback
/// exception. Cluster-lock guarded like the delivering scan, plus a
/// process-local reentrancy flag so one slow sweep cannot overlap itself.
pub struct FailedScan {
    cluster: Arc<dyn ClusterCoordinator>,
    store: Arc<dyn MessageStore>,
    republisher: Arc<Republisher>,
    batch_size: usize,
    is_running: AtomicBool,
}

impl std::fmt::Debug for FailedScan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailedScan")
            .field("is_running", &self.is_running.load(Ordering::SeqCst))
            .finish()
    }
}

impl FailedScan {
    pub fn new(
        cluster: Arc<dyn ClusterCoordinator>,
        store: Arc<dyn MessageStore>,
        republisher: Arc<Republisher>,
        batch_size: usize,
    ) -> Self {
        Self {
            cluster,
            store,
            republisher,
            batch_size: batch_size.max(1),
            is_running: AtomicBool::new(false),
        }
    }

    pub async fn run(&self) -> Result<(), RoundError> {
        if self
            .is_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("failed scan still running, skipping tick");
            return Ok(());
        }
        let result = self.run_guarded().await;
        self.is_running.store(false, Ordering::SeqCst);
        result
    }

    async fn run_guarded(&self) -> Result<(), RoundError> {
        if !self.cluster.try_global_lock(LOCK_WAIT).await? {
            return Err(RoundError::LockTimeout(LOCK_WAIT));
        }
        let result = self.sweep().await;
        self.cluster.global_unlock().await;
        result
    }

    async fn sweep(&self) -> Result<(), RoundError> {
        let query = MessageQuery::failed_callback();
        let mut total = 0usize;
        let mut previous_head = None;
        loop {
            let page = self.store.query(&query, 0, self.batch_size).await?;
            let Some(head) = page.first().map(|coord| coord.uuid) else {
                break;
            };
            if previous_head == Some(head) {
                break;
            }
            previous_head = Some(head);
            total += page.len();
            self.republisher.republish_batch(&page).await;
        }
        if total > 0 {
            tracing::info!(total, "FAILED callback events re-emitted");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{EventBus, MemoryBus};
    use crate::cluster::InProcessCluster;
    use crate::message::{ErrorClass, MessageCoord, MessageStatus, SubscriptionEventMessage};
    use crate::store::InMemoryMessageStore;
    use crate::subscription::{DeliveryType, SubscriptionView};
    use crate::time::SystemClock;
    use chrono::Utc;
    use uuid::Uuid;

    struct Fixture {
        cluster: Arc<InProcessCluster>,
        store: Arc<InMemoryMessageStore>,
        bus: Arc<MemoryBus>,
        republisher: Arc<Republisher>,
        clock: Arc<dyn Clock>,
    }

    fn fixture() -> Fixture {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let cluster = Arc::new(InProcessCluster::new("pod-a"));
        let store = Arc::new(InMemoryMessageStore::new());
        let bus = Arc::new(MemoryBus::new());
        let view = Arc::new(SubscriptionView::new());

        let store_hook = Arc::clone(&store);
        bus.on_publish(move |_, message: &SubscriptionEventMessage| {
            store_hook.set_status(message.uuid, MessageStatus::Processed);
        });

        let republisher = Arc::new(Republisher::new(
            Arc::clone(&bus) as Arc<dyn EventBus>,
            view,
            Arc::clone(&clock),
            "subscribed",
            Duration::from_secs(1),
        ));
        Fixture { cluster, store, bus, republisher, clock }
    }

    fn seed(fx: &Fixture, status: MessageStatus, error_class: Option<ErrorClass>, age_mins: i64, offset: i64) {
        let coord = MessageCoord {
            uuid: Uuid::new_v4(),
            subscription_id: "s1".to_string(),
            topic: "subscribed".to_string(),
            partition: Some(0),
            offset: Some(offset),
            delivery_type: DeliveryType::Callback,
            event_ref: format!("evt-{offset}"),
            status,
            error_class,
            timestamp: Utc::now() - ChronoDuration::minutes(age_mins),
        };
        let original = SubscriptionEventMessage {
            uuid: coord.uuid,
            status,
            delivery_type: DeliveryType::Callback,
            subscription_id: "s1".to_string(),
            environment: "integration".to_string(),
            event: serde_json::Value::Null,
            retention_topic: None,
            error_type: None,
            error_message: None,
            modified: coord.timestamp,
        };
        fx.bus.seed("subscribed", 0, offset, serde_json::to_value(&original).unwrap());
        fx.store.insert(coord);
    }

    #[tokio::test]
    async fn delivering_scan_only_touches_old_events() {
        let fx = fixture();
        seed(&fx, MessageStatus::Delivering, None, 30, 1);
        seed(&fx, MessageStatus::Delivering, None, 1, 2);

        let scan = DeliveringScan::new(
            Arc::clone(&fx.cluster) as Arc<dyn ClusterCoordinator>,
            Arc::clone(&fx.store) as Arc<dyn MessageStore>,
            Arc::clone(&fx.republisher),
            Arc::clone(&fx.clock),
            Duration::from_secs(15 * 60),
            10,
        );
        scan.run().await.unwrap();

        assert_eq!(fx.bus.published().len(), 1, "the fresh DELIVERING event stays put");
    }

    #[tokio::test]
    async fn delivering_scan_skips_when_lock_is_held() {
        let fx = fixture();
        seed(&fx, MessageStatus::Delivering, None, 30, 1);

        let other = fx.cluster.join("pod-b");
        assert!(other.try_global_lock(Duration::from_millis(10)).await.unwrap());

        let scan = DeliveringScan::new(
            Arc::clone(&fx.cluster) as Arc<dyn ClusterCoordinator>,
            Arc::clone(&fx.store) as Arc<dyn MessageStore>,
            Arc::clone(&fx.republisher),
            Arc::clone(&fx.clock),
            Duration::from_secs(15 * 60),
            10,
        );
        // The lock wait is bounded at 10s; run concurrently with a release.
        let release = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            other.global_unlock().await;
        };
        let (result, ()) = tokio::join!(scan.run(), release);
        result.unwrap();
        assert_eq!(fx.bus.published().len(), 1);
    }

    #[tokio::test]
    async fn failed_scan_selects_callback_exceptions_only() {
        let fx = fixture();
        seed(&fx, MessageStatus::Failed, Some(ErrorClass::CallbackException), 5, 1);
        seed(&fx, MessageStatus::Failed, Some(ErrorClass::CallbackUrlNotFound), 5, 2);
        seed(&fx, MessageStatus::Waiting, None, 5, 3);

        let scan = FailedScan::new(
            Arc::clone(&fx.cluster) as Arc<dyn ClusterCoordinator>,
            Arc::clone(&fx.store) as Arc<dyn MessageStore>,
            Arc::clone(&fx.republisher),
            10,
        );
        scan.run().await.unwrap();

        assert_eq!(fx.bus.published().len(), 1);
    }

    #[tokio::test]
    async fn failed_scan_does_not_overlap_itself() {
        let fx = fixture();
        let scan = Arc::new(FailedScan::new(
            Arc::clone(&fx.cluster) as Arc<dyn ClusterCoordinator>,
            Arc::clone(&fx.store) as Arc<dyn MessageStore>,
            Arc::clone(&fx.republisher),
            10,
        ));

        scan.is_running.store(true, Ordering::SeqCst);
        scan.run().await.unwrap();
        assert!(fx.bus.published().is_empty(), "tick skipped while flagged running");
        assert!(scan.is_running.load(Ordering::SeqCst), "foreign flag left untouched");
    }
}
