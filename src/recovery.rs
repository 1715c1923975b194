//! Recovery after a successful probe: drain the endpoint's subscriptions out
//! of the health entry and republish everything parked behind their
//! breakers.

use crate::breaker::BreakerStatus;
use crate::cluster::ClusterCoordinator;
use crate::error::StoreError;
use crate::health::{HealthKey, HealthRegistry};
use crate::registry::BreakerRegistry;
use crate::republish::Republisher;
use crate::store::{MessageQuery, MessageStore};
use crate::time::Clock;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Runs one republish cycle per `(url, method)` key. A second invocation for
/// a key already in flight skips; the running cycle covers the intent.
pub struct RecoveryHandler {
    in_flight: Mutex<HashSet<HealthKey>>,
    health: Arc<HealthRegistry>,
    registry: Arc<dyn BreakerRegistry>,
    store: Arc<dyn MessageStore>,
    republisher: Arc<Republisher>,
    cluster: Arc<dyn ClusterCoordinator>,
    clock: Arc<dyn Clock>,
    batch_size: usize,
}

impl std::fmt::Debug for RecoveryHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryHandler").field("batch_size", &self.batch_size).finish()
    }
}

struct InFlightGuard<'a> {
    set: &'a Mutex<HashSet<HealthKey>>,
    key: HealthKey,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.set.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).remove(&self.key);
    }
}

impl RecoveryHandler {
    pub fn new(
        health: Arc<HealthRegistry>,
        registry: Arc<dyn BreakerRegistry>,
        store: Arc<dyn MessageStore>,
        republisher: Arc<Republisher>,
        cluster: Arc<dyn ClusterCoordinator>,
        clock: Arc<dyn Clock>,
        batch_size: usize,
    ) -> Self {
        Self {
            in_flight: Mutex::new(HashSet::new()),
            health,
            registry,
            store,
            republisher,
            cluster,
            clock,
            batch_size: batch_size.max(1),
        }
    }

    /// Entry point after a successful probe (and for opt-out reconciliation).
    pub async fn handle(&self, key: &HealthKey) {
        let Some(_guard) = self.enter(key) else {
            tracing::debug!(key = %key, "republish cycle already in flight, skipping");
            return;
        };

        if !self.health.contains(key) {
            self.health.set_thread_open(key, false);
            return;
        }

        let subscriptions = self.health.clear_before_republishing(key, None);
        if subscriptions.is_empty() {
            self.health.set_thread_open(key, false);
            return;
        }
        tracing::info!(
            key = %key,
            subscriptions = subscriptions.len(),
            "endpoint recovered, republishing queued events"
        );

        for subscription_id in &subscriptions {
            if let Err(error) = self.republish_subscription(subscription_id).await {
                tracing::warn!(
                    subscription = %subscription_id,
                    %error,
                    "republish cycle aborted for subscription"
                );
            }
        }

        for subscription_id in &subscriptions {
            self.close_if_republishing(subscription_id).await;
        }
    }

    /// Move the breaker to REPUBLISHING and drain every republishable event
    /// for the subscription.
    pub async fn republish_subscription(&self, subscription_id: &str) -> Result<(), StoreError> {
        if let Err(error) =
            self.registry.update_status(subscription_id, BreakerStatus::Republishing).await
        {
            tracing::warn!(subscription = %subscription_id, %error, "status update failed");
        }
        let query = MessageQuery::republishable(subscription_id, self.clock.now());
        self.drain_query(subscription_id, &query).await
    }

    /// Drain every event matching `query` through the republisher. Pages are
    /// always re-read at zero: a successful republish mutates the state
    /// downstream, so the query's natural order advances the iteration. A
    /// page that repeats its head means nothing moved; the rest is left for
    /// the next cycle.
    pub async fn drain_query(
        &self,
        subscription_id: &str,
        query: &MessageQuery,
    ) -> Result<(), StoreError> {
        let mut previous_head: Option<Uuid> = None;
        loop {
            let page = self.store.query(query, 0, self.batch_size).await?;
            let Some(head) = page.first().map(|coord| coord.uuid) else {
                break;
            };
            if previous_head == Some(head) {
                tracing::warn!(
                    subscription = %subscription_id,
                    "republish made no progress, leaving the rest for the next cycle"
                );
                break;
            }
            previous_head = Some(head);
            self.republisher.republish_batch(&page).await;
        }
        Ok(())
    }

    /// Close the breaker unless something (the delivery path reopening it)
    /// moved it out of REPUBLISHING in the meantime.
    pub async fn close_if_republishing(&self, subscription_id: &str) {
        match self.registry.get(subscription_id).await {
            Ok(Some(record)) if record.status == BreakerStatus::Republishing => {
                if let Err(error) = self.registry.remove(subscription_id).await {
                    tracing::warn!(subscription = %subscription_id, %error, "close failed");
                    return;
                }
                self.cluster.release_claim(subscription_id).await;
                tracing::info!(subscription = %subscription_id, "breaker closed");
            }
            Ok(Some(record)) => {
                tracing::info!(
                    subscription = %subscription_id,
                    status = %record.status,
                    "breaker no longer republishing, leaving it alone"
                );
            }
            Ok(None) => {}
            Err(error) => {
                tracing::warn!(subscription = %subscription_id, %error, "close lookup failed");
            }
        }
    }

    fn enter(&self, key: &HealthKey) -> Option<InFlightGuard<'_>> {
        let mut set = self.in_flight.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if set.insert(key.clone()) {
            Some(InFlightGuard { set: &self.in_flight, key: key.clone() })
        } else {
            None
        }
    }
}
