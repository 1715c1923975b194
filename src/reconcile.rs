//! Subscription-change reconciliation.
//!
//! Compares the pre-image and post-image of a subscription and performs
//! exactly one of: health-registry cleanup on deletion, a delivery-type
//! change republish, an opt-out republish, a probe (re)schedule, or nothing.
//! Callers claim the subscription before invoking this.

use crate::breaker::BreakerStatus;
use crate::cooldown;
use crate::health::{HealthKey, HealthRegistry};
use crate::pool::TaskPool;
use crate::recovery::RecoveryHandler;
use crate::registry::BreakerRegistry;
use crate::scheduler::ProbeScheduler;
use crate::store::MessageQuery;
use crate::subscription::{DeliveryType, SubscriptionProjection};
use crate::time::Clock;
use std::sync::Arc;
use std::time::Duration;

pub struct SubscriptionReconciler {
    health: Arc<HealthRegistry>,
    registry: Arc<dyn BreakerRegistry>,
    scheduler: Arc<ProbeScheduler>,
    recovery: Arc<RecoveryHandler>,
    republish_pool: TaskPool,
    clock: Arc<dyn Clock>,
    /// Base delay for probing an endpoint identity we have no damping
    /// history for (fresh URL or method).
    request_delay: Duration,
}

impl std::fmt::Debug for SubscriptionReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionReconciler").finish()
    }
}

impl SubscriptionReconciler {
    pub fn new(
        health: Arc<HealthRegistry>,
        registry: Arc<dyn BreakerRegistry>,
        scheduler: Arc<ProbeScheduler>,
        recovery: Arc<RecoveryHandler>,
        republish_pool: TaskPool,
        clock: Arc<dyn Clock>,
        request_delay: Duration,
    ) -> Self {
        Self { health, registry, scheduler, recovery, republish_pool, clock, request_delay }
    }

    /// Exactly one branch fires per call.
    pub async fn reconcile(
        &self,
        old: Option<SubscriptionProjection>,
        new: Option<SubscriptionProjection>,
    ) {
        match (old, new) {
            (Some(old), None) => self.on_deleted(&old),
            (Some(old), Some(new)) => self.on_changed(old, new).await,
            // A subscription that just appeared has nothing tripped yet.
            (None, _) => {}
        }
    }

    fn on_deleted(&self, old: &SubscriptionProjection) {
        let Some(url) = old.callback_url.as_deref() else {
            return;
        };
        let key = HealthKey::new(url, old.probe_method);
        let emptied = self.health.remove(&key, &old.subscription_id);
        tracing::info!(subscription = %old.subscription_id, key = %key, "subscription deleted");
        if emptied {
            self.health.set_thread_open(&key, false);
            self.scheduler.cancel(&key);
        }
    }

    async fn on_changed(&self, old: SubscriptionProjection, new: SubscriptionProjection) {
        let subscription_id = new.subscription_id.clone();

        match (old.delivery_type, new.delivery_type) {
            (DeliveryType::Callback, DeliveryType::Sse) => {
                if let Some(url) = old.callback_url.as_deref() {
                    self.health.remove(&HealthKey::new(url, old.probe_method), &subscription_id);
                }
                self.spawn_delivery_type_change(subscription_id, DeliveryType::Sse).await;
                return;
            }
            (DeliveryType::Sse, DeliveryType::Callback) => {
                // No health cleanup: SSE subscriptions have no entry.
                self.spawn_delivery_type_change(subscription_id, DeliveryType::Callback).await;
                return;
            }
            (DeliveryType::Sse, DeliveryType::Sse) => return,
            (DeliveryType::Callback, DeliveryType::Callback) => {}
        }

        if new.circuit_breaker_opt_out {
            let url = new.callback_url.clone().or_else(|| old.callback_url.clone());
            let Some(url) = url else {
                return;
            };
            let key = HealthKey::new(url, new.probe_method);
            self.health.add(&key, &subscription_id);
            tracing::info!(subscription = %subscription_id, key = %key, "opted out, republishing directly");
            let recovery = Arc::clone(&self.recovery);
            self.republish_pool
                .submit(async move {
                    recovery.handle(&key).await;
                })
                .await;
            return;
        }

        let old_url = old.callback_url.clone().unwrap_or_default();
        let new_url = new.callback_url.clone().unwrap_or_else(|| old_url.clone());
        let url_changed = new_url != old_url;
        let method_changed = new.probe_method != old.probe_method;

        if !url_changed && !method_changed {
            let key = HealthKey::new(new_url, new.probe_method);
            self.health.add(&key, &subscription_id);
            let delay = self.scheduler.damped_delay(&key);
            self.scheduler.schedule(key, delay);
            return;
        }

        if !url_changed {
            // Same endpoint, new probe method.
            self.health.remove(&HealthKey::new(old_url, old.probe_method), &subscription_id);
            let key = HealthKey::new(new_url, new.probe_method);
            self.health.add(&key, &subscription_id);
            let delay = self.fresh_or_damped_delay(&key);
            self.scheduler.schedule(key, delay);
            return;
        }

        match self.registry.get(&subscription_id).await {
            Ok(None) => {
                // URL changed but nothing is tripped; the next failure will
                // open a breaker against the new URL.
            }
            Ok(Some(mut record)) => {
                self.health.remove(&HealthKey::new(old_url, old.probe_method), &subscription_id);
                record.callback_url = new_url.clone();
                if let Err(error) = self.registry.update(record).await {
                    tracing::warn!(subscription = %subscription_id, %error, "breaker URL update failed");
                }
                let key = HealthKey::new(new_url, new.probe_method);
                self.health.add(&key, &subscription_id);
                let delay = self.fresh_or_damped_delay(&key);
                tracing::info!(subscription = %subscription_id, key = %key, "callback URL changed, probing new endpoint");
                self.scheduler.schedule(key, delay);
            }
            Err(error) => {
                tracing::warn!(subscription = %subscription_id, %error, "breaker lookup failed");
            }
        }
    }

    /// A key that carries damping history keeps it; an unknown one starts at
    /// the configured base delay rather than hammering a just-configured
    /// endpoint immediately.
    fn fresh_or_damped_delay(&self, key: &HealthKey) -> Duration {
        match self.health.republish_count(key) {
            0 => self.request_delay,
            n => cooldown::probe_delay(n),
        }
    }

    async fn spawn_delivery_type_change(&self, subscription_id: String, target: DeliveryType) {
        tracing::info!(subscription = %subscription_id, ?target, "delivery type changed, republishing");
        let registry = Arc::clone(&self.registry);
        let recovery = Arc::clone(&self.recovery);
        let clock = Arc::clone(&self.clock);
        self.republish_pool
            .submit(async move {
                if let Err(error) =
                    registry.update_status(&subscription_id, BreakerStatus::Republishing).await
                {
                    tracing::warn!(subscription = %subscription_id, %error, "status update failed");
                }
                let query = match target {
                    // Switching to callback: replay what the SSE stream already
                    // processed so the delivery path pushes it.
                    DeliveryType::Callback => MessageQuery::processed_sse(&subscription_id),
                    // Switching to SSE: everything parked behind the breaker
                    // flows to the stream instead.
                    DeliveryType::Sse => MessageQuery::republishable(&subscription_id, clock.now()),
                };
                if let Err(error) = recovery.drain_query(&subscription_id, &query).await {
                    tracing::warn!(subscription = %subscription_id, %error, "delivery type republish failed");
                }
                recovery.close_if_republishing(&subscription_id).await;
            })
            .await;
    }
}
