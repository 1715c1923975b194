//! The probe scheduler: at most one scheduled probe per `(url, method)`.
//!
//! A second schedule request for a key cancels the existing one. Cancellation
//! is cooperative: a probe that has not started is dropped from the queue; a
//! probe already running finishes, and its result is discarded except for
//! clearing the in-flight flag. A probe that wakes up to an empty
//! subscription set terminates itself the same way.

use crate::breaker::HealthCheck;
use crate::cooldown;
use crate::health::{HealthKey, HealthRegistry};
use crate::pool::TaskPool;
use crate::probe::{EndpointProber, ProbeRequest};
use crate::recovery::RecoveryHandler;
use crate::registry::BreakerRegistry;
use crate::subscription::{SubscriptionId, SubscriptionView};
use crate::time::{Clock, Sleeper};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

struct ScheduledProbe {
    id: u64,
    handle: JoinHandle<()>,
    started: Arc<AtomicBool>,
    discarded: Arc<AtomicBool>,
}

pub struct ProbeScheduler {
    tasks: Mutex<HashMap<HealthKey, ScheduledProbe>>,
    next_id: AtomicU64,
    shutdown: AtomicBool,
    health: Arc<HealthRegistry>,
    registry: Arc<dyn BreakerRegistry>,
    view: Arc<SubscriptionView>,
    prober: Arc<dyn EndpointProber>,
    recovery: Arc<RecoveryHandler>,
    republish_pool: TaskPool,
    sleeper: Arc<dyn Sleeper>,
    clock: Arc<dyn Clock>,
    successful_codes: BTreeSet<u16>,
}

impl std::fmt::Debug for ProbeScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProbeScheduler")
            .field("pending", &self.tasks.lock().map(|t| t.len()).unwrap_or(0))
            .finish()
    }
}

impl ProbeScheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        health: Arc<HealthRegistry>,
        registry: Arc<dyn BreakerRegistry>,
        view: Arc<SubscriptionView>,
        prober: Arc<dyn EndpointProber>,
        recovery: Arc<RecoveryHandler>,
        republish_pool: TaskPool,
        sleeper: Arc<dyn Sleeper>,
        clock: Arc<dyn Clock>,
        successful_codes: BTreeSet<u16>,
    ) -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
            health,
            registry,
            view,
            prober,
            recovery,
            republish_pool,
            sleeper,
            clock,
            successful_codes,
        }
    }

    /// Delay for the next probe of `key`, damped by the entry's counter.
    pub fn damped_delay(&self, key: &HealthKey) -> Duration {
        cooldown::probe_delay(self.health.republish_count(key))
    }

    /// Schedule a probe for `key` after `delay`, replacing any probe already
    /// scheduled for the key.
    pub fn schedule(self: &Arc<Self>, key: HealthKey, delay: Duration) {
        if self.shutdown.load(Ordering::SeqCst) {
            return;
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let started = Arc::new(AtomicBool::new(false));
        let discarded = Arc::new(AtomicBool::new(false));

        let mut tasks = self.lock_tasks();
        if let Some(existing) = tasks.remove(&key) {
            Self::cancel_entry(existing);
        }

        let scheduler = Arc::clone(self);
        let task_key = key.clone();
        let task_started = Arc::clone(&started);
        let task_discarded = Arc::clone(&discarded);
        let handle = tokio::spawn(async move {
            scheduler.sleeper.sleep(delay).await;
            task_started.store(true, Ordering::SeqCst);
            scheduler.run_probe(task_key, id, task_discarded).await;
        });

        tracing::debug!(key = %key, ?delay, "probe scheduled");
        tasks.insert(key, ScheduledProbe { id, handle, started, discarded });
    }

    /// Drop any scheduled probe for `key`. A probe that already started runs
    /// to completion with its result discarded.
    pub fn cancel(&self, key: &HealthKey) {
        let mut tasks = self.lock_tasks();
        if let Some(existing) = tasks.remove(key) {
            tracing::debug!(key = %key, "probe cancelled");
            Self::cancel_entry(existing);
        }
    }

    pub fn has_pending(&self, key: &HealthKey) -> bool {
        self.lock_tasks().contains_key(key)
    }

    pub fn pending_count(&self) -> usize {
        self.lock_tasks().len()
    }

    /// Stop accepting schedules and drop everything still queued.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let mut tasks = self.lock_tasks();
        for (_, entry) in tasks.drain() {
            Self::cancel_entry(entry);
        }
    }

    fn cancel_entry(entry: ScheduledProbe) {
        if entry.started.load(Ordering::SeqCst) {
            entry.discarded.store(true, Ordering::SeqCst);
        } else {
            entry.handle.abort();
        }
    }

    async fn run_probe(self: Arc<Self>, key: HealthKey, id: u64, discarded: Arc<AtomicBool>) {
        let subscriptions = self.health.subscription_ids(&key);
        if subscriptions.is_empty() {
            self.health.set_thread_open(&key, false);
            self.remove_if_current(&key, id);
            return;
        }
        self.health.set_thread_open(&key, true);

        let request = self.probe_request(&key, &subscriptions).await;
        let outcome = self.prober.probe(&request).await;

        if discarded.load(Ordering::SeqCst) {
            self.health.set_thread_open(&key, false);
            return;
        }

        self.health.update_probe_result(&key, outcome.status_code, &outcome.reason);
        let check = HealthCheck {
            checked_at: self.clock.now(),
            status_code: outcome.status_code,
            reason: outcome.reason.clone(),
        };
        for subscription_id in &subscriptions {
            match self.registry.get(subscription_id).await {
                Ok(Some(mut record)) => {
                    record.last_health_check = Some(check.clone());
                    if let Err(error) = self.registry.update(record).await {
                        tracing::warn!(subscription = %subscription_id, %error, "probe result write failed");
                    }
                }
                Ok(None) => {}
                Err(error) => {
                    tracing::warn!(subscription = %subscription_id, %error, "probe result lookup failed");
                }
            }
        }

        self.remove_if_current(&key, id);
        if outcome.successful(&self.successful_codes) {
            tracing::info!(key = %key, status = ?outcome.status_code, "probe succeeded");
            let recovery = Arc::clone(&self.recovery);
            let recovered_key = key.clone();
            self.republish_pool
                .submit(async move {
                    recovery.handle(&recovered_key).await;
                })
                .await;
        } else {
            let damping = self.health.bump_republish_count(&key);
            let delay = cooldown::probe_delay(damping);
            tracing::info!(
                key = %key,
                status = ?outcome.status_code,
                reason = %outcome.reason,
                damping,
                next_in = ?delay,
                "probe failed, rescheduling"
            );
            self.schedule(key, delay);
        }
    }

    /// Identity for the probe comes from any bound subscription: the
    /// projection when one exists, otherwise the breaker record.
    async fn probe_request(&self, key: &HealthKey, subscriptions: &[SubscriptionId]) -> ProbeRequest {
        for subscription_id in subscriptions {
            if let Some(projection) = self.view.get(subscription_id) {
                return ProbeRequest {
                    url: key.callback_url.clone(),
                    method: key.method,
                    environment: projection.environment,
                    publisher_id: projection.publisher_id,
                    subscriber_id: projection.subscriber_id,
                };
            }
        }
        for subscription_id in subscriptions {
            if let Ok(Some(record)) = self.registry.get(subscription_id).await {
                return ProbeRequest {
                    url: key.callback_url.clone(),
                    method: key.method,
                    environment: record.environment,
                    publisher_id: String::new(),
                    subscriber_id: record.subscriber_id,
                };
            }
        }
        ProbeRequest {
            url: key.callback_url.clone(),
            method: key.method,
            environment: String::new(),
            publisher_id: String::new(),
            subscriber_id: String::new(),
        }
    }

    fn remove_if_current(&self, key: &HealthKey, id: u64) {
        let mut tasks = self.lock_tasks();
        if tasks.get(key).is_some_and(|entry| entry.id == id) {
            tasks.remove(key);
        }
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, HashMap<HealthKey, ScheduledProbe>> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
