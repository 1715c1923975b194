//! Wiring: build the control plane out of its backends, run the periodic
//! loops, and shut the whole thing down in order.

use crate::admin::{self, AdminState};
use crate::bus::EventBus;
use crate::cluster::{ClusterCoordinator, MemberEvent};
use crate::config::PolarisConfig;
use crate::health::HealthRegistry;
use crate::orchestrator::BreakerOrchestrator;
use crate::pool::TaskPool;
use crate::probe::EndpointProber;
use crate::recovery::RecoveryHandler;
use crate::reconcile::SubscriptionReconciler;
use crate::registry::BreakerRegistry;
use crate::republish::Republisher;
use crate::scans::{DeliveringScan, FailedScan};
use crate::scheduler::ProbeScheduler;
use crate::store::MessageStore;
use crate::subscription::{SubscriptionEvent, SubscriptionView};
use crate::time::{Clock, Sleeper, SystemClock, TokioSleeper};
use crate::token::OAuth2TokenProvider;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

const LOCK_WAIT: Duration = Duration::from_secs(10);

/// A required backend was not supplied to the builder.
#[derive(Debug, thiserror::Error)]
#[error("missing required component: {0}")]
pub struct BuildError(&'static str);

pub struct PolarisBuilder {
    config: PolarisConfig,
    bus: Option<Arc<dyn EventBus>>,
    store: Option<Arc<dyn MessageStore>>,
    cluster: Option<Arc<dyn ClusterCoordinator>>,
    registry: Option<Arc<dyn BreakerRegistry>>,
    prober: Option<Arc<dyn EndpointProber>>,
    token_refresher: Option<Arc<OAuth2TokenProvider>>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
}

impl PolarisBuilder {
    pub fn bus(mut self, bus: Arc<dyn EventBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn store(mut self, store: Arc<dyn MessageStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn cluster(mut self, cluster: Arc<dyn ClusterCoordinator>) -> Self {
        self.cluster = Some(cluster);
        self
    }

    pub fn registry(mut self, registry: Arc<dyn BreakerRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn prober(mut self, prober: Arc<dyn EndpointProber>) -> Self {
        self.prober = Some(prober);
        self
    }

    /// Enable the periodic token refresh for a client-credentials provider.
    pub fn token_refresher(mut self, provider: Arc<OAuth2TokenProvider>) -> Self {
        self.token_refresher = Some(provider);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn build(self) -> Result<Arc<Polaris>, BuildError> {
        let bus = self.bus.ok_or(BuildError("event bus"))?;
        let store = self.store.ok_or(BuildError("message store"))?;
        let cluster = self.cluster.ok_or(BuildError("cluster coordinator"))?;
        let registry = self.registry.ok_or(BuildError("breaker registry"))?;
        let prober = self.prober.ok_or(BuildError("endpoint prober"))?;
        let config = self.config;

        let view = Arc::new(SubscriptionView::new());
        let health = Arc::new(HealthRegistry::new(Arc::clone(&self.clock)));
        let republisher = Arc::new(Republisher::new(
            Arc::clone(&bus),
            Arc::clone(&view),
            Arc::clone(&self.clock),
            config.default_topic.clone(),
            config.picking_timeout(),
        ));
        let recovery = Arc::new(RecoveryHandler::new(
            Arc::clone(&health),
            Arc::clone(&registry),
            Arc::clone(&store),
            Arc::clone(&republisher),
            Arc::clone(&cluster),
            Arc::clone(&self.clock),
            config.republishing_batch_size,
        ));
        let republish_pool = TaskPool::new(
            "republishing",
            config.republishing_threadpool.max_size,
            config.republishing_threadpool.queue_capacity,
        );
        let reconcile_pool = TaskPool::new(
            "subscription-check",
            config.subscription_check_threadpool.max_size,
            config.subscription_check_threadpool.queue_capacity,
        );
        let scheduler = Arc::new(ProbeScheduler::new(
            Arc::clone(&health),
            Arc::clone(&registry),
            Arc::clone(&view),
            prober,
            Arc::clone(&recovery),
            republish_pool.clone(),
            Arc::clone(&self.sleeper),
            Arc::clone(&self.clock),
            config.successful_status_codes.clone(),
        ));
        let reconciler = Arc::new(SubscriptionReconciler::new(
            Arc::clone(&health),
            Arc::clone(&registry),
            Arc::clone(&scheduler),
            Arc::clone(&recovery),
            republish_pool.clone(),
            Arc::clone(&self.clock),
            config.request_delay(),
        ));
        let orchestrator = Arc::new(BreakerOrchestrator::new(
            Arc::clone(&cluster),
            Arc::clone(&registry),
            Arc::clone(&view),
            Arc::clone(&reconciler),
            reconcile_pool.clone(),
            config.polling_batch_size,
        ));
        let delivering_scan = Arc::new(DeliveringScan::new(
            Arc::clone(&cluster),
            Arc::clone(&store),
            Arc::clone(&republisher),
            Arc::clone(&self.clock),
            config.delivering_states_offset(),
            config.republishing_batch_size,
        ));
        let failed_scan = Arc::new(FailedScan::new(
            Arc::clone(&cluster),
            Arc::clone(&store),
            Arc::clone(&republisher),
            config.republishing_batch_size,
        ));

        let (shutdown, _) = watch::channel(false);
        Ok(Arc::new(Polaris {
            config,
            cluster,
            registry,
            view,
            health,
            scheduler,
            recovery,
            reconciler,
            orchestrator,
            delivering_scan,
            failed_scan,
            reconcile_pool,
            republish_pool,
            token_refresher: self.token_refresher,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }))
    }
}

/// The assembled control plane.
pub struct Polaris {
    config: PolarisConfig,
    cluster: Arc<dyn ClusterCoordinator>,
    registry: Arc<dyn BreakerRegistry>,
    view: Arc<SubscriptionView>,
    health: Arc<HealthRegistry>,
    scheduler: Arc<ProbeScheduler>,
    recovery: Arc<RecoveryHandler>,
    reconciler: Arc<SubscriptionReconciler>,
    orchestrator: Arc<BreakerOrchestrator>,
    delivering_scan: Arc<DeliveringScan>,
    failed_scan: Arc<FailedScan>,
    reconcile_pool: TaskPool,
    republish_pool: TaskPool,
    token_refresher: Option<Arc<OAuth2TokenProvider>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Polaris {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Polaris").field("self_id", &self.cluster.self_id()).finish()
    }
}

impl Polaris {
    pub fn builder(config: PolarisConfig) -> PolarisBuilder {
        PolarisBuilder {
            config,
            bus: None,
            store: None,
            cluster: None,
            registry: None,
            prober: None,
            token_refresher: None,
            clock: Arc::new(SystemClock),
            sleeper: Arc::new(TokioSleeper),
        }
    }

    pub fn view(&self) -> &Arc<SubscriptionView> {
        &self.view
    }

    pub fn health(&self) -> &Arc<HealthRegistry> {
        &self.health
    }

    pub fn orchestrator(&self) -> &Arc<BreakerOrchestrator> {
        &self.orchestrator
    }

    pub fn scheduler(&self) -> &Arc<ProbeScheduler> {
        &self.scheduler
    }

    /// The admin REST router, served by the embedding process.
    pub fn admin_router(&self) -> axum::Router {
        admin::router(AdminState {
            registry: Arc::clone(&self.registry),
            view: Arc::clone(&self.view),
            health: Arc::clone(&self.health),
            scheduler: Arc::clone(&self.scheduler),
            recovery: Arc::clone(&self.recovery),
            cluster: Arc::clone(&self.cluster),
        })
    }

    /// Start the periodic loops. Call once.
    pub fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let interval = self.config.polling_interval();
        tasks.push(self.spawn_ticker(interval, "open-scan", {
            let orchestrator = Arc::clone(&self.orchestrator);
            move || {
                let orchestrator = Arc::clone(&orchestrator);
                async move {
                    if let Err(error) = orchestrator.run_open_scan().await {
                        tracing::debug!(%error, "open scan skipped");
                    }
                }
            }
        }));
        tasks.push(self.spawn_ticker(interval, "delivering-scan", {
            let scan = Arc::clone(&self.delivering_scan);
            move || {
                let scan = Arc::clone(&scan);
                async move {
                    if let Err(error) = scan.run().await {
                        tracing::debug!(%error, "delivering scan skipped");
                    }
                }
            }
        }));
        tasks.push(self.spawn_ticker(interval, "failed-scan", {
            let scan = Arc::clone(&self.failed_scan);
            move || {
                let scan = Arc::clone(&scan);
                async move {
                    if let Err(error) = scan.run().await {
                        tracing::debug!(%error, "failed scan skipped");
                    }
                }
            }
        }));
        tasks.push(self.spawn_ticker(interval, "health-sweep", {
            let health = Arc::clone(&self.health);
            let idle_window = self.config.request_cooldown_reset();
            move || {
                let health = Arc::clone(&health);
                async move {
                    health.sweep(idle_window);
                }
            }
        }));
        if let Some(provider) = &self.token_refresher {
            tasks.push(self.spawn_ticker(self.config.token_refresh_period(), "token-refresh", {
                let provider = Arc::clone(provider);
                move || {
                    let provider = Arc::clone(&provider);
                    async move {
                        provider.refresh_all().await;
                    }
                }
            }));
        }

        // Member events: a removed member's breakers need new owners.
        let orchestrator = Arc::clone(&self.orchestrator);
        let mut events = self.cluster.member_events();
        let mut shutdown = self.shutdown.subscribe();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(MemberEvent::Removed(member)) => {
                            if let Err(error) = orchestrator.on_member_removed(&member).await {
                                tracing::warn!(member = %member, %error, "member rescan failed");
                            }
                        }
                        Ok(MemberEvent::Added(member)) => {
                            tracing::info!(member = %member, "member joined");
                        }
                        Err(_) => break,
                    },
                    _ = shutdown.changed() => break,
                }
            }
        }));
    }

    fn spawn_ticker<F, Fut>(&self, period: Duration, name: &'static str, mut work: F) -> JoinHandle<()>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => work().await,
                    _ = shutdown.changed() => {
                        tracing::debug!(name, "loop stopped");
                        break;
                    }
                }
            }
        })
    }

    /// Entry point for the external subscription watcher. Updates the view,
    /// then reconciles under the global lock once the subscription is
    /// claimed.
    pub async fn on_subscription_event(&self, event: SubscriptionEvent) {
        self.view.apply(&event);
        let subscription_id = event
            .new
            .as_ref()
            .or(event.old.as_ref())
            .map(|projection| projection.subscription_id.clone());
        let Some(subscription_id) = subscription_id else {
            return;
        };

        match self.cluster.try_global_lock(LOCK_WAIT).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(subscription = %subscription_id, "lock busy, scan will catch up");
                return;
            }
            Err(error) => {
                tracing::warn!(subscription = %subscription_id, %error, "lock unavailable");
                return;
            }
        }
        let claimed = matches!(self.cluster.try_claim(&subscription_id).await, Ok(true));
        if claimed {
            let reconciler = Arc::clone(&self.reconciler);
            let (old, new) = (event.old, event.new);
            self.reconcile_pool
                .submit(async move {
                    reconciler.reconcile(old, new).await;
                })
                .await;
        }
        self.cluster.global_unlock().await;
    }

    /// The watcher calls this after its initial sync; in-flight work from a
    /// previous incarnation is adopted here.
    pub async fn mark_subscriptions_synced(&self) {
        self.view.mark_synced();
        if let Err(error) = self.orchestrator.run_startup_recovery().await {
            tracing::warn!(%error, "startup recovery skipped");
        }
    }

    /// Stop accepting new work, wait for in-flight probes and republishes
    /// (bounded), then release the global lock.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        self.scheduler.shutdown();

        let handles: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            tasks.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }

        let grace = self.config.max_timeout() + self.config.republishing_timeout();
        let drain = async {
            self.reconcile_pool.drain().await;
            self.republish_pool.drain().await;
        };
        if tokio::time::timeout(grace, drain).await.is_err() {
            tracing::warn!(?grace, "in-flight work did not finish within the grace period");
        }
        self.cluster.global_unlock().await;
        tracing::info!("polaris stopped");
    }
}
