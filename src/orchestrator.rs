//! The top-level breaker loop: scan the registry, claim work, transition
//! states, and hand the rest to the reconciler.

use crate::breaker::{BreakerRecord, BreakerStatus};
use crate::cluster::ClusterCoordinator;
use crate::error::RoundError;
use crate::pool::TaskPool;
use crate::reconcile::SubscriptionReconciler;
use crate::registry::BreakerRegistry;
use crate::subscription::{SubscriptionProjection, SubscriptionView};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// Bounded wait for the global lock; a round that cannot get it is skipped.
const LOCK_WAIT: Duration = Duration::from_secs(10);

pub struct BreakerOrchestrator {
    cluster: Arc<dyn ClusterCoordinator>,
    registry: Arc<dyn BreakerRegistry>,
    view: Arc<SubscriptionView>,
    reconciler: Arc<SubscriptionReconciler>,
    reconcile_pool: TaskPool,
    batch_size: usize,
}

impl std::fmt::Debug for BreakerOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BreakerOrchestrator").field("batch_size", &self.batch_size).finish()
    }
}

impl BreakerOrchestrator {
    pub fn new(
        cluster: Arc<dyn ClusterCoordinator>,
        registry: Arc<dyn BreakerRegistry>,
        view: Arc<SubscriptionView>,
        reconciler: Arc<SubscriptionReconciler>,
        reconcile_pool: TaskPool,
        batch_size: usize,
    ) -> Self {
        Self {
            cluster,
            registry,
            view,
            reconciler,
            reconcile_pool,
            batch_size: batch_size.max(1),
        }
    }

    /// Periodic tick: adopt OPEN breakers.
    pub async fn run_open_scan(&self) -> Result<(), RoundError> {
        self.scan(&[BreakerStatus::Open]).await
    }

    /// A member left: its CHECKING and REPUBLISHING breakers need new
    /// owners, and anything it left OPEN is fair game too.
    pub async fn on_member_removed(&self, member: &str) -> Result<(), RoundError> {
        tracing::info!(member, "member removed, rescanning all breakers");
        self.scan(&[BreakerStatus::Open, BreakerStatus::Checking, BreakerStatus::Republishing])
            .await
    }

    /// Startup: pick up in-flight work left by a previous incarnation. Runs
    /// once the subscription view is fully synced.
    pub async fn run_startup_recovery(&self) -> Result<(), RoundError> {
        self.scan(&[BreakerStatus::Republishing, BreakerStatus::Checking]).await
    }

    async fn scan(&self, statuses: &[BreakerStatus]) -> Result<(), RoundError> {
        let members = self
            .cluster
            .members()
            .await
            .map_err(|error| RoundError::WorkingSetUndetermined(error.to_string()))?;
        let self_id = self.cluster.self_id().to_string();
        if members.is_empty() {
            return Err(RoundError::WorkingSetUndetermined("no known members".to_string()));
        }
        if !members.iter().any(|member| member == &self_id) {
            return Err(RoundError::WorkingSetUndetermined(format!(
                "{self_id} is not listed in the cluster"
            )));
        }

        if !self.cluster.try_global_lock(LOCK_WAIT).await? {
            return Err(RoundError::LockTimeout(LOCK_WAIT));
        }
        let result = self.scan_locked(statuses, &self_id).await;
        self.cluster.global_unlock().await;
        result
    }

    async fn scan_locked(
        &self,
        statuses: &[BreakerStatus],
        self_id: &str,
    ) -> Result<(), RoundError> {
        // Records already handled this round; keeps the page re-read rule
        // from looping over our own adoptions.
        let mut seen: HashSet<String> = HashSet::new();

        for status in statuses {
            let mut page = 0usize;
            loop {
                let records =
                    self.registry.get_paged(page, self.batch_size, Some(*status), None).await?;
                if records.is_empty() {
                    break;
                }
                let short_page = records.len() < self.batch_size;

                let mut claimed_any = false;
                for record in records {
                    if seen.contains(&record.subscription_id) {
                        continue;
                    }
                    match self.cluster.try_claim(&record.subscription_id).await {
                        Ok(true) => {}
                        Ok(false) => {
                            // Another member owns it.
                            continue;
                        }
                        Err(error) => {
                            tracing::warn!(
                                subscription = %record.subscription_id,
                                %error,
                                "claim attempt failed"
                            );
                            continue;
                        }
                    }
                    seen.insert(record.subscription_id.clone());
                    claimed_any = true;
                    self.adopt(record, self_id).await;
                }

                if short_page {
                    break;
                }
                // Our claims mutate the status-filtered set, so what was this
                // page is no longer; re-read it before advancing.
                if !claimed_any {
                    page += 1;
                }
            }
        }
        Ok(())
    }

    async fn adopt(&self, record: BreakerRecord, self_id: &str) {
        let subscription_id = record.subscription_id.clone();
        let Some(projection) = self.view.get(&subscription_id) else {
            tracing::info!(subscription = %subscription_id, "no subscription left, closing breaker");
            if let Err(error) = self.registry.remove(&subscription_id).await {
                tracing::warn!(subscription = %subscription_id, %error, "close failed");
            }
            self.cluster.release_claim(&subscription_id).await;
            return;
        };

        let mut updated = record.clone();
        updated.status = BreakerStatus::Checking;
        updated.assigned_owner = Some(self_id.to_string());
        if let Err(error) = self.registry.update(updated).await {
            tracing::warn!(subscription = %subscription_id, %error, "adoption write failed");
            return;
        }
        tracing::info!(subscription = %subscription_id, owner = self_id, "breaker adopted, checking");

        // The pre-image carries the URL the breaker tripped on; method and
        // the rest come from the current projection.
        let pre_image = SubscriptionProjection {
            callback_url: Some(record.callback_url.clone()),
            ..projection.clone()
        };
        let reconciler = Arc::clone(&self.reconciler);
        self.reconcile_pool
            .submit(async move {
                reconciler.reconcile(Some(pre_image), Some(projection)).await;
            })
            .await;
    }
}
