//! The shared breaker registry: a cluster map from subscription id to
//! [`BreakerRecord`], queryable by status and owner with stable paging.

use crate::breaker::{BreakerRecord, BreakerStatus};
use crate::error::RegistryError;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Mutex;

/// Narrow interface over the cluster-wide breaker map.
///
/// Writes are last-writer-wins; serialization comes from the global lock and
/// the per-subscription claim, not from the backend.
#[async_trait]
pub trait BreakerRegistry: Send + Sync {
    async fn get(&self, subscription_id: &str) -> Result<Option<BreakerRecord>, RegistryError>;

    /// One page of records, ordered by subscription id so pages stay stable
    /// across reads. Callers re-read a page after mutating records out of
    /// the filtered set.
    async fn get_paged(
        &self,
        page: usize,
        size: usize,
        status: Option<BreakerStatus>,
        owner: Option<&str>,
    ) -> Result<Vec<BreakerRecord>, RegistryError>;

    /// Idempotent full-record write.
    async fn update(&self, record: BreakerRecord) -> Result<(), RegistryError>;

    /// Status-only write; a no-op when the record is gone.
    async fn update_status(
        &self,
        subscription_id: &str,
        status: BreakerStatus,
    ) -> Result<(), RegistryError>;

    /// Close the breaker.
    async fn remove(&self, subscription_id: &str) -> Result<(), RegistryError>;
}

/// Registry backend for single-process deployments and tests.
#[derive(Debug, Default)]
pub struct InMemoryBreakerRegistry {
    inner: Mutex<BTreeMap<String, BreakerRecord>>,
}

impl InMemoryBreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, BreakerRecord>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl BreakerRegistry for InMemoryBreakerRegistry {
    async fn get(&self, subscription_id: &str) -> Result<Option<BreakerRecord>, RegistryError> {
        Ok(self.lock().get(subscription_id).cloned())
    }

    async fn get_paged(
        &self,
        page: usize,
        size: usize,
        status: Option<BreakerStatus>,
        owner: Option<&str>,
    ) -> Result<Vec<BreakerRecord>, RegistryError> {
        let inner = self.lock();
        Ok(inner
            .values()
            .filter(|record| status.is_none_or(|s| record.status == s))
            .filter(|record| {
                owner.is_none_or(|o| record.assigned_owner.as_deref() == Some(o))
            })
            .skip(page.saturating_mul(size))
            .take(size)
            .cloned()
            .collect())
    }

    async fn update(&self, record: BreakerRecord) -> Result<(), RegistryError> {
        self.lock().insert(record.subscription_id.clone(), record);
        Ok(())
    }

    async fn update_status(
        &self,
        subscription_id: &str,
        status: BreakerStatus,
    ) -> Result<(), RegistryError> {
        if let Some(record) = self.lock().get_mut(subscription_id) {
            record.status = status;
        }
        Ok(())
    }

    async fn remove(&self, subscription_id: &str) -> Result<(), RegistryError> {
        self.lock().remove(subscription_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn record(id: &str, status: BreakerStatus, owner: Option<&str>) -> BreakerRecord {
        let mut r = BreakerRecord::open(
            id,
            format!("https://example.test/{id}"),
            "integration",
            "sub--acme",
            Utc::now(),
        );
        r.status = status;
        r.assigned_owner = owner.map(str::to_string);
        r
    }

    #[tokio::test]
    async fn paging_is_ordered_by_subscription_id() {
        let registry = InMemoryBreakerRegistry::new();
        for id in ["s3", "s1", "s2", "s4"] {
            registry.update(record(id, BreakerStatus::Open, None)).await.unwrap();
        }

        let first = registry.get_paged(0, 2, None, None).await.unwrap();
        let second = registry.get_paged(1, 2, None, None).await.unwrap();
        let ids: Vec<_> = first.iter().chain(&second).map(|r| r.subscription_id.clone()).collect();
        assert_eq!(ids, vec!["s1", "s2", "s3", "s4"]);
    }

    #[tokio::test]
    async fn paging_filters_by_status_and_owner() {
        let registry = InMemoryBreakerRegistry::new();
        registry.update(record("s1", BreakerStatus::Open, None)).await.unwrap();
        registry.update(record("s2", BreakerStatus::Checking, Some("pod-a"))).await.unwrap();
        registry.update(record("s3", BreakerStatus::Checking, Some("pod-b"))).await.unwrap();

        let checking = registry
            .get_paged(0, 10, Some(BreakerStatus::Checking), None)
            .await
            .unwrap();
        assert_eq!(checking.len(), 2);

        let owned = registry
            .get_paged(0, 10, Some(BreakerStatus::Checking), Some("pod-b"))
            .await
            .unwrap();
        assert_eq!(owned.len(), 1);
        assert_eq!(owned[0].subscription_id, "s3");
    }

    #[tokio::test]
    async fn update_status_is_a_noop_for_missing_records() {
        let registry = InMemoryBreakerRegistry::new();
        registry.update_status("ghost", BreakerStatus::Republishing).await.unwrap();
        assert!(registry.get("ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn remove_closes_the_breaker() {
        let registry = InMemoryBreakerRegistry::new();
        registry.update(record("s1", BreakerStatus::Republishing, None)).await.unwrap();
        registry.remove("s1").await.unwrap();
        assert!(registry.get("s1").await.unwrap().is_none());
    }
}
