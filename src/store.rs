//! Query interface over the persistent state database that tracks delivery
//! status per event. Polaris only reads; mutation happens downstream when
//! the delivery path consumes what Polaris re-emits.

use crate::error::StoreError;
use crate::message::{ErrorClass, MessageCoord, MessageStatus};
use crate::subscription::{DeliveryType, SubscriptionId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Mutex;

/// Filter over message states. All populated fields must match; the error
/// class constrains FAILED records only (WAITING records carry none).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageQuery {
    pub statuses: Vec<MessageStatus>,
    pub error_class: Option<ErrorClass>,
    pub delivery_type: Option<DeliveryType>,
    pub subscription_ids: Vec<SubscriptionId>,
    pub modified_before: Option<DateTime<Utc>>,
}

impl MessageQuery {
    /// Events parked behind a breaker for one subscription: WAITING, plus
    /// FAILED states whose callback URL could not be resolved.
    pub fn republishable(subscription_id: &str, until: DateTime<Utc>) -> Self {
        Self {
            statuses: vec![MessageStatus::Waiting, MessageStatus::Failed],
            error_class: Some(ErrorClass::CallbackUrlNotFound),
            subscription_ids: vec![subscription_id.to_string()],
            modified_before: Some(until),
            ..Self::default()
        }
    }

    /// SSE events already processed, for a subscription switching to
    /// callback delivery.
    pub fn processed_sse(subscription_id: &str) -> Self {
        Self {
            statuses: vec![MessageStatus::Processed],
            delivery_type: Some(DeliveryType::Sse),
            subscription_ids: vec![subscription_id.to_string()],
            ..Self::default()
        }
    }

    /// Callback events stuck in DELIVERING since before `cutoff`.
    pub fn delivering_before(cutoff: DateTime<Utc>) -> Self {
        Self {
            statuses: vec![MessageStatus::Delivering],
            delivery_type: Some(DeliveryType::Callback),
            modified_before: Some(cutoff),
            ..Self::default()
        }
    }

    /// FAILED events carrying a delivery-side callback exception.
    pub fn failed_callback() -> Self {
        Self {
            statuses: vec![MessageStatus::Failed],
            error_class: Some(ErrorClass::CallbackException),
            ..Self::default()
        }
    }

    fn matches(&self, coord: &MessageCoord) -> bool {
        if !self.statuses.is_empty() && !self.statuses.contains(&coord.status) {
            return false;
        }
        if coord.status == MessageStatus::Failed {
            if let Some(class) = self.error_class {
                if coord.error_class != Some(class) {
                    return false;
                }
            }
        }
        if let Some(delivery_type) = self.delivery_type {
            if coord.delivery_type != delivery_type {
                return false;
            }
        }
        if !self.subscription_ids.is_empty()
            && !self.subscription_ids.contains(&coord.subscription_id)
        {
            return false;
        }
        if let Some(cutoff) = self.modified_before {
            if coord.timestamp > cutoff {
                return false;
            }
        }
        true
    }
}

/// Read access to the state database.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// One page of matching coordinates, timestamp-ascending. Callers that
    /// expect the republish to mutate state out of the filter re-read page
    /// zero instead of advancing.
    async fn query(
        &self,
        query: &MessageQuery,
        page: usize,
        size: usize,
    ) -> Result<Vec<MessageCoord>, StoreError>;
}

/// State-store stand-in for tests and single-process setups.
#[derive(Debug, Default)]
pub struct InMemoryMessageStore {
    rows: Mutex<Vec<MessageCoord>>,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, coord: MessageCoord) {
        self.lock().push(coord);
    }

    /// Mirror of the downstream mutation: the delivery path marks an event's
    /// state once it consumes the re-emitted record.
    pub fn set_status(&self, uuid: uuid::Uuid, status: MessageStatus) {
        if let Some(row) = self.lock().iter_mut().find(|row| row.uuid == uuid) {
            row.status = status;
            row.error_class = None;
        }
    }

    pub fn get(&self, uuid: uuid::Uuid) -> Option<MessageCoord> {
        self.lock().iter().find(|row| row.uuid == uuid).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<MessageCoord>> {
        self.rows.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl MessageStore for InMemoryMessageStore {
    async fn query(
        &self,
        query: &MessageQuery,
        page: usize,
        size: usize,
    ) -> Result<Vec<MessageCoord>, StoreError> {
        let rows = self.lock();
        let mut matching: Vec<MessageCoord> =
            rows.iter().filter(|coord| query.matches(coord)).cloned().collect();
        matching.sort_by_key(|coord| (coord.timestamp, coord.uuid));
        Ok(matching.into_iter().skip(page.saturating_mul(size)).take(size).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use uuid::Uuid;

    fn coord(
        sub: &str,
        status: MessageStatus,
        error_class: Option<ErrorClass>,
        delivery_type: DeliveryType,
        age_mins: i64,
    ) -> MessageCoord {
        MessageCoord {
            uuid: Uuid::new_v4(),
            subscription_id: sub.to_string(),
            topic: "subscribed".to_string(),
            partition: Some(0),
            offset: Some(1),
            delivery_type,
            event_ref: "evt".to_string(),
            status,
            error_class,
            timestamp: Utc::now() - ChronoDuration::minutes(age_mins),
        }
    }

    #[tokio::test]
    async fn republishable_matches_waiting_and_url_not_found() {
        let store = InMemoryMessageStore::new();
        store.insert(coord("s1", MessageStatus::Waiting, None, DeliveryType::Callback, 10));
        store.insert(coord(
            "s1",
            MessageStatus::Failed,
            Some(ErrorClass::CallbackUrlNotFound),
            DeliveryType::Callback,
            5,
        ));
        store.insert(coord(
            "s1",
            MessageStatus::Failed,
            Some(ErrorClass::CallbackException),
            DeliveryType::Callback,
            5,
        ));
        store.insert(coord("s2", MessageStatus::Waiting, None, DeliveryType::Callback, 5));

        let page = store
            .query(&MessageQuery::republishable("s1", Utc::now()), 0, 10)
            .await
            .unwrap();
        assert_eq!(page.len(), 2);
        assert!(page.iter().all(|c| c.subscription_id == "s1"));
    }

    #[tokio::test]
    async fn results_are_timestamp_ascending() {
        let store = InMemoryMessageStore::new();
        store.insert(coord("s1", MessageStatus::Waiting, None, DeliveryType::Callback, 1));
        store.insert(coord("s1", MessageStatus::Waiting, None, DeliveryType::Callback, 30));
        store.insert(coord("s1", MessageStatus::Waiting, None, DeliveryType::Callback, 10));

        let page = store
            .query(&MessageQuery::republishable("s1", Utc::now()), 0, 10)
            .await
            .unwrap();
        let stamps: Vec<_> = page.iter().map(|c| c.timestamp).collect();
        let mut sorted = stamps.clone();
        sorted.sort();
        assert_eq!(stamps, sorted);
    }

    #[tokio::test]
    async fn delivering_query_honors_the_cutoff() {
        let store = InMemoryMessageStore::new();
        store.insert(coord("s1", MessageStatus::Delivering, None, DeliveryType::Callback, 30));
        store.insert(coord("s1", MessageStatus::Delivering, None, DeliveryType::Callback, 5));
        store.insert(coord("s1", MessageStatus::Delivering, None, DeliveryType::Sse, 30));

        let cutoff = Utc::now() - ChronoDuration::minutes(15);
        let page = store.query(&MessageQuery::delivering_before(cutoff), 0, 10).await.unwrap();
        assert_eq!(page.len(), 1, "only old CALLBACK deliveries match");
    }

    #[tokio::test]
    async fn paging_skips_and_takes() {
        let store = InMemoryMessageStore::new();
        for age in [40, 30, 20, 10] {
            store.insert(coord("s1", MessageStatus::Waiting, None, DeliveryType::Callback, age));
        }
        let query = MessageQuery::republishable("s1", Utc::now());
        let first = store.query(&query, 0, 3).await.unwrap();
        let second = store.query(&query, 1, 3).await.unwrap();
        assert_eq!(first.len(), 3);
        assert_eq!(second.len(), 1);
    }
}
