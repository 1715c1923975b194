//! Republishing: pick the original record off the bus by exact coordinates,
//! rewrite its delivery type and status, and re-emit it so the delivery path
//! picks it up again.

use crate::bus::EventBus;
use crate::error::PickError;
use crate::message::{MessageCoord, MessageStatus, SubscriptionEventMessage};
use crate::subscription::SubscriptionView;
use crate::time::Clock;
use std::sync::Arc;
use std::time::Duration;

/// Outcome counts for one batch. Failures here are FAILED records emitted,
/// not errors raised.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RepublishSummary {
    pub republished: usize,
    pub failed: usize,
}

impl RepublishSummary {
    fn absorb(&mut self, other: RepublishSummary) {
        self.republished += other.republished;
        self.failed += other.failed;
    }
}

pub struct Republisher {
    bus: Arc<dyn EventBus>,
    view: Arc<SubscriptionView>,
    clock: Arc<dyn Clock>,
    default_topic: String,
    picking_timeout: Duration,
}

impl std::fmt::Debug for Republisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Republisher").field("default_topic", &self.default_topic).finish()
    }
}

impl Republisher {
    pub fn new(
        bus: Arc<dyn EventBus>,
        view: Arc<SubscriptionView>,
        clock: Arc<dyn Clock>,
        default_topic: impl Into<String>,
        picking_timeout: Duration,
    ) -> Self {
        Self { bus, view, clock, default_topic: default_topic.into(), picking_timeout }
    }

    /// Handle every coordinate independently; one poisoned coordinate never
    /// fails the batch.
    pub async fn republish_batch(&self, coords: &[MessageCoord]) -> RepublishSummary {
        let mut summary = RepublishSummary::default();
        for coord in coords {
            summary.absorb(self.republish_one(coord).await);
        }
        summary
    }

    async fn republish_one(&self, coord: &MessageCoord) -> RepublishSummary {
        let (partition, offset) = match (coord.partition, coord.offset) {
            (Some(partition), Some(offset)) => (partition, offset),
            _ => return self.emit_pick_failure(coord, PickError::MissingCoordinates).await,
        };

        let record = match self
            .bus
            .read_at(&coord.topic, partition, offset, self.picking_timeout)
            .await
        {
            Ok(Some(record)) => record,
            Ok(None) => {
                return self
                    .emit_pick_failure(
                        coord,
                        PickError::NotFound { topic: coord.topic.clone(), partition, offset },
                    )
                    .await
            }
            Err(error) => {
                return self.emit_pick_failure(coord, PickError::Transport(error.to_string())).await
            }
        };

        let mut message: SubscriptionEventMessage = match serde_json::from_value(record.payload) {
            Ok(message) => message,
            Err(error) => {
                return self
                    .emit_pick_failure(
                        coord,
                        PickError::Decode {
                            topic: coord.topic.clone(),
                            partition,
                            offset,
                            reason: error.to_string(),
                        },
                    )
                    .await
            }
        };

        if let Some(projection) = self.view.get(&message.subscription_id) {
            message.delivery_type = projection.delivery_type;
        }
        message.status = MessageStatus::Processed;
        message.modified = self.clock.now();

        let topic = message.retention_topic.clone().unwrap_or_else(|| self.default_topic.clone());
        match self.bus.publish(&topic, &message).await {
            Ok(()) => {
                tracing::debug!(
                    subscription = %message.subscription_id,
                    uuid = %message.uuid,
                    topic = %topic,
                    "event republished"
                );
                RepublishSummary { republished: 1, failed: 0 }
            }
            Err(error) => {
                tracing::error!(
                    subscription = %message.subscription_id,
                    uuid = %message.uuid,
                    %error,
                    "republish emit failed"
                );
                RepublishSummary { republished: 0, failed: 1 }
            }
        }
    }

    async fn emit_pick_failure(&self, coord: &MessageCoord, error: PickError) -> RepublishSummary {
        tracing::warn!(
            subscription = %coord.subscription_id,
            uuid = %coord.uuid,
            class = error.class(),
            %error,
            "could not pick message, emitting FAILED record"
        );
        let failed = SubscriptionEventMessage::pick_failed(coord, &error, self.clock.now());
        if let Err(publish_error) = self.bus.publish(&self.default_topic, &failed).await {
            tracing::error!(
                subscription = %coord.subscription_id,
                uuid = %coord.uuid,
                error = %publish_error,
                "failed to emit FAILED record"
            );
        }
        RepublishSummary { republished: 0, failed: 1 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MemoryBus;
    use crate::message::MessageStatus;
    use crate::subscription::{DeliveryType, ProbeMethod, SubscriptionProjection};
    use crate::time::SystemClock;
    use chrono::Utc;
    use uuid::Uuid;

    fn coord(topic: &str, partition: Option<i32>, offset: Option<i64>) -> MessageCoord {
        MessageCoord {
            uuid: Uuid::new_v4(),
            subscription_id: "s1".to_string(),
            topic: topic.to_string(),
            partition,
            offset,
            delivery_type: DeliveryType::Callback,
            event_ref: "evt-1".to_string(),
            status: MessageStatus::Waiting,
            error_class: None,
            timestamp: Utc::now(),
        }
    }

    fn original(uuid: Uuid, delivery_type: DeliveryType) -> SubscriptionEventMessage {
        SubscriptionEventMessage {
            uuid,
            status: MessageStatus::Waiting,
            delivery_type,
            subscription_id: "s1".to_string(),
            environment: "integration".to_string(),
            event: serde_json::json!({"id": "evt-1"}),
            retention_topic: None,
            error_type: None,
            error_message: None,
            modified: Utc::now(),
        }
    }

    fn republisher(bus: Arc<MemoryBus>, view: Arc<SubscriptionView>) -> Republisher {
        Republisher::new(bus, view, Arc::new(SystemClock), "subscribed", Duration::from_secs(1))
    }

    #[tokio::test]
    async fn republished_message_keeps_uuid_and_becomes_processed() {
        let bus = Arc::new(MemoryBus::new());
        let view = Arc::new(SubscriptionView::new());
        let coord = coord("subscribed", Some(0), Some(42));
        let mut original = original(coord.uuid, DeliveryType::Callback);
        original.uuid = coord.uuid;
        bus.seed("subscribed", 0, 42, serde_json::to_value(&original).unwrap());

        let summary = republisher(Arc::clone(&bus), view).republish_batch(&[coord.clone()]).await;
        assert_eq!(summary, RepublishSummary { republished: 1, failed: 0 });

        let published = bus.published();
        assert_eq!(published.len(), 1);
        let (topic, message) = &published[0];
        assert_eq!(topic, "subscribed");
        assert_eq!(message.uuid, coord.uuid);
        assert_eq!(message.status, MessageStatus::Processed);
    }

    #[tokio::test]
    async fn delivery_type_is_overwritten_from_the_projection() {
        let bus = Arc::new(MemoryBus::new());
        let view = Arc::new(SubscriptionView::new());
        view.upsert(SubscriptionProjection {
            subscription_id: "s1".to_string(),
            publisher_id: "pub--acme".to_string(),
            subscriber_id: "sub--acme".to_string(),
            environment: "integration".to_string(),
            callback_url: None,
            delivery_type: DeliveryType::Sse,
            probe_method: ProbeMethod::Head,
            circuit_breaker_opt_out: false,
        });

        let coord = coord("subscribed", Some(0), Some(7));
        bus.seed(
            "subscribed",
            0,
            7,
            serde_json::to_value(original(coord.uuid, DeliveryType::Callback)).unwrap(),
        );

        republisher(Arc::clone(&bus), view).republish_batch(&[coord]).await;
        assert_eq!(bus.published()[0].1.delivery_type, DeliveryType::Sse);
    }

    #[tokio::test]
    async fn retention_topic_wins_over_the_default() {
        let bus = Arc::new(MemoryBus::new());
        let view = Arc::new(SubscriptionView::new());
        let coord = coord("subscribed", Some(0), Some(3));
        let mut msg = original(coord.uuid, DeliveryType::Callback);
        msg.retention_topic = Some("subscribed.retention-7d".to_string());
        bus.seed("subscribed", 0, 3, serde_json::to_value(&msg).unwrap());

        republisher(Arc::clone(&bus), view).republish_batch(&[coord]).await;
        assert_eq!(bus.published()[0].0, "subscribed.retention-7d");
    }

    #[tokio::test]
    async fn missing_record_emits_a_failed_record() {
        let bus = Arc::new(MemoryBus::new());
        let view = Arc::new(SubscriptionView::new());
        let coord = coord("subscribed", Some(0), Some(42));

        let summary =
            republisher(Arc::clone(&bus), view).republish_batch(&[coord.clone()]).await;
        assert_eq!(summary, RepublishSummary { republished: 0, failed: 1 });

        let (_, message) = &bus.published()[0];
        assert_eq!(message.uuid, coord.uuid);
        assert_eq!(message.status, MessageStatus::Failed);
        assert_eq!(message.error_type.as_deref(), Some("RecordNotFound"));
    }

    #[tokio::test]
    async fn coordinates_missing_and_transport_errors_do_not_fail_the_batch() {
        let bus = Arc::new(MemoryBus::new());
        let view = Arc::new(SubscriptionView::new());

        let no_coords = coord("subscribed", None, None);
        let good = coord("subscribed", Some(0), Some(1));
        bus.seed("subscribed", 0, 1, serde_json::to_value(original(good.uuid, DeliveryType::Callback)).unwrap());

        let summary = republisher(Arc::clone(&bus), view)
            .republish_batch(&[no_coords.clone(), good.clone()])
            .await;
        assert_eq!(summary, RepublishSummary { republished: 1, failed: 1 });

        let statuses: Vec<MessageStatus> =
            bus.published().iter().map(|(_, m)| m.status).collect();
        assert!(statuses.contains(&MessageStatus::Failed));
        assert!(statuses.contains(&MessageStatus::Processed));
    }

    #[tokio::test]
    async fn undecodable_record_reports_the_decode_class() {
        let bus = Arc::new(MemoryBus::new());
        let view = Arc::new(SubscriptionView::new());
        let coord = coord("subscribed", Some(0), Some(9));
        bus.seed("subscribed", 0, 9, serde_json::json!({"not": "an event"}));

        republisher(Arc::clone(&bus), view).republish_batch(&[coord]).await;
        assert_eq!(bus.published()[0].1.error_type.as_deref(), Some("DecodeFailure"));
    }
}
