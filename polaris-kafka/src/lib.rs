//! Kafka event-bus adapter for `polaris` (companion crate).
//!
//! Publishes re-emitted subscription events through a shared
//! `FutureProducer` and serves exact `(topic, partition, offset)` reads with
//! a short-lived assigned consumer per pick.

use async_trait::async_trait;
use polaris::bus::{BusRecord, EventBus};
use polaris::error::BusError;
use polaris::message::SubscriptionEventMessage;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::topic_partition_list::{Offset, TopicPartitionList};
use rdkafka::util::Timeout;
use std::time::Duration;

#[derive(Clone)]
pub struct KafkaBus {
    brokers: String,
    group_id: String,
    producer: FutureProducer,
    send_timeout: Duration,
}

impl std::fmt::Debug for KafkaBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KafkaBus")
            .field("brokers", &self.brokers)
            .field("group_id", &self.group_id)
            .finish()
    }
}

impl KafkaBus {
    pub fn new(
        brokers: impl Into<String>,
        group_id: impl Into<String>,
        send_timeout: Duration,
    ) -> Result<Self, rdkafka::error::KafkaError> {
        let brokers = brokers.into();
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", send_timeout.as_millis().to_string())
            .create()?;
        Ok(Self { brokers, group_id: group_id.into(), producer, send_timeout })
    }

    /// Each pick gets its own consumer assigned to exactly one offset; no
    /// group coordination happens.
    fn picker(&self) -> Result<StreamConsumer, rdkafka::error::KafkaError> {
        ClientConfig::new()
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", format!("{}-picker-{}", self.group_id, uuid::Uuid::new_v4()))
            .set("enable.auto.commit", "false")
            .set("enable.partition.eof", "false")
            .create()
    }
}

#[async_trait]
impl EventBus for KafkaBus {
    async fn publish(
        &self,
        topic: &str,
        message: &SubscriptionEventMessage,
    ) -> Result<(), BusError> {
        let payload = serde_json::to_vec(message).map_err(|error| BusError::Publish {
            topic: topic.to_string(),
            reason: format!("serialization failed: {error}"),
        })?;
        let key = message.uuid.to_string();
        let record = FutureRecord::to(topic).payload(&payload).key(&key);
        self.producer
            .send(record, Timeout::After(self.send_timeout))
            .await
            .map(|_| ())
            .map_err(|(error, _)| BusError::Publish {
                topic: topic.to_string(),
                reason: error.to_string(),
            })
    }

    async fn read_at(
        &self,
        topic: &str,
        partition: i32,
        offset: i64,
        timeout: Duration,
    ) -> Result<Option<BusRecord>, BusError> {
        let consumer = self.picker().map_err(|error| BusError::Read(error.to_string()))?;
        let mut assignment = TopicPartitionList::new();
        assignment
            .add_partition_offset(topic, partition, Offset::Offset(offset))
            .map_err(|error| BusError::Read(error.to_string()))?;
        consumer.assign(&assignment).map_err(|error| BusError::Read(error.to_string()))?;

        let message = match tokio::time::timeout(timeout, consumer.recv()).await {
            Err(_) => {
                tracing::debug!(topic, partition, offset, "pick timed out, no record");
                return Ok(None);
            }
            Ok(Err(error)) => return Err(BusError::Read(error.to_string())),
            Ok(Ok(message)) => message,
        };

        if message.partition() != partition || message.offset() != offset {
            // The requested offset is gone (compacted or truncated); the
            // broker handed us the next available record instead.
            tracing::debug!(
                topic,
                partition,
                offset,
                got_offset = message.offset(),
                "exact record no longer available"
            );
            return Ok(None);
        }
        let Some(payload) = message.payload() else {
            return Ok(None);
        };
        let payload: serde_json::Value = serde_json::from_slice(payload)
            .map_err(|error| BusError::Read(format!("record is not JSON: {error}")))?;
        Ok(Some(BusRecord { topic: topic.to_string(), partition, offset, payload }))
    }
}
