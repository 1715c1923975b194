//! Event messages on the bus and their coordinates in the state store.

use crate::error::PickError;
use crate::subscription::{DeliveryType, SubscriptionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Delivery state of one event, as tracked by the state database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageStatus {
    /// Parked behind an open breaker.
    Waiting,
    /// Handed to the delivery path, outcome pending.
    Delivering,
    /// Re-emitted (or delivered); the delivery path takes over.
    Processed,
    /// Delivery gave up; the error class says why.
    Failed,
}

/// Error class attached to FAILED message states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorClass {
    CallbackUrlNotFound,
    CallbackException,
}

/// Coordinates of one event: where its state lives and where the original
/// record sits on the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageCoord {
    pub uuid: Uuid,
    pub subscription_id: SubscriptionId,
    pub topic: String,
    pub partition: Option<i32>,
    pub offset: Option<i64>,
    pub delivery_type: DeliveryType,
    pub event_ref: String,
    pub status: MessageStatus,
    pub error_class: Option<ErrorClass>,
    pub timestamp: DateTime<Utc>,
}

/// The wire message Polaris re-emits onto the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionEventMessage {
    pub uuid: Uuid,
    pub status: MessageStatus,
    pub delivery_type: DeliveryType,
    pub subscription_id: SubscriptionId,
    pub environment: String,
    #[serde(default)]
    pub event: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention_topic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub modified: DateTime<Utc>,
}

impl SubscriptionEventMessage {
    /// The FAILED status record emitted when the original event could not be
    /// picked from the bus. Keeps the original uuid so the failure stays
    /// attributable to the event.
    pub fn pick_failed(coord: &MessageCoord, error: &PickError, now: DateTime<Utc>) -> Self {
        Self {
            uuid: coord.uuid,
            status: MessageStatus::Failed,
            delivery_type: coord.delivery_type,
            subscription_id: coord.subscription_id.clone(),
            environment: String::new(),
            event: serde_json::Value::Null,
            retention_topic: None,
            error_type: Some(error.class().to_string()),
            error_message: Some(error.to_string()),
            modified: now,
        }
    }
}
