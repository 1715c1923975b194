//! The event bus: publish a subscription event to a topic, or read one
//! record back by exact partition and offset.

use crate::error::BusError;
use crate::message::SubscriptionEventMessage;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// A single record read back from the bus.
#[derive(Debug, Clone, PartialEq)]
pub struct BusRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub payload: serde_json::Value,
}

/// Publish and exact-read access to the bus. `polaris-kafka` provides the
/// real implementation.
#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, topic: &str, message: &SubscriptionEventMessage)
        -> Result<(), BusError>;

    /// Read the single record at `(topic, partition, offset)`, waiting at
    /// most `timeout`. `Ok(None)` when nothing is there.
    async fn read_at(
        &self,
        topic: &str,
        partition: i32,
        offset: i64,
        timeout: Duration,
    ) -> Result<Option<BusRecord>, BusError>;
}

type PublishHook = dyn Fn(&str, &SubscriptionEventMessage) + Send + Sync;

/// In-process bus for tests and single-process setups: seedable records,
/// recorded publishes, and an optional publish hook so tests can mirror the
/// downstream state mutation.
#[derive(Default)]
pub struct MemoryBus {
    records: Mutex<HashMap<(String, i32, i64), serde_json::Value>>,
    published: Mutex<Vec<(String, SubscriptionEventMessage)>>,
    hook: Mutex<Option<Box<PublishHook>>>,
    read_errors: AtomicBool,
}

impl std::fmt::Debug for MemoryBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBus").finish()
    }
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a record at exact coordinates.
    pub fn seed(&self, topic: &str, partition: i32, offset: i64, payload: serde_json::Value) {
        self.records
            .lock()
            .expect("bus records lock")
            .insert((topic.to_string(), partition, offset), payload);
    }

    /// Everything published so far, in order.
    pub fn published(&self) -> Vec<(String, SubscriptionEventMessage)> {
        self.published.lock().expect("bus published lock").clone()
    }

    /// Run `hook` after every publish.
    pub fn on_publish(&self, hook: impl Fn(&str, &SubscriptionEventMessage) + Send + Sync + 'static) {
        *self.hook.lock().expect("bus hook lock") = Some(Box::new(hook));
    }

    /// Make subsequent reads fail with a transport error.
    pub fn fail_reads(&self, fail: bool) {
        self.read_errors.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl EventBus for MemoryBus {
    async fn publish(
        &self,
        topic: &str,
        message: &SubscriptionEventMessage,
    ) -> Result<(), BusError> {
        self.published
            .lock()
            .expect("bus published lock")
            .push((topic.to_string(), message.clone()));
        if let Some(hook) = self.hook.lock().expect("bus hook lock").as_ref() {
            hook(topic, message);
        }
        Ok(())
    }

    async fn read_at(
        &self,
        topic: &str,
        partition: i32,
        offset: i64,
        _timeout: Duration,
    ) -> Result<Option<BusRecord>, BusError> {
        if self.read_errors.load(Ordering::SeqCst) {
            return Err(BusError::Read("injected transport failure".to_string()));
        }
        let records = self.records.lock().expect("bus records lock");
        Ok(records.get(&(topic.to_string(), partition, offset)).map(|payload| BusRecord {
            topic: topic.to_string(),
            partition,
            offset,
            payload: payload.clone(),
        }))
    }
}
