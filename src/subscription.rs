//! Subscription projections and the in-process view kept current by the
//! external subscription watcher.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Stable identifier of a subscription; primary key everywhere.
pub type SubscriptionId = String;

/// How events reach the subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryType {
    /// Push: events are POSTed to the subscriber's callback URL.
    Callback,
    /// Pull: the subscriber consumes a server-sent-event stream.
    Sse,
}

/// HTTP method used for health probes against the callback endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProbeMethod {
    Head,
    Get,
}

impl ProbeMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Head => "HEAD",
            Self::Get => "GET",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "HEAD" => Some(Self::Head),
            "GET" => Some(Self::Get),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProbeMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The slice of a subscription resource the control plane routes on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionProjection {
    pub subscription_id: SubscriptionId,
    pub publisher_id: String,
    pub subscriber_id: String,
    pub environment: String,
    /// Absent for SSE subscriptions.
    pub callback_url: Option<String>,
    pub delivery_type: DeliveryType,
    pub probe_method: ProbeMethod,
    pub circuit_breaker_opt_out: bool,
}

/// Kind of change pushed by the subscription watcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionEventKind {
    Added,
    Updated,
    Removed,
}

/// A subscription change as delivered by the external watcher.
#[derive(Debug, Clone)]
pub struct SubscriptionEvent {
    pub kind: SubscriptionEventKind,
    pub old: Option<SubscriptionProjection>,
    pub new: Option<SubscriptionProjection>,
}

/// Process-local map of all known projections.
///
/// Reads are lock-free from the caller's perspective: every operation takes
/// the inner mutex for the duration of a single map access.
#[derive(Debug, Default)]
pub struct SubscriptionView {
    inner: Mutex<HashMap<SubscriptionId, SubscriptionProjection>>,
    synced: AtomicBool,
}

impl SubscriptionView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, subscription_id: &str) -> Option<SubscriptionProjection> {
        self.inner.lock().expect("subscription view lock").get(subscription_id).cloned()
    }

    pub fn upsert(&self, projection: SubscriptionProjection) {
        self.inner
            .lock()
            .expect("subscription view lock")
            .insert(projection.subscription_id.clone(), projection);
    }

    pub fn remove(&self, subscription_id: &str) -> Option<SubscriptionProjection> {
        self.inner.lock().expect("subscription view lock").remove(subscription_id)
    }

    /// Apply a watcher event to the view. Reconciliation is the caller's job;
    /// this only keeps the projection map current.
    pub fn apply(&self, event: &SubscriptionEvent) {
        match (&event.kind, &event.new, &event.old) {
            (SubscriptionEventKind::Removed, _, Some(old)) => {
                self.remove(&old.subscription_id);
            }
            (_, Some(new), _) => self.upsert(new.clone()),
            _ => {}
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("subscription view lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Marks the initial sync from the watcher as complete. Startup recovery
    /// waits for this.
    pub fn mark_synced(&self) {
        self.synced.store(true, Ordering::Release);
    }

    pub fn is_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }
}
