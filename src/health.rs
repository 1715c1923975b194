//! Endpoint health bookkeeping, keyed by `(callback URL, probe method)`.
//!
//! A health entry is the meeting point between breakers and probes: it holds
//! the set of subscriptions sharing one endpoint, the latest probe result,
//! whether a probe (or republish) is currently in flight for the key, and
//! the damping counter that spaces out probe attempts.

use crate::subscription::{ProbeMethod, SubscriptionId};
use crate::time::Clock;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Identity of one probed endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthKey {
    pub callback_url: String,
    pub method: ProbeMethod,
}

impl HealthKey {
    pub fn new(callback_url: impl Into<String>, method: ProbeMethod) -> Self {
        Self { callback_url: callback_url.into(), method }
    }
}

impl std::fmt::Display for HealthKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.method, self.callback_url)
    }
}

/// Latest probe observation for one key. `first_checked_at` survives
/// subsequent probes so operators can see how long an endpoint has been
/// watched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeRecord {
    pub first_checked_at: DateTime<Utc>,
    pub last_checked_at: DateTime<Utc>,
    pub status_code: Option<u16>,
    pub reason: String,
}

#[derive(Debug)]
struct HealthEntry {
    subscription_ids: BTreeSet<SubscriptionId>,
    last_probe: Option<ProbeRecord>,
    thread_open: bool,
    republish_count: u32,
    created_at: DateTime<Utc>,
}

/// Read-only copy of one entry, served by the admin surface and tests.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    #[serde(flatten)]
    pub key: HealthKey,
    pub subscription_ids: Vec<SubscriptionId>,
    pub last_probe: Option<ProbeRecord>,
    pub thread_open: bool,
    pub republish_count: u32,
}

/// In-process registry of health entries. Every operation is atomic per key:
/// the whole map sits behind one mutex and each method performs a single
/// compute-style access.
#[derive(Debug)]
pub struct HealthRegistry {
    entries: Mutex<HashMap<HealthKey, HealthEntry>>,
    clock: Arc<dyn Clock>,
}

impl HealthRegistry {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { entries: Mutex::new(HashMap::new()), clock }
    }

    /// Bind a subscription to the entry, creating it if missing. Returns
    /// true iff this call flipped `thread_open` from false to true; the
    /// caller is then responsible for getting a probe scheduled.
    pub fn add(&self, key: &HealthKey, subscription_id: &str) -> bool {
        let now = self.clock.now();
        let mut entries = self.lock();
        let entry = entries.entry(key.clone()).or_insert_with(|| HealthEntry {
            subscription_ids: BTreeSet::new(),
            last_probe: None,
            thread_open: false,
            republish_count: 0,
            created_at: now,
        });
        entry.subscription_ids.insert(subscription_id.to_string());
        let flipped = !entry.thread_open;
        entry.thread_open = true;
        flipped
    }

    /// Unbind a subscription. The entry itself stays; the cleaner removes
    /// cold entries. Returns true when the entry is now empty.
    pub fn remove(&self, key: &HealthKey, subscription_id: &str) -> bool {
        let mut entries = self.lock();
        match entries.get_mut(key) {
            Some(entry) => {
                entry.subscription_ids.remove(subscription_id);
                entry.subscription_ids.is_empty()
            }
            None => true,
        }
    }

    /// Atomically drain the given subset (or everything) out of the entry.
    /// When the set becomes empty through this removal, the in-flight flag
    /// drops and the damping counter advances by one completed cycle.
    /// Running probes are not touched.
    pub fn clear_before_republishing(
        &self,
        key: &HealthKey,
        subset: Option<&[SubscriptionId]>,
    ) -> Vec<SubscriptionId> {
        let mut entries = self.lock();
        let Some(entry) = entries.get_mut(key) else {
            return Vec::new();
        };
        let removed: Vec<SubscriptionId> = match subset {
            Some(ids) => ids
                .iter()
                .filter(|id| entry.subscription_ids.remove(id.as_str()))
                .cloned()
                .collect(),
            None => std::mem::take(&mut entry.subscription_ids).into_iter().collect(),
        };
        if !removed.is_empty() && entry.subscription_ids.is_empty() {
            entry.thread_open = false;
            entry.republish_count = entry.republish_count.saturating_add(1);
        }
        removed
    }

    /// Record a probe observation, preserving `first_checked_at`.
    pub fn update_probe_result(&self, key: &HealthKey, status_code: Option<u16>, reason: &str) {
        let now = self.clock.now();
        let mut entries = self.lock();
        let entry = entries.entry(key.clone()).or_insert_with(|| HealthEntry {
            subscription_ids: BTreeSet::new(),
            last_probe: None,
            thread_open: false,
            republish_count: 0,
            created_at: now,
        });
        let first_checked_at = entry.last_probe.as_ref().map(|p| p.first_checked_at).unwrap_or(now);
        entry.last_probe = Some(ProbeRecord {
            first_checked_at,
            last_checked_at: now,
            status_code,
            reason: reason.to_string(),
        });
    }

    pub fn reset_republish_count(&self, key: &HealthKey) {
        if let Some(entry) = self.lock().get_mut(key) {
            entry.republish_count = 0;
        }
    }

    /// Advance the damping counter after a failed probe; returns the new
    /// value, which feeds the next probe delay.
    pub fn bump_republish_count(&self, key: &HealthKey) -> u32 {
        let mut entries = self.lock();
        match entries.get_mut(key) {
            Some(entry) => {
                entry.republish_count = entry.republish_count.saturating_add(1);
                entry.republish_count
            }
            None => 0,
        }
    }

    pub fn republish_count(&self, key: &HealthKey) -> u32 {
        self.lock().get(key).map(|e| e.republish_count).unwrap_or(0)
    }

    pub fn set_thread_open(&self, key: &HealthKey, open: bool) {
        if let Some(entry) = self.lock().get_mut(key) {
            entry.thread_open = open;
        }
    }

    pub fn thread_open(&self, key: &HealthKey) -> bool {
        self.lock().get(key).map(|e| e.thread_open).unwrap_or(false)
    }

    pub fn subscription_ids(&self, key: &HealthKey) -> Vec<SubscriptionId> {
        self.lock()
            .get(key)
            .map(|e| e.subscription_ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn contains(&self, key: &HealthKey) -> bool {
        self.lock().contains_key(key)
    }

    pub fn snapshot(&self, key: &HealthKey) -> Option<HealthSnapshot> {
        self.lock().get(key).map(|entry| Self::to_snapshot(key, entry))
    }

    /// All entries, ordered by key for stable listings.
    pub fn snapshots(&self) -> Vec<HealthSnapshot> {
        let entries = self.lock();
        let mut all: Vec<HealthSnapshot> =
            entries.iter().map(|(key, entry)| Self::to_snapshot(key, entry)).collect();
        all.sort_by(|a, b| {
            (&a.key.callback_url, a.key.method.as_str())
                .cmp(&(&b.key.callback_url, b.key.method.as_str()))
        });
        all
    }

    /// Drop entries that have been idle longer than `idle_window` and no
    /// longer track any subscription; reset the damping counter on idle
    /// entries that still do.
    pub fn sweep(&self, idle_window: Duration) {
        let now = self.clock.now();
        let window = ChronoDuration::from_std(idle_window).unwrap_or(ChronoDuration::MAX);
        let mut entries = self.lock();
        entries.retain(|key, entry| {
            let last_activity =
                entry.last_probe.as_ref().map(|p| p.last_checked_at).unwrap_or(entry.created_at);
            if now - last_activity < window {
                return true;
            }
            if entry.subscription_ids.is_empty() {
                tracing::debug!(key = %key, "dropping cold health entry");
                return false;
            }
            entry.republish_count = 0;
            true
        });
    }

    fn to_snapshot(key: &HealthKey, entry: &HealthEntry) -> HealthSnapshot {
        HealthSnapshot {
            key: key.clone(),
            subscription_ids: entry.subscription_ids.iter().cloned().collect(),
            last_probe: entry.last_probe.clone(),
            thread_open: entry.thread_open,
            republish_count: entry.republish_count,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<HealthKey, HealthEntry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
