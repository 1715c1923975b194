//! Circuit-breaker records: one per subscription whose delivery has tripped.

use crate::cluster::MemberId;
use crate::subscription::SubscriptionId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of one breaker. Absence of the record means "closed".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BreakerStatus {
    /// Tripped by the delivery path; waiting for a worker to adopt it.
    Open,
    /// A worker owns it and is probing the endpoint.
    Checking,
    /// The endpoint recovered; queued events are being re-emitted.
    Republishing,
}

impl std::fmt::Display for BreakerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Open => "OPEN",
            Self::Checking => "CHECKING",
            Self::Republishing => "REPUBLISHING",
        };
        f.write_str(s)
    }
}

impl BreakerStatus {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "OPEN" => Some(Self::Open),
            "CHECKING" => Some(Self::Checking),
            "REPUBLISHING" => Some(Self::Republishing),
            _ => None,
        }
    }
}

/// Result of the most recent probe against the breaker's endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheck {
    pub checked_at: DateTime<Utc>,
    pub status_code: Option<u16>,
    pub reason: String,
}

/// One breaker, keyed by subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerRecord {
    pub subscription_id: SubscriptionId,
    pub status: BreakerStatus,
    pub callback_url: String,
    pub environment: String,
    pub subscriber_id: String,
    /// Cluster member currently working this breaker; `None` while
    /// unassigned. CHECKING records always carry a live owner.
    pub assigned_owner: Option<MemberId>,
    pub last_health_check: Option<HealthCheck>,
    pub opened_at: DateTime<Utc>,
}

impl BreakerRecord {
    /// A freshly tripped breaker, as the delivery path writes it.
    pub fn open(
        subscription_id: impl Into<SubscriptionId>,
        callback_url: impl Into<String>,
        environment: impl Into<String>,
        subscriber_id: impl Into<String>,
        opened_at: DateTime<Utc>,
    ) -> Self {
        Self {
            subscription_id: subscription_id.into(),
            status: BreakerStatus::Open,
            callback_url: callback_url.into(),
            environment: environment.into(),
            subscriber_id: subscriber_id.into(),
            assigned_owner: None,
            last_health_check: None,
            opened_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_text() {
        for status in [BreakerStatus::Open, BreakerStatus::Checking, BreakerStatus::Republishing] {
            assert_eq!(BreakerStatus::parse(&status.to_string()), Some(status));
        }
        assert_eq!(BreakerStatus::parse("closed"), None);
    }

    #[test]
    fn open_records_start_unassigned() {
        let record =
            BreakerRecord::open("s1", "https://example.test/cb", "integration", "sub--acme", Utc::now());
        assert_eq!(record.status, BreakerStatus::Open);
        assert!(record.assigned_owner.is_none());
        assert!(record.last_health_check.is_none());
    }
}
