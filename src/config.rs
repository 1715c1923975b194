//! Runtime configuration. Every knob the control plane honors, with the
//! defaults it ships with; deserializable from a TOML file.

use crate::error::ConfigError;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct PolarisConfig {
    /// Cadence of the periodic breaker and state-store scans.
    pub polling_interval_ms: u64,
    /// Page size for breaker and state scans.
    pub polling_batch_size: usize,
    /// Per-record bus read timeout during republishing.
    pub picking_timeout_ms: u64,
    /// Page size for republishing scans.
    pub republishing_batch_size: usize,
    /// Per-batch republish deadline, honored during shutdown.
    pub republishing_timeout_ms: u64,
    /// How long an event may sit in DELIVERING before it is re-emitted.
    pub delivering_states_offset_mins: u64,
    /// Idle window after which an endpoint's damping counter resets and
    /// empty health entries are collected.
    pub request_cooldown_reset_mins: u64,
    /// Base delay for probing an endpoint identity with no damping history.
    pub request_delay_mins: u64,
    /// HTTP client request timeout.
    pub max_timeout_ms: u64,
    /// HTTP client connection pool bound.
    pub max_connections: usize,
    /// Probe statuses counted as healthy.
    pub successful_status_codes: BTreeSet<u16>,
    /// Topic for re-emitted events whose subscription has no retention
    /// policy.
    pub default_topic: String,
    pub subscription_check_threadpool: PoolSettings,
    pub republishing_threadpool: PoolSettings,
    pub oauth2: OAuth2Settings,
}

impl Default for PolarisConfig {
    fn default() -> Self {
        Self {
            polling_interval_ms: 30_000,
            polling_batch_size: 50,
            picking_timeout_ms: 5_000,
            republishing_batch_size: 20,
            republishing_timeout_ms: 5_000,
            delivering_states_offset_mins: 15,
            request_cooldown_reset_mins: 90,
            request_delay_mins: 5,
            max_timeout_ms: 30_000,
            max_connections: 100,
            successful_status_codes: [200, 201, 202, 204].into_iter().collect(),
            default_topic: "subscribed".to_string(),
            subscription_check_threadpool: PoolSettings::default(),
            republishing_threadpool: PoolSettings::default(),
            oauth2: OAuth2Settings::default(),
        }
    }
}

/// Worker-pool bounds. Unset means unbounded.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct PoolSettings {
    pub max_size: Option<usize>,
    pub queue_capacity: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct OAuth2Settings {
    /// Token endpoint; may carry an `{environment}` placeholder.
    pub token_uri: String,
    pub client_id: String,
    pub client_secret: String,
    /// Period of the token refresh task.
    pub cron_token_fetch_mins: u64,
}

impl Default for OAuth2Settings {
    fn default() -> Self {
        Self {
            token_uri: String::new(),
            client_id: String::new(),
            client_secret: String::new(),
            cron_token_fetch_mins: 4 * 60,
        }
    }
}

impl PolarisConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.polling_interval_ms)
    }

    pub fn picking_timeout(&self) -> Duration {
        Duration::from_millis(self.picking_timeout_ms)
    }

    pub fn republishing_timeout(&self) -> Duration {
        Duration::from_millis(self.republishing_timeout_ms)
    }

    pub fn delivering_states_offset(&self) -> Duration {
        Duration::from_secs(self.delivering_states_offset_mins * 60)
    }

    pub fn request_cooldown_reset(&self) -> Duration {
        Duration::from_secs(self.request_cooldown_reset_mins * 60)
    }

    pub fn request_delay(&self) -> Duration {
        Duration::from_secs(self.request_delay_mins * 60)
    }

    pub fn max_timeout(&self) -> Duration {
        Duration::from_millis(self.max_timeout_ms)
    }

    pub fn token_refresh_period(&self) -> Duration {
        Duration::from_secs(self.oauth2.cron_token_fetch_mins * 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_shipped_values() {
        let config = PolarisConfig::default();
        assert_eq!(config.polling_interval(), Duration::from_secs(30));
        assert_eq!(config.republishing_batch_size, 20);
        assert_eq!(config.successful_status_codes, [200, 201, 202, 204].into_iter().collect());
        assert_eq!(config.default_topic, "subscribed");
        assert_eq!(config.subscription_check_threadpool.queue_capacity, None);
        assert_eq!(config.oauth2.cron_token_fetch_mins, 240);
    }

    #[test]
    fn partial_toml_overrides_only_named_fields() {
        let config: PolarisConfig = toml::from_str(
            r#"
            polling-interval-ms = 5000
            successful-status-codes = [200, 204]

            [republishing-threadpool]
            max-size = 8
            queue-capacity = 64

            [oauth2]
            token-uri = "https://auth.test/{environment}/token"
            client-id = "polaris"
            client-secret = "hunter2"
            "#,
        )
        .unwrap();

        assert_eq!(config.polling_interval_ms, 5_000);
        assert_eq!(config.successful_status_codes, [200, 204].into_iter().collect());
        assert_eq!(config.republishing_threadpool.max_size, Some(8));
        assert_eq!(config.republishing_threadpool.queue_capacity, Some(64));
        assert_eq!(config.oauth2.client_id, "polaris");
        assert_eq!(config.polling_batch_size, 50, "untouched fields keep defaults");
    }

    #[test]
    fn load_reports_missing_files_with_the_path() {
        let err = PolarisConfig::load("/definitely/not/here.toml").unwrap_err();
        assert!(err.to_string().contains("/definitely/not/here.toml"));
    }
}
